//! Per-device connection supervisor.
//!
//! A [`Supervisor`] keeps one device connected forever. Each loop iteration
//! is one attempt:
//!
//! ```text
//! Scanning -> Connecting -> Connected -> (Disconnected | Failed) -> Idle -> Scanning ...
//! ```
//!
//! Every outcome of an attempt, good or bad, ends in exactly one idle delay
//! chosen by the [`RetryPolicy`](crate::RetryPolicy). Errors never leave the
//! loop; the only exits are [`SupervisorHandle::shutdown`] and, if the policy
//! sets one, the retry cap.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::DeviceAddress;
use crate::config::SupervisorConfig;
use crate::data::UpdateSender;
use crate::error::{Error, Result};
use crate::retry::Backoff;
use crate::signal::{DisconnectReason, DisconnectSignal};
use crate::transport::{Session, Transport};

/// Connection state of one supervised device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Searching for the device.
    #[default]
    Scanning,
    /// Opening a session.
    Connecting,
    /// Connected, waiting for a disconnect.
    Connected,
    /// The connection was lost or released.
    Disconnected,
    /// The attempt failed before connecting.
    Failed,
    /// Waiting before the next attempt.
    Idle,
    /// The supervisor has exited.
    Stopped,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if an attempt is in progress.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Scanning | Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed => write!(f, "Failed"),
            Self::Idle => write!(f, "Idle"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What happened, as broadcast to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEventKind {
    /// A new attempt started scanning.
    Attempting,
    /// Discovery finished without seeing the device.
    NotFound,
    /// Discovery saw the device.
    Found,
    /// The session opened.
    Connected,
    /// The connection was lost.
    Disconnected(DisconnectReason),
    /// The attempt was cancelled while connected.
    Cancelled,
    /// The attempt failed with the given error text.
    Failed(String),
    /// Waiting this long before the next attempt.
    Idle(Duration),
    /// The retry cap was reached.
    GaveUp {
        /// Consecutive failed attempts.
        attempts: u32,
    },
    /// The supervisor exited.
    Stopped,
}

/// Event for supervisor state changes.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorEvent {
    /// The supervised device.
    pub address: DeviceAddress,
    /// What happened.
    pub kind: SupervisorEventKind,
}

/// How one attempt ended.
#[derive(Debug)]
enum AttemptOutcome {
    NotFound,
    Disconnected(DisconnectReason),
    Cancelled,
    Failed(Error),
}

/// Control handle for a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    address: DeviceAddress,
    state: Arc<RwLock<ConnectionState>>,
    shutdown: CancellationToken,
    current_attempt: Arc<Mutex<CancellationToken>>,
}

impl SupervisorHandle {
    /// The supervised device.
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Abandon the current attempt and continue with the idle delay.
    ///
    /// While connected this releases the connection and is reported as
    /// [`SupervisorEventKind::Cancelled`]. While scanning or connecting it is
    /// reported as an ordinary failure. During the idle delay there is no
    /// attempt in progress and the call has no effect.
    pub fn cancel_attempt(&self) {
        self.current_attempt.lock().cancel();
    }

    /// Stop the supervisor at its next suspension point.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Check if shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Keeps one device connected.
pub struct Supervisor<T: Transport> {
    address: DeviceAddress,
    transport: Arc<T>,
    scan_timeout: Duration,
    label: String,
    backoff: Backoff,
    updates: UpdateSender,
    events: broadcast::Sender<SupervisorEvent>,
    state: Arc<RwLock<ConnectionState>>,
    shutdown: CancellationToken,
    current_attempt: Arc<Mutex<CancellationToken>>,
}

impl<T: Transport> Supervisor<T> {
    /// Create a supervisor for `address`.
    ///
    /// `shutdown` stops this supervisor when cancelled; pass a child token to
    /// stop several supervisors together.
    pub fn new(
        address: DeviceAddress,
        transport: Arc<T>,
        config: &SupervisorConfig,
        updates: UpdateSender,
        events: broadcast::Sender<SupervisorEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let current_attempt = shutdown.child_token();

        Self {
            address,
            transport,
            scan_timeout: config.scan_timeout,
            label: config.session_label.clone(),
            backoff: Backoff::new(config.retry),
            updates,
            events,
            state: Arc::new(RwLock::new(ConnectionState::Scanning)),
            shutdown,
            current_attempt: Arc::new(Mutex::new(current_attempt)),
        }
    }

    /// Get a control handle.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            address: self.address,
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            current_attempt: self.current_attempt.clone(),
        }
    }

    /// Run the reconnect loop until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetriesExhausted`] only if the retry policy has a cap
    /// and it was reached. Every other failure is logged and retried.
    pub async fn run(mut self) -> Result<()> {
        debug!("Supervisor for {} started", self.address);

        while !self.shutdown.is_cancelled() {
            let cancel = self.shutdown.child_token();
            *self.current_attempt.lock() = cancel.clone();

            let (outcome, connected) = self.attempt(&cancel).await;
            if self.shutdown.is_cancelled() {
                break;
            }
            self.record(outcome, connected);

            if !connected && self.backoff.exhausted() {
                let attempts = self.backoff.failures();
                warn!(
                    "Giving up on {} after {} consecutive failed attempts",
                    self.address, attempts
                );
                self.emit(SupervisorEventKind::GaveUp { attempts });
                self.stop();
                return Err(Error::RetriesExhausted {
                    address: self.address,
                    attempts,
                });
            }

            let delay = self.backoff.next_delay();
            self.set_state(ConnectionState::Idle);
            self.emit(SupervisorEventKind::Idle(delay));

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Supervisor for {} stopped", self.address);
        self.stop();
        Ok(())
    }

    /// One scan -> connect -> wait cycle. The flag reports whether the
    /// attempt reached the connected state.
    async fn attempt(&self, cancel: &CancellationToken) -> (AttemptOutcome, bool) {
        self.set_state(ConnectionState::Scanning);
        info!("Attempting to connect to {}...", self.address);
        self.emit(SupervisorEventKind::Attempting);

        let peripheral = match self.discover(cancel).await {
            Ok(Some(peripheral)) => peripheral,
            Ok(None) => return (AttemptOutcome::NotFound, false),
            Err(e) => return (AttemptOutcome::Failed(e), false),
        };

        info!("Device found: {}", self.address);
        self.emit(SupervisorEventKind::Found);
        self.set_state(ConnectionState::Connecting);

        let mut session = self.transport.create_session(
            &self.label,
            self.address,
            peripheral,
            self.updates.clone(),
        );

        let opened = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = session.open() => result,
        };
        if let Err(e) = opened {
            self.close(&mut session).await;
            return (AttemptOutcome::Failed(e), false);
        }

        info!("Connected to {}", self.address);
        self.set_state(ConnectionState::Connected);
        self.emit(SupervisorEventKind::Connected);

        let outcome = self.hold(&mut session, cancel).await;
        self.close(&mut session).await;
        (outcome, true)
    }

    /// Bounded discovery. A timeout counts as not found.
    async fn discover(&self, cancel: &CancellationToken) -> Result<Option<T::Peripheral>> {
        let search = tokio::time::timeout(
            self.scan_timeout,
            self.transport.find_device(&self.address, self.scan_timeout),
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = search => result.unwrap_or(Ok(None)),
        }
    }

    /// Block until the session reports a disconnect or the attempt is
    /// cancelled. The signal is created here and dies with this attempt.
    async fn hold(&self, session: &mut T::Session, cancel: &CancellationToken) -> AttemptOutcome {
        let (notifier, signal) = DisconnectSignal::new();

        if let Err(e) = session.watch_disconnect(notifier).await {
            return AttemptOutcome::Failed(e);
        }

        tokio::select! {
            _ = cancel.cancelled() => AttemptOutcome::Cancelled,
            reason = signal.wait() => AttemptOutcome::Disconnected(reason),
        }
    }

    async fn close(&self, session: &mut T::Session) {
        if let Err(e) = session.close().await {
            debug!("Error closing session for {}: {}", self.address, e);
        }
    }

    /// Log the outcome and update retry bookkeeping.
    fn record(&mut self, outcome: AttemptOutcome, connected: bool) {
        match outcome {
            AttemptOutcome::NotFound => {
                warn!("Device {} not found, retrying...", self.address);
                self.emit(SupervisorEventKind::NotFound);
            }
            AttemptOutcome::Disconnected(reason) => {
                warn!("Device {} disconnected.", self.address);
                self.set_state(ConnectionState::Disconnected);
                self.emit(SupervisorEventKind::Disconnected(reason));
            }
            AttemptOutcome::Cancelled => {
                info!("Connection to {} cancelled.", self.address);
                self.set_state(ConnectionState::Disconnected);
                self.emit(SupervisorEventKind::Cancelled);
            }
            AttemptOutcome::Failed(e) => {
                warn!("Failed to connect to {}: {}", self.address, e);
                self.set_state(ConnectionState::Failed);
                self.emit(SupervisorEventKind::Failed(e.to_string()));
            }
        }

        if connected {
            self.backoff.record_success();
        } else {
            self.backoff.record_failure();
        }
    }

    fn stop(&self) {
        self.set_state(ConnectionState::Stopped);
        self.emit(SupervisorEventKind::Stopped);
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state != new_state {
            debug!(
                "{} state changed: {} -> {}",
                self.address, old_state, new_state
            );
        }
    }

    fn emit(&self, kind: SupervisorEventKind) {
        let _ = self.events.send(SupervisorEvent {
            address: self.address,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DeviceUpdate;
    use crate::retry::RetryPolicy;
    use crate::signal::DisconnectNotifier;
    use crate::transport::MockSession;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    const ADDRESS: DeviceAddress = DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    /// Finds the device once per queued session, then never again.
    struct ScriptedTransport {
        sessions: Mutex<VecDeque<MockSession>>,
    }

    impl ScriptedTransport {
        fn new(sessions: Vec<MockSession>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        type Peripheral = MockSession;
        type Session = MockSession;

        async fn find_device(
            &self,
            _address: &DeviceAddress,
            _timeout: Duration,
        ) -> Result<Option<MockSession>> {
            Ok(self.sessions.lock().pop_front())
        }

        fn create_session(
            &self,
            _label: &str,
            _address: DeviceAddress,
            peripheral: MockSession,
            _updates: UpdateSender,
        ) -> MockSession {
            peripheral
        }
    }

    struct Fixture {
        supervisor: Supervisor<ScriptedTransport>,
        events: broadcast::Receiver<SupervisorEvent>,
        _updates: mpsc::Receiver<DeviceUpdate>,
    }

    fn fixture(config: SupervisorConfig, sessions: Vec<MockSession>) -> Fixture {
        let (update_tx, update_rx) = mpsc::channel(8);
        let (event_tx, events) = broadcast::channel(64);
        let supervisor = Supervisor::new(
            ADDRESS,
            Arc::new(ScriptedTransport::new(sessions)),
            &config,
            update_tx,
            event_tx,
            CancellationToken::new(),
        );
        Fixture {
            supervisor,
            events,
            _updates: update_rx,
        }
    }

    async fn next_kind(events: &mut broadcast::Receiver<SupervisorEvent>) -> SupervisorEventKind {
        let event = events.recv().await.unwrap();
        assert_eq!(event.address, ADDRESS);
        event.kind
    }

    fn disconnecting_session() -> MockSession {
        let mut session = MockSession::new();
        session.expect_open().times(1).returning(|| Ok(()));
        session
            .expect_watch_disconnect()
            .times(1)
            .returning(|notifier: DisconnectNotifier| {
                notifier.notify();
                Ok(())
            });
        session.expect_close().times(1).returning(|| Ok(()));
        session
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Idle.is_connected());
        assert!(ConnectionState::Scanning.is_transitioning());
        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(!ConnectionState::Connected.is_transitioning());
        assert_eq!(ConnectionState::default(), ConnectionState::Scanning);
        assert_eq!(ConnectionState::Idle.to_string(), "Idle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_disconnect() {
        let Fixture {
            supervisor,
            mut events,
            _updates,
        } = fixture(SupervisorConfig::new([ADDRESS]), vec![disconnecting_session()]);
        let handle = supervisor.handle();
        let task = tokio::spawn(supervisor.run());

        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Attempting);
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Found);
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Connected);
        assert_eq!(
            next_kind(&mut events).await,
            SupervisorEventKind::Disconnected(DisconnectReason::Reported)
        );
        assert_eq!(
            next_kind(&mut events).await,
            SupervisorEventKind::Idle(Duration::from_secs(3))
        );
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Attempting);
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::NotFound);

        handle.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(handle.state(), ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_retried() {
        let mut session = MockSession::new();
        session
            .expect_open()
            .times(1)
            .returning(|| Err(Error::connection_failed("refused")));
        session.expect_watch_disconnect().never();
        session.expect_close().times(1).returning(|| Ok(()));

        let Fixture {
            supervisor,
            mut events,
            _updates,
        } = fixture(SupervisorConfig::new([ADDRESS]), vec![session]);
        let handle = supervisor.handle();
        let task = tokio::spawn(supervisor.run());

        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Attempting);
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Found);
        assert_eq!(
            next_kind(&mut events).await,
            SupervisorEventKind::Failed("Connection failed: refused".to_string())
        );
        assert_eq!(
            next_kind(&mut events).await,
            SupervisorEventKind::Idle(Duration::from_secs(3))
        );
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Attempting);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_failure_is_retried() {
        let mut session = MockSession::new();
        session.expect_open().times(1).returning(|| Ok(()));
        session
            .expect_watch_disconnect()
            .times(1)
            .returning(|_| Err(Error::Internal("no event stream".to_string())));
        session.expect_close().times(1).returning(|| Ok(()));

        let Fixture {
            supervisor,
            mut events,
            _updates,
        } = fixture(SupervisorConfig::new([ADDRESS]), vec![session]);
        let handle = supervisor.handle();
        let task = tokio::spawn(supervisor.run());

        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Attempting);
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Found);
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Connected);
        assert_eq!(
            next_kind(&mut events).await,
            SupervisorEventKind::Failed("Internal error: no event stream".to_string())
        );

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cap_gives_up() {
        let config = SupervisorConfig::new([ADDRESS])
            .with_retry(RetryPolicy::fixed(Duration::from_secs(1)).with_max_retries(2));
        let Fixture {
            supervisor,
            mut events,
            _updates,
        } = fixture(config, Vec::new());
        let task = tokio::spawn(supervisor.run());

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::RetriesExhausted {
                address: ADDRESS,
                attempts: 2
            }
        ));

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                SupervisorEventKind::Attempting,
                SupervisorEventKind::NotFound,
                SupervisorEventKind::Idle(Duration::from_secs(1)),
                SupervisorEventKind::Attempting,
                SupervisorEventKind::NotFound,
                SupervisorEventKind::GaveUp { attempts: 2 },
                SupervisorEventKind::Stopped,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_attempts_never_hit_retry_cap() {
        let config = SupervisorConfig::new([ADDRESS])
            .with_retry(RetryPolicy::fixed(Duration::from_secs(1)).with_max_retries(1));
        let Fixture {
            supervisor,
            mut events,
            _updates,
        } = fixture(config, vec![disconnecting_session(), disconnecting_session()]);
        let task = tokio::spawn(supervisor.run());

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::RetriesExhausted {
                address: ADDRESS,
                attempts: 1
            }
        ));

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        let connected_cycle = [
            SupervisorEventKind::Attempting,
            SupervisorEventKind::Found,
            SupervisorEventKind::Connected,
            SupervisorEventKind::Disconnected(DisconnectReason::Reported),
            SupervisorEventKind::Idle(Duration::from_secs(1)),
        ];
        let mut expected = Vec::new();
        expected.extend(connected_cycle.clone());
        expected.extend(connected_cycle);
        expected.extend([
            SupervisorEventKind::Attempting,
            SupervisorEventKind::NotFound,
            SupervisorEventKind::GaveUp { attempts: 1 },
            SupervisorEventKind::Stopped,
        ]);
        assert_eq!(kinds, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_resets_retry_count() {
        let config = SupervisorConfig::new([ADDRESS])
            .with_retry(RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60)));
        let Fixture {
            supervisor,
            mut events,
            _updates,
        } = fixture(config, vec![disconnecting_session()]);
        let handle = supervisor.handle();
        let task = tokio::spawn(supervisor.run());

        let mut idles = Vec::new();
        while idles.len() < 3 {
            if let SupervisorEventKind::Idle(delay) = next_kind(&mut events).await {
                idles.push(delay);
            }
        }
        // connected, then two misses
        assert_eq!(
            idles,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(2)
            ]
        );

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_attempt_while_idle_is_ignored() {
        let Fixture {
            supervisor,
            mut events,
            _updates,
        } = fixture(SupervisorConfig::new([ADDRESS]), Vec::new());
        let handle = supervisor.handle();
        let task = tokio::spawn(supervisor.run());

        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Attempting);
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::NotFound);
        assert_eq!(
            next_kind(&mut events).await,
            SupervisorEventKind::Idle(Duration::from_secs(3))
        );

        handle.cancel_attempt();
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Attempting);
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::NotFound);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_idle() {
        let Fixture {
            supervisor,
            mut events,
            _updates,
        } = fixture(SupervisorConfig::new([ADDRESS]), Vec::new());
        let handle = supervisor.handle();
        let task = tokio::spawn(supervisor.run());

        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Attempting);
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::NotFound);
        assert_eq!(
            next_kind(&mut events).await,
            SupervisorEventKind::Idle(Duration::from_secs(3))
        );
        assert_eq!(handle.state(), ConnectionState::Idle);

        handle.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(next_kind(&mut events).await, SupervisorEventKind::Stopped);
        assert!(handle.is_shutdown());
    }
}

//! Scripted in-memory transport for driving supervisors without Bluetooth.

#![allow(dead_code)]

use async_trait::async_trait;
use ble_keepalive::{
    DeviceAddress, DeviceData, DeviceUpdate, DisconnectNotifier, Error, Result, Session,
    SupervisorEvent, SupervisorEventKind, Transport, UpdateSender,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What one session does once discovery finds the device.
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    /// Error text returned from `open`, if any.
    pub open_error: Option<String>,
    /// Payloads sent after the disconnect watch is registered.
    pub updates: Vec<DeviceData>,
    /// Report a disconnect this long after the updates. `None` never does.
    pub disconnect_after: Option<Duration>,
}

impl SessionScript {
    pub fn refuse(reason: &str) -> Self {
        Self {
            open_error: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn disconnect_after(updates: Vec<DeviceData>, after: Duration) -> Self {
        Self {
            updates,
            disconnect_after: Some(after),
            ..Self::default()
        }
    }

    pub fn stay_connected() -> Self {
        Self::default()
    }
}

/// One scripted discovery result.
#[derive(Debug, Clone)]
pub enum Discovery {
    Missing,
    Found(SessionScript),
}

#[derive(Debug, Default)]
pub struct Stats {
    pub sessions: AtomicUsize,
    pub opens: AtomicUsize,
    pub watches: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Stats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeTransport {
    scripts: Mutex<HashMap<DeviceAddress, VecDeque<Discovery>>>,
    find_calls: Mutex<Vec<(DeviceAddress, Instant)>>,
    /// How long a search that finds nothing takes.
    miss_delay: Duration,
    pub stats: Arc<Stats>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            find_calls: Mutex::new(Vec::new()),
            miss_delay: Duration::ZERO,
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn with_miss_delay(mut self, delay: Duration) -> Self {
        self.miss_delay = delay;
        self
    }

    /// Queue discovery results for `address`. Once the queue is empty the
    /// device is never found again.
    pub fn script(self, address: DeviceAddress, discoveries: Vec<Discovery>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(address, discoveries.into());
        self
    }

    pub fn find_calls(&self) -> Vec<(DeviceAddress, Instant)> {
        self.find_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Peripheral = SessionScript;
    type Session = FakeSession;

    async fn find_device(
        &self,
        address: &DeviceAddress,
        _timeout: Duration,
    ) -> Result<Option<SessionScript>> {
        self.find_calls
            .lock()
            .unwrap()
            .push((*address, Instant::now()));

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(address)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Discovery::Missing);

        match next {
            Discovery::Found(script) => Ok(Some(script)),
            Discovery::Missing => {
                tokio::time::sleep(self.miss_delay).await;
                Ok(None)
            }
        }
    }

    fn create_session(
        &self,
        label: &str,
        address: DeviceAddress,
        script: SessionScript,
        updates: UpdateSender,
    ) -> FakeSession {
        self.stats.sessions.fetch_add(1, Ordering::SeqCst);
        FakeSession {
            label: label.to_string(),
            address,
            script,
            updates,
            stats: self.stats.clone(),
            task: None,
        }
    }
}

pub struct FakeSession {
    label: String,
    address: DeviceAddress,
    script: SessionScript,
    updates: UpdateSender,
    stats: Arc<Stats>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Session for FakeSession {
    async fn open(&mut self) -> Result<()> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        match &self.script.open_error {
            Some(reason) => Err(Error::connection_failed(reason)),
            None => Ok(()),
        }
    }

    async fn watch_disconnect(&mut self, notifier: DisconnectNotifier) -> Result<()> {
        self.stats.watches.fetch_add(1, Ordering::SeqCst);

        let updates = self.updates.clone();
        let payloads = self.script.updates.clone();
        let disconnect_after = self.script.disconnect_after;
        let address = self.address;
        let label = self.label.clone();

        self.task = Some(tokio::spawn(async move {
            for data in payloads {
                let _ = updates
                    .send(DeviceUpdate::new(address, label.clone(), data))
                    .await;
            }
            match disconnect_after {
                Some(after) => {
                    tokio::time::sleep(after).await;
                    notifier.notify();
                }
                None => {
                    futures::future::pending::<()>().await;
                    drop(notifier);
                }
            }
        }));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub fn address(last: u8) -> DeviceAddress {
    DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
}

/// Receive events, stamped with the (paused) clock, until `done` returns true
/// for one of them. That event is included.
pub async fn collect_until<F>(
    rx: &mut broadcast::Receiver<SupervisorEvent>,
    mut done: F,
) -> Vec<(Instant, SupervisorEvent)>
where
    F: FnMut(&SupervisorEvent) -> bool,
{
    let mut events = Vec::new();
    loop {
        let event = rx.recv().await.expect("event channel closed");
        let finished = done(&event);
        events.push((Instant::now(), event));
        if finished {
            return events;
        }
    }
}

pub fn count(events: &[(Instant, SupervisorEvent)], kind: &SupervisorEventKind) -> usize {
    events.iter().filter(|(_, e)| &e.kind == kind).count()
}

use clap::{Parser, ValueEnum};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ble_keepalive::{
    log_updates, BtleTransport, DeviceAddress, DeviceManager, Result, RetryPolicy,
    SupervisorConfig,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum Backoff {
    /// Same delay after every attempt.
    #[default]
    Fixed,
    /// Double the delay after each consecutive failure.
    Exponential,
}

/// Keep BLE devices connected and log the data they send.
#[derive(Parser, Debug)]
#[command(author, about, version)]
struct Options {
    /// Device addresses to keep connected, e.g. CF:E2:17:57:36:B9
    #[arg(value_name = "ADDRESS", default_value = "CF:E2:17:57:36:B9")]
    addresses: Vec<DeviceAddress>,

    /// How long a single scan for a device may take (e.g. 15s, 1m).
    #[arg(long, value_parser = humantime::parse_duration, default_value = "15s")]
    scan_timeout: Duration,

    /// Delay between attempts; the starting delay with exponential backoff.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "3s")]
    retry_delay: Duration,

    /// Retry delay growth.
    #[arg(long, value_enum, default_value_t)]
    backoff: Backoff,

    /// Upper bound for exponential backoff.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
    max_retry_delay: Duration,

    /// Randomly shorten each delay by up to this fraction (0.0 - 1.0).
    #[arg(long, default_value_t = 0.0)]
    jitter: f64,

    /// Give up on a device after this many consecutive failed attempts.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_retries: Option<u32>,

    /// Label passed to each device session.
    #[arg(long, default_value = ble_keepalive::config::DEFAULT_SESSION_LABEL)]
    label: String,
}

impl Options {
    fn retry_policy(&self) -> RetryPolicy {
        let policy = match self.backoff {
            Backoff::Fixed => RetryPolicy::fixed(self.retry_delay),
            Backoff::Exponential => RetryPolicy::exponential(self.retry_delay, self.max_retry_delay),
        }
        .with_jitter(self.jitter);

        match self.max_retries {
            Some(max) => policy.with_max_retries(max),
            None => policy,
        }
    }

    fn into_config(self) -> SupervisorConfig {
        let retry = self.retry_policy();
        SupervisorConfig::new(self.addresses)
            .with_scan_timeout(self.scan_timeout)
            .with_retry(retry)
            .with_session_label(self.label)
    }
}

async fn run(options: Options) -> Result<bool> {
    let config = options.into_config();
    let transport = BtleTransport::new().await?;

    let (mut manager, updates) = DeviceManager::new(config, transport)?;
    let logger = tokio::spawn(log_updates(updates));

    let shutdown = manager.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });

    manager.start()?;

    let mut all_ok = true;
    for (address, result) in manager.join().await {
        if let Err(e) = result {
            warn!("Supervisor for {} ended: {}", address, e);
            all_ok = false;
        }
    }

    if let Ok(count) = logger.await {
        info!("Logged {} update(s)", count);
    }
    Ok(all_ok)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = Options::parse();

    match run(options).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

//! Shutdown signaling shared by every engine's `select!` loop. The signal
//! stream itself is wired in `main` exactly as `homeroute::main`'s SIGHUP
//! handler wires `signal_hook_tokio::Signals` — here widened to the full
//! SIGTERM/SIGINT/SIGHUP/SIGUSR1 set the daemon listens for
//! (SPEC_FULL §4.1, §5 "Cancellation and timeouts").

use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook_tokio::Signals;
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tracing::info;

/// Checked between `select!` iterations; set once a termination signal
/// arrives. A `tokio::sync::Notify` rather than a bare `AtomicBool` so
/// waiters can `.await` it directly in a `select!` arm instead of polling.
#[derive(Default)]
pub struct Shutdown {
    notify: Notify,
    stopped: std::sync::atomic::AtomicBool,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Shutdown::default())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn trigger(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        if self.is_stopped() {
            return;
        }
        self.notify.notified().await;
    }
}

/// A request to re-arm every RA timer immediately (SIGUSR1,
/// SPEC_FULL §4.3 "Refresh trigger").
#[derive(Default)]
pub struct RaRefresh {
    notify: Notify,
}

impl RaRefresh {
    pub fn new() -> Arc<Self> {
        Arc::new(RaRefresh::default())
    }

    pub fn trigger(&self) {
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Spawn the signal-listening task. SIGTERM/SIGINT/SIGHUP trigger orderly
/// shutdown; SIGUSR1 requests an immediate RA refresh instead.
pub fn spawn_signal_listener(
    shutdown: Arc<Shutdown>,
    ra_refresh: Arc<RaRefresh>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP, SIGUSR1])?;
    Ok(tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            match signal {
                SIGUSR1 => {
                    info!("received SIGUSR1, refreshing RA timers");
                    ra_refresh.trigger();
                }
                SIGTERM | SIGINT | SIGHUP => {
                    info!(signal, "received termination signal, shutting down");
                    shutdown.trigger();
                    break;
                }
                other => {
                    info!(signal = other, "received unhandled signal");
                }
            }
        }
    }))
}

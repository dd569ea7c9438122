use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch::{self, Receiver, Sender};
use tracing::info;

/// Cooperative, process-wide shutdown signal.
///
/// Every long-running task (the per-chain scheduler loops, the HTTP server)
/// selects on [`Shutdown::await_shutdown_begin`] at its suspension points so
/// the process exits promptly without aborting a handler mid-statement.
pub struct Shutdown {
    sender: Sender<bool>,
    receiver: Receiver<bool>,
    shutting_down: AtomicBool,
    timeout: Duration,
    delay: Duration,
}

impl Shutdown {
    #[must_use]
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender,
            receiver,
            shutting_down: AtomicBool::new(false),
            timeout,
            delay,
        }
    }

    /// Install SIGINT/SIGTERM handling and spawn a task that triggers shutdown.
    pub fn watch_signals(self: &std::sync::Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = signal_shutdown().await {
                tracing::error!(?err, "Error installing shutdown signal handler");
            }
            this.shutdown();
        });
    }

    /// Trigger shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutdown signal received");
        }
        // Does not fail because the receiver handle is kept alive by `self`.
        let _ = self.sender.send(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has begun. Safe to cancel by dropping.
    pub async fn await_shutdown_begin(&self) {
        let mut watch = self.receiver.clone();
        if *watch.borrow_and_update() {
            return;
        }
        let _ = watch.changed().await;
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(unix)]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn signal_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::Shutdown;

    #[tokio::test]
    async fn shutdown_signal_is_observed() {
        let shutdown = Arc::new(Shutdown::new(Duration::from_secs(5), Duration::from_secs(1)));

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.await_shutdown_begin().await })
        };

        assert!(!shutdown.is_shutting_down());
        shutdown.shutdown();
        waiter.await.unwrap();
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let shutdown = Shutdown::new(Duration::from_secs(5), Duration::from_secs(1));
        shutdown.shutdown();
        shutdown.shutdown();
        assert!(shutdown.is_shutting_down());
    }
}

//! Cooperative shutdown for a running consumer.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::task::JoinHandle;

/// Clonable handle that stops a consumer at the end of its current lap.
///
/// Stopping is cooperative: a delivery being handled and a flush in progress both run to
/// completion first.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    keep_alive: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub(crate) fn new() -> Self {
        Self {
            keep_alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Ask the consumer to stop
    pub fn shutdown(&self) {
        self.keep_alive.store(false, Ordering::SeqCst);
    }

    /// Whether the consumer is still allowed to run
    pub fn is_running(&self) -> bool {
        self.keep_alive.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task that flips a [`ShutdownHandle`] on Ctrl-C, or SIGTERM on unix.
///
/// The task is aborted when the listener is dropped.
#[derive(Debug)]
pub(crate) struct SignalListener {
    task: JoinHandle<()>,
}

impl SignalListener {
    pub(crate) fn spawn(shutdown: ShutdownHandle) -> Self {
        let task = tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(signal) => {
                    tracing::info!(signal, "received signal, stopping consumer after current lap");
                    shutdown.shutdown();
                }
                Err(e) => {
                    tracing::error!(error = %e, "unable to listen for shutdown signals");
                }
            }
        });

        Self { task }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn shutdown_is_shared_between_clones() {
        let handle = ShutdownHandle::new();
        let clone = handle.clone();
        assert!(handle.is_running());

        clone.shutdown();

        assert!(!handle.is_running());
        assert!(!clone.is_running());
    }

    #[tokio::test]
    async fn dropping_the_listener_aborts_its_task() {
        let listener = SignalListener::spawn(ShutdownHandle::new());
        let task = listener.task.abort_handle();
        assert!(!task.is_finished());

        drop(listener);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !task.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("listener task still running after drop");
    }
}

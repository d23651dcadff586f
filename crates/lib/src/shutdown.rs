//! Shutdown is a `watch<bool>` fanned out to every long-running task.

use tokio::sync::watch;

/// Resolves once the flag is true or the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

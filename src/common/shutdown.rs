//! Shutdown signal helpers.

use tokio::sync::watch;

/// Resolve once shutdown has been requested.
///
/// A dropped sender counts as a shutdown request.
pub async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

pub fn is_shutdown(shutdown_rx: &watch::Receiver<bool>) -> bool {
    *shutdown_rx.borrow()
}

//! Cooperative cancellation plumbing
//!
//! Blocking engine operations take a `watch::Receiver<bool>` shutdown
//! signal. The helper here resolves only when the signal actually turns
//! true, so spurious channel writes never cancel work.

use tokio::sync::watch;

/// Resolve when the shutdown signal becomes true. If the sender is
/// dropped without firing, this never resolves.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A receiver that never fires; for callers with no shutdown source.
pub fn never() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    // Leak the sender so the channel stays open forever.
    std::mem::forget(tx);
    rx
}

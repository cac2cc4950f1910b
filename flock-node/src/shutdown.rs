//! Cooperative shutdown flag
//!
//! Every loop takes a `watch::Receiver<bool>` that flips to true once. Loops
//! race `requested` against their own work inside `select!`.

use tokio::sync::watch;

/// Resolves once the flag reads true or its sender is gone.
///
/// The borrow returned by `wait_for` is released before this returns, so the
/// future stays `Send` whatever the caller awaits next.
pub async fn requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

//! Listens for the server-wide shutdown broadcast
use tokio::sync::broadcast;

/// Wraps a broadcast receiver; once the notification is seen every later
/// call returns immediately.
#[derive(Debug)]
pub(crate) struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    /// wait for the shutdown notice
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // an error means every sender dropped, which also means shutdown
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

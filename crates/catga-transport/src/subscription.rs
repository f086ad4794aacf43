//! Subscription handles.

use tokio_util::sync::CancellationToken;

/// Handle for an active subscription. Dropping it stops delivery to
/// this subscriber; the callback currently running is allowed to
/// complete.
pub struct Subscription {
    id: u64,
    token: CancellationToken,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(id: u64, token: CancellationToken, on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self { id, token, on_drop: Some(Box::new(on_drop)) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop delivery without waiting for drop.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.token.cancel();
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

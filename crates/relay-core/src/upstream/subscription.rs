use tokio::sync::watch;

/// Handle to a background head or log subscription.
///
/// Dropping the handle stops the subscription. A tick that is already in flight runs to
/// completion but its result is not delivered.
#[derive(Debug)]
pub struct Subscription {
    kind: &'static str,
    stop: watch::Sender<bool>,
}

impl Subscription {
    pub(crate) fn new(kind: &'static str) -> (Self, watch::Receiver<bool>) {
        let (stop, stop_rx) = watch::channel(false);
        (Self { kind, stop }, stop_rx)
    }

    /// Stops the subscription. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.stop.send_replace(true) {
            tracing::debug!(kind = self.kind, "subscription stopped");
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !*self.stop.borrow()
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Resolves once `stop` is set or its handle is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

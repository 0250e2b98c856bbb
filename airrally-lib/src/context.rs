use tokio::sync::broadcast;
use crate::message::{Feedback, Notification};

/// A small wrapper around a Tokio broadcast channel,
/// used to fan-out feedback notifications to haptics, audio and UI.
/// Lagging subscribers lose messages; publishing never waits.
#[derive(Clone)]
pub struct Context {
    pub tx: broadcast::Sender<Notification>,
}

impl Context {
    /// Create a new Context with a channel of the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish. Having no subscribers is not an error.
    pub fn publish(&self, feedback: Feedback) {
        let _ = self.tx.send(Notification::now(feedback));
    }
}

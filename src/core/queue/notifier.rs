use crate::core::message::{ClientId, Message};

/// Told about every message the queue discards to stay within capacity.
///
/// Called synchronously from `Queue::add`, at most once per discarded element.
/// A returned error is logged and otherwise ignored.
pub trait DropNotifier: Send + Sync {
    fn on_dropped(&self, client_id: &ClientId, message: &Message) -> anyhow::Result<()>;
}

impl<F> DropNotifier for F
where
    F: Fn(&ClientId, &Message) -> anyhow::Result<()> + Send + Sync,
{
    fn on_dropped(&self, client_id: &ClientId, message: &Message) -> anyhow::Result<()> {
        self(client_id, message)
    }
}

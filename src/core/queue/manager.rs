//! QueueManager hands out the single queue owned by each client.
//!
//! Uses DashMap so attaching and detaching clients does not serialise on one
//! lock; queues of distinct clients never coordinate with each other.

use std::num::NonZeroUsize;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::core::error::QueueResult;
use crate::core::message::ClientId;
use crate::core::queue::{DropNotifier, Queue};
use crate::core::store::ListStore;

pub struct QueueManager<S: ListStore> {
    store: Arc<S>,
    max_queued: NonZeroUsize,
    notifier: Option<Arc<dyn DropNotifier>>,
    /// Map of client ID → queue.
    queues: DashMap<ClientId, Arc<Queue<S>>>,
}

impl<S: ListStore> std::fmt::Debug for QueueManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("store", &self.store)
            .field("max_queued", &self.max_queued)
            .field("queues", &self.queues.len())
            .finish()
    }
}

impl<S: ListStore> QueueManager<S> {
    pub fn new(store: Arc<S>, max_queued: NonZeroUsize) -> Self {
        Self {
            store,
            max_queued,
            notifier: None,
            queues: DashMap::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DropNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the client's queue, creating it on first use.
    pub fn get_or_create(&self, client_id: &ClientId) -> Arc<Queue<S>> {
        if let Some(existing) = self.queues.get(client_id) {
            return Arc::clone(&*existing);
        }

        // Insert only if not already present (handles race)
        let entry = self.queues.entry(client_id.clone()).or_insert_with(|| {
            let mut queue = Queue::new(client_id.clone(), self.max_queued, Arc::clone(&self.store));
            if let Some(notifier) = &self.notifier {
                queue = queue.with_notifier(Arc::clone(notifier));
            }
            Arc::new(queue)
        });

        Arc::clone(&*entry)
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<Queue<S>>> {
        self.queues.get(client_id).map(|q| Arc::clone(&*q))
    }

    /// Returns the total number of queues currently attached.
    pub fn count(&self) -> usize {
        self.queues.len()
    }

    /// Forget the client's queue, closing it. Stored elements are kept.
    pub fn detach(&self, client_id: &ClientId) {
        if let Some((_, queue)) = self.queues.remove(client_id) {
            queue.close();
        }
    }

    /// End the client's session: close its queue and purge its storage.
    pub fn terminate(&self, client_id: &ClientId) -> QueueResult<()> {
        let queue = self.get_or_create(client_id);
        queue.close();
        queue.clean()?;
        self.queues.remove(client_id);
        info!(client_id = %client_id, "session terminated");
        Ok(())
    }
}

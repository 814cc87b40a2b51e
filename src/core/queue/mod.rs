//! Per-client outbound queue.
//!
//! Each connected client owns one [`Queue`]. The queue keeps its elements in a
//! list in the backing store, ordered as:
//!
//! ```text
//!   [0, current)     dispatched, waiting for acknowledgment (packet id != 0)
//!   [current, len)   pending, never dispatched (packet id == 0)
//! ```
//!
//! After every (re)connect the consumer first drains the dispatched region with
//! [`Queue::read_inflight`], then pulls new elements with [`Queue::read`], which
//! blocks until a producer calls [`Queue::add`] or the queue is closed.
//!
//! Counters, cursor and read cache only change after the store has accepted the
//! corresponding write. A failed flush leaves the queue exactly as it was.

pub mod cache;
pub mod manager;
pub mod notifier;

pub use cache::ReadCache;
pub use manager::QueueManager;
pub use notifier::DropNotifier;

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::core::elem::Elem;
use crate::core::error::{QueueError, QueueResult};
use crate::core::message::{current_timestamp, ClientId, PacketId};
use crate::core::store::{Command, ListConn, ListStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Open,
    Closed,
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub current: usize,
    pub inflight: usize,
    pub lifecycle: Lifecycle,
    pub inflight_drained: bool,
    pub dropped_total: u64,
    pub expired_total: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct QueueState {
    lifecycle: Lifecycle,
    /// Bumped by every `init`; a reader parked across a re-init gives up.
    generation: u64,
    len: usize,
    current: usize,
    inflight_drained: bool,
    read_cache: ReadCache,
    last_error: Option<String>,
}

impl QueueState {
    fn fail(&mut self, err: impl Into<QueueError>) -> QueueError {
        let err = err.into();
        self.last_error = Some(err.to_string());
        err
    }
}

#[derive(Debug, Clone)]
struct Stored {
    encoded: Bytes,
    elem: Elem,
}

enum Victim {
    Incoming,
    Stored(Stored),
}

pub struct Queue<S: ListStore> {
    client_id: ClientId,
    max: usize,
    store: Arc<S>,
    notifier: Option<Arc<dyn DropNotifier>>,
    state: Mutex<QueueState>,
    cond: Condvar,
    dropped_total: AtomicU64,
    expired_total: AtomicU64,
}

impl<S: ListStore> fmt::Debug for Queue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("client_id", &self.client_id)
            .field("max", &self.max)
            .field("store", &self.store)
            .field("has_notifier", &self.notifier.is_some())
            .finish()
    }
}

impl<S: ListStore> Queue<S> {
    pub fn new(client_id: ClientId, max: NonZeroUsize, store: Arc<S>) -> Self {
        Self {
            client_id,
            max: max.get(),
            store,
            notifier: None,
            state: Mutex::new(QueueState {
                lifecycle: Lifecycle::Uninitialized,
                generation: 0,
                len: 0,
                current: 0,
                inflight_drained: false,
                read_cache: ReadCache::new(),
                last_error: None,
            }),
            cond: Condvar::new(),
            dropped_total: AtomicU64::new(0),
            expired_total: AtomicU64::new(0),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DropNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    fn key(&self) -> &str {
        self.client_id.as_str()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            len: state.len,
            current: state.current,
            inflight: state.read_cache.len(),
            lifecycle: state.lifecycle,
            inflight_drained: state.inflight_drained,
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            expired_total: self.expired_total.load(Ordering::Relaxed),
            last_error: state.last_error.clone(),
        }
    }

    /// Start a new connection lifecycle. With `clean_start` every stored
    /// element is purged first.
    #[tracing::instrument(skip(self), fields(client_id = %self.client_id))]
    pub fn init(&self, clean_start: bool) -> QueueResult<()> {
        let mut state = self.state.lock();
        let mut conn = self.store.checkout().map_err(|e| state.fail(e))?;

        if clean_start {
            conn.delete(self.key()).map_err(|e| state.fail(e))?;
        }
        let len = conn.len(self.key()).map_err(|e| state.fail(e))?;

        state.lifecycle = Lifecycle::Open;
        state.generation = state.generation.wrapping_add(1);
        state.len = len;
        state.current = 0;
        state.inflight_drained = false;
        state.read_cache.clear();
        state.last_error = None;

        drop(conn);
        drop(state);
        self.cond.notify_all();

        info!(len, clean_start, "queue initialised");
        Ok(())
    }

    /// Mark the queue closed and wake a blocked reader.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.lifecycle = Lifecycle::Closed;
        drop(state);
        self.cond.notify_all();
        debug!(client_id = %self.client_id, "queue closed");
    }

    /// Permanently purge the client's stored elements.
    #[tracing::instrument(skip(self), fields(client_id = %self.client_id))]
    pub fn clean(&self) -> QueueResult<()> {
        let mut state = self.state.lock();
        let mut conn = self.store.checkout().map_err(|e| state.fail(e))?;
        conn.delete(self.key()).map_err(|e| state.fail(e))?;

        state.len = 0;
        state.current = 0;
        state.read_cache.clear();
        info!("queue storage purged");
        Ok(())
    }

    /// Enqueue `elem`, discarding one element first if the queue is full.
    ///
    /// Allowed in every lifecycle state. Before the first `init` the stored
    /// length is read from the store on each call.
    #[tracing::instrument(skip(self, elem), fields(client_id = %self.client_id))]
    pub fn add(&self, elem: Elem) -> QueueResult<()> {
        let now = current_timestamp();
        let encoded = elem.encode()?;

        let mut state = self.state.lock();
        let mut conn = self.store.checkout().map_err(|e| state.fail(e))?;

        // Offline traffic ahead of the first `init`: size the queue from the store.
        if state.lifecycle == Lifecycle::Uninitialized {
            let len = conn.len(self.key()).map_err(|e| state.fail(e))?;
            state.len = len;
        }

        let mut evicted = None;
        if state.len >= self.max {
            let victim = self
                .pick_victim(&mut conn, &state, &elem, now)
                .map_err(|e| state.fail(e))?;
            match victim {
                Victim::Incoming => {
                    drop(conn);
                    drop(state);
                    warn!("message queue is full, dropping incoming message");
                    self.report_dropped(&elem);
                    return Ok(());
                }
                Victim::Stored(stored) => {
                    conn.send(Command::RemoveOne {
                        key: self.key().to_string(),
                        value: stored.encoded,
                    });
                    evicted = Some(stored.elem);
                }
            }
        }

        conn.send(Command::Append {
            key: self.key().to_string(),
            value: encoded,
        });
        conn.flush().map_err(|e| state.fail(e))?;

        if evicted.is_none() {
            state.len += 1;
        }
        drop(conn);
        drop(state);
        self.cond.notify_one();

        if let Some(victim) = evicted {
            warn!(
                packet_id = %victim.packet_id(),
                "message queue is full, dropped queued message"
            );
            self.report_dropped(&victim);
        }
        Ok(())
    }

    /// Chooses what to discard from a full queue. Dispatched elements are never
    /// candidates.
    fn pick_victim(
        &self,
        conn: &mut S::Conn,
        state: &QueueState,
        incoming: &Elem,
        now: u64,
    ) -> QueueResult<Victim> {
        if state.inflight_drained && state.current >= state.len {
            return Ok(Victim::Incoming);
        }

        let window = conn.range(self.key(), state.current, state.len.saturating_sub(1))?;
        let mut oldest_pending: Option<Stored> = None;
        let mut at_most_once: Option<Stored> = None;

        for encoded in window {
            let elem = Elem::decode(&encoded)?;
            if elem.packet_id().is_assigned() {
                continue;
            }
            let candidate = Stored { encoded, elem };
            if candidate.elem.is_expired(now) {
                return Ok(Victim::Stored(candidate));
            }
            if oldest_pending.is_none() {
                oldest_pending = Some(candidate.clone());
            }
            if at_most_once.is_none() && candidate.elem.is_at_most_once() {
                at_most_once = Some(candidate);
            }
        }

        if let Some(stored) = at_most_once {
            return Ok(Victim::Stored(stored));
        }
        if incoming.is_at_most_once() {
            return Ok(Victim::Incoming);
        }
        Ok(oldest_pending.map_or(Victim::Incoming, Victim::Stored))
    }

    fn report_dropped(&self, elem: &Elem) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
        let (Some(notifier), Some(message)) = (&self.notifier, elem.as_message()) else {
            return;
        };
        if let Err(err) = notifier.on_dropped(&self.client_id, message) {
            warn!(client_id = %self.client_id, "drop notifier failed: {err:#}");
        }
    }

    /// Overwrite a dispatched element that carries the same packet id as
    /// `elem`. Returns `false` when no such element exists.
    #[tracing::instrument(skip(self, elem), fields(client_id = %self.client_id, packet_id = %elem.packet_id()))]
    pub fn replace(&self, elem: Elem) -> QueueResult<bool> {
        let id = elem.packet_id();
        if !id.is_assigned() {
            return Ok(false);
        }
        let encoded = elem.encode()?;

        let mut state = self.state.lock();
        if state.current == 0 {
            return Ok(false);
        }
        let mut conn = self.store.checkout().map_err(|e| state.fail(e))?;
        let dispatched = conn
            .range(self.key(), 0, state.current - 1)
            .map_err(|e| state.fail(e))?;

        for (index, raw) in dispatched.iter().enumerate() {
            let stored = Elem::decode(raw).map_err(|e| state.fail(e))?;
            if stored.packet_id() == id {
                conn.set(self.key(), index, encoded.clone())
                    .map_err(|e| state.fail(e))?;
                state.read_cache.insert(id, encoded);
                trace!(index, "replaced dispatched element");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Replay up to `limit` elements that were dispatched during an earlier
    /// connection and are still unacknowledged.
    ///
    /// Stops at the first never-dispatched element; from then on the in-flight
    /// region is drained and [`Queue::read`] may be used.
    #[tracing::instrument(skip(self), fields(client_id = %self.client_id))]
    pub fn read_inflight(&self, limit: usize) -> QueueResult<Vec<Elem>> {
        let mut state = self.state.lock();
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.store.checkout().map_err(|e| state.fail(e))?;
        let start = state.current;
        let window = conn
            .range(self.key(), start, start.saturating_add(limit - 1))
            .map_err(|e| state.fail(e))?;

        let mut elems = Vec::new();
        let mut cached = Vec::new();
        let mut drained = window.is_empty();
        for encoded in window {
            let elem = Elem::decode(&encoded).map_err(|e| state.fail(e))?;
            let id = elem.packet_id();
            if !id.is_assigned() {
                drained = true;
                break;
            }
            cached.push((id, encoded));
            elems.push(elem);
        }

        state.current += elems.len();
        state.read_cache.extend(cached);
        if drained {
            state.inflight_drained = true;
        }
        debug!(
            replayed = elems.len(),
            drained = state.inflight_drained,
            "in-flight elements replayed"
        );
        Ok(elems)
    }

    /// Dispatch up to `ids.len()` pending elements, assigning them the given
    /// packet ids in order.
    ///
    /// Blocks while nothing is pending. Expired elements are discarded on the
    /// way; at-most-once elements are returned and removed at once without
    /// consuming an id.
    ///
    /// # Panics
    ///
    /// If called before [`Queue::read_inflight`] has drained the in-flight
    /// region of the current connection.
    #[tracing::instrument(skip(self, ids), fields(client_id = %self.client_id, batch = ids.len()))]
    pub fn read(&self, ids: &[PacketId]) -> QueueResult<Vec<Elem>> {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Closed {
            return Err(QueueError::Closed);
        }
        if !state.inflight_drained {
            panic!(
                "read called for client {} before read_inflight drained the in-flight elements",
                self.client_id
            );
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let generation = state.generation;
        while state.current >= state.len && state.lifecycle != Lifecycle::Closed {
            self.cond.wait(&mut state);
            if state.generation != generation {
                debug!("queue re-initialised while waiting; abandoning read");
                return Err(QueueError::Closed);
            }
        }
        if state.lifecycle == Lifecycle::Closed {
            return Err(QueueError::Closed);
        }

        let now = current_timestamp();
        let mut conn = self.store.checkout().map_err(|e| state.fail(e))?;
        let window = conn
            .range(
                self.key(),
                state.current,
                state.current.saturating_add(ids.len() - 1),
            )
            .map_err(|e| state.fail(e))?;

        let mut len = state.len;
        let mut current = state.current;
        let mut expired = 0u64;
        let mut cached = Vec::new();
        let mut elems = Vec::with_capacity(window.len());
        let mut next_id = ids.iter().copied();

        for encoded in window {
            let mut elem = Elem::decode(&encoded).map_err(|e| state.fail(e))?;

            if elem.is_expired(now) {
                conn.send(Command::RemoveOne {
                    key: self.key().to_string(),
                    value: encoded,
                });
                len -= 1;
                expired += 1;
                continue;
            }

            if elem.is_at_most_once() {
                conn.send(Command::RemoveOne {
                    key: self.key().to_string(),
                    value: encoded,
                });
                len -= 1;
                elems.push(elem);
                continue;
            }

            let Some(id) = next_id.next() else {
                break;
            };
            elem.set_packet_id(id);
            let updated = elem.encode().map_err(|e| state.fail(e))?;
            conn.send(Command::SetAt {
                key: self.key().to_string(),
                index: current,
                value: updated.clone(),
            });
            current += 1;
            cached.push((id, updated));
            elems.push(elem);
        }

        conn.flush().map_err(|e| state.fail(e))?;

        state.len = len;
        state.current = current;
        state.read_cache.extend(cached);
        if expired > 0 {
            self.expired_total.fetch_add(expired, Ordering::Relaxed);
            debug!(expired, "expired elements discarded");
        }
        Ok(elems)
    }

    /// Acknowledge the dispatched element carrying `id`. Unknown ids are ignored.
    #[tracing::instrument(skip(self), fields(client_id = %self.client_id))]
    pub fn remove(&self, id: PacketId) -> QueueResult<()> {
        let mut state = self.state.lock();
        let Some(encoded) = state.read_cache.get(id).cloned() else {
            trace!(packet_id = %id, "ignoring unknown packet id");
            return Ok(());
        };

        let mut conn = self.store.checkout().map_err(|e| state.fail(e))?;
        let removed = conn
            .remove_one(self.key(), &encoded)
            .map_err(|e| state.fail(e))?;
        state.read_cache.remove(id);

        if removed {
            state.len = state.len.saturating_sub(1);
            state.current = state.current.saturating_sub(1);
        } else {
            warn!(packet_id = %id, "acknowledged element was missing from the store");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Message, QoSLevel};
    use crate::core::store::{FailPoint, MemoryStore};

    fn queue(max: usize) -> (Queue<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        let q = Queue::new(
            ClientId::new("client-1"),
            NonZeroUsize::new(max).unwrap(),
            Arc::new(store.clone()),
        );
        (q, store)
    }

    fn publish(topic: &str, qos: QoSLevel) -> Elem {
        Elem::publish(Message::new(topic, "payload", qos))
    }

    #[test]
    fn add_increments_len_and_stores_in_order() {
        let (q, store) = queue(8);
        q.init(false).unwrap();
        q.add(publish("a", QoSLevel::AtLeastOnce)).unwrap();
        q.add(publish("b", QoSLevel::AtMostOnce)).unwrap();

        assert_eq!(q.stats().len, 2);
        let topics: Vec<String> = store
            .snapshot("client-1")
            .iter()
            .map(|raw| Elem::decode(raw).unwrap().as_message().unwrap().topic.clone())
            .collect();
        assert_eq!(topics, vec!["a", "b"]);
    }

    #[test]
    fn init_reads_existing_length_and_clean_start_purges() {
        let (q, _store) = queue(8);
        q.init(false).unwrap();
        q.add(publish("a", QoSLevel::AtLeastOnce)).unwrap();
        q.add(publish("b", QoSLevel::AtLeastOnce)).unwrap();

        q.init(false).unwrap();
        let stats = q.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(stats.current, 0);
        assert!(!stats.inflight_drained);
        assert_eq!(stats.lifecycle, Lifecycle::Open);

        q.init(true).unwrap();
        assert_eq!(q.stats().len, 0);
    }

    #[test]
    fn failed_flush_leaves_counters_untouched() {
        let (q, store) = queue(8);
        q.init(false).unwrap();

        store.fail_next(FailPoint::Flush, 1);
        let err = q.add(publish("a", QoSLevel::AtLeastOnce)).unwrap_err();
        assert!(matches!(err, QueueError::Store(_)));

        let stats = q.stats();
        assert_eq!(stats.len, 0);
        assert!(stats.last_error.is_some());
        assert!(store.snapshot("client-1").is_empty());
        assert_eq!(store.active_connections(), 0);
    }

    #[test]
    fn read_with_empty_batch_returns_nothing() {
        let (q, _store) = queue(8);
        q.init(false).unwrap();
        q.read_inflight(4).unwrap();
        assert!(q.read(&[]).unwrap().is_empty());
    }

    #[test]
    fn read_inflight_with_zero_limit_keeps_gate_closed() {
        let (q, _store) = queue(8);
        q.init(false).unwrap();
        assert!(q.read_inflight(0).unwrap().is_empty());
        assert!(!q.stats().inflight_drained);
    }

    #[test]
    fn close_before_read_reports_closed() {
        let (q, _store) = queue(8);
        q.init(false).unwrap();
        q.read_inflight(1).unwrap();
        q.close();
        assert!(matches!(q.read(&[PacketId::new(1)]), Err(QueueError::Closed)));
        assert_eq!(q.stats().lifecycle, Lifecycle::Closed);
    }

    #[test]
    fn clean_resets_counters() {
        let (q, store) = queue(8);
        q.init(false).unwrap();
        q.add(publish("a", QoSLevel::AtLeastOnce)).unwrap();
        q.read_inflight(1).unwrap();
        q.read(&[PacketId::new(1)]).unwrap();

        q.clean().unwrap();
        let stats = q.stats();
        assert_eq!((stats.len, stats.current, stats.inflight), (0, 0, 0));
        assert!(store.keys().is_empty());
    }
}

//! Process-local list store.
//!
//! Holds every list in memory behind a single lock. Useful for tests and for
//! brokers that do not need queues to survive a restart. Failures can be
//! injected at checkout, immediate-command and flush time.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{apply_batch, range_of, Command, ListConn, ListStore, Lists};
use crate::core::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Checkout,
    /// Any immediate (non-pipelined) command.
    Command,
    Flush,
}

#[derive(Debug, Default)]
struct Faults {
    checkout: AtomicUsize,
    command: AtomicUsize,
    flush: AtomicUsize,
}

impl Faults {
    fn counter(&self, point: FailPoint) -> &AtomicUsize {
        match point {
            FailPoint::Checkout => &self.checkout,
            FailPoint::Command => &self.command,
            FailPoint::Flush => &self.flush,
        }
    }

    fn trip(&self, point: FailPoint) -> Result<(), StoreError> {
        let counter = self.counter(point);
        let armed = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StoreError::Io(io::Error::other(format!(
                "injected {point:?} failure"
            ))));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Shared {
    lists: Mutex<Lists>,
    active: AtomicUsize,
    faults: Faults,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` operations at `point` fail with an I/O error.
    pub fn fail_next(&self, point: FailPoint, times: usize) {
        self.shared
            .faults
            .counter(point)
            .fetch_add(times, Ordering::SeqCst);
    }

    /// Number of connections currently checked out.
    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Copy of the list stored under `key`.
    pub fn snapshot(&self, key: &str) -> Vec<Bytes> {
        self.shared.lists.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.lists.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ListStore for MemoryStore {
    type Conn = MemoryConn;

    fn checkout(&self) -> Result<MemoryConn, StoreError> {
        self.shared.faults.trip(FailPoint::Checkout)?;
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConn {
            shared: Arc::clone(&self.shared),
            pending: Vec::new(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryConn {
    shared: Arc<Shared>,
    pending: Vec<Command>,
}

impl MemoryConn {
    fn run(&self, command: Command) -> Result<(), StoreError> {
        self.shared.faults.trip(FailPoint::Command)?;
        let mut lists = self.shared.lists.lock();
        apply_batch(&mut lists, std::slice::from_ref(&command))
    }
}

impl ListConn for MemoryConn {
    fn len(&mut self, key: &str) -> Result<usize, StoreError> {
        self.shared.faults.trip(FailPoint::Command)?;
        Ok(self.shared.lists.lock().get(key).map_or(0, Vec::len))
    }

    fn range(&mut self, key: &str, start: usize, stop: usize) -> Result<Vec<Bytes>, StoreError> {
        self.shared.faults.trip(FailPoint::Command)?;
        Ok(range_of(self.shared.lists.lock().get(key), start, stop))
    }

    fn set(&mut self, key: &str, index: usize, value: Bytes) -> Result<(), StoreError> {
        self.run(Command::SetAt {
            key: key.to_string(),
            index,
            value,
        })
    }

    fn remove_one(&mut self, key: &str, value: &[u8]) -> Result<bool, StoreError> {
        self.shared.faults.trip(FailPoint::Command)?;
        let mut lists = self.shared.lists.lock();
        let Some(list) = lists.get_mut(key) else {
            return Ok(false);
        };
        let Some(pos) = list.iter().position(|v| v.as_ref() == value) else {
            return Ok(false);
        };
        list.remove(pos);
        if list.is_empty() {
            lists.remove(key);
        }
        Ok(true)
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.run(Command::Delete {
            key: key.to_string(),
        })
    }

    fn send(&mut self, command: Command) {
        self.pending.push(command);
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let commands = std::mem::take(&mut self.pending);
        self.shared.faults.trip(FailPoint::Flush)?;
        if commands.is_empty() {
            return Ok(());
        }
        let mut lists = self.shared.lists.lock();
        apply_batch(&mut lists, &commands)
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                discarded = self.pending.len(),
                "connection released with unflushed commands"
            );
        }
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

use std::collections::HashMap;

use bytes::Bytes;

use crate::core::message::PacketId;

/// Stored bytes of every dispatched element, keyed by its packet id.
///
/// Acknowledgments remove elements by exact byte match, so the cache holds the
/// encoding exactly as it sits in the store.
#[derive(Debug, Default)]
pub struct ReadCache {
    entries: HashMap<PacketId, Bytes>,
}

impl ReadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: PacketId, encoded: Bytes) {
        self.entries.insert(id, encoded);
    }

    pub fn get(&self, id: PacketId) -> Option<&Bytes> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: PacketId) -> Option<Bytes> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = (PacketId, Bytes)>) {
        self.entries.extend(entries);
    }
}

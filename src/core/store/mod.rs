//! Backing list stores.
//!
//! A store keeps one ordered list of raw values per key. Connections are
//! checked out per operation and released when dropped. Mutations can either
//! run immediately or be pipelined with [`ListConn::send`] and committed
//! together by [`ListConn::flush`]; a flush applies every pipelined command or
//! none of them.

pub mod journal;
pub mod memory;

pub use journal::{JournalConfig, JournalStore};
pub use memory::{FailPoint, MemoryStore};

use std::collections::HashMap;
use std::fmt::Debug;

use bytes::Bytes;

use crate::core::error::StoreError;

/// A pipelined list mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Append { key: String, value: Bytes },
    SetAt { key: String, index: usize, value: Bytes },
    /// Removes the first element equal to `value`, scanning from the head.
    RemoveOne { key: String, value: Bytes },
    Delete { key: String },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Append { key, .. }
            | Command::SetAt { key, .. }
            | Command::RemoveOne { key, .. }
            | Command::Delete { key } => key,
        }
    }
}

pub trait ListStore: Send + Sync + Debug {
    type Conn: ListConn;

    fn checkout(&self) -> Result<Self::Conn, StoreError>;
}

/// A checked-out store connection.
///
/// Immediate commands do not drain the pipeline. Dropping a connection
/// discards anything still pipelined.
pub trait ListConn {
    fn len(&mut self, key: &str) -> Result<usize, StoreError>;

    /// Elements `start..=stop`, clamped to the list bounds.
    fn range(&mut self, key: &str, start: usize, stop: usize) -> Result<Vec<Bytes>, StoreError>;

    fn set(&mut self, key: &str, index: usize, value: Bytes) -> Result<(), StoreError>;

    /// Returns whether an element was removed.
    fn remove_one(&mut self, key: &str, value: &[u8]) -> Result<bool, StoreError>;

    fn delete(&mut self, key: &str) -> Result<(), StoreError>;

    fn send(&mut self, command: Command);

    fn flush(&mut self) -> Result<(), StoreError>;
}

pub(crate) type Lists = HashMap<String, Vec<Bytes>>;

pub(crate) fn range_of(list: Option<&Vec<Bytes>>, start: usize, stop: usize) -> Vec<Bytes> {
    let Some(list) = list else {
        return Vec::new();
    };
    if start > stop || start >= list.len() {
        return Vec::new();
    }
    let end = stop.min(list.len() - 1);
    list[start..=end].to_vec()
}

/// Applies one command to the list it addresses. Returns whether anything changed.
pub(crate) fn apply_to_list(list: &mut Vec<Bytes>, command: &Command) -> Result<bool, StoreError> {
    match command {
        Command::Append { value, .. } => {
            list.push(value.clone());
            Ok(true)
        }
        Command::SetAt { key, index, value } => match list.get_mut(*index) {
            Some(slot) => {
                *slot = value.clone();
                Ok(true)
            }
            None => Err(StoreError::IndexOutOfRange {
                key: key.clone(),
                index: *index,
            }),
        },
        Command::RemoveOne { value, .. } => match list.iter().position(|v| v == value) {
            Some(pos) => {
                list.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        },
        Command::Delete { .. } => {
            let changed = !list.is_empty();
            list.clear();
            Ok(changed)
        }
    }
}

/// Applies `commands` in order, all or nothing.
pub(crate) fn apply_batch(lists: &mut Lists, commands: &[Command]) -> Result<(), StoreError> {
    let mut scratch: Lists = HashMap::new();
    for command in commands {
        let list = scratch
            .entry(command.key().to_string())
            .or_insert_with(|| lists.get(command.key()).cloned().unwrap_or_default());
        apply_to_list(list, command)?;
    }

    for (key, list) in scratch {
        if list.is_empty() {
            lists.remove(&key);
        } else {
            lists.insert(key, list);
        }
    }
    Ok(())
}

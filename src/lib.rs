//! sessionq – persistent, crash-recoverable outbound queues for broker clients.
//!
//! This crate exports
//!  * `core`    – queued elements, the queue engine, and backing list stores
//!  * `config`  – TOML/YAML + environment driven configuration
//!  * `logging` – tracing subscriber setup
//!
//! A broker embeds a [`QueueManager`] over a [`JournalStore`] (durable) or a
//! [`MemoryStore`] (process-local) and drives one [`Queue`] per connected
//! client.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use crate::config::{Config, ConfigError};
pub use crate::core::elem::{CodecError, Elem, MessageWithId, Publish, Pubrel};
pub use crate::core::error::{QueueError, QueueResult, StoreError};
pub use crate::core::message::{ClientId, Message, PacketId, QoSLevel};
pub use crate::core::queue::{DropNotifier, Lifecycle, Queue, QueueManager, QueueStats};
pub use crate::core::store::{JournalConfig, JournalStore, ListConn, ListStore, MemoryStore};

//! Durable list store backed by an append-only journal.
//!
//! Every commit (one immediate command or one flushed pipeline) is framed as a
//! single record `[seq u64 | len u32 | crc32 u32 | batch]` and written to the
//! journal before it becomes visible. The batch is `[count u32]` followed by
//! `count` length-prefixed commands, so a torn write loses a whole batch and
//! never half of one. Opening a journal replays all records to rebuild the
//! lists, so queues survive a crash.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32Hasher;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{apply_batch, range_of, Command, ListConn, ListStore, Lists};
use crate::core::error::StoreError;

const HEADER_MAGIC: &[u8; 8] = b"SESSIONQ";
const HEADER_VERSION: u32 = 1;
const HEADER_LEN: u64 = 32;
const RECORD_HEADER_LEN: usize = 8 + 4 + 4;

const OP_APPEND: u8 = 1;
const OP_SET_AT: u8 = 2;
const OP_REMOVE_ONE: u8 = 3;
const OP_DELETE: u8 = 4;

/// fsync policy for the journal.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Call fsync every N records. If `None`, do not fsync based on record count.
    pub fsync_every_n: Option<usize>,
    /// Call fsync if at least this duration has elapsed since the last fsync.
    /// Checked on each write. If `None`, do not fsync based on time.
    pub fsync_interval: Option<Duration>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            fsync_every_n: Some(64),
            fsync_interval: None,
        }
    }
}

#[derive(Debug)]
struct JournalState {
    file: File,
    write_offset: u64,
    next_seq: u64,
    unsynced_records: usize,
    last_sync: Instant,
    lists: Lists,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    config: JournalConfig,
    state: Mutex<JournalState>,
    active: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct JournalStore {
    shared: Arc<Shared>,
}

impl JournalStore {
    /// Open or create a journal at the given path with default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_config(path, JournalConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: JournalConfig,
    ) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path_ref)?;

        let raw = fs::read(path_ref)?;
        let (lists, next_seq, write_offset) = if raw.is_empty() {
            write_header(&mut file)?;
            (Lists::new(), 1, HEADER_LEN)
        } else {
            validate_header(&raw)?;
            replay(&raw)?
        };

        if write_offset < raw.len() as u64 {
            warn!(
                path = %path_ref.display(),
                torn_bytes = raw.len() as u64 - write_offset,
                "truncating torn journal tail"
            );
            file.set_len(write_offset)?;
            file.sync_data()?;
        }

        info!(
            path = %path_ref.display(),
            keys = lists.len(),
            next_seq,
            "journal opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                path: path_ref.to_path_buf(),
                config,
                state: Mutex::new(JournalState {
                    file,
                    write_offset,
                    next_seq,
                    unsynced_records: 0,
                    last_sync: Instant::now(),
                    lists,
                }),
                active: AtomicUsize::new(0),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Number of connections currently checked out.
    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Keys that currently hold a non-empty list, sorted.
    pub fn keys(&self) -> Vec<String> {
        let state = self.shared.state.lock();
        let mut keys: Vec<String> = state.lists.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Force buffered records to stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();
        sync_file(&mut state)
    }

    /// Rewrite the journal so it holds only the current lists.
    pub fn compact(&self) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();

        let tmp_path = self.shared.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp_path)?;
        write_header(&mut tmp)?;

        let mut keys: Vec<&String> = state.lists.keys().collect();
        keys.sort();

        let mut buffer = Vec::new();
        let mut seq = 1u64;
        for key in keys {
            let snapshot: Vec<Command> = state.lists[key]
                .iter()
                .map(|value| Command::Append {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            frame_record(&mut buffer, seq, &encode_batch(&snapshot)?)?;
            seq += 1;
        }
        tmp.write_all(&buffer)?;
        tmp.sync_data()?;
        fs::rename(&tmp_path, &self.shared.path)?;

        let before = state.write_offset;
        state.file = tmp;
        state.write_offset = HEADER_LEN + buffer.len() as u64;
        state.next_seq = seq;
        state.unsynced_records = 0;
        state.last_sync = Instant::now();

        info!(
            path = %self.shared.path.display(),
            before_bytes = before,
            after_bytes = state.write_offset,
            "journal compacted"
        );
        Ok(())
    }

    fn commit(&self, commands: &[Command]) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();

        // Validate against a copy first so nothing invalid reaches the journal.
        let mut touched: Lists = HashMap::new();
        for command in commands {
            if let Some(list) = state.lists.get(command.key()) {
                touched.insert(command.key().to_string(), list.clone());
            }
        }
        apply_batch(&mut touched, commands)?;

        let mut buffer = Vec::new();
        let seq = state.next_seq;
        frame_record(&mut buffer, seq, &encode_batch(commands)?)?;

        let offset = state.write_offset;
        if let Err(err) = write_at(&mut state.file, offset, &buffer) {
            error!(path = %self.shared.path.display(), "journal write failed: {err}");
            rewind(&mut state.file, offset);
            return Err(err.into());
        }
        state.unsynced_records += 1;

        if let Err(err) = self.maybe_sync(&mut state) {
            error!(path = %self.shared.path.display(), "journal fsync failed: {err}");
            rewind(&mut state.file, offset);
            return Err(err);
        }

        state.write_offset = offset + buffer.len() as u64;
        state.next_seq = seq + 1;
        let keys: HashSet<&str> = commands.iter().map(Command::key).collect();
        for key in keys {
            match touched.remove(key) {
                Some(list) => {
                    state.lists.insert(key.to_string(), list);
                }
                None => {
                    state.lists.remove(key);
                }
            }
        }
        Ok(())
    }

    fn maybe_sync(&self, state: &mut JournalState) -> Result<(), StoreError> {
        let mut should_sync = false;

        if let Some(every_n) = self.shared.config.fsync_every_n {
            if state.unsynced_records >= every_n {
                should_sync = true;
            }
        }

        if !should_sync {
            if let Some(interval) = self.shared.config.fsync_interval {
                if state.last_sync.elapsed() >= interval {
                    should_sync = true;
                }
            }
        }

        if should_sync {
            let span = tracing::trace_span!("journal_sync");
            let _guard = span.enter();
            sync_file(state)?;
        }
        Ok(())
    }
}

impl ListStore for JournalStore {
    type Conn = JournalConn;

    fn checkout(&self) -> Result<JournalConn, StoreError> {
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        Ok(JournalConn {
            store: self.clone(),
            pending: Vec::new(),
        })
    }
}

#[derive(Debug)]
pub struct JournalConn {
    store: JournalStore,
    pending: Vec<Command>,
}

impl ListConn for JournalConn {
    fn len(&mut self, key: &str) -> Result<usize, StoreError> {
        let state = self.store.shared.state.lock();
        Ok(state.lists.get(key).map_or(0, Vec::len))
    }

    fn range(&mut self, key: &str, start: usize, stop: usize) -> Result<Vec<Bytes>, StoreError> {
        let state = self.store.shared.state.lock();
        Ok(range_of(state.lists.get(key), start, stop))
    }

    fn set(&mut self, key: &str, index: usize, value: Bytes) -> Result<(), StoreError> {
        self.store.commit(&[Command::SetAt {
            key: key.to_string(),
            index,
            value,
        }])
    }

    fn remove_one(&mut self, key: &str, value: &[u8]) -> Result<bool, StoreError> {
        let present = {
            let state = self.store.shared.state.lock();
            state
                .lists
                .get(key)
                .is_some_and(|list| list.iter().any(|v| v.as_ref() == value))
        };
        if !present {
            return Ok(false);
        }
        self.store.commit(&[Command::RemoveOne {
            key: key.to_string(),
            value: Bytes::copy_from_slice(value),
        }])?;
        Ok(true)
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.store.commit(&[Command::Delete {
            key: key.to_string(),
        }])
    }

    fn send(&mut self, command: Command) {
        self.pending.push(command);
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let commands = std::mem::take(&mut self.pending);
        if commands.is_empty() {
            return Ok(());
        }
        self.store.commit(&commands)
    }
}

impl Drop for JournalConn {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                discarded = self.pending.len(),
                "connection released with unflushed commands"
            );
        }
        self.store.shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn write_at(file: &mut File, offset: u64, buffer: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buffer)?;
    file.flush()
}

/// Best-effort removal of a partially written batch.
fn rewind(file: &mut File, offset: u64) {
    if let Err(err) = file.set_len(offset) {
        error!("failed to truncate journal back to {offset}: {err}");
    }
}

fn sync_file(state: &mut JournalState) -> Result<(), StoreError> {
    state.file.sync_data()?;
    state.unsynced_records = 0;
    state.last_sync = Instant::now();
    Ok(())
}

fn write_header(file: &mut File) -> Result<(), StoreError> {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[..8].copy_from_slice(HEADER_MAGIC);
    buf[8..12].copy_from_slice(&HEADER_VERSION.to_le_bytes());
    // Remaining bytes are reserved / zero.
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

fn validate_header(raw: &[u8]) -> Result<(), StoreError> {
    if (raw.len() as u64) < HEADER_LEN {
        return Err(StoreError::Corruption(
            "file too small to contain header".to_string(),
        ));
    }
    if &raw[..8] != HEADER_MAGIC {
        return Err(StoreError::Corruption("invalid journal magic".to_string()));
    }
    let mut version_bytes = [0u8; 4];
    version_bytes.copy_from_slice(&raw[8..12]);
    let version = u32::from_le_bytes(version_bytes);
    if version != HEADER_VERSION {
        return Err(StoreError::Corruption(format!(
            "unsupported journal version: {version}"
        )));
    }
    Ok(())
}

/// Rebuilds the lists from every complete record. Returns the lists, the next
/// sequence number and the offset just past the last complete record.
fn replay(raw: &[u8]) -> Result<(Lists, u64, u64), StoreError> {
    let mut lists = Lists::new();
    let mut next_seq = 1u64;
    let mut offset = HEADER_LEN as usize;

    while raw.len() - offset >= RECORD_HEADER_LEN {
        let mut header = &raw[offset..offset + RECORD_HEADER_LEN];
        let seq = header.get_u64_le();
        let len = header.get_u32_le() as usize;
        let expected_crc = header.get_u32_le();

        let start = offset + RECORD_HEADER_LEN;
        if raw.len() - start < len {
            // Partial payload at end of file: treat tail as not present.
            break;
        }
        let payload = &raw[start..start + len];

        let mut hasher = Crc32Hasher::new();
        hasher.update(payload);
        let actual_crc = hasher.finalize();
        if actual_crc != expected_crc {
            return Err(StoreError::Corruption(format!(
                "CRC mismatch at offset {offset}: expected {expected_crc:08x}, got {actual_crc:08x}"
            )));
        }

        let batch = decode_batch(payload)
            .map_err(|reason| StoreError::Corruption(format!("record {seq}: {reason}")))?;
        apply_batch(&mut lists, &batch).map_err(|err| {
            StoreError::Corruption(format!("record {seq} cannot be replayed: {err}"))
        })?;

        next_seq = seq.wrapping_add(1);
        offset = start + len;
    }

    Ok((lists, next_seq, offset as u64))
}

fn frame_record(buffer: &mut Vec<u8>, seq: u64, payload: &[u8]) -> Result<(), StoreError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Corruption("record too large".to_string()))?;
    let mut hasher = Crc32Hasher::new();
    hasher.update(payload);

    buffer.extend_from_slice(&seq.to_le_bytes());
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(&hasher.finalize().to_le_bytes());
    buffer.extend_from_slice(payload);
    Ok(())
}

fn encode_batch(commands: &[Command]) -> Result<Bytes, StoreError> {
    let count = u32::try_from(commands.len())
        .map_err(|_| StoreError::Corruption("batch too large for journal record".to_string()))?;
    let mut buf = BytesMut::new();
    buf.put_u32(count);
    for command in commands {
        let encoded = encode_command(command)?;
        let len = u32::try_from(encoded.len()).map_err(|_| {
            StoreError::Corruption("command too large for journal record".to_string())
        })?;
        buf.put_u32(len);
        buf.put_slice(&encoded);
    }
    Ok(buf.freeze())
}

fn decode_batch(bytes: &[u8]) -> Result<Vec<Command>, String> {
    let mut slice = bytes;
    if slice.remaining() < 4 {
        return Err("record too short to contain batch size".to_string());
    }
    let count = slice.get_u32() as usize;
    let mut commands = Vec::with_capacity(count.min(64));
    for i in 0..count {
        if slice.remaining() < 4 {
            return Err(format!("batch truncated before command {i}"));
        }
        let len = slice.get_u32() as usize;
        if slice.remaining() < len {
            return Err(format!("batch truncated inside command {i}"));
        }
        commands.push(decode_command(&slice[..len])?);
        slice.advance(len);
    }
    if slice.has_remaining() {
        return Err(format!("{} trailing bytes after batch", slice.remaining()));
    }
    Ok(commands)
}

fn encode_command(command: &Command) -> Result<Bytes, StoreError> {
    let mut buf = BytesMut::new();
    let op = match command {
        Command::Append { .. } => OP_APPEND,
        Command::SetAt { .. } => OP_SET_AT,
        Command::RemoveOne { .. } => OP_REMOVE_ONE,
        Command::Delete { .. } => OP_DELETE,
    };
    buf.put_u8(op);

    let key = command.key().as_bytes();
    let key_len = u16::try_from(key.len())
        .map_err(|_| StoreError::Corruption("key too long for journal record".to_string()))?;
    buf.put_u16(key_len);
    buf.put_slice(key);

    if let Command::SetAt { index, .. } = command {
        buf.put_u64(*index as u64);
    }
    match command {
        Command::Append { value, .. }
        | Command::SetAt { value, .. }
        | Command::RemoveOne { value, .. } => {
            let value_len = u32::try_from(value.len()).map_err(|_| {
                StoreError::Corruption("value too large for journal record".to_string())
            })?;
            buf.put_u32(value_len);
            buf.put_slice(value);
        }
        Command::Delete { .. } => {}
    }
    Ok(buf.freeze())
}

fn decode_command(bytes: &[u8]) -> Result<Command, String> {
    let mut slice = bytes;
    if slice.remaining() < 3 {
        return Err("record too short to contain header".to_string());
    }
    let op = slice.get_u8();
    let key_len = slice.get_u16() as usize;
    if slice.remaining() < key_len {
        return Err("record truncated while reading key".to_string());
    }
    let key = String::from_utf8(slice.copy_to_bytes(key_len).to_vec())
        .map_err(|_| "key is not valid UTF-8".to_string())?;

    let index = if op == OP_SET_AT {
        if slice.remaining() < 8 {
            return Err("record truncated while reading index".to_string());
        }
        Some(slice.get_u64() as usize)
    } else {
        None
    };

    let value = if op == OP_DELETE {
        None
    } else {
        if slice.remaining() < 4 {
            return Err("record truncated while reading value length".to_string());
        }
        let len = slice.get_u32() as usize;
        if slice.remaining() < len {
            return Err("record truncated while reading value".to_string());
        }
        Some(slice.copy_to_bytes(len))
    };

    if slice.has_remaining() {
        return Err(format!("{} trailing bytes", slice.remaining()));
    }

    match (op, index, value) {
        (OP_APPEND, None, Some(value)) => Ok(Command::Append { key, value }),
        (OP_SET_AT, Some(index), Some(value)) => Ok(Command::SetAt { key, index, value }),
        (OP_REMOVE_ONE, None, Some(value)) => Ok(Command::RemoveOne { key, value }),
        (OP_DELETE, None, None) => Ok(Command::Delete { key }),
        (other, _, _) => Err(format!("unknown operation {other}")),
    }
}

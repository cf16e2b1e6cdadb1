//! Relay indexes (spec §3, "Relay index"; §4.5).
//!
//! A `relay_index` tracks one packet's worth of bookkeeping: the
//! control-channel data describing it (`set_control_data`) and the
//! streaming-data position/file it landed in (`set_file`) can arrive in
//! either order. The index becomes flushable only once both halves are
//! present, at which point `try_flush` writes the encoded record and
//! releases the row's self-reference.

use std::sync::{Arc, Mutex};

use crate::index_file::{IndexFile, IndexRecord};
use crate::stream::StreamHandle;

/// Sentinel written for fields unknown on protocols older than 2.8 (spec
/// §6).
pub const UNSET_SENTINEL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Empty,
    Data,
    File,
    Both,
    Flushed,
}

struct IndexState {
    fsm: State,
    record: IndexRecord,
    /// The index file this row will write into once flushed. Captured
    /// from the stream's *current* file at `set_file` time, not read
    /// lazily at flush time, so a rotation mid-flight can retarget it
    /// explicitly via `switch_all_files`.
    index_file: Option<IndexFile>,
    in_hash_table: bool,
}

pub struct RelayIndex {
    pub seq_num: u64,
    pub(crate) stream: StreamHandle,
    state: Mutex<IndexState>,
}

pub type IndexHandle = Arc<crate::refcount::Refcounted<RelayIndex>>;

impl RelayIndex {
    fn new(seq_num: u64, stream: StreamHandle) -> IndexHandle {
        crate::refcount::Refcounted::new(RelayIndex {
            seq_num,
            stream,
            state: Mutex::new(IndexState {
                fsm: State::Empty,
                record: IndexRecord::default(),
                index_file: None,
                in_hash_table: false,
            }),
        })
    }
}

/// Find the index for `seq_num` under `stream`, or create and register a
/// fresh one. Resolves the create race the same way as every other
/// registry in the crate: the loser adopts the winner and drops its
/// speculative row. On successful insertion, bumps the stream's
/// `indexes_in_flight` counter (spec §4.5 step 4).
///
/// Callers are expected to hold the stream's lock across this call, per
/// the spec; in this implementation the registry's own atomicity makes
/// that unnecessary for correctness, but callers that also touch
/// `indexes_in_flight`/rotation bookkeeping alongside this call should
/// still serialize through `stream`'s higher-level API so the two stay
/// consistent with each other.
pub fn relay_index_get_by_id_or_create(stream: &StreamHandle, seq_num: u64) -> IndexHandle {
    if let Some(existing) = stream.indexes().lookup(&seq_num) {
        return existing;
    }

    let stream_ref = crate::stream::stream_get(stream)
        .expect("caller must hold a live stream reference");
    let index = RelayIndex::new(seq_num, stream_ref);
    match stream.indexes().insert_unique(seq_num, index.clone()) {
        Ok(inserted) => {
            inserted.state.lock().expect("index lock poisoned").in_hash_table = true;
            stream.begin_index();
            inserted
        }
        Err(existing) => {
            // Lost the race: the speculative row was never linked into
            // the stream's map, so just give back the stream reference it
            // took and let it drop; no release callback is needed.
            index.stream.put(|_| {});
            if existing.get_unless_zero() {
                existing
            } else {
                relay_index_get_by_id_or_create(stream, seq_num)
            }
        }
    }
}

/// Record the control-channel half of the index: all eight big-endian
/// fields the spec assigns to it (spec §3, "Relay index": "control half:
/// eight big-endian fields (packet_size, content_size, timestamp_begin,
/// timestamp_end, events_discarded, stream_id, stream_instance_id,
/// packet_seq_num)"). Valid from `Empty` or `File`.
///
/// `minor_version` is the producer's negotiated protocol minor version; for
/// anything older than 2.8, `stream_instance_id` and `packet_seq_num` are
/// forced to the all-ones sentinel regardless of caller input (spec §4.5,
/// "Encoding"), matching the original's `relay_index_set_control_data`
/// taking `minor_version` directly rather than leaving the sentinel as a
/// separate step a caller could forget.
#[allow(clippy::too_many_arguments)]
pub fn set_control_data(
    index: &IndexHandle,
    packet_size: u64,
    content_size: u64,
    timestamp_begin: u64,
    timestamp_end: u64,
    events_discarded: u64,
    stream_id: u64,
    stream_instance_id: u64,
    packet_seq_num: u64,
    minor_version: u32,
) -> crate::error::Result<()> {
    let mut state = index.state.lock().expect("index lock poisoned");
    match state.fsm {
        State::Empty | State::File => {
            state.record.packet_size = packet_size;
            state.record.content_size = content_size;
            state.record.timestamp_begin = timestamp_begin;
            state.record.timestamp_end = timestamp_end;
            state.record.events_discarded = events_discarded;
            state.record.stream_id = stream_id;
            if minor_version < 8 {
                state.record.stream_instance_id = UNSET_SENTINEL;
                state.record.packet_seq_num = UNSET_SENTINEL;
            } else {
                state.record.stream_instance_id = stream_instance_id;
                state.record.packet_seq_num = packet_seq_num;
            }
            state.fsm = if state.fsm == State::Empty {
                State::Data
            } else {
                State::Both
            };
            Ok(())
        }
        _ => Err(crate::error::RelayError::AlreadySet),
    }
}

/// Record the streaming-data half of the index: the byte `offset` plus an
/// index-file reference captured from `stream`'s *current* file at the
/// moment of the call (spec §3, "Relay index": "data half: one big-endian
/// field *offset* plus ownership of a reference to the index file").
/// Valid from `Empty` or `Data`.
pub fn set_file(index: &IndexHandle, offset: u64) -> crate::error::Result<()> {
    let mut state = index.state.lock().expect("index lock poisoned");
    match state.fsm {
        State::Empty | State::Data => {
            if state.index_file.is_some() {
                return Err(crate::error::RelayError::AlreadySet);
            }
            state.record.offset = offset;
            state.index_file = index.stream.current_index_file();
            state.fsm = if state.fsm == State::Empty {
                State::File
            } else {
                State::Both
            };
            Ok(())
        }
        _ => Err(crate::error::RelayError::AlreadySet),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The record was written and the index transitioned to `Flushed`.
    Flushed,
    /// Not both halves are present yet, no index file is attached, or the
    /// write itself failed transiently. Not an error: a control
    /// connection racing ahead of its data connection is routine.
    Skipped,
}

/// Attempt to flush `index`'s record under its own lock (spec §4.5,
/// "BOTH → FLUSHED"). On success, releases the row's self-reference,
/// which runs `release` below.
pub fn relay_index_try_flush(index: &IndexHandle) -> FlushOutcome {
    let (record, file) = {
        let state = index.state.lock().expect("index lock poisoned");
        if state.fsm != State::Both {
            return FlushOutcome::Skipped;
        }
        let Some(file) = state.index_file.as_ref().map(IndexFile::get) else {
            return FlushOutcome::Skipped;
        };
        (state.record, file)
    };

    match file.write_record(&record) {
        Ok(()) => {
            {
                let mut state = index.state.lock().expect("index lock poisoned");
                state.fsm = State::Flushed;
            }
            index
                .stream
                .advance_pos_after_last_complete_data_index(record.offset + record.packet_size);
            index.put(release);
            FlushOutcome::Flushed
        }
        Err(_) => FlushOutcome::Skipped,
    }
}

/// The release callback invoked on `index`'s refcount reaching zero (spec
/// §4.5, "Release"): drops the index-file reference if still held,
/// unlinks from the stream's map if still linked, decrements
/// `indexes_in_flight`, and drops the counted reference to the stream.
/// Every row reaching this callback was successfully linked by
/// `relay_index_get_by_id_or_create` (the discard path on a lost create
/// race releases its stream reference directly, without going through
/// here), so the stream reference is always released.
fn release(index: &RelayIndex) {
    let (file, was_linked) = {
        let mut state = index.state.lock().expect("index lock poisoned");
        (state.index_file.take(), std::mem::take(&mut state.in_hash_table))
    };
    if let Some(file) = file {
        file.put();
    }
    if was_linked {
        index.stream.indexes().prune_dead(&index.seq_num);
        index.stream.end_index();
    }
    index.stream.put(|_| {});
}

/// Release every index still registered under `stream`, without flushing
/// any of them: used when the stream closes without flushing the
/// remaining indexes (spec §4.5, "close_all"; spec §5, "any row that had
/// been partially filled is dropped, not flushed").
pub fn close_all(stream: &StreamHandle) {
    for index in stream.indexes().iter() {
        index.put(release);
    }
}

/// Release the self-reference of every index row that currently has an
/// attached index file (the "data half already arrived" set), without
/// flushing. Rows with no attached file keep their control-half state
/// registered (spec §4.5, "close_partial_fd": "used when the daemon must
/// relinquish file descriptors without losing control-half state").
pub fn close_partial_fd(stream: &StreamHandle) {
    for index in stream.indexes().iter() {
        let has_file = index.state.lock().expect("index lock poisoned").index_file.is_some();
        if has_file {
            index.put(release);
        }
    }
}

/// Re-target every pending (not yet flushed) index row in `stream` onto
/// `new_file` and rebase its stored offset by `removed_data_count` (spec
/// §4.5, "Rotation"). `removed_data_count` is the byte offset of the
/// first unfinished packet; it must not exceed any pending row's offset.
pub fn switch_all_files(stream: &StreamHandle, new_file: &IndexFile, removed_data_count: u64) {
    for index in stream.indexes().iter() {
        let mut state = index.state.lock().expect("index lock poisoned");
        if state.fsm == State::Flushed {
            continue;
        }
        if let Some(old) = state.index_file.replace(new_file.get()) {
            old.put();
        }
        debug_assert!(removed_data_count <= state.record.offset || state.record.offset == 0);
        state.record.offset = state.record.offset.saturating_sub(removed_data_count);
    }
    stream.set_index_file(Some(new_file.get()));
}

//! Relay streams (spec §3, "Relay stream"; §4.4).
//!
//! A `relay_stream` is the unit a producer's data connection writes
//! packets into. It owns the `relay_index` registry keyed by sequence
//! number, tracks the current index file, and counts in-flight indexes so
//! a stream close can wait for its writers to settle before it releases
//! its trace.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::ctf_trace::CtfTraceHandle;
use crate::index::RelayIndex;
use crate::index_file::IndexFile;
use crate::refcount::Refcounted;
use crate::registry::Registry;

static NEXT_STREAM_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_stream_handle() -> u64 {
    NEXT_STREAM_HANDLE.fetch_add(1, Ordering::Relaxed)
}

struct StreamState {
    index_file: Option<IndexFile>,
    indexes_in_flight: u64,
    pos_after_last_complete_data_index: u64,
}

pub struct RelayStream {
    pub handle: u64,
    pub(crate) trace: CtfTraceHandle,
    state: Mutex<StreamState>,
    closed: AtomicBool,
    pub(crate) indexes: Registry<u64, RelayIndex>,
}

pub type StreamHandle = Arc<Refcounted<RelayStream>>;

impl RelayStream {
    /// Create a stream inside `trace`, taking its own counted reference to
    /// it (spec §3, "Ownership at a glance": "each relay_stream holds a
    /// counted reference to its ctf_trace") rather than sharing whatever
    /// reference the caller happens to be holding.
    pub fn new(trace: &CtfTraceHandle) -> StreamHandle {
        let trace_ref = crate::ctf_trace::ctf_trace_get(trace)
            .expect("caller must hold a live ctf_trace reference");
        let handle = next_stream_handle();
        let stream = Refcounted::new(RelayStream {
            handle,
            trace: trace_ref,
            state: Mutex::new(StreamState {
                index_file: None,
                indexes_in_flight: 0,
                pos_after_last_complete_data_index: 0,
            }),
            closed: AtomicBool::new(false),
            indexes: Registry::new(),
        });
        stream.trace.add_stream(stream.clone());
        stream
    }

    pub fn trace(&self) -> &CtfTraceHandle {
        &self.trace
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn current_index_file(&self) -> Option<IndexFile> {
        self.state
            .lock()
            .expect("stream lock poisoned")
            .index_file
            .as_ref()
            .map(IndexFile::get)
    }

    /// Install a (possibly new, post-rotation) index file as the stream's
    /// current one. Any previously installed file is released.
    pub(crate) fn set_index_file(&self, file: Option<IndexFile>) {
        let mut state = self.state.lock().expect("stream lock poisoned");
        if let Some(old) = state.index_file.take() {
            old.put();
        }
        state.index_file = file;
    }

    pub(crate) fn begin_index(&self) {
        self.state.lock().expect("stream lock poisoned").indexes_in_flight += 1;
    }

    pub(crate) fn end_index(&self) {
        let mut state = self.state.lock().expect("stream lock poisoned");
        state.indexes_in_flight = state
            .indexes_in_flight
            .checked_sub(1)
            .expect("indexes_in_flight underflow");
    }

    pub(crate) fn indexes_in_flight(&self) -> u64 {
        self.state.lock().expect("stream lock poisoned").indexes_in_flight
    }

    pub fn pos_after_last_complete_data_index(&self) -> u64 {
        self.state
            .lock()
            .expect("stream lock poisoned")
            .pos_after_last_complete_data_index
    }

    pub(crate) fn advance_pos_after_last_complete_data_index(&self, new_pos: u64) {
        let mut state = self.state.lock().expect("stream lock poisoned");
        state.pos_after_last_complete_data_index =
            state.pos_after_last_complete_data_index.max(new_pos);
    }

    pub fn indexes(&self) -> &Registry<u64, RelayIndex> {
        &self.indexes
    }
}

/// Attach `file` as `stream`'s current index file — the control path's
/// entry point for what `set_index_file` otherwise only does internally
/// (on construction it's unset; `switch_all_files` is the only other
/// writer, on rotation). Any previously attached file is released.
pub fn attach_index_file(stream: &StreamHandle, file: IndexFile) {
    stream.set_index_file(Some(file));
}

/// Take an additional counted reference to `stream`. Every `relay_index`
/// row holds one of these while it lives (spec §3, "Ownership at a
/// glance").
pub fn stream_get(stream: &StreamHandle) -> Option<StreamHandle> {
    if stream.get_unless_zero() {
        Some(stream.clone())
    } else {
        None
    }
}

/// Idempotently begin closing `stream`: mark it closed so no further index
/// creation is accepted, drop every remaining index row without flushing
/// it (spec §4.5, "close_all"), and release the stream's own lifetime
/// self-reference (spec §4.4). Safe to call more than once or
/// concurrently; only the first caller does any work. The release
/// callback unlinks the stream from its trace's list and drops the
/// stream's own counted reference to that trace.
pub fn try_stream_close(stream: &StreamHandle) {
    if stream.closed.swap(true, Ordering::AcqRel) {
        return;
    }

    crate::index::close_all(stream);
    stream.set_index_file(None);

    stream.put(|s| {
        s.trace.remove_stream(stream);
        crate::ctf_trace::ctf_trace_put(&s.trace);
    });
}

/// The process-wide stream map (keyed by opaque handle, spec §4.4).
#[derive(Default)]
pub struct StreamRegistry {
    table: Registry<u64, RelayStream>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            table: Registry::new(),
        }
    }

    pub fn register(&self, stream: StreamHandle) -> StreamHandle {
        let handle = stream.handle;
        match self.table.insert_unique(handle, stream) {
            Ok(inserted) => inserted,
            Err(existing) => existing,
        }
    }

    pub fn get(&self, handle: u64) -> Option<StreamHandle> {
        self.table.lookup(&handle)
    }

    pub fn remove(&self, stream: &StreamHandle) {
        self.table.remove_handle(&stream.handle, stream);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctf_trace::ctf_trace_get_by_path_or_create;
    use crate::session::Session;
    use crate::trace_chunk::TraceChunk;

    fn new_trace() -> CtfTraceHandle {
        let session = Session::new(1, "host", "s", TraceChunk::new("/c", 0));
        ctf_trace_get_by_path_or_create(&session, "a")
    }

    #[test]
    fn new_stream_registers_itself_under_its_trace() {
        let trace = new_trace();
        let stream = RelayStream::new(&trace);
        assert_eq!(trace.streams_snapshot().len(), 1);
        assert!(Arc::ptr_eq(&trace.streams_snapshot()[0], &stream));
    }

    #[test]
    fn close_is_idempotent_and_detaches_from_trace() {
        let trace = new_trace();
        let stream = RelayStream::new(&trace);
        try_stream_close(&stream);
        try_stream_close(&stream);
        assert!(stream.is_closed());
        assert!(trace.streams_snapshot().is_empty());
    }

    #[test]
    fn distinct_streams_get_distinct_handles() {
        let trace = new_trace();
        let a = RelayStream::new(&trace);
        let b = RelayStream::new(&trace);
        assert_ne!(a.handle, b.handle);
    }
}

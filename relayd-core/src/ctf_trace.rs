//! CTF traces (spec §3, "CTF trace"; §4.3).
//!
//! A `ctf_trace` is keyed by subpath under its session's map, has a
//! monotonic process-wide id, owns a counted reference to its session, and
//! hosts the list of `relay_stream`s created inside it. Its only weak
//! reference is the "current viewer metadata stream" pointer, published
//! with release semantics and read with acquire semantics inside the read
//! protection (spec §9).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwapAny;

use crate::refcount::Refcounted;
use crate::session::SessionHandle;
use crate::stream::StreamHandle;
use crate::viewer::{ViewerStream, ViewerStreamHandle};

/// A strictly-increasing, process-wide id generator. 0 is never assigned
/// (spec invariant 6). An atomic counter is the idiomatic Rust stand-in
/// for the spec's "allocated under a global lock": both give a total
/// order with no gaps skipped and no value repeated, without forcing a
/// blocking mutex onto the hottest allocation path in the daemon.
static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

fn next_trace_id() -> u64 {
    NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed)
}

type ViewerMetadataSlot = ArcSwapAny<Weak<Refcounted<ViewerStream>>>;

pub struct CtfTrace {
    pub id: u64,
    pub subpath: String,
    pub(crate) session: SessionHandle,
    closed: AtomicBool,
    pub(crate) streams: Mutex<Vec<StreamHandle>>,
    viewer_metadata_stream: ViewerMetadataSlot,
}

pub type CtfTraceHandle = Arc<Refcounted<CtfTrace>>;

impl CtfTrace {
    fn new(id: u64, subpath: String, session: SessionHandle) -> CtfTraceHandle {
        Refcounted::new(CtfTrace {
            id,
            subpath,
            session,
            closed: AtomicBool::new(false),
            streams: Mutex::new(Vec::new()),
            viewer_metadata_stream: ArcSwapAny::new(Weak::new()),
        })
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn streams_snapshot(&self) -> Vec<StreamHandle> {
        self.streams.lock().expect("trace lock poisoned").clone()
    }

    pub(crate) fn add_stream(&self, stream: StreamHandle) {
        self.streams.lock().expect("trace lock poisoned").push(stream);
    }

    pub(crate) fn remove_stream(&self, stream: &StreamHandle) {
        self.streams
            .lock()
            .expect("trace lock poisoned")
            .retain(|entry| !Arc::ptr_eq(entry, stream));
    }

    /// Atomically publish (or clear) the current viewer metadata stream.
    /// Readers race this against teardown of the stream it points at; they
    /// resolve the race with `viewer_metadata_stream()` below.
    pub fn publish_viewer_metadata_stream(&self, stream: Option<&ViewerStreamHandle>) {
        let weak = stream.map(Arc::downgrade).unwrap_or_default();
        self.viewer_metadata_stream.store(weak);
    }

    /// Resolve the weak viewer-metadata-stream pointer. Returns `None` if
    /// nothing has been published, or if the stream it pointed at has
    /// already begun teardown (the "allowed to dangle" window from spec
    /// §9) -- the caller sees this exactly like any other failed
    /// `get_unless_zero` on a registry lookup.
    pub fn viewer_metadata_stream(&self) -> Option<ViewerStreamHandle> {
        let weak = self.viewer_metadata_stream.load_full();
        let strong = weak.upgrade()?;
        if strong.get_unless_zero() {
            Some(strong)
        } else {
            None
        }
    }
}

/// Take an additional counted reference to `trace`. Every `relay_stream`
/// created inside it holds one of these (spec §3, "Ownership at a
/// glance"); `ctf_trace_get_by_path_or_create` hands the caller one too.
pub fn ctf_trace_get(trace: &CtfTraceHandle) -> Option<CtfTraceHandle> {
    if trace.get_unless_zero() {
        Some(trace.clone())
    } else {
        None
    }
}

/// Release a counted reference to `trace`. On the transition to zero,
/// unlinks it from its session's map and releases the session reference
/// the trace itself was holding.
pub fn ctf_trace_put(trace: &CtfTraceHandle) {
    trace.put(|t| {
        t.session().ctf_traces().remove_handle(&t.subpath, trace);
        crate::session::session_put(t.session());
    });
}

/// Find the trace at `subpath` under `session`, or create and register a
/// fresh one. No unique-insertion race needs resolving here: the spec
/// notes the caller already holds the session's control-channel ordering,
/// so a single lookup-then-insert is sufficient. We still fall back to a
/// single retry if something unexpected wins the race (e.g. two control
/// threads momentarily overlapping), rather than assume it can't happen.
///
/// Returns a freshly counted reference the caller now owns, same as any
/// other `*_get_by_*_or_create` in this crate (spec §4.1 get/put
/// discipline); a caller handing it straight to `RelayStream::new` and
/// keeping nothing for itself should `ctf_trace_put` its own copy once
/// done with it.
pub fn ctf_trace_get_by_path_or_create(session: &SessionHandle, subpath: &str) -> CtfTraceHandle {
    if let Some(existing) = session.ctf_traces().lookup(&subpath.to_string()) {
        return existing;
    }

    let session_ref =
        crate::session::session_get(session).expect("caller must hold a live session reference");
    let trace = CtfTrace::new(next_trace_id(), subpath.to_string(), session_ref);
    match session
        .ctf_traces()
        .insert_unique(subpath.to_string(), trace.clone())
    {
        Ok(inserted) => inserted,
        Err(existing) => {
            // Lost the race: the speculative trace was never linked
            // anywhere, so just give back the session reference it took
            // and let it drop; no release callback is needed.
            trace.session.put(|_| {});
            if existing.get_unless_zero() {
                existing
            } else {
                ctf_trace_get_by_path_or_create(session, subpath)
            }
        }
    }
}

/// Close every stream belonging to `trace`. Returns immediately; each
/// stream releases its own counted reference to `trace` on teardown
/// completion (spec §4.3).
pub fn ctf_trace_close(trace: &CtfTraceHandle) {
    if trace.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    for stream in trace.streams_snapshot() {
        crate::stream::try_stream_close(&stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::trace_chunk::TraceChunk;

    fn new_session() -> SessionHandle {
        Session::new(1, "host", "s", TraceChunk::new("/c", 0))
    }

    #[test]
    fn get_or_create_is_idempotent_for_the_same_subpath() {
        let session = new_session();
        let first = ctf_trace_get_by_path_or_create(&session, "ust/uid/0/64-bit");
        let second = ctf_trace_get_by_path_or_create(&session, "ust/uid/0/64-bit");
        assert!(Arc::ptr_eq(&first, &second));
        assert_ne!(first.id, 0);
    }

    #[test]
    fn distinct_subpaths_get_distinct_monotonic_ids() {
        let session = new_session();
        let a = ctf_trace_get_by_path_or_create(&session, "a");
        let b = ctf_trace_get_by_path_or_create(&session, "b");
        assert_ne!(a.id, b.id);
        assert!(a.id > 0 && b.id > 0);
    }

    #[test]
    fn viewer_metadata_stream_dangles_after_teardown() {
        let session = new_session();
        let trace = ctf_trace_get_by_path_or_create(&session, "a");
        assert!(trace.viewer_metadata_stream().is_none());
    }
}

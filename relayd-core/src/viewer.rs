//! Viewer sessions and viewer streams (spec §3, "Viewer session"/"Viewer
//! stream"; §4.6).
//!
//! A `ViewerSession` attaches to zero or more producer sessions, each
//! contributing its streams to the process-wide [`ViewerStreamRegistry`]
//! (`RelayCore::viewer_streams`) as a [`ViewerStream`] projection. Exclusivity
//! runs the other way from what a reader might expect: it is the *producer*
//! session that can only ever have one viewer attached at a time
//! (`Session::viewer_attached`), not the viewer that can only attach one
//! producer — a single viewer session's `producers` list is exactly the
//! spec's "list of attached producer sessions" (spec §3).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::refcount::Refcounted;
use crate::registry::Registry;
use crate::session::{session_get, session_put, SessionHandle};
use crate::stream::StreamHandle;
use crate::trace_chunk::TraceChunk;

static NEXT_VIEWER_STREAM_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_viewer_stream_handle() -> u64 {
    NEXT_VIEWER_STREAM_HANDLE.fetch_add(1, Ordering::Relaxed)
}

pub struct ViewerStream {
    pub handle: u64,
    pub(crate) stream: StreamHandle,
    last_sent_index_pos: AtomicU64,
    /// Claimed by whichever `close_one_session` call gets there first, so a
    /// racing second call (e.g. `close(viewer)` overlapping a direct
    /// `close_one_session`) does not release the row's lifetime reference
    /// twice.
    closing: AtomicBool,
}

pub type ViewerStreamHandle = Arc<Refcounted<ViewerStream>>;

impl ViewerStream {
    /// Project `stream` into a viewer-visible row, taking its own counted
    /// reference (spec §3, "Ownership at a glance": "a viewer_stream holds
    /// counted references to its underlying stream"). Returns `None` if
    /// `stream` has already torn down by the time we get here.
    fn new(stream: &StreamHandle) -> Option<ViewerStreamHandle> {
        let stream_ref = crate::stream::stream_get(stream)?;
        Some(Refcounted::new(ViewerStream {
            handle: next_viewer_stream_handle(),
            stream: stream_ref,
            last_sent_index_pos: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        }))
    }

    pub fn stream(&self) -> &StreamHandle {
        &self.stream
    }

    pub fn last_sent_index_pos(&self) -> u64 {
        self.last_sent_index_pos.load(Ordering::Acquire)
    }

    pub fn advance_last_sent_index_pos(&self, pos: u64) {
        self.last_sent_index_pos.fetch_max(pos, Ordering::AcqRel);
    }
}

/// The process-wide viewer-stream lookup (spec §3: "registered in a
/// process-wide map"), owned by `RelayCore`.
#[derive(Default)]
pub struct ViewerStreamRegistry {
    table: Registry<u64, ViewerStream>,
}

impl ViewerStreamRegistry {
    pub fn new() -> Self {
        Self {
            table: Registry::new(),
        }
    }

    fn register(&self, viewer_stream: ViewerStreamHandle) -> ViewerStreamHandle {
        match self.table.insert_unique(viewer_stream.handle, viewer_stream) {
            Ok(inserted) => inserted,
            Err(existing) => existing,
        }
    }

    pub fn get(&self, handle: u64) -> Option<ViewerStreamHandle> {
        self.table.lookup(&handle)
    }

    fn remove(&self, viewer_stream: &ViewerStreamHandle) {
        self.table.remove_handle(&viewer_stream.handle, viewer_stream);
    }

    pub fn iter(&self) -> impl Iterator<Item = ViewerStreamHandle> + '_ {
        self.table.iter()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
}

pub struct ViewerSession {
    pub id: u64,
    /// The spec's "list of attached producer sessions", under the spec §5
    /// `viewer_session.session_list_lock`.
    producers: Mutex<Vec<SessionHandle>>,
    /// A copy of the most recently attached producer's current trace-chunk
    /// (spec §3: "owns a copy of the producer session's current
    /// trace-chunk"), replaced wholesale on every `attach`.
    trace_chunk: Mutex<Option<TraceChunk>>,
}

pub type ViewerSessionHandle = Arc<Refcounted<ViewerSession>>;

impl ViewerSession {
    pub fn new(id: u64) -> ViewerSessionHandle {
        Refcounted::new(ViewerSession {
            id,
            producers: Mutex::new(Vec::new()),
            trace_chunk: Mutex::new(None),
        })
    }

    pub fn current_trace_chunk(&self) -> Option<TraceChunk> {
        self.trace_chunk
            .lock()
            .expect("viewer session lock poisoned")
            .clone()
    }

    pub fn attached_producers(&self) -> Vec<SessionHandle> {
        self.producers.lock().expect("viewer session lock poisoned").clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Ok,
    /// The producer already has a different viewer attached (spec §4.6:
    /// "if `viewer_attached` is true, return `ALREADY`").
    Already,
    /// The producer's refcount had already dropped to zero by the time we
    /// tried to take our own reference to it, or its trace-chunk could not
    /// be copied.
    Unknown,
}

/// Attach `viewer` to `producer`, projecting every stream it currently owns
/// into `viewer_streams` (spec §4.6).
pub fn attach(
    viewer: &ViewerSessionHandle,
    producer: &SessionHandle,
    viewer_streams: &ViewerStreamRegistry,
) -> AttachOutcome {
    if !producer.try_mark_viewer_attached() {
        return AttachOutcome::Already;
    }

    let producer = match session_get(producer) {
        Some(producer) => producer,
        None => {
            producer.clear_viewer_attached();
            return AttachOutcome::Unknown;
        }
    };

    let chunk = producer.current_trace_chunk();
    *viewer.trace_chunk.lock().expect("viewer session lock poisoned") = Some(chunk);

    for ctf_trace in producer.ctf_traces().iter() {
        for stream in ctf_trace.streams_snapshot() {
            if let Some(viewer_stream) = ViewerStream::new(&stream) {
                viewer_streams.register(viewer_stream);
            }
        }
    }

    viewer
        .producers
        .lock()
        .expect("viewer session lock poisoned")
        .push(producer);
    AttachOutcome::Ok
}

/// Detach `viewer` from `producer`: clears `viewer_attached`, removes the
/// list node, and releases the list-owned counted reference (spec §4.6).
/// Does not itself tear down any `ViewerStream` projections — that is
/// `close_one_session`'s job, which calls this once it has.
pub fn detach(viewer: &ViewerSessionHandle, producer: &SessionHandle) {
    let removed = {
        let mut producers = viewer.producers.lock().expect("viewer session lock poisoned");
        producers
            .iter()
            .position(|p| Arc::ptr_eq(p, producer))
            .map(|pos| producers.remove(pos))
    };
    if let Some(removed) = removed {
        removed.clear_viewer_attached();
        session_put(&removed);
    }
}

/// Tear down every `ViewerStream` projecting a stream belonging to
/// `producer`, drop the viewer's trace-chunk copy, and detach (spec §4.6).
/// Idempotent: a racing second call for the same `(viewer, producer)` pair
/// observes each `ViewerStream` already claimed and does nothing further.
pub fn close_one_session(
    viewer: &ViewerSessionHandle,
    producer: &SessionHandle,
    viewer_streams: &ViewerStreamRegistry,
) {
    for candidate in viewer_streams.iter() {
        if !Arc::ptr_eq(candidate.stream.trace().session(), producer) {
            continue;
        }
        if candidate.closing.swap(true, Ordering::AcqRel) {
            continue;
        }
        if candidate.get_unless_zero() {
            viewer_streams.remove(&candidate);
            candidate.put(|_| {}); // the iteration-local reference
            candidate.put(|vs| vs.stream.put(|_| {})); // the lifetime reference
        }
    }

    *viewer.trace_chunk.lock().expect("viewer session lock poisoned") = None;
    detach(viewer, producer);
}

/// Apply `close_one_session` to every producer `viewer` is currently
/// attached to (spec §4.6).
pub fn close(viewer: &ViewerSessionHandle, viewer_streams: &ViewerStreamRegistry) {
    for producer in viewer.attached_producers() {
        close_one_session(viewer, &producer, viewer_streams);
    }
}

/// Returns `true` if `producer` appears in `viewer`'s attached list (spec
/// §4.6).
pub fn is_attached(viewer: &ViewerSessionHandle, producer: &SessionHandle) -> bool {
    viewer
        .producers
        .lock()
        .expect("viewer session lock poisoned")
        .iter()
        .any(|p| Arc::ptr_eq(p, producer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctf_trace::ctf_trace_get_by_path_or_create;
    use crate::session::Session;
    use crate::stream::RelayStream;
    use crate::trace_chunk::TraceChunk;

    fn new_producer_with_one_stream() -> SessionHandle {
        let session = Session::new(1, "host", "s", TraceChunk::new("/c", 0));
        let trace = ctf_trace_get_by_path_or_create(&session, "a");
        RelayStream::new(&trace);
        session
    }

    #[test]
    fn attach_projects_every_existing_stream() {
        let producer = new_producer_with_one_stream();
        let viewer = ViewerSession::new(1);
        let registry = ViewerStreamRegistry::new();
        assert_eq!(attach(&viewer, &producer, &registry), AttachOutcome::Ok);
        assert_eq!(registry.len(), 1);
        assert!(viewer.current_trace_chunk().is_some());
    }

    #[test]
    fn second_attach_to_an_already_attached_producer_is_rejected() {
        let producer = new_producer_with_one_stream();
        let first = ViewerSession::new(1);
        let second = ViewerSession::new(2);
        let registry = ViewerStreamRegistry::new();
        assert_eq!(attach(&first, &producer, &registry), AttachOutcome::Ok);
        assert_eq!(attach(&second, &producer, &registry), AttachOutcome::Already);
    }

    #[test]
    fn one_viewer_can_attach_several_distinct_producers() {
        let a = new_producer_with_one_stream();
        let b = new_producer_with_one_stream();
        let viewer = ViewerSession::new(1);
        let registry = ViewerStreamRegistry::new();
        assert_eq!(attach(&viewer, &a, &registry), AttachOutcome::Ok);
        assert_eq!(attach(&viewer, &b, &registry), AttachOutcome::Ok);
        assert!(is_attached(&viewer, &a));
        assert!(is_attached(&viewer, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn attach_detach_cycle_restores_ok_then_ok() {
        let producer = new_producer_with_one_stream();
        let viewer = ViewerSession::new(1);
        let registry = ViewerStreamRegistry::new();
        assert_eq!(attach(&viewer, &producer, &registry), AttachOutcome::Ok);
        detach(&viewer, &producer);
        assert!(!is_attached(&viewer, &producer));
        assert!(!producer.viewer_attached());

        let other = ViewerSession::new(2);
        assert_eq!(attach(&other, &producer, &registry), AttachOutcome::Ok);
    }

    #[test]
    fn close_one_session_tears_down_projected_streams_and_detaches() {
        let producer = new_producer_with_one_stream();
        let viewer = ViewerSession::new(1);
        let registry = ViewerStreamRegistry::new();
        attach(&viewer, &producer, &registry);
        assert!(is_attached(&viewer, &producer));

        close_one_session(&viewer, &producer, &registry);
        assert!(!is_attached(&viewer, &producer));
        assert_eq!(registry.len(), 0);
        assert!(viewer.current_trace_chunk().is_none());
        assert!(!producer.viewer_attached());
    }

    #[test]
    fn close_one_session_is_idempotent_under_a_racing_second_call() {
        let producer = new_producer_with_one_stream();
        let viewer = ViewerSession::new(1);
        let registry = ViewerStreamRegistry::new();
        attach(&viewer, &producer, &registry);

        close_one_session(&viewer, &producer, &registry);
        close_one_session(&viewer, &producer, &registry);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn close_tears_down_every_attached_producer() {
        let a = new_producer_with_one_stream();
        let b = new_producer_with_one_stream();
        let viewer = ViewerSession::new(1);
        let registry = ViewerStreamRegistry::new();
        attach(&viewer, &a, &registry);
        attach(&viewer, &b, &registry);

        close(&viewer, &registry);
        assert!(!is_attached(&viewer, &a));
        assert!(!is_attached(&viewer, &b));
        assert_eq!(registry.len(), 0);
    }
}

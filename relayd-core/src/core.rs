//! The process-wide aggregator (spec §4, overview).
//!
//! `RelayCore` owns every top-level registry in the object graph and is
//! the one place daemon-level code (control-channel handlers, the viewer
//! listener, periodic idle sweeps) reaches into for cross-entity
//! orchestration. Per-entity operations that only need a handle already in
//! hand (`ctf_trace_get_by_path_or_create`, `relay_index_try_flush`, ...)
//! stay free functions in their own modules; they're threaded through here
//! only where a caller starts from nothing but a bare id.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::{Session, SessionHandle, SessionRegistry};
use crate::stream::{StreamHandle, StreamRegistry};
use crate::trace_chunk::TraceChunk;
use crate::viewer::{ViewerSession, ViewerSessionHandle, ViewerStreamRegistry};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_VIEWER_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
pub struct RelayCore {
    pub sessions: SessionRegistry,
    pub streams: StreamRegistry,
    pub viewer_streams: ViewerStreamRegistry,
}

impl RelayCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a new producer session (spec §4.3: the control-channel
    /// handshake's `create_session`).
    pub fn create_session(
        &self,
        hostname: impl Into<String>,
        session_name: impl Into<String>,
        initial_chunk_directory: impl Into<String>,
    ) -> SessionHandle {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(
            id,
            hostname,
            session_name,
            TraceChunk::new(initial_chunk_directory, 0),
        );
        self.sessions.register(session)
    }

    pub fn find_session(&self, id: u64) -> Option<SessionHandle> {
        self.sessions.get(id)
    }

    /// Evict a session whose last counted reference has already gone to
    /// zero from the by-id lookup map. Safe to call speculatively; a
    /// session still reachable is left untouched (`remove_handle` only
    /// evicts the exact handle passed in).
    pub fn reap_session(&self, session: &SessionHandle) {
        self.sessions.remove(session);
    }

    pub fn register_stream(&self, stream: StreamHandle) -> StreamHandle {
        self.streams.register(stream)
    }

    pub fn find_stream(&self, handle: u64) -> Option<StreamHandle> {
        self.streams.get(handle)
    }

    pub fn reap_stream(&self, stream: &StreamHandle) {
        self.streams.remove(stream);
    }

    /// Open a fresh viewer session, not yet attached to any producer.
    pub fn create_viewer_session(&self) -> ViewerSessionHandle {
        let id = NEXT_VIEWER_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        ViewerSession::new(id)
    }

    /// Attach `viewer` to `producer`, projecting its streams into the
    /// process-wide viewer-stream registry (spec §4.6).
    pub fn attach_viewer(
        &self,
        viewer: &ViewerSessionHandle,
        producer: &SessionHandle,
    ) -> crate::viewer::AttachOutcome {
        crate::viewer::attach(viewer, producer, &self.viewer_streams)
    }

    pub fn detach_viewer(&self, viewer: &ViewerSessionHandle, producer: &SessionHandle) {
        crate::viewer::detach(viewer, producer)
    }

    pub fn close_viewer_session(&self, viewer: &ViewerSessionHandle) {
        crate::viewer::close(viewer, &self.viewer_streams)
    }

    pub fn find_viewer_stream(&self, handle: u64) -> Option<crate::viewer::ViewerStreamHandle> {
        self.viewer_streams.get(handle)
    }

    /// Sweep every registered session and drop the registry's own table
    /// entry for any whose logical refcount has already reached zero
    /// (i.e. it tore down between some earlier lookup and now, but no one
    /// has reaped it from the by-id map yet). Intended to be run
    /// periodically from the daemon's idle loop, not on every release.
    pub fn sweep_idle_sessions(&self) {
        for session in self.sessions.iter() {
            if !session.get_unless_zero() {
                self.sessions.remove(&session);
            } else {
                session.put(|_| {});
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_session_assigns_monotonic_ids_and_registers() {
        let core = RelayCore::new();
        let a = core.create_session("host", "s1", "/a");
        let b = core.create_session("host", "s2", "/b");
        assert_ne!(a.id, b.id);
        assert!(core.find_session(a.id).is_some());
        assert!(core.find_session(b.id).is_some());
    }

    #[test]
    fn find_session_misses_unknown_id() {
        let core = RelayCore::new();
        assert!(core.find_session(999).is_none());
    }

    #[test]
    fn attach_viewer_projects_streams_into_the_process_wide_registry() {
        let core = RelayCore::new();
        let producer = core.create_session("host", "s1", "/a");
        let trace = crate::ctf_trace::ctf_trace_get_by_path_or_create(&producer, "ust");
        let stream = crate::stream::RelayStream::new(&trace);
        core.register_stream(stream);

        let viewer = core.create_viewer_session();
        assert_eq!(
            core.attach_viewer(&viewer, &producer),
            crate::viewer::AttachOutcome::Ok
        );
        assert_eq!(core.viewer_streams.len(), 1);

        core.close_viewer_session(&viewer);
        assert_eq!(core.viewer_streams.len(), 0);
    }
}

//! Sessions (spec §3, "Session"; §4.3).
//!
//! A session is announced by a producer's control-channel handshake and
//! lives until its last `ctf_trace` (and any viewer attachment) has
//! released it. It exclusively owns its `ctf_traces` map and its current
//! trace-chunk handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::ctf_trace::CtfTrace;
use crate::refcount::Refcounted;
use crate::registry::Registry;
use crate::trace_chunk::TraceChunk;

pub struct Session {
    pub id: u64,
    pub hostname: String,
    pub session_name: String,
    state: Mutex<SessionState>,
    viewer_attached: AtomicBool,
    pub(crate) ctf_traces: Registry<String, CtfTrace>,
}

struct SessionState {
    trace_chunk: TraceChunk,
}

pub type SessionHandle = Arc<Refcounted<Session>>;

impl Session {
    pub fn new(
        id: u64,
        hostname: impl Into<String>,
        session_name: impl Into<String>,
        trace_chunk: TraceChunk,
    ) -> SessionHandle {
        Refcounted::new(Session {
            id,
            hostname: hostname.into(),
            session_name: session_name.into(),
            state: Mutex::new(SessionState { trace_chunk }),
            viewer_attached: AtomicBool::new(false),
            ctf_traces: Registry::new(),
        })
    }

    /// A fresh, independent handle to the session's current trace chunk.
    pub fn current_trace_chunk(&self) -> TraceChunk {
        self.state
            .lock()
            .expect("session lock poisoned")
            .trace_chunk
            .copy()
    }

    pub(crate) fn replace_trace_chunk(&self, chunk: TraceChunk) {
        self.state.lock().expect("session lock poisoned").trace_chunk = chunk;
    }

    pub fn viewer_attached(&self) -> bool {
        self.viewer_attached.load(Ordering::Acquire)
    }

    /// Returns `true` if this call transitioned the flag from unset to set
    /// (i.e. it "won" the attach). Mirrors `attach`'s `ALREADY` check
    /// (spec §4.6) being performed under the session's lock.
    pub(crate) fn try_mark_viewer_attached(&self) -> bool {
        self.viewer_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_viewer_attached(&self) {
        self.viewer_attached.store(false, Ordering::Release);
    }

    pub fn ctf_traces(&self) -> &Registry<String, CtfTrace> {
        &self.ctf_traces
    }
}

/// Take an additional counted reference to `session`. Named to match the
/// spec's get/put vocabulary for the object graph's root entity.
pub fn session_get(session: &SessionHandle) -> Option<SessionHandle> {
    if session.get_unless_zero() {
        Some(session.clone())
    } else {
        None
    }
}

/// Release a counted reference to `session`. On the transition to zero,
/// the session is gone from the object graph; it does not remove itself
/// from a `SessionRegistry` here, since ownership of that registry is
/// process-wide state the core (not the session) holds (spec §4.3: a
/// session's lifetime is driven by its last `ctf_trace`/viewer detaching,
/// while eviction from the lookup-by-id map is the daemon's control-path
/// responsibility once it observes the session has gone idle).
pub fn session_put(session: &SessionHandle) {
    session.put(|_| {});
}

/// The process-wide session map.
#[derive(Default)]
pub struct SessionRegistry {
    table: Registry<u64, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            table: Registry::new(),
        }
    }

    pub fn register(&self, session: SessionHandle) -> SessionHandle {
        let id = session.id;
        match self.table.insert_unique(id, session) {
            Ok(inserted) => inserted,
            Err(existing) => existing,
        }
    }

    pub fn get(&self, id: u64) -> Option<SessionHandle> {
        self.table.lookup(&id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SessionHandle> + '_ {
        self.table.iter()
    }

    pub(crate) fn remove(&self, session: &SessionHandle) {
        self.table.remove_handle(&session.id, session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_get_round_trips() {
        let registry = SessionRegistry::new();
        let session = Session::new(1, "host", "session-a", TraceChunk::new("/chunk-1", 0));
        registry.register(session.clone());

        let found = registry.get(1).expect("session should be registered");
        assert_eq!(found.hostname, "host");
    }

    #[test]
    fn attach_flag_is_exclusive() {
        let session = Session::new(1, "host", "s", TraceChunk::new("/c", 0));
        assert!(session.try_mark_viewer_attached());
        assert!(!session.try_mark_viewer_attached());
        session.clear_viewer_attached();
        assert!(session.try_mark_viewer_attached());
    }
}

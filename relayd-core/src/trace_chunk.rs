//! The trace chunk handle (spec §3, "Trace chunk").
//!
//! Opaque from the core's point of view: it is owned by the consumer/chunk
//! subsystem (out of scope here) and the core only ever gets, puts, or
//! copies a handle to one. A handle is backed by a plain `Arc`, so `copy`
//! is `Clone::clone` and `put` is simply dropping the handle — the core
//! exposes `get`/`put`/`copy` as named methods anyway so call sites read
//! the same way the spec describes them, rather than relying on readers to
//! infer the mapping from bare `Clone`/`Drop`.

use std::sync::Arc;

#[derive(Debug)]
struct TraceChunkInner {
    /// Rotation epoch, monotonically increasing per session. Two handles
    /// with the same `session_id` but different `epoch` refer to different
    /// on-disk chunks; `switch_all_files` is what happens when a stream's
    /// indexes need to catch up to a new epoch.
    epoch: u64,
    directory: String,
}

#[derive(Debug, Clone)]
pub struct TraceChunk(Arc<TraceChunkInner>);

impl TraceChunk {
    pub fn new(directory: impl Into<String>, epoch: u64) -> Self {
        Self(Arc::new(TraceChunkInner {
            epoch,
            directory: directory.into(),
        }))
    }

    /// Increment the external chunk's own refcount and return a new handle
    /// to the same on-disk chunk. Named to match the spec's vocabulary; in
    /// this Arc-backed implementation it is `Clone::clone`.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Borrow the handle without taking ownership of a new reference.
    pub fn get(&self) -> &Self {
        self
    }

    /// Release this handle. A no-op beyond `Drop` in this implementation,
    /// exposed so call sites mirror the spec's get/put/copy vocabulary.
    pub fn put(self) {}

    pub fn epoch(&self) -> u64 {
        self.0.epoch
    }

    pub fn directory(&self) -> &str {
        &self.0.directory
    }
}

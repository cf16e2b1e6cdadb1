//! The read-protected reference count (spec §4.1).
//!
//! Every live entity in the object graph is wrapped in a [`Refcounted<T>`]
//! and always handed around as `Arc<Refcounted<T>>`. The wrapper keeps a
//! *logical* refcount separate from the `Arc`'s own strong count:
//!
//! - the logical count models reachability in the daemon's object graph
//!   (how many sessions/streams/rows still consider this entity live);
//! - the `Arc` strong count models memory liveness.
//!
//! `get_unless_zero` only ever succeeds while the logical count is
//! nonzero, and `put` runs its release callback exactly once, on the
//! transition to zero. Because every caller that is inside a "read
//! section" is holding a cloned `Arc`, the `Arc` allocator itself gives us
//! the deferred-destruction guarantee the spec asks for: the release
//! callback may unlink the entity from its registry, but the backing
//! allocation is not freed until the last clone (including ones held by
//! readers who observed the entity before teardown began) is dropped. This
//! is the documented stand-in for epoch/hazard-pointer reclamation (see
//! DESIGN.md).

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct Refcounted<T> {
    count: AtomicUsize,
    inner: T,
}

impl<T> Refcounted<T> {
    /// Construct a new entity with logical refcount 1 (the caller's own
    /// "self-reference" or initial handle).
    pub fn new(inner: T) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(1),
            inner,
        })
    }

    /// Increment the logical refcount if and only if it is currently
    /// nonzero. Safe to call either from inside a registry's read section
    /// or while already holding a live counted reference.
    pub fn get_unless_zero(self: &Arc<Self>) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == 0 {
                    None
                } else {
                    Some(current + 1)
                }
            })
            .is_ok()
    }

    /// Decrement the logical refcount. On the transition to zero, `on_release`
    /// runs exactly once and is handed a shared reference to the payload so
    /// it can unlink the entity from whatever registry holds it.
    pub fn put(self: &Arc<Self>, on_release: impl FnOnce(&T)) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous != 0, "refcount underflow: put() on a dead entity");
        if previous == 1 {
            on_release(&self.inner);
        }
    }

    /// Current logical refcount, for diagnostics and tests only.
    pub fn current_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl<T> Deref for Refcounted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn get_unless_zero_fails_after_release() {
        let entity = Refcounted::new(42u32);
        assert!(entity.get_unless_zero());
        assert_eq!(entity.current_count(), 2);

        entity.put(|_| {});
        assert_eq!(entity.current_count(), 1);

        entity.put(|_| {});
        assert_eq!(entity.current_count(), 0);
        assert!(!entity.get_unless_zero());
    }

    #[test]
    fn release_runs_exactly_once() {
        let released = Arc::new(AtomicU32::new(0));
        let entity = Refcounted::new(());
        entity.get_unless_zero();
        entity.get_unless_zero();
        assert_eq!(entity.current_count(), 3);

        for _ in 0..3 {
            let released = released.clone();
            entity.put(move |_| {
                released.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_get_and_put_never_double_release() {
        use std::thread;

        let entity = Refcounted::new(());
        let release_count = Arc::new(AtomicU32::new(0));

        // Fan out N attempted get_unless_zero + put pairs concurrently with
        // the owner's own put. At most one of them should observe the zero
        // transition.
        let mut handles = Vec::new();
        for _ in 0..8 {
            let entity = entity.clone();
            let release_count = release_count.clone();
            handles.push(thread::spawn(move || {
                if entity.get_unless_zero() {
                    let release_count = release_count.clone();
                    entity.put(move |_| {
                        release_count.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        let release_count_owner = release_count.clone();
        entity.put(move |_| {
            release_count_owner.fetch_add(1, Ordering::SeqCst);
        });

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(release_count.load(Ordering::SeqCst), 1);
    }
}

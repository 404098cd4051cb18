//! Reference-counted item envelopes and the bounded pool backing them.
//!
//! Items carry one message plus the routing metadata the dispatcher needs:
//! remaining TTL, the origin the item entered on, and a scope tag. The pool
//! bounds how many items are live at once; the last reference to drop
//! returns the slot. `acquire` is called from a single owning stage, while
//! release may happen on any thread and is lock-free.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::topic::Topic;
use crate::types::EndpointId;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Visibility of an item beyond the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemScope {
    /// Deliver only to local subscribers; never hits a peer stream.
    LocalOnly,
    /// Eligible for forwarding to peers, subject to filters and TTL.
    Routable,
}

/// Where an item entered the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOrigin {
    /// Produced by a local publisher.
    Local,
    /// Decoded from the inbound stream of this peer.
    Peer(EndpointId),
}

impl ItemOrigin {
    /// The originating peer, if the item arrived from the mesh.
    pub const fn peer(&self) -> Option<EndpointId> {
        match self {
            Self::Local => None,
            Self::Peer(id) => Some(*id),
        }
    }
}

#[derive(Debug)]
struct PoolShared {
    capacity: usize,
    ceiling: usize,
    live: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Accounting snapshot of a pool, exposed for observability and the
/// conservation check at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounters {
    /// Items handed out since the pool was created.
    pub acquired: u64,
    /// Items whose last reference has dropped.
    pub released: u64,
    /// Items currently alive. Always `acquired - released`.
    pub live: usize,
}

/// Bounded allocator for [`ItemRef`] envelopes.
///
/// The pool grows lazily up to a soft `capacity`, then spills until the hard
/// `ceiling`; at the ceiling [`ItemPool::acquire`] fails with
/// [`Error::Backpressure`] and the caller decides whether to retry or drop.
#[derive(Debug, Clone)]
pub struct ItemPool {
    shared: Arc<PoolShared>,
}

impl ItemPool {
    /// Create a pool with the given soft capacity and hard ceiling.
    ///
    /// `ceiling` is clamped to at least `capacity`.
    pub fn new(capacity: usize, ceiling: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                capacity,
                ceiling: ceiling.max(capacity),
                live: AtomicUsize::new(0),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Wrap a message in a new item.
    ///
    /// # Errors
    /// Returns [`Error::Backpressure`] once `live` items reach the ceiling.
    pub fn acquire(
        &self,
        message: Message,
        ttl: u16,
        origin: ItemOrigin,
        scope: ItemScope,
    ) -> Result<ItemRef> {
        let shared = &self.shared;
        let live = shared.live.fetch_add(1, Ordering::AcqRel) + 1;
        if live > shared.ceiling {
            shared.live.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Backpressure);
        }
        if live > shared.capacity {
            tracing::trace!(live, capacity = shared.capacity, "item pool spilling past capacity");
        }
        shared.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(ItemRef {
            inner: Arc::new(ItemInner {
                message,
                ttl,
                origin,
                scope,
                _permit: PoolPermit { shared: Arc::clone(shared) },
            }),
        })
    }

    /// Soft capacity before the pool starts spilling.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Hard ceiling at which `acquire` fails.
    pub fn ceiling(&self) -> usize {
        self.shared.ceiling
    }

    /// Number of items currently alive.
    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Accounting snapshot.
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            acquired: self.shared.acquired.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
            live: self.live(),
        }
    }
}

struct PoolPermit {
    shared: Arc<PoolShared>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.shared.live.fetch_sub(1, Ordering::AcqRel);
        self.shared.released.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for PoolPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PoolPermit")
    }
}

#[derive(Debug)]
struct ItemInner {
    message: Message,
    ttl: u16,
    origin: ItemOrigin,
    scope: ItemScope,
    _permit: PoolPermit,
}

/// Shared handle to a pooled item.
///
/// Cloning bumps the reference count; when the last clone drops, the slot
/// returns to the pool. Dropping is lock-free and may happen on any thread.
#[derive(Debug, Clone)]
pub struct ItemRef {
    inner: Arc<ItemInner>,
}

impl ItemRef {
    /// The wrapped message.
    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    /// The topic of the wrapped message.
    pub fn topic(&self) -> &Topic {
        self.inner.message.topic()
    }

    /// Remaining TTL. Forwarding decrements the value placed on the wire;
    /// an item with TTL zero is dropped at the forwarding decision.
    pub fn ttl(&self) -> u16 {
        self.inner.ttl
    }

    /// Where the item entered this endpoint.
    pub fn origin(&self) -> ItemOrigin {
        self.inner.origin
    }

    /// Visibility scope.
    pub fn scope(&self) -> ItemScope {
        self.inner.scope
    }

    /// Current reference count. At least one while the item is live.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

//! Generic reclaiming resource pool: fixed capacity, LRU reuse, and
//! destruction interception through leases.
//!
//! The pool parks released resources on a free list instead of destroying
//! them, and hands them out again to compatible requests. Consumers receive
//! a [`Lease`], a cloneable shared handle; when the final clone drops, the
//! resource is returned to the pool rather than destroyed, so downstream
//! code never needs to know a resource is pool-managed. Killing the pool
//! stops further allocation and eagerly destroys everything parked, while
//! outstanding leases stay fully usable until they drop.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;

/// How well a parked resource fits a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseScore {
    /// Not usable for this request.
    Reject,
    /// Perfect fit; the scan stops here.
    Exact,
    /// Usable; the lowest score among candidates wins.
    Usable(u32),
}

/// Allocation, matching, and destruction for one kind of pooled resource.
///
/// `Shape` describes what a request needs (a byte size, frame geometry, ...);
/// the pool never inspects it. The strategy is dropped together with the
/// pool, after the last lease has gone; release backing state there.
pub trait PoolStrategy: Send + Sync + 'static {
    type Resource: Send + Sync;
    type Shape;

    /// Produce a fresh resource for `shape`, or `None` on exhaustion.
    fn alloc(&self, shape: &Self::Shape) -> Option<Self::Resource>;

    /// Score a parked resource against `shape`.
    fn reuse_score(&self, res: &Self::Resource, shape: &Self::Shape) -> ReuseScore;

    /// Destroy a resource the pool is done with.
    fn destroy(&self, res: Self::Resource) {
        drop(res);
    }
}

struct PoolState<R> {
    /// Parked resources; least recently freed at the front.
    free: VecDeque<R>,
    /// Resources currently in existence (parked or leased).
    live: usize,
    /// No further allocation; releases destroy instead of parking.
    dead: bool,
}

struct PoolCore<S: PoolStrategy> {
    strategy: S,
    capacity: usize,
    state: Mutex<PoolState<S::Resource>>,
}

/// Fixed-capacity reclaiming pool over one strategy.
///
/// Clones share the same pool; the backing state and the strategy are
/// released when the last clone, including those held by outstanding
/// leases, has dropped.
pub struct Pool<S: PoolStrategy> {
    core: Arc<PoolCore<S>>,
}

impl<S: PoolStrategy> Clone for Pool<S> {
    fn clone(&self) -> Pool<S> {
        Pool {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S: PoolStrategy> Pool<S> {
    pub fn new(capacity: usize, strategy: S) -> Pool<S> {
        Pool {
            core: Arc::new(PoolCore {
                strategy,
                capacity,
                state: Mutex::new(PoolState {
                    free: VecDeque::new(),
                    live: 0,
                    dead: false,
                }),
            }),
        }
    }

    /// Lease a resource fitting `shape`.
    ///
    /// Scans the free list for the best (lowest) reuse score, stopping early
    /// on a perfect match. On a total miss a fresh resource is allocated
    /// while under capacity; at capacity the least-recently-freed parked
    /// resource is evicted to make room. Fails when the pool is dead, the
    /// strategy cannot allocate, or capacity is reached with nothing
    /// evictable. Strategy calls always run outside the pool lock.
    pub fn acquire(&self, shape: &S::Shape) -> Option<Lease<S>> {
        let core = &self.core;
        let mut st = core.state.lock();
        if st.dead {
            return None;
        }

        let mut best: Option<(usize, u32)> = None;
        for (i, res) in st.free.iter().enumerate() {
            match core.strategy.reuse_score(res, shape) {
                ReuseScore::Reject => {}
                ReuseScore::Exact => {
                    best = Some((i, 0));
                    break;
                }
                ReuseScore::Usable(score) => {
                    if best.map_or(true, |(_, b)| score < b) {
                        best = Some((i, score));
                    }
                }
            }
        }
        if let Some((i, _)) = best {
            let res = st.free.remove(i)?;
            drop(st);
            return Some(self.lease(res));
        }

        // Nothing reusable: allocate fresh until capacity, then evict LRU.
        let evicted = if st.live < core.capacity {
            st.live += 1;
            None
        } else {
            match st.free.pop_front() {
                Some(res) => Some(res),
                None => return None,
            }
        };
        drop(st);

        if let Some(res) = evicted {
            core.strategy.destroy(res);
        }

        match core.strategy.alloc(shape) {
            Some(res) => Some(self.lease(res)),
            None => {
                core.state.lock().live -= 1;
                None
            }
        }
    }

    /// Park a resource on the free-list tail (most recently freed end).
    /// Fails when the pool is dead, handing the resource back; the caller
    /// must destroy it itself.
    pub fn release(&self, res: S::Resource) -> Result<(), S::Resource> {
        let mut st = self.core.state.lock();
        if st.dead {
            st.live = st.live.saturating_sub(1);
            return Err(res);
        }
        st.free.push_back(res);
        Ok(())
    }

    /// Mark the pool dead and synchronously destroy every parked resource.
    ///
    /// Breaks the pool/lease reference cycle eagerly instead of waiting for
    /// the last lease. The pool state persists until every outstanding
    /// lease has dropped; the strategy is dropped with it.
    pub fn kill(&self) {
        let core = &self.core;
        let mut st = core.state.lock();
        st.dead = true;
        while let Some(res) = st.free.pop_front() {
            st.live -= 1;
            drop(st);
            core.strategy.destroy(res);
            st = core.state.lock();
        }
    }

    pub fn is_dead(&self) -> bool {
        self.core.state.lock().dead
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    /// Resources currently in existence, parked or leased.
    pub fn live_count(&self) -> usize {
        self.core.state.lock().live
    }

    /// Resources currently parked on the free list.
    pub fn free_count(&self) -> usize {
        self.core.state.lock().free.len()
    }

    fn lease(&self, res: S::Resource) -> Lease<S> {
        Lease {
            res: Some(Arc::new(res)),
            pool: self.clone(),
        }
    }

    fn reclaim(&self, res: S::Resource) {
        if let Err(res) = self.release(res) {
            self.core.strategy.destroy(res);
        }
    }
}

/// Shared handle to a leased resource.
///
/// Clones share the same resource. Dropping the final clone intercepts what
/// would otherwise be the resource's destruction and parks it back in the
/// pool; if the pool has been killed, the interception declines and the
/// resource is destroyed through the strategy.
pub struct Lease<S: PoolStrategy> {
    res: Option<Arc<S::Resource>>,
    pool: Pool<S>,
}

impl<S: PoolStrategy> Lease<S> {
    /// The pool this lease came from.
    pub fn pool(&self) -> &Pool<S> {
        &self.pool
    }
}

impl<S: PoolStrategy> Clone for Lease<S> {
    fn clone(&self) -> Lease<S> {
        Lease {
            res: self.res.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<S: PoolStrategy> Deref for Lease<S> {
    type Target = S::Resource;

    fn deref(&self) -> &S::Resource {
        self.res.as_deref().expect("lease resource present until drop")
    }
}

impl<S: PoolStrategy> Drop for Lease<S> {
    fn drop(&mut self) {
        let Some(arc) = self.res.take() else { return };
        // Only the final clone gets the resource back; everyone else just
        // drops their reference.
        if let Some(res) = Arc::into_inner(arc) {
            self.pool.reclaim(res);
        }
    }
}

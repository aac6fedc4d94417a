//! Two-level slot pool bounding concurrent page fetches.
//!
//! Every page fetch holds two permits for its whole lifetime: one from its
//! job's local semaphore and one from the global semaphore shared by all
//! jobs. Permits are always taken in the order local then global, so a job
//! never holds a global slot while it waits on its own bound.
//!
//! # Example
//!
//! ```
//! use chapterdl_core::download::PagePool;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let pool = PagePool::new(4, 16);
//! let slots = pool.job_slots();
//! let cancel = CancellationToken::new();
//!
//! if let Some(slot) = slots.acquire(&cancel).await {
//!     // ... fetch one page while `slot` is alive ...
//!     drop(slot);
//! }
//! # }
//! ```

use std::cmp::Ordering as Compare;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct LimitState {
    limit: usize,
    /// Permits to retire as they come back after a shrink.
    debt: usize,
}

/// A semaphore whose size can change while permits are held.
///
/// Shrinking retires idle permits at once and the rest as their holders
/// release them, so new acquirers never see more than the current limit in
/// flight.
#[derive(Debug)]
pub(crate) struct SlotLimit {
    semaphore: Arc<Semaphore>,
    state: Mutex<LimitState>,
}

impl SlotLimit {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            state: Mutex::new(LimitState { limit, debt: 0 }),
        })
    }

    fn state(&self) -> MutexGuard<'_, LimitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn limit(&self) -> usize {
        self.state().limit
    }

    pub(crate) fn resize(&self, limit: usize) {
        let mut state = self.state();
        match limit.cmp(&state.limit) {
            Compare::Greater => {
                let grow = limit - state.limit;
                let repaid = grow.min(state.debt);
                state.debt -= repaid;
                self.semaphore.add_permits(grow - repaid);
            }
            Compare::Less => {
                let shrink = state.limit - limit;
                let retired = self.semaphore.forget_permits(shrink);
                state.debt += shrink - retired;
            }
            Compare::Equal => {}
        }
        state.limit = limit;
    }

    /// Waits for a permit. `None` only if the semaphore was closed.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Option<LimitPermit> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        Some(LimitPermit {
            permit: Some(permit),
            limit: Arc::clone(self),
        })
    }
}

/// Permit of a [`SlotLimit`]; retired instead of returned while a shrink is
/// outstanding.
#[derive(Debug)]
pub(crate) struct LimitPermit {
    permit: Option<OwnedSemaphorePermit>,
    limit: Arc<SlotLimit>,
}

impl Drop for LimitPermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let mut state = self.limit.state();
        if state.debt > 0 {
            state.debt -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
    }
}

#[derive(Debug)]
struct PoolShared {
    local_limit: AtomicUsize,
    global: Arc<SlotLimit>,
    global_in_flight: AtomicUsize,
}

/// Page fetch slots shared by every job of a coordinator.
///
/// Cloning shares the pool. The per-job limit is fixed when a job takes its
/// [`JobSlots`]; resizing changes it for jobs started afterwards. The global
/// limit is resized in place: fetches already holding a slot finish, and no
/// new fetch starts until the total in flight is under the new limit.
#[derive(Debug, Clone)]
pub struct PagePool {
    shared: Arc<PoolShared>,
}

impl PagePool {
    /// Creates a pool with `local` slots per job and `global` slots overall.
    ///
    /// Both limits are clamped to at least 1.
    #[must_use]
    pub fn new(local: usize, global: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                local_limit: AtomicUsize::new(local.max(1)),
                global: SlotLimit::new(global.max(1)),
                global_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Per-job limit applied to jobs that start from now on.
    #[must_use]
    pub fn local_limit(&self) -> usize {
        self.shared.local_limit.load(Ordering::SeqCst)
    }

    /// Limit across all jobs.
    #[must_use]
    pub fn global_limit(&self) -> usize {
        self.shared.global.limit()
    }

    /// Page fetches currently holding a slot, across all jobs.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.global_in_flight.load(Ordering::SeqCst)
    }

    /// Changes both limits. In-flight fetches are not interrupted.
    pub fn resize(&self, local: usize, global: usize) {
        let local = local.max(1);
        let global = global.max(1);
        self.shared.local_limit.store(local, Ordering::SeqCst);
        self.shared.global.resize(global);
        debug!(local, global, "page pool resized");
    }

    /// Creates the slot source for one job, sized by the current local limit.
    #[must_use]
    pub fn job_slots(&self) -> JobSlots {
        JobSlots {
            pool: self.clone(),
            local: Arc::new(Semaphore::new(self.local_limit())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Local slots of one job.
#[derive(Debug)]
pub struct JobSlots {
    pool: PagePool,
    local: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl JobSlots {
    /// Waits for a local and then a global slot.
    ///
    /// Returns `None` if `cancel` fires first; any slot already taken is
    /// released on the way out.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<PageSlot> {
        let local = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            permit = Arc::clone(&self.local).acquire_owned() => permit.ok()?,
        };

        let global = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            permit = self.pool.shared.global.acquire() => permit?,
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.pool
            .shared
            .global_in_flight
            .fetch_add(1, Ordering::SeqCst);

        Some(PageSlot {
            _global: global,
            _local: local,
            job_in_flight: Arc::clone(&self.in_flight),
            pool: Arc::clone(&self.pool.shared),
        })
    }

    /// Page fetches of this job currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Local limit this job was created with.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.local.available_permits() + self.in_flight()
    }
}

/// A held pair of slots. Dropping it releases both.
#[derive(Debug)]
pub struct PageSlot {
    _global: LimitPermit,
    _local: OwnedSemaphorePermit,
    job_in_flight: Arc<AtomicUsize>,
    pool: Arc<PoolShared>,
}

impl Drop for PageSlot {
    fn drop(&mut self) {
        self.job_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.pool.global_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

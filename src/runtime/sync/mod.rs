//! Mutexes for code under test
//!
//! Two implementations sit behind the [`Lock`] capability:
//!
//! - [`SimMutex`]: contention is arbitrated by the orchestrator. A task that
//!   finds the mutex held is marked blocked and gives up its turn until the
//!   holder releases.
//! - [`NativeMutex`]: a plain blocking mutex with no task awareness, used when
//!   the code runs outside the harness.
//!
//! [`Mutex`] is the handle user code holds; which implementation backs it is
//! decided once, when it is created.

mod native;
mod sim;

pub use native::NativeMutex;
pub use sim::SimMutex;
pub(crate) use sim::WaitGraph;

use std::sync::Arc;

use super::context::Context;
use super::task::TaskId;

/// Mutual exclusion driven through a [`Context`].
pub trait Lock: Send + Sync {
    /// Block until the calling task holds the lock.
    fn acquire(
        &self,
        ctx: &Context,
    );

    /// Release a lock held by the calling task.
    fn release(
        &self,
        ctx: &Context,
    );

    /// The current holder, for implementations that track one.
    fn holder(&self) -> Option<TaskId>;

    /// Check if the lock is currently held.
    fn is_locked(&self) -> bool;
}

/// Cloneable mutex handle.
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<dyn Lock>,
}

impl std::fmt::Debug for Mutex {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.inner.is_locked())
            .field("holder", &self.inner.holder())
            .finish()
    }
}

impl Mutex {
    /// A mutex matching the context: simulated under the harness, native
    /// otherwise.
    pub fn new(ctx: &Context) -> Self {
        match ctx.epoch() {
            Some(epoch) => Self::from_lock(SimMutex::new(epoch)),
            None => Self::native(),
        }
    }

    /// A plain blocking mutex.
    pub fn native() -> Self {
        Self::from_lock(NativeMutex::new())
    }

    /// Wrap any [`Lock`] implementation.
    pub fn from_lock(lock: impl Lock + 'static) -> Self {
        Self {
            inner: Arc::new(lock),
        }
    }

    /// Acquire the lock; it is released when the guard drops.
    pub fn lock<'a>(
        &'a self,
        ctx: &'a Context,
    ) -> MutexGuard<'a> {
        self.inner.acquire(ctx);
        MutexGuard { mutex: self, ctx }
    }

    /// Acquire without a guard. Pair with [`Mutex::release`].
    pub fn acquire(
        &self,
        ctx: &Context,
    ) {
        self.inner.acquire(ctx);
    }

    /// Release a lock taken with [`Mutex::acquire`].
    pub fn release(
        &self,
        ctx: &Context,
    ) {
        self.inner.release(ctx);
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// The current holder, if the implementation tracks one.
    #[inline]
    pub fn holder(&self) -> Option<TaskId> {
        self.inner.holder()
    }
}

/// Releases the mutex on drop.
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    ctx: &'a Context,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.inner.release(self.ctx);
    }
}

#[cfg(test)]
mod tests;

//! Native mutex: ordinary blocking, no task awareness.

use parking_lot::{Condvar, Mutex};

use super::Lock;
use crate::runtime::context::Context;
use crate::runtime::task::TaskId;

/// A plain mutual-exclusion primitive for code running outside the harness.
#[derive(Debug, Default)]
pub struct NativeMutex {
    locked: Mutex<bool>,
    released: Condvar,
}

impl NativeMutex {
    /// Create an unlocked mutex.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Lock for NativeMutex {
    fn acquire(
        &self,
        _ctx: &Context,
    ) {
        let mut locked = self.locked.lock();
        while *locked {
            self.released.wait(&mut locked);
        }
        *locked = true;
    }

    fn release(
        &self,
        _ctx: &Context,
    ) {
        let mut locked = self.locked.lock();
        *locked = false;
        self.released.notify_one();
    }

    fn holder(&self) -> Option<TaskId> {
        None
    }

    fn is_locked(&self) -> bool {
        *self.locked.lock()
    }
}

//! Cross-thread state.
//!
//! Everything another thread may observe lives in one `SharedState` behind one
//! mutex, with a single condition variable on that mutex for "a newer frame was
//! published". Nothing in here owns a device or file handle.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::publish::PublishedFrame;
use crate::settings::Settings;
use crate::status::{LoopStatus, SegmentInfo};

pub(crate) struct SharedState {
    pub settings: Settings,
    pub published: PublishedFrame,
    pub status: LoopStatus,
    pub segment: Option<SegmentInfo>,
    /// Bumped on every stop so blocked frame waiters return early.
    pub wake_generation: u64,
    /// Loop run allowed to write `status` and `segment`. A loop thread left
    /// behind by a timed-out stop no longer matches.
    pub run_id: u64,
}

pub(crate) struct Shared {
    state: Mutex<SharedState>,
    frame_ready: Condvar,
}

impl Shared {
    pub fn new(settings: Settings) -> Self {
        Self {
            state: Mutex::new(SharedState {
                settings,
                published: PublishedFrame::default(),
                status: LoopStatus::stopped(),
                segment: None,
                wake_generation: 0,
                run_id: 0,
            }),
            frame_ready: Condvar::new(),
        }
    }

    /// Lock the shared state.
    ///
    /// The state is plain data with no cross-field invariant a panic could
    /// break halfway, so a poisoned lock is recovered rather than propagated.
    pub fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn notify_frame(&self) {
        self.frame_ready.notify_all();
    }

    /// Wake every frame waiter without publishing (used on stop).
    pub fn release_waiters(&self) {
        let mut state = self.lock();
        state.wake_generation = state.wake_generation.wrapping_add(1);
        drop(state);
        self.frame_ready.notify_all();
    }

    /// Wait on the frame condvar until `done` holds, the deadline passes, or
    /// waiters are released. Returns the guard either way.
    ///
    /// A timeout too large to express as an `Instant` waits without a deadline.
    pub fn wait_until<'a, F>(
        &'a self,
        mut guard: MutexGuard<'a, SharedState>,
        timeout: Duration,
        mut done: F,
    ) -> MutexGuard<'a, SharedState>
    where
        F: FnMut(&SharedState) -> bool,
    {
        let deadline = Instant::now().checked_add(timeout);
        let generation = guard.wake_generation;
        while !done(&guard) && guard.wake_generation == generation {
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    match self.frame_ready.wait_timeout(guard, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => self
                    .frame_ready
                    .wait(guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
        guard
    }
}

//! Virtual users and the pool that scales them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::workload::{RunContext, SharedWorkload, VuContext};

const STOP_POLL: Duration = Duration::from_millis(50);

/// Check recorded as failed for every iteration that returned an error or
/// panicked, so crashed iterations lower the `checks` rate.
pub const ITERATION_CHECK: &str = "iteration completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VuState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl VuState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => VuState::Idle,
            1 => VuState::Running,
            2 => VuState::Stopping,
            _ => VuState::Stopped,
        }
    }
}

/// State shared between a virtual user's task and its pool.
struct VuShared {
    state: AtomicU8,
    /// Set when the user ran out of iterations rather than being stopped.
    exhausted: AtomicBool,
}

impl VuShared {
    fn state(&self) -> VuState {
        VuState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set(&self, state: VuState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Idle/Running -> Stopping. Stopping and Stopped users are left alone.
    fn request_stop(&self) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            match VuState::from_u8(current) {
                VuState::Idle | VuState::Running => {}
                _ => return false,
            }
            match self.state.compare_exchange(
                current,
                VuState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

pub struct VirtualUser {
    id: u64,
    shared: Arc<VuShared>,
    handle: JoinHandle<()>,
    /// The handle has been awaited to completion and must not be polled again.
    joined: bool,
}

impl VirtualUser {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        self.shared.state()
    }

    fn is_live(&self) -> bool {
        matches!(self.state(), VuState::Idle | VuState::Running)
    }

    fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::SeqCst)
    }
}

/// Per-scenario limits applied inside the iteration loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterationLimits {
    /// Iterations each user runs before it finishes on its own.
    pub max_iterations: Option<u64>,
    /// Iterations shorter than this are padded with a sleep.
    pub min_iteration_duration: Option<Duration>,
}

/// The virtual users of one scenario.
pub struct VirtualUserPool {
    scenario: Arc<str>,
    workload: SharedWorkload,
    run: Arc<RunContext>,
    ids: Arc<AtomicU64>,
    limits: IterationLimits,
    users: Vec<VirtualUser>,
}

impl VirtualUserPool {
    /// `ids` hands out user ids; share it between pools so ids stay unique
    /// across scenarios.
    pub fn new(
        scenario: &str,
        workload: SharedWorkload,
        run: Arc<RunContext>,
        ids: Arc<AtomicU64>,
        limits: IterationLimits,
    ) -> Self {
        Self {
            scenario: Arc::from(scenario),
            workload,
            run,
            ids,
            limits,
            users: Vec::new(),
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Users that are Idle or Running.
    pub fn live(&self) -> usize {
        self.users.iter().filter(|u| u.is_live()).count()
    }

    /// Users whose task has not finished yet, Stopping ones included.
    pub fn running(&self) -> usize {
        self.users.iter().filter(|u| !u.handle.is_finished()).count()
    }

    /// True once every spawned user ran out of iterations.
    pub fn exhausted(&self) -> bool {
        self.limits.max_iterations.is_some()
            && !self.users.is_empty()
            && self.users.iter().all(|u| u.is_exhausted())
    }

    /// Bring the number of live users to `desired`: spawn new ones, or ask
    /// the most recently spawned ones to stop after their current iteration.
    /// Users that ran out of iterations keep their slot and are not replaced.
    pub fn reconcile(&mut self, desired: usize) {
        self.users
            .retain(|u| !(u.handle.is_finished() && !u.is_exhausted()));

        let occupied = self
            .users
            .iter()
            .filter(|u| u.is_live() || u.is_exhausted())
            .count();

        if occupied < desired {
            for _ in occupied..desired {
                self.spawn();
            }
            debug!(scenario = %self.scenario, from = occupied, to = desired, "Scaled up");
        } else if occupied > desired {
            let mut excess = occupied - desired;
            for user in self.users.iter().rev() {
                if excess == 0 {
                    break;
                }
                if user.shared.request_stop() {
                    excess -= 1;
                }
            }
            debug!(scenario = %self.scenario, from = occupied, to = desired, "Scaled down");
        }
    }

    fn spawn(&mut self) {
        let id = self.ids.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::new(VuShared {
            state: AtomicU8::new(VuState::Idle as u8),
            exhausted: AtomicBool::new(false),
        });
        let ctx = VuContext::new(id, self.scenario.clone(), self.run.clone());
        let handle = tokio::spawn(vu_loop(
            ctx,
            self.workload.clone(),
            self.run.clone(),
            shared.clone(),
            self.limits,
        ));
        self.users.push(VirtualUser {
            id,
            shared,
            handle,
            joined: false,
        });
    }

    /// Ask every user to stop after its current iteration.
    pub fn stop_all(&self) {
        for user in &self.users {
            user.shared.request_stop();
        }
    }

    /// Stop everyone and wait up to `timeout` for them to finish.
    /// Returns how many are still running.
    pub async fn drain(&mut self, timeout: Duration) -> usize {
        self.stop_all();
        let deadline = tokio::time::Instant::now() + timeout;
        for user in self.users.iter_mut().filter(|u| !u.joined) {
            if tokio::time::timeout_at(deadline, &mut user.handle)
                .await
                .is_err()
            {
                break;
            }
            user.joined = true;
        }
        self.running()
    }

    /// Cancel whatever is still running and wait for the cancellation to land,
    /// so interrupted requests are recorded before the final snapshot.
    pub async fn abort_all(&mut self) -> usize {
        let mut aborted = 0;
        for user in &self.users {
            if !user.handle.is_finished() {
                user.handle.abort();
                aborted += 1;
            }
        }
        for user in self.users.drain(..) {
            if !user.joined {
                let _ = user.handle.await;
            }
            user.shared.set(VuState::Stopped);
        }
        if aborted > 0 {
            warn!(scenario = %self.scenario, aborted, "Hard-stopped virtual users");
        }
        aborted
    }

    pub fn users(&self) -> impl Iterator<Item = &VirtualUser> {
        self.users.iter()
    }
}

async fn vu_loop(
    mut ctx: VuContext,
    workload: SharedWorkload,
    run: Arc<RunContext>,
    shared: Arc<VuShared>,
    limits: IterationLimits,
) {
    let shard = ctx.vu_id() as usize;
    let mut iteration: u64 = 0;

    loop {
        if shared.state() == VuState::Stopping {
            break;
        }
        if limits.max_iterations.is_some_and(|max| iteration >= max) {
            shared.exhausted.store(true, Ordering::SeqCst);
            break;
        }
        if shared.state() == VuState::Idle {
            // Lose the race against a concurrent stop rather than overwrite it.
            let _ = shared.state.compare_exchange(
                VuState::Idle as u8,
                VuState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }

        ctx.set_iteration(iteration);
        let start = Instant::now();
        let outcome = AssertUnwindSafe(workload.iteration(&mut ctx))
            .catch_unwind()
            .await;
        let elapsed = start.elapsed();

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                debug!(vu = ctx.vu_id(), iteration, error = %format!("{:#}", e), "Iteration failed");
                Some(format!("{:#}", e))
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                warn!(vu = ctx.vu_id(), iteration, "Iteration panicked: {}", msg);
                Some(format!("panic: {}", msg))
            }
        };
        if error.is_some() {
            run.metrics.record_check(shard, ITERATION_CHECK, false);
        }
        run.metrics.record_iteration(shard, elapsed, error);
        iteration += 1;

        if let Some(min) = limits.min_iteration_duration {
            let mut remaining = min.saturating_sub(elapsed);
            while !remaining.is_zero() && shared.state() != VuState::Stopping {
                let slice = remaining.min(STOP_POLL);
                tokio::time::sleep(slice).await;
                remaining -= slice;
            }
        }
    }

    shared.set(VuState::Stopped);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

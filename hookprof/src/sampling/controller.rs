//! Seam between the sampler and the OS thread-control primitives

use crate::domain::{SamplingError, Tid};

/// Nice value a frozen thread is raised to while its stack is walked
pub const BOOSTED_NICE: i32 = -20;

/// Freezes, walks and thaws threads of one target process
///
/// Implementations must leave a thread running again after [`thaw`] even
/// if [`walk`] failed in between.
///
/// [`thaw`]: ThreadController::thaw
/// [`walk`]: ThreadController::walk
pub trait ThreadController: Send {
    fn threads(&mut self) -> Result<Vec<Tid>, SamplingError>;

    fn freeze(&mut self, tid: Tid) -> Result<(), SamplingError>;

    fn thaw(&mut self, tid: Tid);

    /// Current scheduling priority, `None` when it cannot be changed
    fn priority(&mut self, _tid: Tid) -> Option<i32> {
        None
    }

    fn set_priority(&mut self, _tid: Tid, _nice: i32) {}

    /// Instruction pointers of a frozen thread, leaf first
    fn walk(&mut self, tid: Tid, max_depth: usize) -> Result<Vec<u64>, SamplingError>;

    fn cpu_time_ns(&mut self, tid: Tid) -> Option<u64>;
}

/// Freeze one thread, boost it, walk it and put everything back
///
/// # Errors
/// Propagates freeze and walk failures. The thread is thawed either way.
pub fn sample_thread(
    controller: &mut dyn ThreadController,
    tid: Tid,
    max_depth: usize,
) -> Result<Vec<u64>, SamplingError> {
    controller.freeze(tid)?;
    let previous = controller.priority(tid);
    if previous.is_some() {
        controller.set_priority(tid, BOOSTED_NICE);
    }

    let frames = controller.walk(tid, max_depth);

    if let Some(nice) = previous {
        controller.set_priority(tid, nice);
    }
    controller.thaw(tid);
    frames
}

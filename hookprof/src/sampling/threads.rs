//! Target thread enumeration and CPU accounting via /proc

use crate::domain::{Pid, SamplingError, Tid};
use std::fs;

/// Every thread of `pid`, by reading /proc/pid/task
///
/// # Errors
/// Returns [`SamplingError::ThreadList`] if the task directory cannot be read,
/// typically because the process has exited.
pub fn list_threads(pid: Pid) -> Result<Vec<Tid>, SamplingError> {
    let task_dir = format!("/proc/{}/task", pid.0);
    let entries = fs::read_dir(&task_dir).map_err(|source| SamplingError::ThreadList { pid, source })?;

    let mut tids: Vec<Tid> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            entry.file_name().to_string_lossy().parse::<u32>().ok().map(Tid)
        })
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

/// Thread name from /proc/pid/task/tid/comm
#[must_use]
pub fn thread_name(pid: Pid, tid: Tid) -> Option<String> {
    fs::read_to_string(format!("/proc/{}/task/{}/comm", pid.0, tid.0))
        .ok()
        .map(|comm| comm.trim().to_string())
}

/// User plus system CPU time of one thread, in nanoseconds
#[must_use]
pub fn thread_cpu_time_ns(pid: Pid, tid: Tid) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/task/{}/stat", pid.0, tid.0)).ok()?;
    parse_cpu_ticks(&stat).map(|ticks| ticks.saturating_mul(1_000_000_000) / clock_ticks_per_second())
}

/// `utime + stime` from a stat line
///
/// The comm field may contain spaces and parentheses, so fields are counted
/// from the last `)`.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[allow(unsafe_code)]
fn clock_ticks_per_second() -> u64 {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    u64::try_from(ticks).ok().filter(|t| *t > 0).unwrap_or(100)
}

/// Percentage of one core used between two CPU-time readings
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn usage_percent(cpu_before_ns: u64, cpu_after_ns: u64, wall_ns: u64) -> f32 {
    if wall_ns == 0 {
        return 0.0;
    }
    let used = cpu_after_ns.saturating_sub(cpu_before_ns) as f64;
    (used * 100.0 / wall_ns as f64).clamp(0.0, 100.0) as f32
}

//! Linux [`ThreadController`] built on ptrace and frame-pointer unwinding
//!
//! Each thread is seized and interrupted rather than attached with
//! `PTRACE_ATTACH`, so no SIGSTOP is delivered to the target. Stack memory
//! is read with `process_vm_readv` while the thread is stopped.

use super::controller::ThreadController;
use super::threads::{list_threads, thread_cpu_time_ns};
use crate::domain::{Pid, SamplingError, Tid};
use nix::sys::ptrace;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid as NixPid;
use std::io::IoSliceMut;

pub struct PtraceController {
    pid: Pid,
}

impl PtraceController {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    fn nix_tid(tid: Tid) -> NixPid {
        #[allow(clippy::cast_possible_wrap)]
        NixPid::from_raw(tid.0 as i32)
    }

    /// Read two consecutive words at `address` in the target
    fn read_frame_record(&self, address: u64) -> Option<(u64, u64)> {
        let mut buf = [0u8; 16];
        let remote = [RemoteIoVec { base: usize::try_from(address).ok()?, len: buf.len() }];
        let mut local = [IoSliceMut::new(&mut buf)];
        let read = process_vm_readv(NixPid::from_raw(self.pid.0), &mut local, &remote).ok()?;
        if read != 16 {
            return None;
        }
        let next = u64::from_le_bytes(buf[..8].try_into().ok()?);
        let ret = u64::from_le_bytes(buf[8..].try_into().ok()?);
        Some((next, ret))
    }

    #[cfg(target_arch = "x86_64")]
    fn registers(tid: Tid) -> Result<(u64, u64), SamplingError> {
        let regs = ptrace::getregs(Self::nix_tid(tid))
            .map_err(|e| SamplingError::Walk { tid, message: e.to_string() })?;
        Ok((regs.rip, regs.rbp))
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn registers(_tid: Tid) -> Result<(u64, u64), SamplingError> {
        Err(SamplingError::Unsupported)
    }
}

impl ThreadController for PtraceController {
    fn threads(&mut self) -> Result<Vec<Tid>, SamplingError> {
        list_threads(self.pid)
    }

    fn freeze(&mut self, tid: Tid) -> Result<(), SamplingError> {
        let target = Self::nix_tid(tid);
        let freeze_err = |e: nix::Error| SamplingError::Freeze { tid, message: e.to_string() };

        ptrace::seize(target, ptrace::Options::empty()).map_err(freeze_err)?;
        if let Err(e) = ptrace::interrupt(target).and_then(|()| waitpid(target, Some(WaitPidFlag::__WALL))) {
            let _ = ptrace::detach(target, None);
            return Err(freeze_err(e));
        }
        Ok(())
    }

    fn thaw(&mut self, tid: Tid) {
        if let Err(e) = ptrace::detach(Self::nix_tid(tid), None) {
            log::debug!("Detach from thread {tid} failed: {e}");
        }
    }

    #[allow(unsafe_code)]
    fn priority(&mut self, tid: Tid) -> Option<i32> {
        // SAFETY: getpriority only reads scheduler state; errno is reset first
        // because -1 is a valid nice value.
        unsafe {
            *libc::__errno_location() = 0;
            let nice = libc::getpriority(libc::PRIO_PROCESS, tid.0);
            (*libc::__errno_location() == 0).then_some(nice)
        }
    }

    #[allow(unsafe_code)]
    fn set_priority(&mut self, tid: Tid, nice: i32) {
        // SAFETY: setpriority has no memory-safety preconditions
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid.0, nice) };
        if rc != 0 {
            log::trace!("setpriority({tid}, {nice}) failed");
        }
    }

    fn walk(&mut self, tid: Tid, max_depth: usize) -> Result<Vec<u64>, SamplingError> {
        let (ip, mut frame_pointer) = Self::registers(tid)?;
        let mut frames = Vec::with_capacity(max_depth.min(64));
        if max_depth == 0 {
            return Ok(frames);
        }
        frames.push(ip);

        while frames.len() < max_depth && frame_pointer != 0 {
            let Some((next, return_address)) = self.read_frame_record(frame_pointer) else {
                break;
            };
            if return_address == 0 {
                break;
            }
            frames.push(return_address);
            // Stacks grow down; a non-increasing chain means garbage
            if next <= frame_pointer {
                break;
            }
            frame_pointer = next;
        }
        Ok(frames)
    }

    fn cpu_time_ns(&mut self, tid: Tid) -> Option<u64> {
        thread_cpu_time_ns(self.pid, tid)
    }
}

/// Raise the calling thread's priority so sampling keeps pace with the target
#[allow(unsafe_code)]
pub fn boost_current_thread() {
    // SAFETY: who = 0 addresses the calling thread
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
    if rc != 0 {
        log::debug!("Could not raise sampler thread priority");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_of_self() {
        #[allow(clippy::cast_possible_wrap)]
        let mut controller = PtraceController::new(Pid(std::process::id() as i32));
        let threads = controller.threads().unwrap();
        assert!(!threads.is_empty());
    }

    #[test]
    fn test_freeze_missing_thread_fails() {
        let mut controller = PtraceController::new(Pid(9_999_999));
        assert!(matches!(
            controller.freeze(Tid(9_999_999)),
            Err(SamplingError::Freeze { .. })
        ));
    }
}

//! Pre-flight checks
//!
//! Each capture mode needs something different from the host: bpftrace needs
//! root and a recent kernel, stack sampling needs ptrace permission, and every
//! mode needs a readable `/proc/<pid>`. Failures carry the fix in the message.

use crate::domain::Pid;
use crate::session::CaptureMode;
use anyhow::{bail, Context, Result};
use nix::unistd::geteuid;
use object::{Object, ObjectSection};
use std::fs;
use std::path::Path;

/// Oldest kernel with uprobes and the bpftrace builtins the generated script uses
const MIN_BPFTRACE_KERNEL: (u32, u32) = (4, 9);

const PTRACE_SCOPE_PATH: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// Run every check the selected capture needs
pub fn run_preflight_checks(pid: Pid, mode: CaptureMode, sample: bool, tracer: &str, quiet: bool) -> Result<()> {
    check_process_exists(pid)?;
    check_proc_access(pid)?;
    if mode == CaptureMode::Bpftrace {
        check_root("bpftrace mode")?;
        check_kernel_version(&fs::read_to_string("/proc/version").context("Failed to read /proc/version")?)?;
        check_tracer_on_path(tracer)?;
    }
    if sample || mode == CaptureMode::SamplingOnly {
        let scope = fs::read_to_string(PTRACE_SCOPE_PATH).ok();
        check_ptrace_scope(scope.as_deref(), geteuid().is_root())?;
    }
    if !quiet {
        if let Ok(exe) = fs::read_link(format!("/proc/{}/exe", pid.0)) {
            warn_missing_symbols(&exe);
        }
    }
    Ok(())
}

fn check_root(what: &str) -> Result<()> {
    if geteuid().is_root() {
        return Ok(());
    }
    bail!(
        "Permission denied: {what} attaches uprobes and requires root.\n\n\
         Run with: sudo hookprof ..."
    );
}

/// `release` is the third field of `/proc/version`
fn check_kernel_version(proc_version: &str) -> Result<()> {
    let release = proc_version.split_whitespace().nth(2).unwrap_or("unknown");
    let mut parts = release.split('.').map(|p| {
        p.chars().take_while(char::is_ascii_digit).collect::<String>().parse::<u32>().ok()
    });
    let (Some(Some(major)), Some(Some(minor))) = (parts.next(), parts.next()) else {
        log::debug!("unparseable kernel release {release}, skipping version check");
        return Ok(());
    };

    if (major, minor) < MIN_BPFTRACE_KERNEL {
        bail!(
            "Kernel {major}.{minor} is too old for bpftrace mode.\n\n\
             Linux {}.{} or newer is required. Current kernel: {release}",
            MIN_BPFTRACE_KERNEL.0,
            MIN_BPFTRACE_KERNEL.1
        );
    }
    Ok(())
}

fn check_tracer_on_path(program: &str) -> Result<()> {
    if program.contains('/') {
        if Path::new(program).is_file() {
            return Ok(());
        }
        bail!("Tracer not found: {program}");
    }
    let found = std::env::var_os("PATH")
        .is_some_and(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()));
    if !found {
        bail!(
            "{program} not found on PATH.\n\n\
             Install bpftrace, or point --bpftrace-path at the binary."
        );
    }
    Ok(())
}

/// Yama scope 0 allows any same-user attach, 1-2 need root, 3 disables ptrace
fn check_ptrace_scope(scope: Option<&str>, is_root: bool) -> Result<()> {
    let Some(scope) = scope.and_then(|s| s.trim().parse::<u32>().ok()) else {
        return Ok(());
    };
    match scope {
        0 => Ok(()),
        3 => bail!(
            "ptrace is disabled on this host (kernel.yama.ptrace_scope = 3).\n\n\
             Stack sampling cannot run; drop --sample or reboot with a lower scope."
        ),
        _ if is_root => Ok(()),
        _ => bail!(
            "Permission denied: kernel.yama.ptrace_scope = {scope} blocks attaching to other processes.\n\n\
             Run with sudo, or: echo 0 | sudo tee {PTRACE_SCOPE_PATH}"
        ),
    }
}

/// Symbols drive function selection, so their absence is worth a warning
fn warn_missing_symbols(exe: &Path) {
    let Ok(data) = fs::read(exe) else {
        return;
    };
    let Ok(obj) = object::File::parse(&*data) else {
        return;
    };
    let has_section = |name: &str| obj.section_by_name(name).is_some_and(|s| s.size() > 0);

    if !has_section(".symtab") && !has_section(".dynsym") {
        eprintln!("warning: {} is stripped, no functions can be selected", exe.display());
    } else if !has_section(".debug_info") {
        eprintln!("warning: {} has no DWARF, source locations unavailable", exe.display());
    }
}

/// Check if the target process exists
pub fn check_process_exists(pid: Pid) -> Result<()> {
    if !Path::new(&format!("/proc/{}", pid.0)).exists() {
        bail!(
            "Process {} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0,
            pid.0
        );
    }
    Ok(())
}

/// Module discovery reads the target's memory maps
pub fn check_proc_access(pid: Pid) -> Result<()> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             The process may have exited, or it belongs to another user (run with sudo)."
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_parsing() {
        assert!(check_kernel_version("Linux version 6.1.0-arch1-1 (gcc 12)").is_ok());
        assert!(check_kernel_version("Linux version 4.9.0 (gcc)").is_ok());
        let err = check_kernel_version("Linux version 3.10.0-1160.el7.x86_64 (gcc)").unwrap_err();
        assert!(err.to_string().contains("too old"));
        assert!(check_kernel_version("garbage").is_ok());
    }

    #[test]
    fn test_ptrace_scope() {
        assert!(check_ptrace_scope(Some("0\n"), false).is_ok());
        assert!(check_ptrace_scope(Some("1\n"), true).is_ok());
        assert!(check_ptrace_scope(Some("1\n"), false).unwrap_err().to_string().contains("ptrace_scope = 1"));
        assert!(check_ptrace_scope(Some("3"), true).unwrap_err().to_string().contains("disabled"));
        assert!(check_ptrace_scope(None, false).is_ok());
    }

    #[test]
    fn test_tracer_lookup() {
        assert!(check_tracer_on_path("sh").is_ok());
        assert!(check_tracer_on_path("/nonexistent/bpftrace").is_err());
        let err = check_tracer_on_path("no-such-tracer-hookprof").unwrap_err();
        assert!(err.to_string().contains("--bpftrace-path"));
    }

    #[test]
    fn test_process_not_found() {
        let err = check_process_exists(Pid(999_999_999)).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_own_process_passes() {
        #[allow(clippy::cast_possible_wrap)]
        let own = Pid(std::process::id() as i32);
        assert!(check_process_exists(own).is_ok());
        assert!(check_proc_access(own).is_ok());
        assert!(run_preflight_checks(own, CaptureMode::Instrumented, false, "bpftrace", true).is_ok());
    }
}

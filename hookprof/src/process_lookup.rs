//! Target resolution from a process name or PID

use crate::domain::Pid;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub exe_path: PathBuf,
    pub command: String,
}

impl ProcessInfo {
    /// Describe one PID; `None` for kernel threads and processes we cannot inspect
    #[must_use]
    pub fn inspect(pid: Pid) -> Option<Self> {
        let exe_path = fs::read_link(format!("/proc/{}/exe", pid.0)).ok()?;
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid.0)).ok()?;
        let command = command_name(&stat)?.to_string();
        Some(Self { pid, exe_path, command })
    }

    /// Whether `pattern` names this process
    ///
    /// A pattern that is a path matches on its file name. Exact matches on the
    /// command or executable name win; substrings are accepted too.
    #[must_use]
    pub fn matches(&self, pattern: &str) -> bool {
        let exe_name = self.exe_path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let wanted = Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);
        [self.command.as_str(), exe_name].iter().any(|name| *name == wanted || name.contains(pattern))
    }
}

/// Every inspectable process
pub fn list_processes() -> Result<Vec<ProcessInfo>> {
    let entries = fs::read_dir("/proc").context("Failed to read /proc")?;
    let mut processes: Vec<ProcessInfo> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(|pid| ProcessInfo::inspect(Pid(pid)))
        .collect();
    processes.sort_by_key(|p| p.pid.0);
    Ok(processes)
}

/// The single process matching `name`
///
/// # Errors
/// No match, or more than one.
pub fn find_process_by_name(name: &str) -> Result<ProcessInfo> {
    #[allow(clippy::cast_possible_wrap)]
    let own = std::process::id() as i32;
    let mut matches: Vec<ProcessInfo> =
        list_processes()?.into_iter().filter(|p| p.pid.0 != own && p.matches(name)).collect();

    match matches.len() {
        0 => bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: ps aux | grep {name}"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> = matches.iter().map(|m| format!("  {} ({})", m.pid.0, m.command)).collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: hookprof --pid <PID>",
                list.join("\n")
            )
        }
    }
}

/// Executable of `pid` via `/proc/<pid>/exe`
///
/// # Errors
/// The process is gone or its exe link is not readable.
pub fn resolve_exe_path(pid: Pid) -> Result<PathBuf> {
    let exe_link = format!("/proc/{}/exe", pid.0);
    fs::read_link(&exe_link).with_context(|| format!("Cannot read {exe_link}"))
}

/// `comm` field of a `/proc/<pid>/stat` line: `pid (comm) state ...`
fn command_name(stat_line: &str) -> Option<&str> {
    let open = stat_line.find('(')?;
    let close = stat_line.rfind(')')?;
    (open < close).then(|| &stat_line[open + 1..close])
}

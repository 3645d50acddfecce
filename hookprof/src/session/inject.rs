//! Getting the stub into the target
//!
//! The trampoline injector itself is an external tool; the session only
//! needs to ask for an injection and then wait for the stub to connect.

use crate::domain::{InstrumentationError, Pid};
use std::process::Command;

pub trait Injector: Send {
    /// Load the stub into `pid`, telling it to connect back on `port`
    ///
    /// # Errors
    /// [`InstrumentationError::InjectFailed`] with the injector's reason.
    fn inject(&mut self, pid: Pid, port: u16) -> Result<(), InstrumentationError>;

    fn is_injected(&self, pid: Pid) -> bool;
}

/// The stub is already in the target (preloaded or linked in)
#[derive(Debug, Default)]
pub struct PreloadedStub;

impl Injector for PreloadedStub {
    fn inject(&mut self, pid: Pid, port: u16) -> Result<(), InstrumentationError> {
        log::debug!("Expecting the stub in {pid} to connect to port {port}");
        Ok(())
    }

    fn is_injected(&self, _pid: Pid) -> bool {
        true
    }
}

/// Runs an external injector; `{pid}` and `{port}` in its arguments are substituted
#[derive(Debug, Clone)]
pub struct CommandInjector {
    program: String,
    args: Vec<String>,
    injected: Vec<Pid>,
}

impl CommandInjector {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args, injected: Vec::new() }
    }
}

impl Injector for CommandInjector {
    fn inject(&mut self, pid: Pid, port: u16) -> Result<(), InstrumentationError> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{pid}", &pid.0.to_string()).replace("{port}", &port.to_string()))
            .collect();
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| InstrumentationError::InjectFailed(format!("{}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InstrumentationError::InjectFailed(format!("{}: {}", output.status, stderr.trim())));
        }
        log::info!("Injected stub into {pid}");
        self.injected.push(pid);
        Ok(())
    }

    fn is_injected(&self, pid: Pid) -> bool {
        self.injected.contains(&pid)
    }
}

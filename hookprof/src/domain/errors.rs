//! Structured error types for hookprof
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Library modules return these; the binary wraps them in `anyhow` at the
//! top level.

use super::types::{Pid, Tid};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to listen on capture port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },

    #[error("Frame payload of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unknown message type {0}")]
    UnknownMessageType(u16),

    #[error("Truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Peer closed the capture connection")]
    PeerClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Function already present at virtual address 0x{0:x}")]
    DuplicateFunction(u64),

    #[error("No function at virtual address 0x{0:x}")]
    UnknownFunction(u64),
}

#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("Failed to read module {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse module {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Symbols unavailable for module {0}")]
    Unavailable(PathBuf),
}

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Sampling is already running")]
    AlreadySampling,

    #[error("Failed to list threads of process {pid}: {source}")]
    ThreadList { pid: Pid, source: std::io::Error },

    #[error("Failed to freeze thread {tid}: {message}")]
    Freeze { tid: Tid, message: String },

    #[error("Stack walk failed for thread {tid}: {message}")]
    Walk { tid: Tid, message: String },

    #[error("Stack walking is not supported on this architecture")]
    Unsupported,

    #[error("Failed to spawn sampler thread: {0}")]
    Spawn(std::io::Error),
}

#[derive(Error, Debug)]
pub enum InstrumentationError {
    #[error("No stub connection after {attempts} attempts on port {port}")]
    InjectTimeout { attempts: u32, port: u16 },

    #[error("Injection failed: {0}")]
    InjectFailed(String),

    #[error("Not connected to a target")]
    NotConnected,
}

#[derive(Error, Debug)]
pub enum TracerError {
    #[error("No functions selected, nothing to trace")]
    EmptyScript,

    #[error("Failed to write tracer script {path}: {source}")]
    ScriptWrite { path: PathBuf, source: std::io::Error },

    #[error("Failed to spawn {program}: {source}")]
    Spawn { program: String, source: std::io::Error },

    #[error("Tracer exited early: {0}")]
    ChildExited(String),

    #[error("Tracer stdout unavailable")]
    NoStdout,
}

#[derive(Error, Debug)]
pub enum PresetError {
    #[error("Unsupported preset version {0}")]
    UnsupportedVersion(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No process selected. Please choose a target process for the capture.")]
    NoTarget,

    #[error("Cannot {operation} while {state}")]
    InvalidState { operation: &'static str, state: &'static str },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Instrumentation(#[from] InstrumentationError),

    #[error(transparent)]
    Tracer(#[from] TracerError),

    #[error(transparent)]
    Sampling(#[from] SamplingError),

    #[error(transparent)]
    Preset(#[from] PresetError),

    #[error(transparent)]
    Symbols(#[from] SymbolError),
}

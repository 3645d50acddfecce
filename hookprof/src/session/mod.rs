//! Capture session
//!
//! - `capture`: the state machine that wires every subsystem together
//! - `params`: capture configuration
//! - `sink`: the UI capability
//! - `preset`: saved function selections
//! - `inject`: the stub injection seam

pub mod capture;
pub mod inject;
pub mod params;
pub mod preset;
pub mod sink;

pub use capture::{CaptureContext, CaptureState, CaptureSummary, TargetProcess};
pub use inject::{CommandInjector, Injector, PreloadedStub};
pub use params::{CaptureMode, CaptureParams};
pub use preset::{Preset, PresetApplication, PresetModule, PRESET_EXTENSION, PRESET_VERSION};
pub use sink::{LogSink, RecordingSink, Sink};

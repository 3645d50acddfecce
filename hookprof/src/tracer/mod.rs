//! Uprobe tracing through bpftrace, for targets without an injected stub

pub mod driver;
pub mod parser;
pub mod script;

pub use driver::{BpftraceDriver, TracerCallback, TracerConfig};
pub use parser::{FrameSymbol, ParserCounters, TimerLineParser, TracerOutput};
pub use script::generate_script;

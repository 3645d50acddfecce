//! # hookprof - out-of-process function profiler
//!
//! hookprof attaches to a running process, lets the user pick functions from
//! the process's symbol tables, and times every call to them. Timing comes
//! either from a stub loaded into the target that patches the selected
//! functions and streams timers back over TCP, or from bpftrace uprobes when
//! no stub is available. A ptrace-based sampler can run alongside either one.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Target Process                         │
//! │         stub (hooks, timers)          bpftrace uprobes        │
//! └───────────────┬───────────────────────────────┬───────────────┘
//!                 │ framed TCP                    │ b/e lines
//!                 ▼                               ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐            │
//! │  │ transport  │──▶│ instrumen- │◀──│   tracer   │            │
//! │  │ (dispatch) │   │  tation    │   │ (bpftrace) │            │
//! │  └────────────┘   └─────┬──────┘   └────────────┘            │
//! │                         │ timers, callstacks                  │
//! │  ┌────────────┐   ┌─────▼──────┐   ┌────────────┐            │
//! │  │  sampling  │──▶│  session   │──▶│    Sink    │            │
//! │  │  (ptrace)  │   │ (capture)  │   │ (front end)│            │
//! │  └────────────┘   └─────┬──────┘   └────────────┘            │
//! │                         │                                      │
//! │  ┌────────────┐   ┌─────▼──────┐                              │
//! │  │symbolizat- │──▶│  modules   │──▶ catalog (functions, stats) │
//! │  │ ion (ELF)  │   │ (loader)   │                              │
//! │  └────────────┘   └────────────┘                              │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`transport`]: framed messages over TCP, per-type dispatch, traffic stats
//! - [`catalog`]: modules and functions keyed by virtual address, selection, timing stats
//! - [`symbolization`]: ELF/DWARF function tables and `/proc/<pid>/maps` parsing
//! - [`modules`]: background symbol loading, preset application, watched variables
//! - [`instrumentation`]: hook selection, timer pairing and routing
//! - [`tracer`]: bpftrace script generation, child process, output parsing
//! - [`sampling`]: thread freeze, stack walk, sample roll-up
//! - [`callstack`]: content-hashed callstack interning
//! - [`session`]: capture state machine, presets, front-end sink
//! - [`cli`], [`preflight`], [`process_lookup`]: the `hookprof` binary's plumbing
//!
//! ## Addresses
//!
//! Every function is identified by its virtual address in the target:
//! `address - load_bias + module_base`. Hooks, timers, sampled frames and
//! presets (by name hash) all resolve through the [`catalog`].

pub mod callstack;
pub mod catalog;
pub mod cli;
pub mod clock;
pub mod domain;
pub mod hashing;
pub mod instrumentation;
pub mod modules;
pub mod preflight;
pub mod process_lookup;
pub mod sampling;
pub mod session;
pub mod symbolization;
pub mod tracer;
pub mod transport;

//! # hookprof - Main Entry Point
//!
//! Resolves the target, loads its symbols, selects functions, runs one capture
//! until Ctrl-C, `--duration` or target exit, and prints a summary.

#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use hookprof::cli::Args;
use hookprof::domain::Pid;
use hookprof::modules::SymbolProvider;
use hookprof::preflight::run_preflight_checks;
use hookprof::process_lookup::find_process_by_name;
use hookprof::session::{CaptureContext, CaptureState, CaptureSummary, CommandInjector, LogSink, TargetProcess};
use hookprof::symbolization::ElfSymbolProvider;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

const SYMBOL_LOAD_TIMEOUT: Duration = Duration::from_secs(30);
const TICK: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const TOP_FUNCTIONS: usize = 20;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// `hookprof my-app` or `hookprof --pid 1234`, never both
fn resolve_pid(args: &Args) -> Result<Pid> {
    match (&args.process, args.pid) {
        (Some(_), Some(_)) => anyhow::bail!(
            "Cannot use PROCESS argument with --pid.\n\n\
             Use either:\n  \
             hookprof my-app          (find by name)\n  \
             hookprof --pid 1234      (explicit PID)"
        ),
        (Some(name), None) => Ok(find_process_by_name(name)?.pid),
        (None, Some(pid)) => Ok(Pid(pid)),
        (None, None) => anyhow::bail!(
            "Missing required argument: PROCESS or --pid\n\n\
             Usage:\n  \
             hookprof my-app -f Render      Hook functions matching 'Render'\n  \
             hookprof --pid 1234 --sample   Sample stacks only\n\n\
             Run 'hookprof --help' for more options"
        ),
    }
}

fn injector_from(command: &str) -> Result<CommandInjector> {
    let mut words = command.split_whitespace().map(str::to_string);
    let program = words.next().context("--inject-command is empty")?;
    Ok(CommandInjector::new(program, words.collect()))
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;
    let params = args.to_params();

    let pid = resolve_pid(&args)?;
    run_preflight_checks(pid, params.mode, params.sample, &params.tracer.program, quiet)?;

    let target = TargetProcess::from_pid(pid).with_context(|| format!("Cannot inspect process {pid}"))?;
    if !quiet {
        println!("hookprof v{}", env!("CARGO_PKG_VERSION"));
        println!("target: {}", target.path);
        println!("pid: {pid}");
        println!("mode: {:?}", params.mode);
    }

    let provider: Arc<dyn SymbolProvider> = Arc::new(ElfSymbolProvider::new());
    let mut ctx = CaptureContext::new(params, provider, Arc::new(LogSink));
    if let Some(command) = &args.inject_command {
        ctx = ctx.with_injector(Box::new(injector_from(command)?));
    }

    // ── Symbols and selection ──────────────────────────────────────────
    ctx.set_target(target)?;
    let outcomes = ctx.wait_for_symbols(SYMBOL_LOAD_TIMEOUT);
    let loaded: usize = outcomes.iter().map(|o| o.functions).sum();
    for failed in outcomes.iter().filter(|o| o.error.is_some()) {
        warn!("{}: {}", failed.path, failed.error.as_deref().unwrap_or_default());
    }
    if !quiet {
        println!("functions: {loaded} in {} modules", outcomes.len());
    }

    if let Some(path) = &args.load_preset {
        let applied = ctx.load_preset(path)?;
        ctx.wait_for_symbols(SYMBOL_LOAD_TIMEOUT);
        info!("Preset {}: {} selected, {} missing", path.display(), applied.selected, applied.missing);
    }
    for pattern in &args.functions {
        let selected = ctx.select_matching(pattern);
        if selected == 0 {
            warn!("No function matches '{pattern}'");
        }
        info!("'{pattern}' selected {selected} functions");
    }
    if !quiet {
        println!("selected: {}", ctx.catalog().selected_addresses().len());
    }

    // ── Capture ─────────────────────────────────────────────────────────
    if !quiet && ctx.params().needs_link() {
        println!("waiting for stub on port {}...", ctx.params().capture_port);
    }
    ctx.connect()?;
    ctx.start()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let capture_start = Instant::now();
    let duration_limit = args.duration_limit();
    let proc_path = format!("/proc/{}", pid.0);
    let mut exit_reason = "interrupted";

    loop {
        if duration_limit.is_some_and(|limit| capture_start.elapsed() >= limit) {
            exit_reason = "duration limit reached";
            break;
        }
        if !Path::new(&proc_path).exists() {
            exit_reason = "process exited";
            break;
        }

        ctx.update();
        if ctx.state() != CaptureState::Capturing {
            exit_reason = "capture ended";
            break;
        }

        tokio::select! {
            () = tokio::time::sleep(TICK) => {}
            _ = &mut ctrl_c => break,
        }
    }

    ctx.stop();
    let drain_start = Instant::now();
    while ctx.state() != CaptureState::Idle && drain_start.elapsed() < DRAIN_TIMEOUT {
        ctx.update();
        tokio::time::sleep(TICK).await;
    }

    if let Some(path) = &args.save_preset {
        let saved = ctx.save_preset(path)?;
        if !quiet {
            println!("saved preset: {} ({saved} functions)", path.display());
        }
    }

    print_summary(&ctx, exit_reason, capture_start.elapsed());
    Ok(())
}

fn print_summary(ctx: &CaptureContext, exit_reason: &str, elapsed: Duration) {
    let CaptureSummary { session_id, timers, open_timers, hooks, tracer, transport, samples } = ctx.summary();
    eprintln!(
        "\n{exit_reason}: capture {session_id}, {:.1}s, {timers} timers ({open_timers} open), {samples} samples, {} messages / {} bytes received",
        elapsed.as_secs_f64(),
        transport.messages_received,
        transport.bytes_received,
    );
    if let Some(hooks) = hooks {
        eprintln!("hooks: {} installed, {} rejected", hooks.installed, hooks.rejected.len());
    }
    if let Some(tracer) = tracer {
        eprintln!(
            "bpftrace: {} timers, {} malformed lines, {} unmatched ends",
            tracer.timers_emitted, tracer.malformed_lines, tracer.unmatched_ends
        );
    }

    let rows = ctx.top_functions(TOP_FUNCTIONS);
    if !rows.is_empty() {
        eprintln!("\n{:>10} {:>12} {:>10} {:>10} {:>10}  function", "calls", "total ms", "avg ms", "min ms", "max ms");
        for (name, stats) in rows {
            eprintln!(
                "{:>10} {:>12.3} {:>10.3} {:>10.3} {:>10.3}  {name}",
                stats.count, stats.total_ms, stats.average_ms, stats.min_ms, stats.max_ms
            );
        }
    }

    if let Some(thread) = ctx.last_report().and_then(|report| report.all_threads()) {
        eprintln!("\nsampled hot spots ({} samples):", thread.samples_count);
        for function in thread.functions.iter().take(TOP_FUNCTIONS) {
            eprintln!(
                "{:>7.2}% {:>7.2}%  {}",
                function.exclusive_percent, function.inclusive_percent, function.name
            );
        }
    }
}

//! Demo workload for hookprof
//!
//! A fake game loop with a few uninlined functions on two threads, so there
//! is something to hook, trace and sample.
//!
//! ## Usage
//!
//! ```bash
//! cargo build --release --example demo-target
//! ./target/release/examples/demo-target
//!
//! # In another terminal: trace with bpftrace
//! sudo ./target/release/hookprof demo-target --bpftrace -f simulate_physics -f render_frame
//!
//! # Or sample stacks only
//! ./target/release/hookprof demo-target --sample --duration 5
//! ```

use std::hint::black_box;
use std::thread;
use std::time::Duration;

#[inline(never)]
fn simulate_physics(bodies: u64) -> u64 {
    (0..bodies * 2_000).fold(0u64, |acc, i| acc.wrapping_mul(31).wrapping_add(black_box(i)))
}

#[inline(never)]
fn cull_objects(count: u64) -> u64 {
    (0..count).filter(|i| black_box(*i) % 3 != 0).count() as u64
}

#[inline(never)]
fn render_frame(frame: u64) -> u64 {
    let visible = cull_objects(50_000 + frame % 1_000);
    visible ^ simulate_physics(4)
}

#[inline(never)]
fn stream_assets(chunk: u64) {
    black_box(simulate_physics(chunk % 8 + 1));
    thread::sleep(Duration::from_millis(5));
}

fn main() {
    println!("demo-target pid {}", std::process::id());

    let loader = thread::Builder::new()
        .name("asset-loader".into())
        .spawn(|| {
            for chunk in 0.. {
                stream_assets(chunk);
            }
        })
        .expect("spawn asset-loader");

    for frame in 0u64.. {
        black_box(simulate_physics(16));
        black_box(render_frame(frame));
        thread::sleep(Duration::from_millis(16));
        if loader.is_finished() {
            break;
        }
    }
}

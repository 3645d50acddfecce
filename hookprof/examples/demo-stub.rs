//! Stand-in for the in-process stub
//!
//! Connects to a listening hookprof, records the hooks it is sent and, once
//! the capture starts, reports a synthetic call to every hooked function
//! every few milliseconds until the profiler hangs up.
//!
//! ## Usage
//!
//! ```bash
//! ./target/release/hookprof --pid $(pgrep demo-target) --remote -f render_frame &
//! cargo run --example demo-stub -- 1789
//! ```

use hookprof::transport::{FrameDecoder, Message};
use hookprof_common::{MessageType, Timer};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::args().nth(1).map_or(Ok(1789), |p| p.parse())?;
    let mut stream = TcpStream::connect(("127.0.0.1", port))?;
    stream.set_read_timeout(Some(Duration::from_millis(5)))?;
    println!("connected to hookprof on port {port}");

    let epoch = Instant::now();
    let mut decoder = FrameDecoder::new();
    let mut hooks: Vec<u64> = Vec::new();
    let mut session: Option<u32> = None;
    let mut buf = [0u8; 64 * 1024];
    let mut sent = 0u64;

    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(e.into()),
        }

        while let Some(frame) = decoder.next_frame() {
            let frame = frame?;
            match frame.kind {
                MessageType::NewSession => hooks.clear(),
                MessageType::StartCapture => {
                    println!("capture {} started, {} hooks", frame.session_id, hooks.len());
                    session = Some(frame.session_id);
                }
                MessageType::StopCapture => {
                    println!("capture {} stopped after {sent} timers", frame.session_id);
                    session = None;
                }
                kind if kind.is_function_hook() => hooks.extend(frame.addresses()?),
                _ => {}
            }
        }

        let Some(session_id) = session else {
            continue;
        };
        #[allow(clippy::cast_possible_truncation)]
        let now = epoch.elapsed().as_nanos() as u64;
        let payload: Vec<u8> = hooks
            .iter()
            .enumerate()
            .flat_map(|(i, address)| {
                let start = now.saturating_sub(1_000_000 + i as u64 * 10_000);
                Timer { function_address: *address, tid: 1, start, end: now, session_id, ..Timer::default() }
                    .to_bytes()
            })
            .collect();
        if payload.is_empty() {
            continue;
        }
        sent += hooks.len() as u64;
        stream.write_all(&Message::new(MessageType::Timer, session_id).with_payload(payload).encode()?)?;
    }

    println!("hookprof closed the connection");
    Ok(())
}

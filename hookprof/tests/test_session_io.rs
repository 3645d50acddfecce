mod common;

use common::{game_session, game_target, vaddr, TableProvider, GAME};
use hookprof::session::{CaptureContext, CaptureParams, CaptureState, Preset, RecordingSink};
use hookprof::transport::{FrameDecoder, Message};
use hookprof_common::{MessageType, Timer};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[test]
fn test_preset_save_and_load_restores_selection() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("frame.opr.json");

    let (mut ctx, _link, sink) = game_session(CaptureParams::default());
    ctx.select_function(vaddr(0x1100)).unwrap();
    ctx.select_function(vaddr(0x1300)).unwrap();
    assert_eq!(ctx.save_preset(&path).unwrap(), 2);

    let saved = Preset::load(&path).unwrap();
    assert_eq!(saved.process_full_path, GAME);
    assert_eq!(saved.modules[GAME].name, "game");

    ctx.catalog().clear_selection();
    let applied = ctx.load_preset(&path).unwrap();
    assert_eq!(applied.selected, 2);
    assert_eq!(applied.missing, 0);
    assert_eq!(ctx.catalog().selected_addresses(), vec![vaddr(0x1100), vaddr(0x1300)]);
    assert!(sink.messages().is_empty());
}

#[test]
fn test_preset_misses_reported_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stale.opr.json");

    let (mut ctx, _link, sink) = game_session(CaptureParams::default());
    ctx.select_function(vaddr(0x1000)).unwrap();
    let mut preset = Preset::from_selection(ctx.catalog());
    preset.modules.get_mut(GAME).unwrap().function_hashes.push(0xdead_beef);
    preset.save(&path).unwrap();

    ctx.catalog().clear_selection();
    let applied = ctx.load_preset(&path).unwrap();
    assert_eq!((applied.selected, applied.missing), (1, 1));
    assert_eq!(sink.messages(), vec!["1 preset functions could not be found in the loaded modules".to_string()]);
}

#[test]
fn test_preset_applies_after_symbols_arrive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("early.opr.json");
    {
        let (mut ctx, _link, _) = game_session(CaptureParams::default());
        ctx.select_function(vaddr(0x1300)).unwrap();
        ctx.save_preset(&path).unwrap();
    }

    // Fresh session: the preset is loaded before the module's symbols are in
    let sink = Arc::new(RecordingSink::new());
    let mut ctx = CaptureContext::new(CaptureParams::default(), Arc::new(TableProvider::game()), sink);
    ctx.set_target(game_target()).unwrap();
    ctx.load_preset(&path).unwrap();
    ctx.wait_for_symbols(Duration::from_secs(5));

    assert_eq!(ctx.catalog().selected_addresses(), vec![vaddr(0x1300)]);
    assert!(!ctx.modules_mut().has_pending_preset());
}

#[test]
fn test_unsupported_preset_version_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("future.opr.json");
    std::fs::write(&path, r#"{"version":"2.0","modules":{}}"#).unwrap();

    let (mut ctx, _link, _) = game_session(CaptureParams::default());
    assert!(ctx.load_preset(&path).is_err());
}

/// Plays the stub: waits for StartCapture, sends timers, hangs up
fn fake_stub(port: u16, timers: Vec<Timer>) -> thread::JoinHandle<Vec<MessageType>> {
    thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];

        let session_id = 'read: loop {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "profiler closed the connection");
            decoder.push(&buf[..n]);
            while let Some(frame) = decoder.next_frame() {
                let frame = frame.unwrap();
                seen.push(frame.kind);
                if frame.kind == MessageType::StartCapture {
                    break 'read frame.session_id;
                }
            }
        };

        let payload = timers.iter().flat_map(|t| Timer { session_id, ..*t }.to_bytes()).collect();
        let frame = Message::new(MessageType::Timer, session_id).with_payload(payload);
        stream.write_all(&frame.encode().unwrap()).unwrap();
        stream.flush().unwrap();
        seen
    })
}

#[test]
fn test_capture_over_tcp_until_stub_hangs_up() {
    let params = CaptureParams { capture_port: 0, remote: true, ..CaptureParams::default() };
    let sink = Arc::new(RecordingSink::new());
    let mut ctx = CaptureContext::new(params, Arc::new(TableProvider::game()), sink.clone());
    ctx.set_target(game_target()).unwrap();
    ctx.wait_for_symbols(Duration::from_secs(5));
    ctx.select_function(vaddr(0x1100)).unwrap();

    let port = ctx.listen().unwrap();
    let timers = vec![
        Timer { function_address: vaddr(0x1100), tid: 5, start: 1_000_000, end: 2_000_000, ..Timer::default() },
        Timer { function_address: vaddr(0x1100), tid: 5, start: 3_000_000, end: 6_000_000, ..Timer::default() },
    ];
    let stub = fake_stub(port, timers);

    ctx.connect().unwrap();
    assert_eq!(ctx.state(), CaptureState::Connected);
    ctx.start().unwrap();

    let seen = stub.join().unwrap();
    assert_eq!(seen.first(), Some(&MessageType::NewSession));
    assert!(seen.contains(&MessageType::FunctionHook));

    let deadline = Instant::now() + Duration::from_secs(5);
    while ctx.state() != CaptureState::Idle && Instant::now() < deadline {
        ctx.update();
        thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(ctx.state(), CaptureState::Idle);
    assert_eq!(sink.timer_count(), 2);
    let stats = ctx.catalog().stats(vaddr(0x1100)).unwrap();
    assert_eq!(stats.count, 2);
    assert!((stats.total_ms - 4.0).abs() < 1e-9);
    assert!(ctx.summary().transport.messages_received >= 1);
}

//! Routing of inbound capture data
//!
//! Runs on the transport receiver thread (or the tracer reader thread).
//! Zone starts and stops are paired here; every completed timer updates the
//! catalog statistics and is queued for the main thread as a
//! [`CaptureEvent`].

use super::pending::PendingTimers;
use crate::callstack::{CallStack, CallstackEvent};
use crate::catalog::FunctionCatalog;
use crate::transport::{ContextSwitch, Dispatcher, Message};
use crossbeam_channel::{unbounded, Receiver, Sender};
use hookprof_common::{MessageType, Timer, TimerKind, TIMER_WIRE_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Data handed from the capture threads to the main thread
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Timer(Timer),
    CallStack(CallStack),
    Sample(CallstackEvent),
    ContextSwitch(ContextSwitch),
}

pub struct TimerRouter {
    pending: Mutex<PendingTimers>,
    catalog: Arc<FunctionCatalog>,
    events: Sender<CaptureEvent>,
    recording: AtomicBool,
    emitted: AtomicU64,
    decode_errors: AtomicU64,
}

impl TimerRouter {
    #[must_use]
    pub fn new(catalog: Arc<FunctionCatalog>) -> (Arc<Self>, Receiver<CaptureEvent>) {
        let (events, rx) = unbounded();
        let router = Arc::new(Self {
            pending: Mutex::new(PendingTimers::new()),
            catalog,
            events,
            recording: AtomicBool::new(false),
            emitted: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        });
        (router, rx)
    }

    /// Timers arriving while not recording are dropped
    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Accept one timer from the stub or the tracer
    pub fn on_timer(&self, timer: Timer) {
        if !self.is_recording() {
            return;
        }
        match timer.timer_kind() {
            TimerKind::ZoneStart => {
                self.pending.lock().open(timer);
            }
            TimerKind::ZoneStop => {
                let closed = self.pending.lock().close(timer.tid, timer.start);
                if let Some(zone) = closed {
                    self.emit(zone);
                }
            }
            _ => {
                self.pending.lock().observe(timer.tid, timer.end.max(timer.start));
                self.emit(timer);
            }
        }
    }

    /// Forward a timer that was already paired elsewhere
    pub fn emit(&self, timer: Timer) {
        self.catalog.update_stats(timer.function_address, &timer);
        self.emitted.fetch_add(1, Ordering::Relaxed);
        // The receiving end lives as long as the session
        let _ = self.events.send(CaptureEvent::Timer(timer));
    }

    pub fn on_callstack(&self, stack: CallStack) {
        if self.is_recording() {
            let _ = self.events.send(CaptureEvent::CallStack(stack));
        }
    }

    pub fn on_sample(&self, event: CallstackEvent) {
        if self.is_recording() {
            let _ = self.events.send(CaptureEvent::Sample(event));
        }
    }

    pub fn on_context_switch(&self, switch: ContextSwitch) {
        if self.is_recording() {
            let _ = self.events.send(CaptureEvent::ContextSwitch(switch));
        }
    }

    /// Close open zones at `now`; returns how many were closed
    pub fn flush_at(&self, now: u64) -> usize {
        let flushed = self.pending.lock().flush_at(now);
        self.emit_all(flushed)
    }

    /// Close open zones at each thread's last-seen timestamp
    pub fn flush_last_seen(&self) -> usize {
        let flushed = self.pending.lock().flush_last_seen();
        self.emit_all(flushed)
    }

    fn emit_all(&self, timers: Vec<Timer>) -> usize {
        let count = timers.len();
        for timer in timers {
            self.emit(timer);
        }
        count
    }

    #[must_use]
    pub fn open_timers(&self) -> usize {
        self.pending.lock().open_count()
    }

    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.pending.lock().clear();
        self.emitted.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
    }

    /// Hook the capture message types into `dispatcher`
    pub fn register(self: &Arc<Self>, dispatcher: &Dispatcher) {
        let router = Arc::clone(self);
        dispatcher.register(MessageType::Timer, move |message| router.handle_timers(message));

        let router = Arc::clone(self);
        dispatcher.register(MessageType::CallStack, move |message| {
            match CallStack::from_payload(&message.payload) {
                Ok(stack) => router.on_callstack(stack),
                Err(e) => router.decode_failed(message.kind, &e),
            }
        });

        let router = Arc::clone(self);
        dispatcher.register(MessageType::HashedCallStack, move |message| {
            match CallstackEvent::from_payload(&message.payload) {
                Ok(event) => router.on_sample(event),
                Err(e) => router.decode_failed(message.kind, &e),
            }
        });

        let router = Arc::clone(self);
        dispatcher.register(MessageType::ContextSwitch, move |message| {
            match ContextSwitch::from_payload(&message.payload) {
                Ok(switch) => router.on_context_switch(switch),
                Err(e) => router.decode_failed(message.kind, &e),
            }
        });
    }

    /// A Timer frame may batch several fixed-size records
    fn handle_timers(&self, message: &Message) {
        let chunks = message.payload.chunks_exact(TIMER_WIRE_SIZE);
        if !chunks.remainder().is_empty() {
            log::debug!("Timer frame with {} trailing bytes", chunks.remainder().len());
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
        }
        for chunk in chunks {
            if let Some(timer) = Timer::from_bytes(chunk) {
                self.on_timer(timer);
            }
        }
    }

    fn decode_failed(&self, kind: MessageType, error: &dyn std::fmt::Display) {
        log::debug!("Dropping malformed {kind:?} frame: {error}");
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Function;

    fn router() -> (Arc<TimerRouter>, Receiver<CaptureEvent>, Arc<FunctionCatalog>) {
        let catalog = Arc::new(FunctionCatalog::new());
        catalog.add(Function::new("work", 0x100, 0x40).in_module("/bin/app", 0, 0)).unwrap();
        let (router, rx) = TimerRouter::new(catalog.clone());
        router.set_recording(true);
        (router, rx, catalog)
    }

    fn timer(kind: TimerKind, tid: u32, start: u64, end: u64) -> Timer {
        Timer { function_address: 0x100, tid, start, end, kind: kind as u8, ..Timer::default() }
    }

    #[test]
    fn test_function_timer_updates_stats_and_queues() {
        let (router, rx, catalog) = router();
        router.on_timer(timer(TimerKind::Function, 1, 1_000_000, 3_000_000));
        assert!(matches!(rx.try_recv(), Ok(CaptureEvent::Timer(t)) if t.end == 3_000_000));
        let stats = catalog.stats(0x100).unwrap();
        assert_eq!(stats.count, 1);
        assert!((stats.total_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_zone_pairs_start_and_stop() {
        let (router, rx, _) = router();
        router.on_timer(timer(TimerKind::ZoneStart, 1, 10, 10));
        assert!(rx.try_recv().is_err());
        assert_eq!(router.open_timers(), 1);

        router.on_timer(timer(TimerKind::ZoneStop, 1, 50, 50));
        let Ok(CaptureEvent::Timer(zone)) = rx.try_recv() else {
            panic!("zone timer expected");
        };
        assert_eq!((zone.start, zone.end), (10, 50));
        assert_eq!(zone.timer_kind(), TimerKind::ZoneStart);
    }

    #[test]
    fn test_not_recording_drops_everything() {
        let (router, rx, _) = router();
        router.set_recording(false);
        router.on_timer(timer(TimerKind::Function, 1, 0, 5));
        router.on_callstack(CallStack::new(vec![1], crate::domain::Tid(1)));
        assert!(rx.try_recv().is_err());
        assert_eq!(router.emitted(), 0);
    }

    #[test]
    fn test_batched_timer_frame_dispatch() {
        let (router, rx, _) = router();
        let dispatcher = Dispatcher::default();
        router.register(&dispatcher);

        let mut payload = timer(TimerKind::Function, 1, 0, 5).to_bytes().to_vec();
        payload.extend_from_slice(&timer(TimerKind::Function, 2, 5, 9).to_bytes());
        dispatcher.dispatch(Message::new(MessageType::Timer, 0).with_payload(payload));

        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(router.decode_errors(), 0);
    }

    #[test]
    fn test_flush_last_seen_emits_leftovers() {
        let (router, rx, catalog) = router();
        router.on_timer(timer(TimerKind::ZoneStart, 4, 100, 100));
        router.on_timer(timer(TimerKind::Function, 4, 150, 400));

        assert_eq!(router.flush_last_seen(), 1);
        let timers: Vec<Timer> = rx
            .try_iter()
            .filter_map(|e| if let CaptureEvent::Timer(t) = e { Some(t) } else { None })
            .collect();
        assert_eq!(timers.last().map(|t| (t.start, t.end)), Some((100, 400)));
        assert_eq!(catalog.stats(0x100).unwrap().count, 2);
    }
}

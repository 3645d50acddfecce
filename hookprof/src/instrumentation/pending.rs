//! Per-thread stacks of timers that have an entry but no exit yet

use hookprof_common::Timer;
use std::collections::HashMap;

/// Open timers keyed by thread, innermost on top
///
/// Also remembers the newest timestamp seen on every thread so a capture
/// that loses its connection can close leftovers at a plausible time.
#[derive(Debug, Default)]
pub struct PendingTimers {
    stacks: HashMap<u32, Vec<Timer>>,
    last_seen: HashMap<u32, u64>,
    latest: u64,
    unmatched_ends: u64,
}

impl PendingTimers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Note activity on `tid` at `timestamp`
    pub fn observe(&mut self, tid: u32, timestamp: u64) {
        let seen = self.last_seen.entry(tid).or_insert(timestamp);
        *seen = (*seen).max(timestamp);
        self.latest = self.latest.max(timestamp);
    }

    /// Push an entry; its depth becomes the number of timers already open on the thread
    pub fn open(&mut self, mut timer: Timer) -> u8 {
        self.observe(timer.tid, timer.start);
        let stack = self.stacks.entry(timer.tid).or_default();
        timer.depth = u8::try_from(stack.len()).unwrap_or(u8::MAX);
        stack.push(timer);
        timer.depth
    }

    /// Close the innermost open timer on `tid`
    ///
    /// An exit with nothing open is counted and ignored.
    pub fn close(&mut self, tid: u32, end: u64) -> Option<Timer> {
        self.observe(tid, end);
        match self.stacks.get_mut(&tid).and_then(Vec::pop) {
            Some(mut timer) => {
                timer.end = end.max(timer.start);
                Some(timer)
            }
            None => {
                self.unmatched_ends += 1;
                None
            }
        }
    }

    /// Tag the innermost open timer on `tid` with a callstack hash
    pub fn set_top_callstack(&mut self, tid: u32, callstack_hash: u64) -> bool {
        match self.stacks.get_mut(&tid).and_then(|stack| stack.last_mut()) {
            Some(top) => {
                top.callstack_hash = callstack_hash;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn depth(&self, tid: u32) -> usize {
        self.stacks.get(&tid).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.stacks.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn unmatched_ends(&self) -> u64 {
        self.unmatched_ends
    }

    #[must_use]
    pub fn last_seen(&self, tid: u32) -> Option<u64> {
        self.last_seen.get(&tid).copied()
    }

    /// Close every open timer with a synthetic end at `now`
    pub fn flush_at(&mut self, now: u64) -> Vec<Timer> {
        self.drain(|_| now)
    }

    /// Close every open timer at the last timestamp seen on its thread
    pub fn flush_last_seen(&mut self) -> Vec<Timer> {
        let last_seen = std::mem::take(&mut self.last_seen);
        let latest = self.latest;
        let flushed = self.drain(|tid| last_seen.get(&tid).copied().unwrap_or(latest));
        self.last_seen = last_seen;
        flushed
    }

    fn drain(&mut self, end_for: impl Fn(u32) -> u64) -> Vec<Timer> {
        let mut tids: Vec<u32> = self.stacks.keys().copied().collect();
        tids.sort_unstable();

        let mut flushed = Vec::new();
        for tid in tids {
            let Some(stack) = self.stacks.remove(&tid) else {
                continue;
            };
            let end = end_for(tid);
            flushed.extend(stack.into_iter().rev().map(|mut timer| {
                timer.end = end.max(timer.start);
                timer
            }));
        }
        flushed
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

//! Type-indexed dispatch of inbound frames
//!
//! The receiver thread hands every decoded frame to [`Dispatcher::dispatch`].
//! Frames from an older session are dropped, frames with a registered
//! callback run it on the receiver thread, and everything else lands in a
//! bounded queue the main thread drains on its tick.

use super::frame::Message;
use super::stats::TransportStats;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use hookprof_common::MessageType;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Default capacity of the main-thread queue
pub const MAIN_THREAD_QUEUE_CAPACITY: usize = 4096;

pub type Callback = Box<dyn Fn(&Message) + Send + Sync>;

/// What happened to a dispatched frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Queued,
    /// Main-thread queue was full
    Dropped,
    /// Frame belonged to a previous session
    Stale,
}

pub struct Dispatcher {
    callbacks: RwLock<HashMap<MessageType, Callback>>,
    main_tx: Sender<Message>,
    main_rx: Receiver<Message>,
    session_id: AtomicU32,
    stats: Arc<TransportStats>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(MAIN_THREAD_QUEUE_CAPACITY)
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(main_queue_capacity: usize) -> Self {
        let (main_tx, main_rx) = bounded(main_queue_capacity);
        Self {
            callbacks: RwLock::new(HashMap::new()),
            main_tx,
            main_rx,
            session_id: AtomicU32::new(0),
            stats: Arc::new(TransportStats::new()),
        }
    }

    /// Register the handler for one message type, replacing any previous one
    pub fn register<F>(&self, kind: MessageType, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.callbacks.write().insert(kind, Box::new(callback));
    }

    pub fn unregister(&self, kind: MessageType) {
        self.callbacks.write().remove(&kind);
    }

    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::Acquire)
    }

    pub fn set_session_id(&self, id: u32) {
        self.session_id.store(id, Ordering::Release);
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<TransportStats> {
        &self.stats
    }

    pub fn dispatch(&self, message: Message) -> Dispatch {
        self.stats.record_received(message.wire_size());

        if message.kind != MessageType::NewSession && message.session_id != self.session_id() {
            debug!(
                "Dropping {:?} from session {} (current {})",
                message.kind,
                message.session_id,
                self.session_id()
            );
            self.stats.record_session_mismatch();
            return Dispatch::Stale;
        }

        if let Some(callback) = self.callbacks.read().get(&message.kind) {
            callback(&message);
            return Dispatch::Handled;
        }

        match self.main_tx.try_send(message) {
            Ok(()) => Dispatch::Queued,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.stats.record_dropped();
                Dispatch::Dropped
            }
        }
    }

    /// Drain everything queued for the main thread
    pub fn poll_main_thread(&self) -> Vec<Message> {
        self.main_rx.try_iter().collect()
    }

    #[must_use]
    pub fn pending_main_thread(&self) -> usize {
        self.main_rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callback_runs_for_registered_type() {
        let dispatcher = Dispatcher::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.register(MessageType::Timer, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(dispatcher.dispatch(Message::new(MessageType::Timer, 0)), Dispatch::Handled);
        assert_eq!(dispatcher.dispatch(Message::new(MessageType::GetData, 0)), Dispatch::Queued);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.poll_main_thread().len(), 1);
        assert_eq!(dispatcher.pending_main_thread(), 0);
    }

    #[test]
    fn test_stale_session_frames_dropped() {
        let dispatcher = Dispatcher::default();
        dispatcher.set_session_id(5);
        assert_eq!(dispatcher.dispatch(Message::new(MessageType::Timer, 4)), Dispatch::Stale);
        assert_eq!(dispatcher.dispatch(Message::new(MessageType::NewSession, 4)), Dispatch::Queued);
        assert_eq!(dispatcher.stats().snapshot().session_mismatches, 1);
    }

    #[test]
    fn test_full_main_queue_drops() {
        let dispatcher = Dispatcher::new(1);
        assert_eq!(dispatcher.dispatch(Message::new(MessageType::SetData, 0)), Dispatch::Queued);
        assert_eq!(dispatcher.dispatch(Message::new(MessageType::SetData, 0)), Dispatch::Dropped);
        assert_eq!(dispatcher.stats().snapshot().dropped_frames, 1);
    }
}

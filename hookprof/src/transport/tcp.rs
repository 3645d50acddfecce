//! TCP capture link
//!
//! ```text
//!  producers ──▶ unbounded MPSC ──▶ sender thread ──▶ socket
//!  socket ──▶ receiver thread ──▶ FrameDecoder ──▶ Dispatcher
//!  listener ──▶ acceptor thread (hands each new stream to sender + receiver)
//! ```
//!
//! Producers never block: frames queue until the sender writes them, and
//! frames sent while nobody is connected are counted and discarded.

use super::dispatch::Dispatcher;
use super::frame::{FrameDecoder, Message};
use super::Link;
use crate::domain::TransportError;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Connection state changes, observed by the capture session on its tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(SocketAddr),
    Lost,
}

struct LinkState {
    connected: AtomicBool,
    shutdown: AtomicBool,
    /// Bumped for every accepted stream; only the newest stream's receiver may report loss
    generation: AtomicU64,
    /// Handle used only to shut the socket down, never written to
    current: Mutex<Option<TcpStream>>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
}

pub struct TcpTransport {
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    outbound: Option<Sender<Vec<u8>>>,
    state: Arc<LinkState>,
    events: Receiver<ConnectionEvent>,
    threads: Vec<JoinHandle<()>>,
}

impl TcpTransport {
    /// Listen for the stub on `0.0.0.0:port` (port 0 picks a free port)
    ///
    /// # Errors
    /// Returns [`TransportError::Bind`] if the port cannot be bound.
    pub fn listen(port: u16, dispatcher: Arc<Dispatcher>) -> Result<Self, TransportError> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).map_err(|source| TransportError::Bind { port, source })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("Listening for capture connections on {local_addr}");

        let state = Arc::new(LinkState {
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
            receivers: Mutex::new(Vec::new()),
        });
        let (outbound_tx, outbound_rx) = unbounded::<Vec<u8>>();
        let (writer_tx, writer_rx) = unbounded::<TcpStream>();
        let (events_tx, events_rx) = unbounded::<ConnectionEvent>();

        let sender = {
            let dispatcher = Arc::clone(&dispatcher);
            std::thread::Builder::new()
                .name("hookprof-send".to_string())
                .spawn(move || sender_loop(&outbound_rx, &writer_rx, &dispatcher))?
        };

        let acceptor = {
            let dispatcher = Arc::clone(&dispatcher);
            let state = Arc::clone(&state);
            std::thread::Builder::new()
                .name("hookprof-accept".to_string())
                .spawn(move || acceptor_loop(&listener, &writer_tx, &events_tx, &dispatcher, &state))?
        };

        Ok(Self {
            local_addr,
            dispatcher,
            outbound: Some(outbound_tx),
            state,
            events: events_rx,
            threads: vec![sender, acceptor],
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Connection events since the last poll
    pub fn poll_events(&self) -> Vec<ConnectionEvent> {
        self.events.try_iter().collect()
    }
}

impl Link for TcpTransport {
    fn send(&self, message: Message) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Not sending {:?}: {e}", message.kind);
                self.dispatcher.stats().record_oversized();
                return;
            }
        };
        if let Some(outbound) = &self.outbound {
            self.dispatcher.stats().record_outstanding(outbound.len() + 1);
            if outbound.send(bytes).is_err() {
                self.dispatcher.stats().record_unsent();
            }
        }
    }

    fn has_connection(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    fn outstanding(&self) -> usize {
        self.outbound.as_ref().map_or(0, Sender::len)
    }

    fn disconnect(&self) {
        if let Some(stream) = self.state.current.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.disconnect();
        self.outbound.take();
        for handle in self.threads.drain(..) {
            handle.join().ok();
        }
        for handle in self.state.receivers.lock().drain(..) {
            handle.join().ok();
        }
    }
}

fn acceptor_loop(
    listener: &TcpListener,
    writer_tx: &Sender<TcpStream>,
    events_tx: &Sender<ConnectionEvent>,
    dispatcher: &Arc<Dispatcher>,
    state: &Arc<LinkState>,
) {
    while !state.shutdown.load(Ordering::Acquire) {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(e) => {
                warn!("Accept failed: {e}");
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
        };

        let generation = match attach_stream(&stream, writer_tx, state) {
            Ok(generation) => generation,
            Err(e) => {
                warn!("Dropping connection from {peer}: {e}");
                continue;
            }
        };
        info!("Capture connection from {peer}");
        events_tx.send(ConnectionEvent::Connected(peer)).ok();

        let dispatcher = Arc::clone(dispatcher);
        let receiver_state = Arc::clone(state);
        let events = events_tx.clone();
        let spawned = std::thread::Builder::new()
            .name("hookprof-recv".to_string())
            .spawn(move || receiver_loop(stream, generation, &dispatcher, &receiver_state, &events));
        match spawned {
            Ok(handle) => state.receivers.lock().push(handle),
            Err(e) => warn!("Failed to spawn receiver thread: {e}"),
        }
    }
}

/// Make `stream` the live connection, returning its generation
fn attach_stream(
    stream: &TcpStream,
    writer_tx: &Sender<TcpStream>,
    state: &LinkState,
) -> std::io::Result<u64> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let writer = stream.try_clone()?;
    let control = stream.try_clone()?;
    writer_tx.send(writer).map_err(|_| std::io::Error::from(ErrorKind::BrokenPipe))?;

    let mut current = state.current.lock();
    let generation = state.generation.fetch_add(1, Ordering::AcqRel) + 1;
    if let Some(previous) = current.replace(control) {
        let _ = previous.shutdown(Shutdown::Both);
    }
    state.connected.store(true, Ordering::Release);
    Ok(generation)
}

fn sender_loop(outbound: &Receiver<Vec<u8>>, writers: &Receiver<TcpStream>, dispatcher: &Dispatcher) {
    let mut writer: Option<TcpStream> = None;
    let mut writers_open = true;

    loop {
        let frame = if writers_open {
            select! {
                recv(outbound) -> frame => frame,
                recv(writers) -> stream => {
                    match stream {
                        Ok(stream) => writer = Some(stream),
                        Err(_) => writers_open = false,
                    }
                    continue;
                }
            }
        } else {
            outbound.recv()
        };

        let Ok(bytes) = frame else {
            debug!("Outbound queue closed, sender exiting");
            return;
        };

        // A stream accepted concurrently with this frame may still be queued.
        while let Ok(stream) = writers.try_recv() {
            writer = Some(stream);
        }

        let Some(stream) = writer.as_mut() else {
            dispatcher.stats().record_unsent();
            continue;
        };
        match stream.write_all(&bytes) {
            Ok(()) => dispatcher.stats().record_sent(bytes.len()),
            Err(e) => {
                warn!("Send failed, dropping writer: {e}");
                dispatcher.stats().record_unsent();
                writer = None;
            }
        }
    }
}

fn receiver_loop(
    mut stream: TcpStream,
    generation: u64,
    dispatcher: &Dispatcher,
    state: &LinkState,
    events: &Sender<ConnectionEvent>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Receive failed: {e}");
                break;
            }
        };
        decoder.push(&buffer[..read]);
        while let Some(frame) = decoder.next_frame() {
            match frame {
                Ok(message) => {
                    dispatcher.dispatch(message);
                }
                Err(TransportError::FrameTooLarge { size, max }) => {
                    warn!("Skipping oversized frame ({size} > {max} bytes)");
                    dispatcher.stats().record_oversized();
                }
                Err(e) => {
                    debug!("Skipping frame: {e}");
                    dispatcher.stats().record_dispatch_miss();
                }
            }
        }
    }

    let mut current = state.current.lock();
    if state.generation.load(Ordering::Acquire) != generation {
        debug!("Replaced capture connection closed");
        return;
    }
    info!("Capture connection closed");
    current.take();
    state.connected.store(false, Ordering::Release);
    events.send(ConnectionEvent::Lost).ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookprof_common::MessageType;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_roundtrip_over_loopback() {
        let dispatcher = Arc::new(Dispatcher::default());
        let transport = TcpTransport::listen(0, Arc::clone(&dispatcher)).unwrap();
        let mut stub = TcpStream::connect(("127.0.0.1", transport.port())).unwrap();
        assert!(wait_until(|| transport.has_connection()));

        // stub → profiler
        let frame = Message::new(MessageType::GetData, 0).with_payload(vec![1, 2, 3]);
        stub.write_all(&frame.encode().unwrap()).unwrap();
        let mut received = Vec::new();
        assert!(wait_until(|| {
            received.extend(dispatcher.poll_main_thread());
            !received.is_empty()
        }));
        assert_eq!(received[0].payload, vec![1, 2, 3]);

        // profiler → stub
        transport.send(Message::new(MessageType::StopCapture, 0));
        let mut bytes = vec![0u8; 34];
        stub.read_exact(&mut bytes).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next_frame().unwrap().unwrap().kind, MessageType::StopCapture);
    }

    #[test]
    fn test_peer_close_reports_lost() {
        let dispatcher = Arc::new(Dispatcher::default());
        let transport = TcpTransport::listen(0, dispatcher).unwrap();
        let stub = TcpStream::connect(("127.0.0.1", transport.port())).unwrap();
        assert!(wait_until(|| transport.has_connection()));

        drop(stub);
        assert!(wait_until(|| !transport.has_connection()));
        let events = transport.poll_events();
        assert!(matches!(events.first(), Some(ConnectionEvent::Connected(_))));
        assert_eq!(events.last(), Some(&ConnectionEvent::Lost));
    }

    #[test]
    fn test_reconnect_keeps_link_up() {
        let dispatcher = Arc::new(Dispatcher::default());
        let transport = TcpTransport::listen(0, dispatcher).unwrap();
        for _ in 0..5 {
            let first = TcpStream::connect(("127.0.0.1", transport.port())).unwrap();
            assert!(wait_until(|| transport.has_connection()));
            transport.poll_events();

            let mut second = TcpStream::connect(("127.0.0.1", transport.port())).unwrap();
            // The first stream is shut down once the second one is attached
            let mut byte = [0u8; 1];
            first.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            assert_eq!((&first).read(&mut byte).unwrap(), 0);
            std::thread::sleep(Duration::from_millis(100));

            assert!(transport.has_connection());
            let events = transport.poll_events();
            assert!(!events.contains(&ConnectionEvent::Lost), "{events:?}");

            transport.send(Message::new(MessageType::StartCapture, 3));
            let mut bytes = vec![0u8; 34];
            second.read_exact(&mut bytes).unwrap();

            drop(second);
            drop(first);
            assert!(wait_until(|| !transport.has_connection()));
            assert_eq!(transport.poll_events().last(), Some(&ConnectionEvent::Lost));
        }
    }

    #[test]
    fn test_send_without_peer_is_counted() {
        let dispatcher = Arc::new(Dispatcher::default());
        let transport = TcpTransport::listen(0, Arc::clone(&dispatcher)).unwrap();
        transport.send(Message::new(MessageType::StartCapture, 0));
        assert!(wait_until(|| dispatcher.stats().snapshot().unsent == 1));
    }
}

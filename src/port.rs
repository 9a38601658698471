// src/port.rs
//
// The serial port core: lifecycle controller, receive loop and decode loop.
//
// One open session runs two named background threads. The receive loop pulls
// chunks off the transport and pushes them onto an unbounded FIFO queue; the
// decode loop drains the queue and feeds the frame decoder. Closing is
// cooperative: `close` flips flags that both loops observe, the receive loop
// performs the actual transport close once it exits, and the decode loop
// drains what is still queued, flushes the decoder and reports the Closed
// event last. The transport is therefore closed exactly once, from exactly
// one place, and no decoded data is lost behind the Closed event.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::config::{SerialConfig, DEFAULT_POLL_INTERVAL};
use crate::decoder::{FrameDecoder, RawDecoder};
use crate::error::SerialError;
use crate::event::{EventDispatcher, EventKind, ListenerId, SerialEvent};
use crate::transport::{SerialTransport, Transport};

/// How long the decode loop waits on an empty queue before re-checking the
/// closing flag.
const QUEUE_WAIT: Duration = Duration::from_millis(10);

/// How long `write` waits for the receive loop to service a transmit request.
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Transmit queue depth.
const TRANSMIT_QUEUE_DEPTH: usize = 32;

/// Lifecycle state. `Opening` and `Closing` are transient; the receive loop
/// performs the final `Closing -> Closed` transition when it exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    Closed,
    Opening,
    Listening,
    Closing,
}

struct TransmitRequest {
    data: Vec<u8>,
    result_tx: SyncSender<Result<(), String>>,
}

/// State shared between the controller and both loops. The flags each have a
/// single writer: `closing` and `shutdown` are set by the controller,
/// `listening` is cleared by the receive loop at exit.
struct Shared {
    port_name: String,
    state: Mutex<PortState>,
    /// Request both loops to break out of their iteration.
    closing: AtomicBool,
    /// Request both loops to leave their outer while.
    shutdown: AtomicBool,
    /// True only while the session is in `Listening`.
    listening: AtomicBool,
    /// Set by the receive loop at exit when a listening session ended;
    /// consumed by the decode loop, which dispatches `Closed` after its
    /// final flush.
    closed_event_due: AtomicBool,
    poll_interval_ms: AtomicU64,
    dispatcher: EventDispatcher,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.load(Ordering::Relaxed))
    }

    fn dispatch(&self, event: SerialEvent) {
        self.dispatcher.dispatch(event);
    }

    fn exception(&self, error: SerialError) {
        self.dispatch(SerialEvent::Exception {
            port: self.port_name.clone(),
            error,
        });
    }
}

/// A serial port with threaded receive/decode loops and deferred event
/// delivery.
///
/// Events are queued by the background loops and delivered to listeners when
/// [`update`](SerialPort::update) is called, so callbacks always run on the
/// embedding application's thread of choice.
pub struct SerialPort {
    config: SerialConfig,
    shared: Arc<Shared>,
    decoder: Arc<Mutex<Box<dyn FrameDecoder>>>,
    transmit_tx: Mutex<Option<SyncSender<TransmitRequest>>>,
    receive_handle: Option<JoinHandle<()>>,
    decode_handle: Option<JoinHandle<()>>,
}

impl SerialPort {
    /// Create a closed port with the pass-through decoder.
    pub fn new(config: SerialConfig) -> Self {
        Self::with_decoder(config, Box::new(RawDecoder))
    }

    /// Create a closed port with the given frame decoder.
    pub fn with_decoder(config: SerialConfig, decoder: Box<dyn FrameDecoder>) -> Self {
        let shared = Arc::new(Shared {
            port_name: config.port.clone(),
            state: Mutex::new(PortState::Closed),
            closing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            closed_event_due: AtomicBool::new(false),
            poll_interval_ms: AtomicU64::new(DEFAULT_POLL_INTERVAL.as_millis() as u64),
            dispatcher: EventDispatcher::new(),
        });
        SerialPort {
            config,
            shared,
            decoder: Arc::new(Mutex::new(decoder)),
            transmit_tx: Mutex::new(None),
            receive_handle: None,
            decode_handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.port
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn state(&self) -> PortState {
        *self.shared.state()
    }

    /// True only while the port is listening.
    pub fn is_open(&self) -> bool {
        self.shared.listening.load(Ordering::Relaxed)
    }

    /// Delay between receive-loop read attempts. Takes effect on the next
    /// iteration. There is deliberately no "block indefinitely" value.
    pub fn set_poll_interval(&self, interval: Duration) {
        self.shared
            .poll_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn poll_interval(&self) -> Duration {
        self.shared.poll_interval()
    }

    // ------------------------------------------------------------------
    // Event listener registry
    // ------------------------------------------------------------------

    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        self.shared.dispatcher.add_listener(kind, listener)
    }

    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.shared.dispatcher.remove_listener(kind, id)
    }

    pub fn has_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.shared.dispatcher.has_listener(kind, id)
    }

    /// Deliver queued events to listeners on the calling thread. Call this
    /// periodically (e.g. once per frame) from the consuming thread.
    pub fn update(&self) {
        self.shared.dispatcher.update();
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the configured serial line and start both background loops.
    ///
    /// Fails with [`SerialError::AlreadyOpen`] unless the port is closed, and
    /// with [`SerialError::Open`] if the line cannot be opened (state reverts
    /// to closed). On success the port is listening and an `Opened` event has
    /// been dispatched.
    pub fn open(&mut self) -> Result<(), SerialError> {
        self.begin_opening()?;
        let transport = match SerialTransport::open(&self.config) {
            Ok(t) => t,
            Err(e) => {
                *self.shared.state() = PortState::Closed;
                return Err(e);
            }
        };
        self.start(Box::new(transport))
    }

    /// Open with an injected transport instead of a system serial port.
    pub fn open_with(&mut self, transport: Box<dyn Transport>) -> Result<(), SerialError> {
        self.begin_opening()?;
        self.start(transport)
    }

    fn begin_opening(&mut self) -> Result<(), SerialError> {
        let mut state = self.shared.state();
        if *state != PortState::Closed {
            return Err(SerialError::AlreadyOpen(self.config.port.clone()));
        }
        *state = PortState::Opening;
        drop(state);

        // Reap the previous session's threads; both have exited (or are
        // within one queue wait of exiting) once the state is Closed.
        if let Some(handle) = self.receive_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.decode_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn start(&mut self, transport: Box<dyn Transport>) -> Result<(), SerialError> {
        let name = self.config.port.clone();
        self.shared.closing.store(false, Ordering::Relaxed);
        self.shared.shutdown.store(false, Ordering::Relaxed);
        self.shared.closed_event_due.store(false, Ordering::Relaxed);

        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>();
        let (transmit_tx, transmit_rx) = mpsc::sync_channel::<TransmitRequest>(TRANSMIT_QUEUE_DEPTH);

        let read_buffer = vec![0u8; self.config.read_buffer_capacity];

        let shared = self.shared.clone();
        let receive_handle = thread::Builder::new()
            .name(format!("{name}-receive"))
            .spawn(move || receive_loop(shared, transport, read_buffer, chunk_tx, transmit_rx))
            .map_err(|e| {
                *self.shared.state() = PortState::Closed;
                SerialError::Open {
                    port: name.clone(),
                    source: e,
                }
            })?;

        let shared = self.shared.clone();
        let decoder = self.decoder.clone();
        let decode_handle = match thread::Builder::new()
            .name(format!("{name}-decode"))
            .spawn(move || decode_loop(shared, chunk_rx, decoder))
        {
            Ok(handle) => handle,
            Err(e) => {
                // The receive loop is already running; shut it down the
                // cooperative way. It will drop the transport and finish the
                // Closed transition itself.
                *self.shared.state() = PortState::Closing;
                self.shared.closing.store(true, Ordering::Relaxed);
                self.shared.shutdown.store(true, Ordering::Relaxed);
                self.receive_handle = Some(receive_handle);
                return Err(SerialError::Open {
                    port: name,
                    source: e,
                });
            }
        };

        *self.transmit_tx.lock().unwrap_or_else(|p| p.into_inner()) = Some(transmit_tx);
        self.shared.listening.store(true, Ordering::Relaxed);
        *self.shared.state() = PortState::Listening;
        self.receive_handle = Some(receive_handle);
        self.decode_handle = Some(decode_handle);

        info!("[{}] listening at {} baud", name, self.config.baud_rate);
        self.shared.dispatch(SerialEvent::Opened { port: name });
        Ok(())
    }

    /// Request shutdown. Non-blocking: from `Listening` this sets the closing
    /// flags and returns; the receive loop observes them within one
    /// read-timeout + poll-interval, flips `is_open` off and closes the
    /// transport, then the decode loop drains the remaining queue, flushes
    /// the decoder and dispatches a single `Closed` event. From any other
    /// state this transitions directly to `Closed`.
    pub fn close(&self) {
        let mut state = self.shared.state();
        match *state {
            PortState::Listening => {
                *state = PortState::Closing;
                drop(state);
                self.shared.closing.store(true, Ordering::Relaxed);
                self.shared.shutdown.store(true, Ordering::Relaxed);
                info!("[{}] close requested", self.config.port);
            }
            PortState::Closing => {
                // Shutdown already in flight; the receive loop finishes it.
            }
            PortState::Opening | PortState::Closed => {
                // No live session, so no transport to hand off: close
                // synchronously.
                *state = PortState::Closed;
            }
        }
        *self.transmit_tx.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    // ------------------------------------------------------------------
    // Transmit
    // ------------------------------------------------------------------

    /// Queue bytes for transmission and wait for the receive loop to service
    /// the request. Fails with [`SerialError::NotOpen`] if the port is not
    /// listening.
    pub fn write(&self, data: &[u8]) -> Result<(), SerialError> {
        if !self.is_open() {
            return Err(SerialError::NotOpen);
        }
        let tx = self
            .transmit_tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(SerialError::NotOpen)?;

        let (result_tx, result_rx) = mpsc::sync_channel::<Result<(), String>>(1);
        tx.try_send(TransmitRequest {
            data: data.to_vec(),
            result_tx,
        })
        .map_err(|e| SerialError::Write(format!("failed to queue transmit request: {e}")))?;

        match result_rx.recv_timeout(WRITE_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(SerialError::Write(message)),
            Err(e) => Err(SerialError::Write(format!(
                "timed out waiting for transmit: {e}"
            ))),
        }
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        // Cooperative shutdown only; never blocks, never panics. The loops
        // exit within one read-timeout + poll-interval.
        self.close();
    }
}

// ============================================================================
// Receive loop
// ============================================================================

/// Pull chunks from the transport and push them onto the byte queue, until
/// the closing flag is observed. Owns the transport; dropping it at exit is
/// the one place the line is closed.
fn receive_loop(
    shared: Arc<Shared>,
    mut transport: Box<dyn Transport>,
    mut read_buffer: Vec<u8>,
    chunk_tx: mpsc::Sender<Vec<u8>>,
    transmit_rx: Receiver<TransmitRequest>,
) {
    let name = shared.port_name.clone();
    debug!("[{name}] receive loop started");

    while !shared.shutdown.load(Ordering::Relaxed) {
        if shared.closing.load(Ordering::Relaxed) {
            break;
        }

        // Service queued transmit requests between reads.
        while let Ok(request) = transmit_rx.try_recv() {
            let result = transport
                .write_all(&request.data)
                .and_then(|_| transport.flush())
                .map_err(|e| e.to_string());
            if let Err(ref message) = result {
                warn!("[{name}] transmit failed: {message}");
            }
            let _ = request.result_tx.try_send(result);
        }

        if shared.listening.load(Ordering::Relaxed) {
            match transport.read(&mut read_buffer) {
                Ok(n) if n > 0 => {
                    trace!("[{name}] chunk: {}", hex::encode(&read_buffer[..n]));
                    // Copy exactly n bytes out; the scratch buffer is reused.
                    // The send only fails during teardown, when the decode
                    // loop is already gone.
                    let _ = chunk_tx.send(read_buffer[..n].to_vec());
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    // Expected for serial reads; not an error.
                }
                Err(e) => shared.exception(SerialError::Read(e)),
            }
        }

        let interval = shared.poll_interval();
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    {
        // Flip is_open and the state together, under the state lock, so a
        // caller observing not-open can immediately reopen. The Closed event
        // itself is handed off to the decode loop, which still has chunks to
        // drain and a decoder to flush before the session may be reported
        // ended.
        let mut state = shared.state();
        let was_listening = shared.listening.swap(false, Ordering::Relaxed);
        *state = PortState::Closed;
        if was_listening {
            shared.closed_event_due.store(true, Ordering::Relaxed);
        }
    }
    info!("[{name}] receive loop stopped");

    drop(transport);
}

// ============================================================================
// Decode loop
// ============================================================================

/// Drain the byte queue in FIFO order and feed each chunk to the decoder.
/// Decode failures are reported and never terminate the loop. At stream end
/// the decoder is flushed so a buffered partial frame is delivered (marked
/// incomplete) rather than dropped, and the `Closed` event goes out after it.
fn decode_loop(
    shared: Arc<Shared>,
    chunk_rx: Receiver<Vec<u8>>,
    decoder: Arc<Mutex<Box<dyn FrameDecoder>>>,
) {
    let name = shared.port_name.clone();
    debug!("[{name}] decode loop started");

    while !shared.shutdown.load(Ordering::Relaxed) {
        if shared.closing.load(Ordering::Relaxed) {
            break;
        }

        match chunk_rx.recv_timeout(QUEUE_WAIT) {
            Ok(chunk) => feed_chunk(&shared, &name, &decoder, &chunk),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    // Chunks the receive loop queued before it observed the closing flag are
    // still decoded, in order. recv() reports Disconnected once the receive
    // loop has exited and dropped its sender.
    while let Ok(chunk) = chunk_rx.recv() {
        feed_chunk(&shared, &name, &decoder, &chunk);
    }

    if let Some(packet) = decoder.lock().unwrap_or_else(|p| p.into_inner()).flush() {
        shared.dispatch(SerialEvent::DataReceived {
            port: name.clone(),
            packet,
        });
    }

    // Receiving Disconnected above happens after the receive loop's exit
    // block, so the handoff flag is already settled by the time it is read.
    if shared.closed_event_due.swap(false, Ordering::Relaxed) {
        shared.dispatch(SerialEvent::Closed { port: name.clone() });
    }

    debug!("[{name}] decode loop stopped");
}

fn feed_chunk(
    shared: &Shared,
    name: &str,
    decoder: &Mutex<Box<dyn FrameDecoder>>,
    chunk: &[u8],
) {
    let result = decoder.lock().unwrap_or_else(|p| p.into_inner()).feed(chunk);
    match result {
        Ok(packets) => {
            for packet in packets {
                shared.dispatch(SerialEvent::DataReceived {
                    port: name.to_string(),
                    packet,
                });
            }
        }
        Err(e) => shared.exception(SerialError::Decode(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialConfig;

    #[test]
    fn test_new_port_is_closed() {
        let port = SerialPort::new(SerialConfig::new("COM1", 9600));
        assert_eq!(port.state(), PortState::Closed);
        assert!(!port.is_open());
        assert_eq!(port.poll_interval(), DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_poll_interval_is_mutable_at_any_time() {
        let port = SerialPort::new(SerialConfig::new("COM1", 9600));
        port.set_poll_interval(Duration::from_millis(0));
        assert_eq!(port.poll_interval(), Duration::ZERO);
        port.set_poll_interval(Duration::from_millis(100));
        assert_eq!(port.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_write_on_closed_port_fails() {
        let port = SerialPort::new(SerialConfig::new("COM1", 9600));
        assert!(matches!(port.write(b"data"), Err(SerialError::NotOpen)));
    }
}

//! Client request multiplexer for the world model.
//!
//! One connection carries any number of in-flight queries. Each outbound
//! request is stamped with a ticket from a monotonic counter; a background
//! receive thread demultiplexes the inbound stream back onto per-ticket
//! channels. `Response` (snapshot/range) and `StepResponse` (stream) are the
//! user-facing ends of those channels and release their ticket on drop.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MuxConfig;
use crate::types::{Attribute, Endpoint, Request, Uri, WorldState};
use crate::wire::client as codec;
use crate::wire::{self, FrameReader, FrameWriter, TransportError};

/// Error attached to one request ticket.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("not connected")]
    NotConnected,
    #[error("Connection Closed")]
    ConnectionClosed,
    #[error("World Model Connection object is being destroyed")]
    Destroyed,
    #[error("request timed out")]
    Timeout,
    #[error("next value requested after the stream completed")]
    Exhausted,
}

type SlotMessage = Result<WorldState, RequestError>;

enum SlotKind {
    /// Snapshot/range: responses accumulate here until request_complete.
    Single { partial: WorldState },
    /// Stream: every response is forwarded as it arrives.
    Streaming,
}

struct RequestSlot {
    tx: Sender<SlotMessage>,
    kind: SlotKind,
    error: Option<RequestError>,
}

struct PromiseTable {
    next_ticket: u32,
    slots: HashMap<u32, RequestSlot>,
}

struct RxHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct OutState {
    stream: Option<TcpStream>,
    writer: Option<FrameWriter>,
    rx: Option<RxHandle>,
}

struct MuxInner {
    endpoint: Endpoint,
    config: MuxConfig,
    /// Outbound mutex; outermost of the two locks.
    out: Mutex<OutState>,
    /// Promise mutex: ticket counter and per-ticket slots.
    promises: Mutex<PromiseTable>,
    /// Alias tables are append-only for the lifetime of the connection
    /// object; they survive reconnects.
    known_attributes: Mutex<HashMap<u32, String>>,
    known_origins: Mutex<HashMap<u32, String>>,
    connected: AtomicBool,
}

impl MuxInner {
    fn set_slot_error(&self, ticket: u32, error: RequestError) {
        let mut promises = self.promises.lock().expect("promise table poisoned");
        if let Some(slot) = promises.slots.get_mut(&ticket) {
            slot.error = Some(error.clone());
            let _ = slot.tx.send(Err(error));
        }
    }

    fn slot_error(&self, ticket: u32) -> Option<RequestError> {
        let promises = self.promises.lock().expect("promise table poisoned");
        promises
            .slots
            .get(&ticket)
            .and_then(|slot| slot.error.clone())
    }

    fn mark_finished(&self, ticket: u32) {
        let mut promises = self.promises.lock().expect("promise table poisoned");
        promises.slots.remove(&ticket);
    }
}

/// Connection to the world model from a client. Thread safe; queries may be
/// issued from any thread.
pub struct ClientWorldConnection {
    inner: Arc<MuxInner>,
}

impl ClientWorldConnection {
    /// Connects and starts the receive thread. Construction never fails: if
    /// the world model is unreachable, requests carry a `NotConnected` error
    /// until a reconnect succeeds.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, MuxConfig::default())
    }

    pub fn with_config(endpoint: Endpoint, config: MuxConfig) -> Self {
        let inner = Arc::new(MuxInner {
            endpoint,
            config,
            out: Mutex::new(OutState::default()),
            promises: Mutex::new(PromiseTable {
                next_ticket: 0,
                slots: HashMap::new(),
            }),
            known_attributes: Mutex::new(HashMap::new()),
            known_origins: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
        });

        {
            let mut out = inner.out.lock().expect("outbound state poisoned");
            if let Err(err) = reconnect_locked(&inner, &mut out) {
                warn!(
                    "initial connection to world model {} failed: {err}",
                    inner.endpoint
                );
            }
        }

        Self { inner }
    }

    /// Most recent state of every URI matching the pattern.
    pub fn current_snapshot(&self, uri: Uri, attributes: Vec<String>) -> Response {
        self.snapshot(&Request {
            object_uri: uri,
            attributes,
            start: 0,
            stop: 0,
        })
    }

    /// State of the world model at `request.stop`, built from data starting
    /// at `request.start`.
    pub fn snapshot(&self, request: &Request) -> Response {
        let (ticket, rx) = self.issue(true, |ticket| {
            codec::encode_snapshot_request(request, ticket)
        });
        Response {
            ticket,
            rx,
            mux: Arc::clone(&self.inner),
        }
    }

    /// All changes between `request.start` and `request.stop`.
    pub fn range(&self, request: &Request) -> Response {
        let (ticket, rx) =
            self.issue(true, |ticket| codec::encode_range_request(request, ticket));
        Response {
            ticket,
            rx,
            mux: Arc::clone(&self.inner),
        }
    }

    /// Current state followed by live updates, sent no more often than
    /// `interval` milliseconds.
    pub fn stream(&self, uri: Uri, attributes: Vec<String>, interval: u64) -> StepResponse {
        let request = Request {
            object_uri: uri,
            attributes,
            start: 0,
            stop: interval as i64,
        };
        let (ticket, rx) = self.issue(false, |ticket| {
            codec::encode_stream_request(&request, ticket)
        });
        StepResponse {
            ticket,
            rx,
            mux: Arc::clone(&self.inner),
            complete: false,
        }
    }

    /// Allocates a ticket and slot, then sends the encoded request. Requests
    /// that cannot be sent still return a handle; the failure is recorded as
    /// a sticky error on the ticket.
    fn issue(
        &self,
        single_response: bool,
        encode: impl FnOnce(u32) -> Vec<u8>,
    ) -> (u32, Receiver<SlotMessage>) {
        let (ticket, rx) = {
            let mut promises = self.inner.promises.lock().expect("promise table poisoned");
            let ticket = promises.next_ticket;
            promises.next_ticket += 1;
            let (tx, rx) = crossbeam::channel::unbounded();
            let kind = if single_response {
                SlotKind::Single {
                    partial: WorldState::new(),
                }
            } else {
                SlotKind::Streaming
            };
            promises.slots.insert(
                ticket,
                RequestSlot {
                    tx,
                    kind,
                    error: None,
                },
            );
            (ticket, rx)
        };

        let body = encode(ticket);
        {
            let mut out = self.inner.out.lock().expect("outbound state poisoned");
            if out.writer.is_none() {
                if let Err(err) = reconnect_locked(&self.inner, &mut out) {
                    warn!("world model reconnect failed: {err}");
                    self.inner.set_slot_error(ticket, RequestError::NotConnected);
                    return (ticket, rx);
                }
            }
            if let Some(writer) = out.writer.as_mut() {
                if let Err(err) = writer.write_frame(&body) {
                    warn!("world model request send failed: {err}");
                    out.stream = None;
                    out.writer = None;
                    self.inner.connected.store(false, Ordering::SeqCst);
                    self.inner.set_slot_error(ticket, RequestError::NotConnected);
                }
            }
        }
        (ticket, rx)
    }

    /// Reconnects after losing or closing a connection. In-flight tickets
    /// keep their slots, but the server has forgotten the requests; they
    /// will only finish if reissued.
    pub fn reconnect(&self) -> Result<(), crate::Error> {
        let mut out = self.inner.out.lock().expect("outbound state poisoned");
        reconnect_locked(&self.inner, &mut out)
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Number of tickets with live request slots.
    pub fn pending_requests(&self) -> usize {
        let promises = self.inner.promises.lock().expect("promise table poisoned");
        promises.slots.len()
    }
}

impl Drop for ClientWorldConnection {
    fn drop(&mut self) {
        let rx = {
            let mut out = self.inner.out.lock().expect("outbound state poisoned");
            out.stream = None;
            out.writer = None;
            out.rx.take()
        };
        if let Some(rx) = rx {
            rx.stop.store(true, Ordering::SeqCst);
            let _ = rx.handle.join();
        }

        let mut promises = self.inner.promises.lock().expect("promise table poisoned");
        for slot in promises.slots.values_mut() {
            slot.error = Some(RequestError::Destroyed);
            let _ = slot.tx.send(Err(RequestError::Destroyed));
        }
    }
}

/// Handshake and receive-thread restart. Called with the outbound lock held;
/// the receive thread only ever try-locks `out`, so joining it here cannot
/// deadlock.
fn reconnect_locked(inner: &Arc<MuxInner>, out: &mut OutState) -> Result<(), crate::Error> {
    if let Some(rx) = out.rx.take() {
        rx.stop.store(true, Ordering::SeqCst);
        let _ = rx.handle.join();
    }
    inner.connected.store(false, Ordering::SeqCst);

    if out.stream.is_none() {
        out.stream = Some(wire::connect_timeout(
            &inner.endpoint,
            inner.config.connect_timeout(),
        )?);
    }
    let stream = out.stream.as_mut().expect("stream just set");

    if let Err(err) = wire::handshake(stream, codec::HANDSHAKE) {
        out.stream = None;
        out.writer = None;
        return Err(err.into());
    }

    let writer_stream = stream.try_clone().map_err(TransportError::from)?;
    // A fresh reader also discards any carry-over from the old connection.
    let reader_stream = stream.try_clone().map_err(TransportError::from)?;
    let reader = FrameReader::with_poll_interval(reader_stream, inner.config.poll_interval())?;

    let stop = Arc::new(AtomicBool::new(false));
    let rx_inner = Arc::clone(inner);
    let rx_stop = Arc::clone(&stop);
    let handle = thread::Builder::new()
        .name("grail-wm-client-rx".to_string())
        .spawn(move || run_receiver(rx_inner, reader, rx_stop))
        .map_err(TransportError::from)?;

    out.writer = Some(FrameWriter::new(writer_stream));
    out.rx = Some(RxHandle { stop, handle });
    inner.connected.store(true, Ordering::SeqCst);
    debug!("connected to world model {}", inner.endpoint);
    Ok(())
}

fn run_receiver(inner: Arc<MuxInner>, mut reader: FrameReader, stop: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let body = match reader.read_next(|| stop.load(Ordering::SeqCst)) {
            Ok(Some(body)) => body,
            Ok(None) => continue,
            Err(err) => {
                warn!("world model connection lost: {err}");
                fail_all(&inner, RequestError::ConnectionClosed);
                inner.connected.store(false, Ordering::SeqCst);
                // Best effort: the request path tears the socket down itself
                // on its next send failure if the lane is busy right now.
                if let Ok(mut out) = inner.out.try_lock() {
                    out.stream = None;
                    out.writer = None;
                }
                return;
            }
        };
        let tag = match wire::message_tag(&body) {
            Ok(tag) => tag,
            Err(err) => {
                warn!("ignoring message from world model: {err}");
                continue;
            }
        };

        match tag {
            codec::tag::ATTRIBUTE_ALIAS => match codec::decode_attribute_alias(&body) {
                Ok(entries) => {
                    let mut known = inner
                        .known_attributes
                        .lock()
                        .expect("attribute aliases poisoned");
                    known.extend(entries);
                }
                Err(err) => warn!("bad attribute_alias message: {err}"),
            },
            codec::tag::ORIGIN_ALIAS => match codec::decode_origin_alias(&body) {
                Ok(entries) => {
                    let mut known = inner
                        .known_origins
                        .lock()
                        .expect("origin aliases poisoned");
                    known.extend(entries);
                }
                Err(err) => warn!("bad origin_alias message: {err}"),
            },
            codec::tag::DATA_RESPONSE => handle_data_response(&inner, &body),
            codec::tag::REQUEST_COMPLETE => handle_request_complete(&inner, &body),
            codec::tag::KEEP_ALIVE => {
                // Reply below the server's timeout period. try_lock keeps
                // this thread joinable by a reconnect that holds `out`; a
                // busy outbound lane is itself evidence of liveness.
                if let Ok(mut out) = inner.out.try_lock() {
                    if let Some(writer) = out.writer.as_mut() {
                        let _ = writer.write_frame(&codec::encode_keep_alive());
                    }
                }
            }
            other => debug!("ignoring world model message tag {other}"),
        }
    }
}

fn handle_data_response(inner: &MuxInner, body: &[u8]) {
    let (data, ticket) = match codec::decode_data_response(body) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!("bad data_response message: {err}");
            return;
        }
    };

    // Resolve aliases to names; entries the server never announced resolve
    // to empty strings.
    let attributes: Vec<Attribute> = {
        let names = inner
            .known_attributes
            .lock()
            .expect("attribute aliases poisoned");
        let origins = inner.known_origins.lock().expect("origin aliases poisoned");
        data.attributes
            .iter()
            .map(|attr| Attribute {
                name: names.get(&attr.name_alias).cloned().unwrap_or_default(),
                creation_date: attr.creation_date,
                expiration_date: attr.expiration_date,
                origin: origins.get(&attr.origin_alias).cloned().unwrap_or_default(),
                data: attr.data.clone(),
            })
            .collect()
    };

    let mut promises = inner.promises.lock().expect("promise table poisoned");
    match promises.slots.get_mut(&ticket) {
        Some(slot) => match &mut slot.kind {
            SlotKind::Single { partial } => {
                partial.insert(data.object_uri, attributes);
            }
            SlotKind::Streaming => {
                let mut state = WorldState::new();
                state.insert(data.object_uri, attributes);
                let _ = slot.tx.send(Ok(state));
            }
        },
        None => debug!("data_response for unknown ticket {ticket}"),
    }
}

fn handle_request_complete(inner: &MuxInner, body: &[u8]) {
    let ticket = match codec::decode_request_complete(body) {
        Ok(ticket) => ticket,
        Err(err) => {
            warn!("bad request_complete message: {err}");
            return;
        }
    };

    let mut promises = inner.promises.lock().expect("promise table poisoned");
    match promises.slots.get_mut(&ticket) {
        Some(slot) => match &mut slot.kind {
            SlotKind::Single { partial } => {
                let result = std::mem::take(partial);
                let _ = slot.tx.send(Ok(result));
            }
            SlotKind::Streaming => {
                // Empty state is the end-of-stream marker.
                let _ = slot.tx.send(Ok(WorldState::new()));
            }
        },
        None => debug!("request_complete for unknown ticket {ticket}"),
    }
}

fn fail_all(inner: &MuxInner, error: RequestError) {
    let mut promises = inner.promises.lock().expect("promise table poisoned");
    for slot in promises.slots.values_mut() {
        slot.error = Some(error.clone());
        let _ = slot.tx.send(Err(error.clone()));
    }
}

fn recv_slot(
    rx: &Receiver<SlotMessage>,
    config: &MuxConfig,
) -> Result<WorldState, RequestError> {
    let message = match config.request_timeout() {
        Some(timeout) => rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => RequestError::Timeout,
            RecvTimeoutError::Disconnected => RequestError::Destroyed,
        })?,
        None => rx.recv().map_err(|_| RequestError::Destroyed)?,
    };
    message
}

/// Response to a snapshot or range query: exactly one `WorldState`.
pub struct Response {
    ticket: u32,
    rx: Receiver<SlotMessage>,
    mux: Arc<MuxInner>,
}

impl Response {
    /// Waits for the complete result. Blocks until the server finishes the
    /// request (or the configured request timeout expires).
    pub fn get(self) -> Result<WorldState, RequestError> {
        if let Some(err) = self.get_error() {
            return Err(err);
        }
        recv_slot(&self.rx, &self.mux.config)
    }

    /// True when `get` will not block.
    pub fn ready(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn is_error(&self) -> bool {
        self.get_error().is_some()
    }

    pub fn get_error(&self) -> Option<RequestError> {
        self.mux.slot_error(self.ticket)
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.mux.mark_finished(self.ticket);
    }
}

/// Response to a streaming query: a sequence of `WorldState`s ending with an
/// empty one when the server completes the request.
pub struct StepResponse {
    ticket: u32,
    rx: Receiver<SlotMessage>,
    mux: Arc<MuxInner>,
    complete: bool,
}

impl StepResponse {
    /// Waits for the next update. The final update of a stream is an empty
    /// `WorldState`; calling again after that is an error.
    pub fn next(&mut self) -> Result<WorldState, RequestError> {
        if self.complete {
            return Err(RequestError::Exhausted);
        }
        if let Some(err) = self.get_error() {
            return Err(err);
        }
        let state = recv_slot(&self.rx, &self.mux.config)?;
        if state.is_empty() {
            self.complete = true;
        }
        Ok(state)
    }

    /// True when `next` will not block.
    pub fn has_next(&self) -> bool {
        !self.complete && !self.rx.is_empty()
    }

    /// True once the end-of-stream marker has been observed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_error(&self) -> bool {
        self.get_error().is_some()
    }

    pub fn get_error(&self) -> Option<RequestError> {
        self.mux.slot_error(self.ticket)
    }
}

impl Drop for StepResponse {
    fn drop(&mut self) {
        self.mux.mark_finished(self.ticket);
    }
}

//! Aggregator fan-in: one worker per aggregator endpoint, all samples
//! delivered into a single callback.
//!
//! Workers replay the shared subscription list against a private frontier
//! counter, so a subscription appended while several workers race for the
//! wake hint is still sent by every worker. Handshake mismatch is fatal for
//! the worker (wrong endpoint); transport faults reconnect after a delay.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::AggregatorConfig;
use crate::types::{Endpoint, Sample, Subscription};
use crate::wire::aggregator as codec;
use crate::wire::{self, FrameReader, FrameWriter, HandshakeError, TransportError};

const INTERRUPT_NONE: u8 = 0;
const INTERRUPT_ADD_SUBSCRIPTIONS: u8 = 1;
const INTERRUPT_CLOSE_CONNECTION: u8 = 2;

/// Shared worker interrupt. `CloseConnection` is terminal and wins every
/// race: the add hint is only ever cleared back to `None`, never the close.
struct Interrupt(AtomicU8);

impl Interrupt {
    fn new() -> Self {
        Self(AtomicU8::new(INTERRUPT_NONE))
    }

    fn reset(&self) {
        self.0.store(INTERRUPT_NONE, Ordering::SeqCst);
    }

    fn request_add(&self) {
        let _ = self.0.compare_exchange(
            INTERRUPT_NONE,
            INTERRUPT_ADD_SUBSCRIPTIONS,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn request_close(&self) {
        self.0.store(INTERRUPT_CLOSE_CONNECTION, Ordering::SeqCst);
    }

    fn clear_add(&self) {
        let _ = self.0.compare_exchange(
            INTERRUPT_ADD_SUBSCRIPTIONS,
            INTERRUPT_NONE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn raised(&self) -> bool {
        self.0.load(Ordering::SeqCst) != INTERRUPT_NONE
    }

    fn cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == INTERRUPT_CLOSE_CONNECTION
    }
}

type SampleCallback = Box<dyn FnMut(Sample) + Send>;

/// Maintains connections to any number of aggregators. All methods return
/// promptly; the callback runs on worker threads under a mutex, so it does
/// not need to be thread safe itself.
pub struct SolverAggregator {
    servers: Vec<Endpoint>,
    callback: Arc<Mutex<SampleCallback>>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    interrupt: Arc<Interrupt>,
    workers: Vec<JoinHandle<()>>,
    config: AggregatorConfig,
}

impl SolverAggregator {
    /// Connections are not opened until the first `add_rules` call.
    pub fn new(servers: Vec<Endpoint>, callback: impl FnMut(Sample) + Send + 'static) -> Self {
        Self::with_config(servers, callback, AggregatorConfig::default())
    }

    pub fn with_config(
        servers: Vec<Endpoint>,
        callback: impl FnMut(Sample) + Send + 'static,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            servers,
            callback: Arc::new(Mutex::new(Box::new(callback))),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            interrupt: Arc::new(Interrupt::new()),
            workers: Vec::new(),
            config,
        }
    }

    /// Appends a subscription. Spawns the workers on first use; running
    /// workers pick the new entry up from their own frontier.
    pub fn add_rules(&mut self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .expect("subscription list poisoned")
            .push(subscription);

        if self.workers.is_empty() {
            self.interrupt.reset();
            self.spawn_workers();
        } else {
            self.interrupt.request_add();
        }
    }

    /// Replaces the subscription list with `[subscription]`, then drops all
    /// connections and reconnects with the fresh list.
    pub fn update_rules(&mut self, subscription: Subscription) {
        *self
            .subscriptions
            .lock()
            .expect("subscription list poisoned") = vec![subscription];

        self.disconnect();
        self.interrupt.reset();
        self.spawn_workers();
    }

    /// Disconnects from all aggregators and joins the workers.
    pub fn disconnect(&mut self) {
        self.interrupt.request_close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn spawn_workers(&mut self) {
        for endpoint in &self.servers {
            let ctx = WorkerContext {
                endpoint: endpoint.clone(),
                subscriptions: Arc::clone(&self.subscriptions),
                callback: Arc::clone(&self.callback),
                interrupt: Arc::clone(&self.interrupt),
                config: self.config.clone(),
            };
            let name = format!("grail-agg-{endpoint}");
            match thread::Builder::new().name(name).spawn(move || run_worker(ctx)) {
                Ok(handle) => self.workers.push(handle),
                Err(err) => warn!("failed to spawn aggregator worker for {endpoint}: {err}"),
            }
        }
    }
}

impl Drop for SolverAggregator {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct WorkerContext {
    endpoint: Endpoint,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    callback: Arc<Mutex<SampleCallback>>,
    interrupt: Arc<Interrupt>,
    config: AggregatorConfig,
}

enum SessionFault {
    /// Handshake mismatch: the endpoint is not an aggregator. The worker
    /// exits instead of retrying.
    Fatal,
    Transport(TransportError),
}

impl From<TransportError> for SessionFault {
    fn from(err: TransportError) -> Self {
        SessionFault::Transport(err)
    }
}

fn run_worker(ctx: WorkerContext) {
    debug!("starting aggregator worker for {}", ctx.endpoint);
    while !ctx.interrupt.cancelled() {
        match wire::connect(&ctx.endpoint) {
            Ok(stream) => match run_session(stream, &ctx) {
                Ok(()) => break,
                Err(SessionFault::Fatal) => {
                    error!(
                        "handshake mismatch with aggregator {}; giving up on this endpoint",
                        ctx.endpoint
                    );
                    return;
                }
                Err(SessionFault::Transport(err)) => {
                    warn!("aggregator connection to {} failed: {err}", ctx.endpoint);
                }
            },
            Err(err) => {
                warn!("failed to connect to aggregator {}: {err}", ctx.endpoint);
            }
        }

        if sleep_interrupted(ctx.config.reconnect_delay(), &ctx.interrupt) {
            break;
        }
    }
    debug!("leaving aggregator worker for {}", ctx.endpoint);
}

/// Runs one connected session. Returns `Ok(())` only on a close interrupt.
fn run_session(mut stream: std::net::TcpStream, ctx: &WorkerContext) -> Result<(), SessionFault> {
    match wire::handshake(&mut stream, codec::HANDSHAKE) {
        Ok(()) => debug!("connected to aggregator {}", ctx.endpoint),
        Err(HandshakeError::Mismatch) => return Err(SessionFault::Fatal),
        Err(HandshakeError::Transport(err)) => return Err(err.into()),
    }

    let reader_stream = stream.try_clone().map_err(TransportError::from)?;
    let mut reader =
        FrameReader::with_poll_interval(reader_stream, ctx.config.poll_interval())?;
    let mut writer = FrameWriter::new(stream);

    // Each session replays from the start of the list; the frontier tracks
    // what this connection has already sent.
    let mut sent_count = 0usize;
    send_from_frontier(&mut writer, ctx, &mut sent_count)?;

    loop {
        if ctx.interrupt.cancelled() {
            return Ok(());
        }

        if let Some(body) = reader.read_next(|| ctx.interrupt.raised())? {
            handle_frame(&body, ctx);
        }

        // Clear the wake hint before reading the list so an append racing
        // with the clear re-raises it for the next pass.
        ctx.interrupt.clear_add();
        send_from_frontier(&mut writer, ctx, &mut sent_count)?;
    }
}

fn send_from_frontier(
    writer: &mut FrameWriter,
    ctx: &WorkerContext,
    sent_count: &mut usize,
) -> Result<(), SessionFault> {
    loop {
        let next = {
            let subs = ctx
                .subscriptions
                .lock()
                .expect("subscription list poisoned");
            match subs.get(*sent_count) {
                Some(sub) => sub.clone(),
                None => return Ok(()),
            }
        };
        writer.write_frame(&codec::encode_subscription_request(&next))?;
        *sent_count += 1;
        debug!(
            "sent subscription {} to aggregator {}",
            *sent_count, ctx.endpoint
        );
    }
}

fn handle_frame(body: &[u8], ctx: &WorkerContext) {
    let tag = match wire::message_tag(body) {
        Ok(tag) => tag,
        Err(err) => {
            warn!("ignoring message from {}: {err}", ctx.endpoint);
            return;
        }
    };
    match tag {
        codec::tag::SUBSCRIPTION_RESPONSE => match codec::decode_subscription_response(body) {
            // The server may have narrowed the accepted rules; the local
            // list is not reconciled with the response.
            Ok(sub) => debug!(
                rules = sub.rules.len(),
                "subscription response from {}", ctx.endpoint
            ),
            Err(err) => warn!("bad subscription response from {}: {err}", ctx.endpoint),
        },
        codec::tag::SERVER_SAMPLE => match codec::decode_sample(body) {
            Ok(sample) if sample.valid => {
                let mut callback = ctx.callback.lock().expect("sample callback poisoned");
                (callback)(sample);
            }
            Ok(_) => {}
            Err(err) => warn!("bad sample from {}: {err}", ctx.endpoint),
        },
        codec::tag::KEEP_ALIVE => {}
        other => debug!("ignoring message tag {other} from {}", ctx.endpoint),
    }
}

/// Sleeps in short slices so a close interrupt cuts the wait short.
/// Returns true when interrupted by a close.
fn sleep_interrupted(total: Duration, interrupt: &Interrupt) -> bool {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() {
        if interrupt.cancelled() {
            return true;
        }
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining -= step;
    }
    interrupt.cancelled()
}

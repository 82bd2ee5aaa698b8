//! Solver uplink: publishes typed attribute updates to the world model.
//!
//! One connection, one background tracker thread for the world model's
//! on-demand gating protocol, and a send path that retries until the write
//! lands (callers rely on uplink writes never being dropped). Handshake
//! mismatch here is treated as transient and retried, unlike the aggregator
//! workers; a mismatched world-model handshake during reconnect usually
//! clears on its own.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use regex::Regex;
use tracing::{debug, warn};

use crate::config::UplinkConfig;
use crate::types::{AttrUpdate, Endpoint, GrailTime};
use crate::wire::solver as codec;
use crate::wire::solver::{AliasType, OnDemandRequest, SolutionData};
use crate::wire::{self, FrameReader, FrameWriter, TransportError};

/// One on-demand gate pattern. Patterns that fail to compile keep
/// `regex: None` so they match nothing but still count for the symmetric
/// stop-on-demand removal.
struct OnDemandGate {
    pattern: String,
    regex: Option<Regex>,
}

/// Registered types plus the on-demand gate table. An alias is on-demand
/// iff it has an entry in `gates`, even an empty one; an empty gate set
/// suppresses every update for that alias.
#[derive(Default)]
struct TypeRegistry {
    types: Vec<AliasType>,
    aliases: HashMap<String, u32>,
    gates: HashMap<u32, Vec<OnDemandGate>>,
}

impl TypeRegistry {
    /// Aliases are sequential starting at 1, in registration order; alias 0
    /// is never issued. Returns the newly added entries.
    fn register(&mut self, new_types: Vec<(String, bool)>) -> Vec<AliasType> {
        let mut added = Vec::with_capacity(new_types.len());
        for (name, on_demand) in new_types {
            let alias = self.types.len() as u32 + 1;
            let entry = AliasType {
                alias,
                name: name.clone(),
                on_demand,
            };
            self.types.push(entry.clone());
            self.aliases.insert(name, alias);
            if on_demand {
                self.gates.entry(alias).or_default();
            }
            added.push(entry);
        }
        added
    }

    fn apply_start(&mut self, requests: Vec<OnDemandRequest>) {
        for (alias, patterns) in requests {
            debug!(alias, requests = patterns.len(), "on-demand enabled");
            for pattern in patterns {
                let regex = match Regex::new(&pattern) {
                    Ok(re) => Some(re),
                    Err(err) => {
                        warn!("cannot compile on-demand pattern {pattern:?}: {err}");
                        None
                    }
                };
                self.gates
                    .entry(alias)
                    .or_default()
                    .push(OnDemandGate { pattern, regex });
            }
        }
    }

    /// Removes exactly one gate per stop pattern, matching the server's
    /// balanced start/stop accounting. The (possibly empty) gate entry stays
    /// so the alias remains marked on-demand.
    fn apply_stop(&mut self, requests: Vec<OnDemandRequest>) {
        for (alias, patterns) in requests {
            debug!(alias, requests = patterns.len(), "on-demand disabled");
            let Some(gates) = self.gates.get_mut(&alias) else {
                continue;
            };
            for pattern in patterns {
                if let Some(pos) = gates.iter().position(|g| g.pattern == pattern) {
                    gates.remove(pos);
                }
            }
        }
    }

    /// Applies the alias lookup and on-demand gate to a batch of updates.
    /// Updates with unregistered type names are skipped.
    fn gate_updates(&self, updates: &[AttrUpdate]) -> Vec<SolutionData> {
        updates
            .iter()
            .filter_map(|update| {
                let alias = *self.aliases.get(&update.type_name)?;
                let permitted = match self.gates.get(&alias) {
                    None => true,
                    Some(gates) => gates.iter().any(|gate| {
                        gate.regex
                            .as_ref()
                            .is_some_and(|re| full_match(re, &update.target))
                    }),
                };
                permitted.then(|| SolutionData {
                    alias,
                    time: update.time,
                    target: update.target.clone(),
                    data: update.data.clone(),
                })
            })
            .collect()
    }

    #[cfg(test)]
    fn gate_count(&self, alias: u32) -> usize {
        self.gates.get(&alias).map_or(0, Vec::len)
    }
}

/// Anchored match: the pattern must cover the whole target URI.
fn full_match(re: &Regex, target: &str) -> bool {
    re.find(target)
        .is_some_and(|m| m.start() == 0 && m.end() == target.len())
}

struct TrackerHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct LinkState {
    stream: Option<TcpStream>,
    writer: Option<FrameWriter>,
    tracker: Option<TrackerHandle>,
}

struct UplinkInner {
    endpoint: Endpoint,
    origin: String,
    config: UplinkConfig,
    /// The send mutex: every outbound write serialises here.
    link: Mutex<LinkState>,
    /// The transaction mutex: type and gate tables. Only ever nested inside
    /// `link` (reconnect snapshots the types); never the other way around.
    registry: Mutex<TypeRegistry>,
    connected: AtomicBool,
}

/// Connection from a solver to the world model.
pub struct SolverWorldModel {
    inner: Arc<UplinkInner>,
}

impl SolverWorldModel {
    /// Registers `types` (name, on-demand flag), then attempts the first
    /// connection. Construction never fails: a dead world model only delays
    /// the first send, which retries until it lands.
    pub fn new(endpoint: Endpoint, types: Vec<(String, bool)>, origin: impl Into<String>) -> Self {
        Self::with_config(endpoint, types, origin, UplinkConfig::default())
    }

    pub fn with_config(
        endpoint: Endpoint,
        types: Vec<(String, bool)>,
        origin: impl Into<String>,
        config: UplinkConfig,
    ) -> Self {
        let mut registry = TypeRegistry::default();
        registry.register(types);

        let inner = Arc::new(UplinkInner {
            endpoint,
            origin: origin.into(),
            config,
            link: Mutex::new(LinkState::default()),
            registry: Mutex::new(registry),
            connected: AtomicBool::new(false),
        });

        {
            let mut link = inner.link.lock().expect("uplink state poisoned");
            if let Err(err) = reconnect_locked(&inner, &mut link) {
                warn!(
                    "initial connection to world model {} failed: {err}",
                    inner.endpoint
                );
            }
        }

        Self { inner }
    }

    /// Registers additional types and announces only the new entries.
    pub fn add_types(&self, new_types: Vec<(String, bool)>) -> Result<(), TransportError> {
        let announce = {
            let mut registry = self.inner.registry.lock().expect("type registry poisoned");
            let added = registry.register(new_types);
            codec::encode_type_announce(&added, &self.inner.origin)
        };
        send_with_retry(&self.inner, &announce, None)
    }

    /// Sends a batch of attribute updates. Updates for on-demand types are
    /// dropped unless a gate pattern fully matches their target URI; the
    /// frame is sent even when everything was filtered out, which doubles as
    /// an application-level keep-alive.
    pub fn send_data(
        &self,
        updates: &[AttrUpdate],
        create_uris: bool,
    ) -> Result<(), TransportError> {
        let solutions = {
            let registry = self.inner.registry.lock().expect("type registry poisoned");
            registry.gate_updates(updates)
        };
        send_with_retry(
            &self.inner,
            &codec::encode_solver_data(create_uris, &solutions),
            None,
        )
    }

    pub fn create_uri(&self, uri: &str, created: GrailTime) -> Result<(), TransportError> {
        send_with_retry(
            &self.inner,
            &codec::encode_create_uri(uri, created, &self.inner.origin),
            None,
        )
    }

    pub fn expire_uri(&self, uri: &str, expires: GrailTime) -> Result<(), TransportError> {
        send_with_retry(
            &self.inner,
            &codec::encode_expire_uri(uri, expires, &self.inner.origin),
            None,
        )
    }

    pub fn delete_uri(&self, uri: &str) -> Result<(), TransportError> {
        send_with_retry(
            &self.inner,
            &codec::encode_delete_uri(uri, &self.inner.origin),
            None,
        )
    }

    pub fn expire_attribute(
        &self,
        uri: &str,
        name: &str,
        expires: GrailTime,
    ) -> Result<(), TransportError> {
        send_with_retry(
            &self.inner,
            &codec::encode_expire_attribute(uri, name, &self.inner.origin, expires),
            None,
        )
    }

    pub fn delete_attribute(&self, uri: &str, name: &str) -> Result<(), TransportError> {
        send_with_retry(
            &self.inner,
            &codec::encode_delete_attribute(uri, name, &self.inner.origin),
            None,
        )
    }

    /// Cached connection flag: true once a handshake completed, false from
    /// the start of a reconnect until it succeeds again.
    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SolverWorldModel {
    fn drop(&mut self) {
        let tracker = {
            let mut link = self.inner.link.lock().expect("uplink state poisoned");
            link.tracker.take()
        };
        if let Some(tracker) = tracker {
            tracker.stop.store(true, Ordering::SeqCst);
            let _ = tracker.handle.join();
        }
    }
}

/// Handshake, type announcement, and tracker restart. Called with the link
/// lock held. The previous tracker is signalled and detached, never joined:
/// joining from here could wait on a thread that is itself waiting for the
/// link lock, and the tracker triggers reconnects for keep-alive replies,
/// so it could even be the current thread.
fn reconnect_locked(inner: &Arc<UplinkInner>, link: &mut LinkState) -> Result<(), crate::Error> {
    inner.connected.store(false, Ordering::SeqCst);

    if link.stream.is_none() {
        link.stream = Some(wire::connect(&inner.endpoint)?);
    }
    let stream = link.stream.as_mut().expect("stream just set");

    if let Err(err) = wire::handshake(stream, codec::HANDSHAKE) {
        link.stream = None;
        link.writer = None;
        return Err(err.into());
    }

    let mut writer = match stream.try_clone() {
        Ok(clone) => FrameWriter::new(clone),
        Err(err) => {
            link.stream = None;
            link.writer = None;
            return Err(TransportError::from(err).into());
        }
    };

    let types = {
        let registry = inner.registry.lock().expect("type registry poisoned");
        registry.types.clone()
    };
    if let Err(err) = writer.write_frame(&codec::encode_type_announce(&types, &inner.origin)) {
        link.stream = None;
        link.writer = None;
        return Err(err.into());
    }

    if let Some(old) = link.tracker.take() {
        old.stop.store(true, Ordering::SeqCst);
    }

    // A fresh reader clone also discards any carry-over from the old
    // connection.
    let reader = match stream.try_clone() {
        Ok(clone) => FrameReader::with_poll_interval(clone, inner.config.poll_interval())?,
        Err(err) => {
            link.stream = None;
            link.writer = None;
            return Err(TransportError::from(err).into());
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let tracker_inner = Arc::clone(inner);
    let tracker_stop = Arc::clone(&stop);
    let handle = thread::Builder::new()
        .name("grail-wm-solver-tracker".to_string())
        .spawn(move || run_tracker(tracker_inner, reader, tracker_stop))
        .map_err(TransportError::from)?;

    link.writer = Some(writer);
    link.tracker = Some(TrackerHandle { stop, handle });
    inner.connected.store(true, Ordering::SeqCst);
    debug!("connected to world model {}", inner.endpoint);
    Ok(())
}

/// The only write path after construction: tries to send, and on failure
/// sleeps (1 s first, 8 s thereafter), reconnects, and tries again until the
/// write lands or the optional retry budget runs out. `cancel` lets the
/// tracker abandon a retry loop when it is being stopped.
fn send_with_retry(
    inner: &Arc<UplinkInner>,
    body: &[u8],
    cancel: Option<&AtomicBool>,
) -> Result<(), TransportError> {
    let mut first_wait = true;
    let mut attempts = 0u32;

    loop {
        {
            let mut link = inner.link.lock().expect("uplink state poisoned");
            if link.writer.is_none() {
                if let Err(err) = reconnect_locked(inner, &mut link) {
                    warn!("world model reconnect failed: {err}");
                }
            }
            if let Some(writer) = link.writer.as_mut() {
                match writer.write_frame(body) {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        warn!("world model send failed: {err}");
                        link.stream = None;
                        link.writer = None;
                        inner.connected.store(false, Ordering::SeqCst);
                    }
                }
            }
        }

        if let Some(max) = inner.config.max_retries {
            if attempts >= max {
                return Err(TransportError::Closed);
            }
        }
        if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(TransportError::Closed);
        }

        attempts += 1;
        let delay = if first_wait {
            inner.config.initial_retry_delay()
        } else {
            inner.config.retry_delay()
        };
        first_wait = false;

        // Sleep in slices so a stopped tracker abandons the loop quickly.
        let slice = std::time::Duration::from_millis(50);
        let mut remaining = delay;
        while !remaining.is_zero() {
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                return Err(TransportError::Closed);
            }
            let step = remaining.min(slice);
            thread::sleep(step);
            remaining -= step;
        }
    }
}

/// Background tracker: consumes start/stop on-demand messages and answers
/// keep-alives. Exits on transport error; the next retried send reconnects
/// and starts a fresh tracker.
fn run_tracker(inner: Arc<UplinkInner>, mut reader: FrameReader, stop: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let body = match reader.read_next(|| stop.load(Ordering::SeqCst)) {
            Ok(Some(body)) => body,
            Ok(None) => continue,
            Err(err) => {
                warn!("world model connection lost: {err}");
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
            codec::tag::START_ON_DEMAND => match codec::decode_start_on_demand(&body) {
                Ok(requests) => {
                    let mut registry =
                        inner.registry.lock().expect("type registry poisoned");
                    registry.apply_start(requests);
                }
                Err(err) => warn!("bad start_on_demand message: {err}"),
            },
            codec::tag::STOP_ON_DEMAND => match codec::decode_stop_on_demand(&body) {
                Ok(requests) => {
                    let mut registry =
                        inner.registry.lock().expect("type registry poisoned");
                    registry.apply_stop(requests);
                }
                Err(err) => warn!("bad stop_on_demand message: {err}"),
            },
            codec::tag::KEEP_ALIVE => {
                // Reply below the server's timeout period. On failure the
                // retry loop observes our stop flag, set when a reconnect
                // replaced this tracker.
                if send_with_retry(&inner, &codec::encode_keep_alive(), Some(&stop)).is_err() {
                    return;
                }
            }
            other => debug!("ignoring world model message tag {other}"),
        }
    }
}

#![forbid(unsafe_code)]

//! Client-side connection cores for a GRAIL-style real-time location system.
//!
//! Three independent cores share a framed-TCP layer:
//!
//! - [`SolverAggregator`] fans samples from any number of aggregator servers
//!   into one callback, replaying subscriptions across reconnects.
//! - [`SolverWorldModel`] publishes typed attribute updates to the world
//!   model, honouring its on-demand gating protocol and retrying sends until
//!   they land.
//! - [`ClientWorldConnection`] multiplexes snapshot, range, and streaming
//!   queries over one socket, routing ticketed responses back to independent
//!   [`Response`]/[`StepResponse`] handles.

pub mod aggregator;
pub mod client;
pub mod config;
pub mod error;
pub mod solver;
pub mod telemetry;
pub mod types;
pub mod wire;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the primary surface at the crate root for convenience
pub use crate::aggregator::SolverAggregator;
pub use crate::client::{ClientWorldConnection, RequestError, Response, StepResponse};
pub use crate::config::{AggregatorConfig, MuxConfig, UplinkConfig};
pub use crate::solver::SolverWorldModel;
pub use crate::types::{
    Attribute, AttrUpdate, Endpoint, GrailTime, Request, Sample, Subscription, SubscriptionRule,
    Transmitter, Uri, WorldState,
};
pub use crate::wire::{HandshakeError, TransportError, WireError};

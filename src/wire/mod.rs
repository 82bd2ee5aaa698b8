//! Wire protocol: framing, handshake, and the three message codecs.

pub mod aggregator;
pub mod buffer;
pub mod client;
pub mod frame;
pub mod solver;

pub use buffer::{message_tag, WireError, WireReader, WireWriter};
pub use frame::{
    connect, connect_timeout, handshake, FrameReader, FrameWriter, HandshakeError,
    TransportError, DEFAULT_POLL_INTERVAL, MAX_FRAME_BYTES,
};

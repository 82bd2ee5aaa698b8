use thiserror::Error;

use crate::client::RequestError;
use crate::wire::{HandshakeError, TransportError, WireError};

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the capability errors owned
/// by the transport, codec, and request-mux modules.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

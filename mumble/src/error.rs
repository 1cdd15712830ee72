//! Top-level error taxonomy: network/protocol/crypto/resource/decode, per
//! the error handling design. Each surfaces either as a `connect` failure
//! or as the argument to a hook, never as a panic.

use thiserror::Error;

use crate::connect::ConnectError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(#[from] ConnectError),
    #[error("server rejected connection: {0}")]
    Rejected(String),
    #[error("connection closed before handshake completed")]
    HandshakeClosed,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum MessageError {
    #[error("message length {0} exceeds server limit of {1}")]
    MessageTooLong(usize, usize),
}

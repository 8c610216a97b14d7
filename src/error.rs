//! Error taxonomy shared by the protocol engine.

use thiserror::Error;

/// Errors surfaced by key decoding, signing and relay operations.
///
/// Relay failures are normally contained by the client and fed to the
/// backoff tracker; they only escape from single-relay helpers.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed key or identity string.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Event id or signature does not check out.
    #[error("invalid signature: {0}")]
    SignatureInvalid(String),

    /// A client-signed event does not match the draft it claims to sign.
    #[error("event does not match submitted content")]
    EventMismatch,

    /// Browser-delegated sessions cannot sign on the server.
    #[error("browser signer must sign in the client")]
    SigningMustHappenClientSide,

    /// Remote bunker could not be reached or did not answer in time.
    #[error("remote signer unavailable: {0}")]
    RemoteSignerUnavailable(String),

    /// Remote bunker answered with an error or an unusable event.
    #[error("remote signer error: {0}")]
    RemoteSignerError(String),

    /// The session does not hold credentials for any signer.
    #[error("unsupported session for signing: {0}")]
    UnsupportedSessionForSigning(String),

    /// Network or protocol failure against one relay.
    #[error("relay {relay}: {reason}")]
    RelayConnection { relay: String, reason: String },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn relay(relay: &str, reason: impl std::fmt::Display) -> Self {
        Error::RelayConnection {
            relay: relay.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

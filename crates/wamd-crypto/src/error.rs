use libsignal_protocol::SignalProtocolError;
use thiserror::Error;
use wamd_protocol::AddressError;

/// Failures surfaced by the session repository and pre-key manager.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("decryption failed for {peer}: {source}")]
    DecryptionFailure {
        peer: String,
        #[source]
        source: SignalProtocolError,
    },

    #[error("no sender key for {author} in {group}")]
    MissingSenderKey { group: String, author: String },

    #[error("signal protocol error: {0}")]
    Protocol(#[from] SignalProtocolError),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("key bundle for {identifier} rejected: {code} {text}")]
    KeyBundleRejected {
        identifier: String,
        code: u16,
        text: String,
    },

    #[error("key store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures of a key store backend.
///
/// Record reads never fail: a record that cannot be read is treated as
/// absent. Standalone value files such as `creds.json` are strict.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary encoding error: {0}")]
    Binary(#[from] postcard::Error),

    #[error("sealing failed: {0}")]
    Sealing(#[from] anyhow::Error),

    #[error("{path} exists and is not a directory")]
    NotADirectory { path: String },

    #[error("{file} exists but cannot be read: {reason}")]
    UnreadableValue { file: String, reason: String },

    #[error("no store folder configured")]
    NoFolder,
}

pub type Result<T, E = SignalError> = std::result::Result<T, E>;

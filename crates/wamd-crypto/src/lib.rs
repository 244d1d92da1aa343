//! Session and key management for the multi-device messaging protocol.
//!
//! This crate provides:
//! - The persisted key store (in-memory and one-file-per-record backends)
//! - Authentication credentials and their persistence
//! - Signal Protocol store adapters over the key store
//! - Pairwise sessions (X3DH + Double Ratchet) and group Sender Keys
//! - The one-time pre-key pool and signed pre-key rotation
//! - Device-list extraction and bulk session injection

pub mod auth;
pub mod config;
pub mod creds;
pub mod device;
pub mod error;
pub mod file_store;
pub mod group;
pub mod identity;
pub mod keystore;
mod locks;
pub mod persistence;
pub mod prekey;
pub mod session;
pub mod stores;

// Re-export key types for convenience
pub use auth::{
    use_multi_file_auth_state, use_multi_file_auth_state_from, MultiFileAuthState, SignalAuthState,
};
pub use config::{SignalConfig, StoreConfig, TrustPolicy};
pub use creds::{create_signal_identity, init_auth_creds, AuthenticationCreds, CredsUpdate};
pub use device::{extract_addresses, inject_e2e_sessions};
pub use error::{Result, SignalError, StoreError};
pub use file_store::FileKeyStore;
pub use group::GroupEncrypted;
pub use identity::{KeyPairData, SignedKeyPair};
pub use keystore::{Category, KeyRecord, KeyStore, KeyUpdates, MemoryKeyStore};
pub use prekey::{
    fetch_range, generate_or_reserve, next_pre_keys, next_pre_keys_upload,
    pre_keys_to_upload, rotate_signed_pre_key, INITIAL_PRE_KEY_COUNT, MIN_PRE_KEY_COUNT,
};
pub use session::{EncryptedMessage, MessageKind, SignalRepository};

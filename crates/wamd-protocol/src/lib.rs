//! Shared data types for the multi-device session layer.
//!
//! This crate provides:
//! - The address resolver for phone-number (`@s.whatsapp.net`) and
//!   anonymized (`@lid`) identifiers
//! - Directory query results and device lists
//! - Key bundles returned by key queries and the pre-key upload payload

pub mod address;
pub mod error;
pub mod serde_b64;
pub mod types;

pub use address::{domain_for, format, parse, Address, Namespace, LID_DOMAIN, S_WHATSAPP_NET};
pub use error::AddressError;
pub use types::{
    DeviceList, DeviceListEntry, DirectoryResult, E2ESession, KeyBundleError, PreKeyData,
    PreKeyUpload, SignedPreKeyData, UploadPreKey, UploadSignedPreKey, UserKeyBundle,
    KEY_BUNDLE_TYPE,
};

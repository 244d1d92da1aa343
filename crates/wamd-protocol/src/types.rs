use serde::{Deserialize, Serialize};

use crate::address::domain_for;

/// Key bundle type advertised in pre-key uploads (Curve25519).
pub const KEY_BUNDLE_TYPE: u8 = 5;

// ── Directory sync ─────────────────────────────────────────────────────

/// One device of a user, as reported by a directory query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListEntry {
    pub id: u32,
    /// Present for provisioned companion devices.
    #[serde(default)]
    pub key_index: Option<u32>,
}

impl DeviceListEntry {
    pub fn primary() -> Self {
        Self {
            id: 0,
            key_index: None,
        }
    }

    pub fn companion(id: u32, key_index: Option<u32>) -> Self {
        Self { id, key_index }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    #[serde(default)]
    pub device_list: Vec<DeviceListEntry>,
}

/// A resolved user from a directory query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryResult {
    /// Identifier of the user, in either namespace.
    pub id: String,
    #[serde(default)]
    pub devices: Option<DeviceList>,
}

impl DirectoryResult {
    pub fn new(id: impl Into<String>, devices: Vec<DeviceListEntry>) -> Self {
        Self {
            id: id.into(),
            devices: Some(DeviceList {
                device_list: devices,
            }),
        }
    }
}

// ── Key bundles ────────────────────────────────────────────────────────

/// A one-time pre-key's public portion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyData {
    pub key_id: u32,
    /// 32-byte Curve25519 public key (a 33-byte typed key is accepted too).
    #[serde(with = "crate::serde_b64")]
    pub public_key: Vec<u8>,
}

/// A signed pre-key's public portion plus the identity key's signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyData {
    pub key_id: u32,
    #[serde(with = "crate::serde_b64")]
    pub public_key: Vec<u8>,
    /// 64-byte signature.
    #[serde(with = "crate::serde_b64")]
    pub signature: Vec<u8>,
}

/// Key material needed to start an outgoing session without a handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct E2ESession {
    pub registration_id: u32,
    #[serde(with = "crate::serde_b64")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key: SignedPreKeyData,
    /// The server may have run out of one-time pre-keys.
    #[serde(default)]
    pub pre_key: Option<PreKeyData>,
}

/// Error attached to a single user entry of a key query response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundleError {
    pub code: u16,
    pub text: String,
}

/// One user entry of a key query response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKeyBundle {
    pub jid: String,
    #[serde(default)]
    pub lid: Option<String>,
    #[serde(default)]
    pub error: Option<KeyBundleError>,
    #[serde(default)]
    pub session: Option<E2ESession>,
}

impl UserKeyBundle {
    /// The identifier the session is injected for; the anonymized one wins when both are present.
    pub fn identifier(&self) -> &str {
        self.lid.as_deref().unwrap_or(&self.jid)
    }
}

// ── Pre-key upload ─────────────────────────────────────────────────────

/// A one-time pre-key as uploaded: 3-byte big-endian id plus raw public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPreKey {
    #[serde(with = "crate::serde_b64")]
    pub id: Vec<u8>,
    #[serde(with = "crate::serde_b64")]
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSignedPreKey {
    #[serde(with = "crate::serde_b64")]
    pub id: Vec<u8>,
    #[serde(with = "crate::serde_b64")]
    pub value: Vec<u8>,
    #[serde(with = "crate::serde_b64")]
    pub signature: Vec<u8>,
}

/// Payload of a pre-key upload request, ready for the stanza encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyUpload {
    /// Target domain of the request.
    pub to: String,
    /// 4-byte big-endian registration id.
    #[serde(with = "crate::serde_b64")]
    pub registration: Vec<u8>,
    pub key_type: u8,
    /// Raw 32-byte identity public key.
    #[serde(with = "crate::serde_b64")]
    pub identity: Vec<u8>,
    pub pre_keys: Vec<UploadPreKey>,
    pub signed_pre_key: UploadSignedPreKey,
}

impl PreKeyUpload {
    pub fn new(
        use_anonymized: bool,
        registration_id: u32,
        identity: Vec<u8>,
        pre_keys: Vec<UploadPreKey>,
        signed_pre_key: UploadSignedPreKey,
    ) -> Self {
        Self {
            to: domain_for(use_anonymized).to_string(),
            registration: encode_big_endian(registration_id, 4),
            key_type: KEY_BUNDLE_TYPE,
            identity,
            pre_keys,
            signed_pre_key,
        }
    }
}

/// Encode the low `len` bytes of `value`, most significant first.
pub fn encode_big_endian(value: u32, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let mut rest = value as u64;
    for byte in out.iter_mut().rev() {
        *byte = (rest & 0xff) as u8;
        rest >>= 8;
    }
    out
}

/// Inverse of [`encode_big_endian`] for up to four bytes.
pub fn decode_big_endian(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte))
}

//! Key pair generation and serialization.
//!
//! Keys are stored in libsignal's own encoding: public keys carry the
//! one-byte Curve25519 type prefix (33 bytes), private keys are 32 bytes.
//! The wire carries raw 32-byte public keys, so conversions in both
//! directions live here too.

use std::fmt;

use libsignal_protocol::{IdentityKey, IdentityKeyPair, KeyPair, PublicKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SignalError};

/// Type prefix of a serialized Curve25519 public key.
pub const DJB_TYPE: u8 = 0x05;

/// A serializable key pair, used for the identity key, signed pre-key and one-time pre-keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyPairData {
    /// 33-byte typed Curve25519 public key.
    #[serde(with = "wamd_protocol::serde_b64")]
    pub public: Vec<u8>,
    /// 32-byte Curve25519 private key.
    #[serde(with = "wamd_protocol::serde_b64")]
    pub private: Vec<u8>,
}

impl fmt::Debug for KeyPairData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPairData")
            .field("public", &self.public)
            .field("private", &"<redacted>")
            .finish()
    }
}

impl KeyPairData {
    pub fn generate() -> Self {
        Self::from_key_pair(&KeyPair::generate(&mut OsRng))
    }

    pub fn from_key_pair(pair: &KeyPair) -> Self {
        Self {
            public: pair.public_key.serialize().to_vec(),
            private: pair.private_key.serialize().to_vec(),
        }
    }

    pub fn to_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_public_and_private(&self.public, &self.private)
            .map_err(|e| SignalError::InvalidKeyMaterial(e.to_string()))
    }

    pub fn to_identity_key_pair(&self) -> Result<IdentityKeyPair> {
        let key_pair = self.to_key_pair()?;
        Ok(IdentityKeyPair::new(
            IdentityKey::new(key_pair.public_key),
            key_pair.private_key,
        ))
    }

    /// The public key without its type prefix, as sent on the wire.
    pub fn raw_public(&self) -> &[u8] {
        raw_pub_key(&self.public)
    }
}

/// A signed pre-key: key pair, id and the identity key's signature over the typed public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKeyPair {
    pub key_pair: KeyPairData,
    pub key_id: u32,
    #[serde(with = "wamd_protocol::serde_b64")]
    pub signature: Vec<u8>,
}

impl SignedKeyPair {
    pub fn generate(identity: &KeyPairData, key_id: u32) -> Result<Self> {
        let identity = identity.to_identity_key_pair()?;
        let key_pair = KeyPair::generate(&mut OsRng);
        let signature = identity
            .private_key()
            .calculate_signature(&key_pair.public_key.serialize(), &mut OsRng)?;

        Ok(Self {
            key_pair: KeyPairData::from_key_pair(&key_pair),
            key_id,
            signature: signature.to_vec(),
        })
    }
}

/// Add the type prefix to a raw 32-byte key; typed keys pass through unchanged.
pub fn signal_pub_key(key: &[u8]) -> Vec<u8> {
    if key.len() == 33 {
        key.to_vec()
    } else {
        let mut typed = Vec::with_capacity(key.len() + 1);
        typed.push(DJB_TYPE);
        typed.extend_from_slice(key);
        typed
    }
}

/// Strip the type prefix from a typed key; raw keys pass through unchanged.
pub fn raw_pub_key(key: &[u8]) -> &[u8] {
    match key {
        [DJB_TYPE, rest @ ..] if rest.len() == 32 => rest,
        _ => key,
    }
}

/// Decode a public key received from the wire, raw or typed.
pub fn public_key_from_wire(key: &[u8]) -> Result<PublicKey> {
    PublicKey::deserialize(&signal_pub_key(key))
        .map_err(|e| SignalError::InvalidKeyMaterial(e.to_string()))
}

/// Decode an identity key received from the wire, raw or typed.
pub fn identity_key_from_wire(key: &[u8]) -> Result<IdentityKey> {
    public_key_from_wire(key).map(IdentityKey::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_roundtrip() {
        let pair = KeyPairData::generate();
        let restored = pair.to_identity_key_pair().unwrap();
        assert_eq!(restored.public_key().serialize().to_vec(), pair.public);
        assert_eq!(pair.public.len(), 33);
        assert_eq!(pair.raw_public().len(), 32);
    }

    #[test]
    fn wire_key_prefixing() {
        let raw = [9u8; 32];
        let typed = signal_pub_key(&raw);
        assert_eq!(typed.len(), 33);
        assert_eq!(typed[0], DJB_TYPE);
        assert_eq!(signal_pub_key(&typed), typed);
        assert_eq!(raw_pub_key(&typed), &raw);
        assert_eq!(raw_pub_key(&raw), &raw);
    }

    #[test]
    fn raw_identity_key_decodes() {
        let pair = KeyPairData::generate();
        let identity = identity_key_from_wire(pair.raw_public()).unwrap();
        assert_eq!(identity.serialize().to_vec(), pair.public);
    }

    #[test]
    fn signed_key_pair_shape() {
        let identity = KeyPairData::generate();
        let signed = SignedKeyPair::generate(&identity, 7).unwrap();
        assert_eq!(signed.key_id, 7);

        assert_eq!(signed.signature.len(), 64);
        assert_ne!(signed.key_pair.public, identity.public);
    }

    #[test]
    fn debug_redacts_private_key() {
        let pair = KeyPairData::generate();
        let rendered = format!("{pair:?}");
        assert!(rendered.contains("<redacted>"));
    }
}

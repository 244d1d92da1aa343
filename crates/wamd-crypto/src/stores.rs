//! Signal Protocol store traits backed by a [`KeyStore`] and the credentials.
//!
//! The adapters hold no state of their own beyond a credentials snapshot:
//! every session, pre-key, sender key and pinned identity is read from and
//! written through the key store on each call.

use std::collections::BTreeMap;
use std::sync::Arc;

use libsignal_protocol::{
    Direction, GenericSignedPreKey, IdentityKey, IdentityKeyPair, IdentityKeyStore,
    KyberPreKeyId, KyberPreKeyRecord, KyberPreKeyStore, PreKeyId, PreKeyRecord, PreKeyStore,
    ProtocolAddress, SenderKeyRecord, SenderKeyStore, SessionRecord, SessionStore,
    SignalProtocolError, SignedPreKeyId, SignedPreKeyRecord, SignedPreKeyStore, Timestamp,
};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use wamd_protocol::Address;

use crate::config::TrustPolicy;
use crate::creds::AuthenticationCreds;
use crate::error::StoreError;
use crate::identity::{KeyPairData, SignedKeyPair};
use crate::keystore::{Category, KeyRecord, KeyStore, KeyUpdates};

/// Canonical address of a libsignal protocol address.
pub fn address_of(addr: &ProtocolAddress) -> Result<Address, SignalProtocolError> {
    Address::from_protocol_parts(addr.name(), u32::from(addr.device_id()))
        .map_err(|e| SignalProtocolError::InvalidArgument(e.to_string()))
}

/// libsignal protocol address of a peer.
pub fn protocol_address(address: &Address) -> ProtocolAddress {
    ProtocolAddress::new(address.protocol_name(), address.device.into())
}

/// Key-store id of the sender-key record of `author` in `group`.
pub fn sender_key_id(group: &str, author: &Address) -> String {
    format!("{group}::{}", author.signal_key())
}

fn store_failure(e: StoreError) -> SignalProtocolError {
    SignalProtocolError::InvalidArgument(format!("key store write failed: {e}"))
}

async fn write(keys: &dyn KeyStore, updates: KeyUpdates) -> Result<(), SignalProtocolError> {
    keys.set(updates).await.map_err(store_failure)
}

/// All 1:1 Signal Protocol stores bundled together.
pub struct SignalStores {
    pub identity: KeyStoreIdentityStore,
    pub prekey: KeyStorePreKeyStore,
    pub signed_prekey: CredsSignedPreKeyStore,
    pub session: KeyStoreSessionStore,
    pub kyber: NoKyberPreKeyStore,
}

impl SignalStores {
    pub fn new(creds: &AuthenticationCreds, keys: Arc<dyn KeyStore>, trust: TrustPolicy) -> Self {
        Self {
            identity: KeyStoreIdentityStore {
                key_pair: creds.signed_identity_key.clone(),
                registration_id: creds.registration_id,
                trust,
                keys: keys.clone(),
            },
            prekey: KeyStorePreKeyStore { keys: keys.clone() },
            signed_prekey: CredsSignedPreKeyStore {
                signed_pre_key: creds.signed_pre_key.clone(),
            },
            session: KeyStoreSessionStore { keys },
            kyber: NoKyberPreKeyStore,
        }
    }
}

// ── Identity Key Store ──────────────────────────────────────────────────

pub struct KeyStoreIdentityStore {
    key_pair: KeyPairData,
    registration_id: u32,
    trust: TrustPolicy,
    keys: Arc<dyn KeyStore>,
}

impl KeyStoreIdentityStore {
    async fn pinned(&self, id: &str) -> Option<Vec<u8>> {
        match self.keys.get_one(Category::IdentityKey, id).await {
            Some(KeyRecord::IdentityKey(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

#[async_trait::async_trait(?Send)]
impl IdentityKeyStore for KeyStoreIdentityStore {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        self.key_pair
            .to_identity_key_pair()
            .map_err(|e| SignalProtocolError::InvalidArgument(e.to_string()))
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        Ok(self.registration_id)
    }

    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, SignalProtocolError> {
        let id = address_of(address)?.signal_key();
        let serialized = identity.serialize().to_vec();
        let existing = self.pinned(&id).await;
        if existing.as_deref() == Some(serialized.as_slice()) {
            return Ok(false);
        }
        write(
            self.keys.as_ref(),
            KeyUpdates::new().put(id, KeyRecord::IdentityKey(serialized)),
        )
        .await?;
        // true when a different identity was replaced
        Ok(existing.is_some())
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        _direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        match self.trust {
            TrustPolicy::AcceptAll => Ok(true),
            TrustPolicy::Strict => {
                let id = address_of(address)?.signal_key();
                match self.pinned(&id).await {
                    None => Ok(true),
                    Some(stored) => {
                        let trusted: bool = stored.ct_eq(&identity.serialize()).into();
                        if !trusted {
                            warn!("identity key of {id} does not match the pinned key");
                        }
                        Ok(trusted)
                    }
                }
            }
        }
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        let id = address_of(address)?.signal_key();
        match self.pinned(&id).await {
            None => Ok(None),
            Some(bytes) => Ok(Some(IdentityKey::decode(&bytes)?)),
        }
    }
}

// ── Kyber Pre-Key Store ────────────────────────────────────────────────
// Key bundles from the directory carry no post-quantum keys, but the
// decrypt functions require a KyberPreKeyStore. This is a no-op stub.

pub struct NoKyberPreKeyStore;

#[async_trait::async_trait(?Send)]
impl KyberPreKeyStore for NoKyberPreKeyStore {
    async fn get_kyber_pre_key(
        &self,
        _kyber_prekey_id: KyberPreKeyId,
    ) -> Result<KyberPreKeyRecord, SignalProtocolError> {
        Err(SignalProtocolError::InvalidKyberPreKeyId)
    }

    async fn save_kyber_pre_key(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
        _record: &KyberPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }

    async fn mark_kyber_pre_key_used(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }
}

// ── Pre-Key Store ───────────────────────────────────────────────────────

/// One-time pre-keys, stored under their decimal id.
pub struct KeyStorePreKeyStore {
    keys: Arc<dyn KeyStore>,
}

#[async_trait::async_trait(?Send)]
impl PreKeyStore for KeyStorePreKeyStore {
    async fn get_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        let key_id = u32::from(id);
        match self.keys.get_one(Category::PreKey, &key_id.to_string()).await {
            Some(KeyRecord::PreKey(pair)) => {
                let key_pair = pair
                    .to_key_pair()
                    .map_err(|e| SignalProtocolError::InvalidArgument(e.to_string()))?;
                Ok(PreKeyRecord::new(id, &key_pair))
            }
            _ => Err(SignalProtocolError::InvalidPreKeyId),
        }
    }

    async fn save_pre_key(
        &mut self,
        id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        let pair = KeyPairData::from_key_pair(&record.key_pair()?);
        write(
            self.keys.as_ref(),
            KeyUpdates::new().put(u32::from(id).to_string(), KeyRecord::PreKey(pair)),
        )
        .await
    }

    async fn remove_pre_key(&mut self, id: PreKeyId) -> Result<(), SignalProtocolError> {
        debug!("consumed pre-key {}", u32::from(id));
        write(
            self.keys.as_ref(),
            KeyUpdates::new().delete(Category::PreKey, u32::from(id).to_string()),
        )
        .await
    }
}

// ── Signed Pre-Key Store ────────────────────────────────────────────────

/// The current signed pre-key, owned by the credentials.
///
/// Only one signed pre-key is live at a time, so the requested id is not
/// consulted. Rotation goes through a credentials delta, never through here.
pub struct CredsSignedPreKeyStore {
    signed_pre_key: SignedKeyPair,
}

#[async_trait::async_trait(?Send)]
impl SignedPreKeyStore for CredsSignedPreKeyStore {
    async fn get_signed_pre_key(
        &self,
        _id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        let key_pair = self
            .signed_pre_key
            .key_pair
            .to_key_pair()
            .map_err(|e| SignalProtocolError::InvalidArgument(e.to_string()))?;
        Ok(SignedPreKeyRecord::new(
            SignedPreKeyId::from(self.signed_pre_key.key_id),
            Timestamp::from_epoch_millis(0),
            &key_pair,
            &self.signed_pre_key.signature,
        ))
    }

    async fn save_signed_pre_key(
        &mut self,
        id: SignedPreKeyId,
        _record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        debug!("ignoring save of signed pre-key {}", u32::from(id));
        Ok(())
    }
}

// ── Session Store ───────────────────────────────────────────────────────

/// Ratchet sessions keyed by canonical address.
pub struct KeyStoreSessionStore {
    keys: Arc<dyn KeyStore>,
}

#[async_trait::async_trait(?Send)]
impl SessionStore for KeyStoreSessionStore {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        let id = address_of(address)?.signal_key();
        let Some(KeyRecord::Session(bytes)) = self.keys.get_one(Category::Session, &id).await
        else {
            return Ok(None);
        };
        match SessionRecord::deserialize(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("session {id} is corrupted, deleting it: {e}");
                let updates = KeyUpdates::new().delete(Category::Session, id.clone());
                if let Err(e) = self.keys.set(updates).await {
                    warn!("failed to delete corrupted session {id}: {e}");
                }
                Ok(None)
            }
        }
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        let id = address_of(address)?.signal_key();
        write(
            self.keys.as_ref(),
            KeyUpdates::new().put(id, KeyRecord::Session(record.serialize()?)),
        )
        .await
    }
}

// ── Sender Key Store ────────────────────────────────────────────────────

/// Sender-key records of one group, stored as `"{group}::{canonical-author}"`.
///
/// The distribution id is derived from the group, so it is not part of the key.
pub struct KeyStoreSenderKeyStore {
    group: String,
    keys: Arc<dyn KeyStore>,
}

impl KeyStoreSenderKeyStore {
    pub fn new(group: impl Into<String>, keys: Arc<dyn KeyStore>) -> Self {
        Self {
            group: group.into(),
            keys,
        }
    }

    fn record_id(&self, sender: &ProtocolAddress) -> Result<String, SignalProtocolError> {
        Ok(sender_key_id(&self.group, &address_of(sender)?))
    }
}

#[async_trait::async_trait(?Send)]
impl SenderKeyStore for KeyStoreSenderKeyStore {
    async fn store_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        _distribution_id: uuid::Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        let id = self.record_id(sender)?;
        write(
            self.keys.as_ref(),
            KeyUpdates::new().put(id, KeyRecord::SenderKey(record.serialize()?)),
        )
        .await
    }

    async fn load_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        _distribution_id: uuid::Uuid,
    ) -> Result<Option<SenderKeyRecord>, SignalProtocolError> {
        let id = self.record_id(sender)?;
        match self.keys.get_one(Category::SenderKey, &id).await {
            Some(KeyRecord::SenderKey(bytes)) => Ok(Some(SenderKeyRecord::deserialize(&bytes)?)),
            _ => Ok(None),
        }
    }
}

/// Devices of one group that already hold our sender key.
pub async fn load_sender_key_memory(keys: &dyn KeyStore, group: &str) -> BTreeMap<String, bool> {
    match keys.get_one(Category::SenderKeyMemory, group).await {
        Some(KeyRecord::SenderKeyMemory(memory)) => memory,
        _ => BTreeMap::new(),
    }
}

//! Pairwise session lifecycle and message encryption/decryption.
//!
//! Sessions are established either by decrypting a peer's pre-key message
//! or by injecting a key bundle obtained from a key query, then advanced by
//! the Double Ratchet on every message. All state lives in the key store;
//! the repository only holds a per-peer lock map so two operations on the
//! same session never interleave their load and store.

use std::fmt;
use std::time::SystemTime;

use libsignal_protocol::{
    message_decrypt, message_decrypt_prekey, message_encrypt, process_prekey_bundle,
    CiphertextMessage, CiphertextMessageType, PreKeyBundle, PreKeyId, PreKeySignalMessage,
    SignalMessage, SignedPreKeyId,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use wamd_protocol::address::{is_lid_identifier, S_WHATSAPP_NET};
use wamd_protocol::{Address, E2ESession};

use crate::auth::SignalAuthState;
use crate::config::SignalConfig;
use crate::error::{Result, SignalError};
use crate::identity::{identity_key_from_wire, public_key_from_wire};
use crate::keystore::{Category, KeyUpdates};
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::stores::{protocol_address, SignalStores};

/// Wire kind of a pairwise ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// First message(s) of a session, carrying the handshake.
    #[serde(rename = "pkmsg")]
    PreKeyMessage,
    #[serde(rename = "msg")]
    Message,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::PreKeyMessage => "pkmsg",
            MessageKind::Message => "msg",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pkmsg" => Some(MessageKind::PreKeyMessage),
            "msg" => Some(MessageKind::Message),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of [`SignalRepository::encrypt_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub kind: MessageKind,
    pub ciphertext: Vec<u8>,
}

/// Session orchestration for one authenticated session.
///
/// The futures returned here are not `Send`: drive them on the task that
/// owns the repository.
pub struct SignalRepository {
    pub(crate) auth: SignalAuthState,
    pub(crate) config: SignalConfig,
    locks: KeyedLocks<String>,
}

impl SignalRepository {
    pub fn new(auth: SignalAuthState, config: SignalConfig) -> Self {
        Self {
            auth,
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub fn auth(&self) -> &SignalAuthState {
        &self.auth
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    pub(crate) async fn lock_for(&self, key: &str) -> KeyedGuard<'_, String> {
        self.locks.lock(key.to_string()).await
    }

    pub(crate) async fn stores(&self) -> SignalStores {
        let creds = self.auth.creds.read().await;
        SignalStores::new(&creds, self.auth.keys.clone(), self.config.trust_policy)
    }

    /// The exact key-store id of a peer's session.
    pub fn canonical_address_of(&self, peer: &Address) -> String {
        peer.signal_key()
    }

    pub async fn has_session(&self, peer: &Address) -> bool {
        self.auth
            .keys
            .get_one(Category::Session, &peer.signal_key())
            .await
            .is_some()
    }

    /// Decrypt a pairwise message, creating the session from a pre-key message if needed.
    pub async fn decrypt_message(
        &self,
        peer: &Address,
        kind: MessageKind,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let key = peer.signal_key();
        let address = protocol_address(peer);
        let failure = |source| SignalError::DecryptionFailure {
            peer: key.clone(),
            source,
        };

        let _guard = self.lock_for(&key).await;
        let mut stores = self.stores().await;

        let plaintext = match kind {
            MessageKind::PreKeyMessage => {
                let msg = PreKeySignalMessage::try_from(ciphertext).map_err(failure)?;
                message_decrypt_prekey(
                    &msg,
                    &address,
                    &mut stores.session,
                    &mut stores.identity,
                    &mut stores.prekey,
                    &mut stores.signed_prekey,
                    &mut stores.kyber,
                    &mut OsRng,
                )
                .await
                .map_err(failure)?
            }
            MessageKind::Message => {
                let msg = SignalMessage::try_from(ciphertext).map_err(failure)?;
                message_decrypt(
                    &CiphertextMessage::SignalMessage(msg),
                    &address,
                    &mut stores.session,
                    &mut stores.identity,
                    &mut stores.prekey,
                    &mut stores.signed_prekey,
                    &mut stores.kyber,
                    &mut OsRng,
                )
                .await
                .map_err(failure)?
            }
        };

        debug!("decrypted {kind} from {key}");
        Ok(plaintext)
    }

    /// Encrypt a pairwise message over the peer's existing session.
    pub async fn encrypt_message(&self, peer: &Address, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let key = peer.signal_key();
        let address = protocol_address(peer);

        let _guard = self.lock_for(&key).await;
        let mut stores = self.stores().await;

        let ciphertext = message_encrypt(
            plaintext,
            &address,
            &mut stores.session,
            &mut stores.identity,
            SystemTime::now(),
        )
        .await?;

        let kind = match ciphertext.message_type() {
            CiphertextMessageType::PreKey => MessageKind::PreKeyMessage,
            _ => MessageKind::Message,
        };
        Ok(EncryptedMessage {
            kind,
            ciphertext: ciphertext.serialize().to_vec(),
        })
    }

    /// Start an outgoing session from a key bundle, without a handshake message.
    pub async fn inject_session(&self, peer: &Address, session: &E2ESession) -> Result<()> {
        let key = peer.signal_key();
        let address = protocol_address(peer);

        let identity_key = identity_key_from_wire(&session.identity_key)?;
        let signed_pre_key = public_key_from_wire(&session.signed_pre_key.public_key)?;
        let pre_key = match &session.pre_key {
            Some(pre_key) => Some((
                PreKeyId::from(pre_key.key_id),
                public_key_from_wire(&pre_key.public_key)?,
            )),
            None => None,
        };

        let bundle = PreKeyBundle::new(
            session.registration_id,
            peer.device.into(),
            pre_key,
            SignedPreKeyId::from(session.signed_pre_key.key_id),
            signed_pre_key,
            session.signed_pre_key.signature.clone(),
            identity_key,
        )?;

        let _guard = self.lock_for(&key).await;
        let mut stores = self.stores().await;

        process_prekey_bundle(
            &address,
            &mut stores.session,
            &mut stores.identity,
            &bundle,
            SystemTime::now(),
            &mut OsRng,
        )
        .await?;

        debug!("injected session for {key}");
        Ok(())
    }

    /// Delete sessions stored under ids no current address can produce.
    ///
    /// Matches ids that contain a `.` but end in neither known domain, the
    /// shape left behind by bare `user.device` keys. Returns how many were removed.
    pub async fn clean_incompatible_sessions(&self) -> Result<usize> {
        let phone_suffix = format!("@{S_WHATSAPP_NET}");
        let stale: Vec<String> = self
            .auth
            .keys
            .ids(Category::Session)
            .await
            .into_iter()
            .filter(|id| id.contains('.') && !id.ends_with(&phone_suffix) && !is_lid_identifier(id))
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let updates = stale
            .iter()
            .fold(KeyUpdates::new(), |updates, id| updates.delete(Category::Session, id.as_str()));
        self.auth.keys.set(updates).await?;
        info!("cleaned {} incompatible sessions", stale.len());
        Ok(stale.len())
    }
}

//! Long-lived authentication credentials.
//!
//! Credentials are owned by one authenticated session. They change only
//! through [`CredsUpdate`] deltas (pairing, pre-key batches, signed
//! pre-key rotation); the owner persists them after every merge.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use wamd_protocol::{address, Address};

use crate::error::Result;
use crate::identity::{signal_pub_key, KeyPairData, SignedKeyPair};

/// The account the credentials belong to, known after pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub lid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Account signature material received during pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSignature {
    #[serde(with = "wamd_protocol::serde_b64")]
    pub details: Vec<u8>,
    #[serde(with = "wamd_protocol::serde_b64")]
    pub account_signature_key: Vec<u8>,
    #[serde(with = "wamd_protocol::serde_b64")]
    pub account_signature: Vec<u8>,
    #[serde(default, with = "wamd_protocol::serde_b64::option")]
    pub device_signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolIdentifier {
    pub name: String,
    pub device_id: u32,
}

/// A peer identity learned during pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalIdentity {
    pub identifier: ProtocolIdentifier,
    /// 33-byte typed public key.
    #[serde(with = "wamd_protocol::serde_b64")]
    pub identifier_key: Vec<u8>,
}

/// Build a [`SignalIdentity`] for an identifier in either namespace.
pub fn create_signal_identity(
    identifier: &str,
    account_signature_key: &[u8],
) -> Result<SignalIdentity> {
    let parsed = address::parse(identifier)?;
    Ok(SignalIdentity {
        identifier: ProtocolIdentifier {
            name: identifier.to_string(),
            device_id: parsed.device,
        },
        identifier_key: signal_pub_key(account_signature_key),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationCreds {
    pub signed_identity_key: KeyPairData,
    pub signed_pre_key: SignedKeyPair,
    pub registration_id: u32,
    /// Base64 secret used to authenticate the account signature during pairing.
    pub adv_secret_key: String,
    #[serde(default)]
    pub me: Option<Contact>,
    #[serde(default)]
    pub account: Option<AccountSignature>,
    #[serde(default)]
    pub signal_identities: Vec<SignalIdentity>,
    #[serde(default)]
    pub platform: Option<String>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
}

/// A partial update to [`AuthenticationCreds`]; unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredsUpdate {
    pub signed_pre_key: Option<SignedKeyPair>,
    pub me: Option<Contact>,
    pub account: Option<AccountSignature>,
    pub signal_identities: Option<Vec<SignalIdentity>>,
    pub platform: Option<String>,
    pub next_pre_key_id: Option<u32>,
    pub first_unuploaded_pre_key_id: Option<u32>,
}

impl CredsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Fresh credentials for a device that has not paired yet.
pub fn init_auth_creds() -> Result<AuthenticationCreds> {
    let identity = KeyPairData::generate();
    let signed_pre_key = SignedKeyPair::generate(&identity, 1)?;

    let mut adv_secret = [0u8; 32];
    OsRng.fill_bytes(&mut adv_secret);

    Ok(AuthenticationCreds {
        signed_identity_key: identity,
        signed_pre_key,
        registration_id: generate_registration_id(),
        adv_secret_key: STANDARD.encode(adv_secret),
        me: None,
        account: None,
        signal_identities: Vec::new(),
        platform: None,
        next_pre_key_id: 1,
        first_unuploaded_pre_key_id: 1,
    })
}

/// 14-bit registration id, never zero.
pub fn generate_registration_id() -> u32 {
    OsRng.gen_range(1..=0x3fff)
}

impl AuthenticationCreds {
    pub fn apply(&mut self, update: CredsUpdate) {
        if let Some(signed_pre_key) = update.signed_pre_key {
            self.signed_pre_key = signed_pre_key;
        }
        if let Some(me) = update.me {
            self.me = Some(me);
        }
        if let Some(account) = update.account {
            self.account = Some(account);
        }
        if let Some(identities) = update.signal_identities {
            self.signal_identities = identities;
        }
        if let Some(platform) = update.platform {
            self.platform = Some(platform);
        }
        if let Some(next) = update.next_pre_key_id {
            self.next_pre_key_id = next;
        }
        if let Some(first) = update.first_unuploaded_pre_key_id {
            self.first_unuploaded_pre_key_id = first;
        }
    }

    /// Our own address once paired.
    pub fn self_address(&self) -> Result<Option<Address>> {
        match &self.me {
            Some(me) => Ok(Some(address::parse(&me.id)?)),
            None => Ok(None),
        }
    }

    /// Credentials delta recording a successful pairing.
    pub fn pairing_update(
        &self,
        me: Contact,
        account: AccountSignature,
        platform: Option<String>,
    ) -> Result<CredsUpdate> {
        let identity = create_signal_identity(&me.id, &account.account_signature_key)?;
        let mut identities = self.signal_identities.clone();
        identities.push(identity);

        Ok(CredsUpdate {
            me: Some(me),
            account: Some(account),
            signal_identities: Some(identities),
            platform,
            ..Default::default()
        })
    }
}

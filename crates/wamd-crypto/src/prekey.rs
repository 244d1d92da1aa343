//! One-time pre-key pool and signed pre-key rotation.
//!
//! Pre-keys are one-time-use Curve25519 key pairs consumed by peers when
//! they start a session with us. Ids come from `next_pre_key_id`, which
//! only ever grows, and `first_unuploaded_pre_key_id` marks how far the
//! pool has been handed to the server. Local copies are kept until a peer
//! consumes them.

use std::collections::BTreeMap;

use tracing::info;
use wamd_protocol::types::encode_big_endian;
use wamd_protocol::{PreKeyUpload, UploadPreKey, UploadSignedPreKey};

use crate::auth::SignalAuthState;
use crate::config::SignalConfig;
use crate::creds::{AuthenticationCreds, CredsUpdate};
use crate::error::Result;
use crate::identity::{KeyPairData, SignedKeyPair};
use crate::keystore::{Category, KeyRecord, KeyStore, KeyUpdates};

/// Number of one-time pre-keys uploaded on first registration.
pub const INITIAL_PRE_KEY_COUNT: u32 = 30;

/// Server-side count below which a new batch should be uploaded.
pub const MIN_PRE_KEY_COUNT: u32 = 5;

/// Result of [`generate_or_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyReservation {
    /// Freshly generated keys, not yet in the store.
    pub new_pre_keys: BTreeMap<u32, KeyPairData>,
    pub last_pre_key_id: u32,
    /// `(first id, count)` of the keys to upload.
    pub upload_range: (u32, u32),
}

/// Reserve `want` unuploaded pre-keys, generating only the ones missing.
///
/// Keys between `first_unuploaded_pre_key_id` and `next_pre_key_id` were
/// generated earlier but never uploaded, so they are reused rather than
/// replaced.
pub fn generate_or_reserve(creds: &AuthenticationCreds, want: u32) -> PreKeyReservation {
    let first = creds.first_unuploaded_pre_key_id;
    let next = creds.next_pre_key_id;
    let available = next.saturating_sub(first);

    let mut new_pre_keys = BTreeMap::new();
    let last_pre_key_id = if want > available {
        let last = next + (want - available) - 1;
        for id in next..=last {
            new_pre_keys.insert(id, KeyPairData::generate());
        }
        last
    } else {
        // nothing to generate; the range ends inside the existing pool
        (first + want).saturating_sub(1)
    };

    PreKeyReservation {
        new_pre_keys,
        last_pre_key_id,
        upload_range: (first, want),
    }
}

/// Read the pre-keys `from..from + count` that are still in the store.
pub async fn fetch_range(keys: &dyn KeyStore, from: u32, count: u32) -> BTreeMap<u32, KeyPairData> {
    let ids: Vec<String> = (from..from.saturating_add(count)).map(|id| id.to_string()).collect();
    keys.get(Category::PreKey, &ids)
        .await
        .into_iter()
        .filter_map(|(id, record)| match (id.parse::<u32>(), record) {
            (Ok(id), KeyRecord::PreKey(pair)) => Some((id, pair)),
            _ => None,
        })
        .collect()
}

/// A batch of pre-keys ready for upload plus the credentials delta recording it.
#[derive(Debug, Clone)]
pub struct PreKeyBatch {
    pub update: CredsUpdate,
    pub pre_keys: BTreeMap<u32, KeyPairData>,
}

/// Generate and store whatever is missing for a batch of `count` keys.
///
/// The caller merges `update` into the credentials and persists them.
pub async fn next_pre_keys(state: &SignalAuthState, count: u32) -> Result<PreKeyBatch> {
    let creds = state.creds().await;
    let reservation = generate_or_reserve(&creds, count);
    let last = reservation.last_pre_key_id;

    let update = CredsUpdate {
        next_pre_key_id: Some(creds.next_pre_key_id.max(last + 1)),
        first_unuploaded_pre_key_id: Some(creds.first_unuploaded_pre_key_id.max(last + 1)),
        ..Default::default()
    };

    let generated = reservation.new_pre_keys.len();
    if generated > 0 {
        let updates = reservation
            .new_pre_keys
            .into_iter()
            .fold(KeyUpdates::new(), |updates, (id, pair)| {
                updates.put(id.to_string(), KeyRecord::PreKey(pair))
            });
        state.keys.set(updates).await?;
        info!(generated, last_pre_key_id = last, "generated pre-keys");
    }

    let (from, count) = reservation.upload_range;
    let pre_keys = fetch_range(state.keys.as_ref(), from, count).await;
    Ok(PreKeyBatch { update, pre_keys })
}

/// A pre-key upload payload plus the credentials delta recording it.
#[derive(Debug, Clone)]
pub struct PreKeyUploadBatch {
    pub update: CredsUpdate,
    pub upload: PreKeyUpload,
}

/// Build the upload payload for the next `count` pre-keys.
pub async fn next_pre_keys_upload(
    state: &SignalAuthState,
    count: u32,
    use_anonymized: bool,
) -> Result<PreKeyUploadBatch> {
    let PreKeyBatch { update, pre_keys } = next_pre_keys(state, count).await?;
    let creds = state.creds().await;

    let pre_keys = pre_keys
        .iter()
        .map(|(id, pair)| UploadPreKey {
            id: encode_big_endian(*id, 3),
            value: pair.raw_public().to_vec(),
        })
        .collect();
    let signed = &creds.signed_pre_key;
    let upload = PreKeyUpload::new(
        use_anonymized,
        creds.registration_id,
        creds.signed_identity_key.raw_public().to_vec(),
        pre_keys,
        UploadSignedPreKey {
            id: encode_big_endian(signed.key_id, 3),
            value: signed.key_pair.raw_public().to_vec(),
            signature: signed.signature.clone(),
        },
    );

    Ok(PreKeyUploadBatch { update, upload })
}

/// Like [`next_pre_keys_upload`], targeting the namespace of our own identifier.
pub async fn next_pre_keys_upload_for(
    state: &SignalAuthState,
    count: u32,
    identifier: Option<&str>,
) -> Result<PreKeyUploadBatch> {
    let use_anonymized = identifier.is_some_and(wamd_protocol::address::is_lid_identifier);
    next_pre_keys_upload(state, count, use_anonymized).await
}

/// How many pre-keys to upload, given the count the server still holds.
///
/// `None` while the server has more than `min_pre_key_count` left.
pub fn pre_keys_to_upload(config: &SignalConfig, server_count: u32) -> Option<u32> {
    (server_count <= config.min_pre_key_count).then_some(config.initial_pre_key_count)
}

/// A fresh signed pre-key with the next id, signed by the identity key.
pub fn rotate_signed_pre_key(creds: &AuthenticationCreds) -> Result<CredsUpdate> {
    let key_id = creds.signed_pre_key.key_id.wrapping_add(1).max(1);
    let signed_pre_key = SignedKeyPair::generate(&creds.signed_identity_key, key_id)?;
    info!(key_id, "rotated signed pre-key");
    Ok(CredsUpdate {
        signed_pre_key: Some(signed_pre_key),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::init_auth_creds;
    use wamd_protocol::KEY_BUNDLE_TYPE;

    #[test]
    fn reserve_from_empty_pool() {
        let creds = init_auth_creds().unwrap();
        let reservation = generate_or_reserve(&creds, INITIAL_PRE_KEY_COUNT);
        assert_eq!(reservation.new_pre_keys.len(), 30);
        assert_eq!(reservation.new_pre_keys.keys().next(), Some(&1));
        assert_eq!(reservation.last_pre_key_id, 30);
        assert_eq!(reservation.upload_range, (1, 30));
    }

    #[test]
    fn reserve_reuses_unuploaded_keys() {
        let mut creds = init_auth_creds().unwrap();
        creds.first_unuploaded_pre_key_id = 11;
        creds.next_pre_key_id = 15;
        let reservation = generate_or_reserve(&creds, 10);
        // 4 available, 6 generated starting at 15
        assert_eq!(
            reservation.new_pre_keys.keys().copied().collect::<Vec<_>>(),
            vec![15, 16, 17, 18, 19, 20]
        );
        assert_eq!(reservation.last_pre_key_id, 20);
        assert_eq!(reservation.upload_range, (11, 10));
    }

    #[test]
    fn reserve_zero_is_a_no_op() {
        let creds = init_auth_creds().unwrap();
        let reservation = generate_or_reserve(&creds, 0);
        assert!(reservation.new_pre_keys.is_empty());
        assert_eq!(reservation.upload_range, (1, 0));
    }

    #[tokio::test]
    async fn batches_are_monotonic() {
        let state = SignalAuthState::in_memory().unwrap();

        let first = next_pre_keys(&state, 5).await.unwrap();
        state.apply_creds_update(first.update.clone()).await;
        let second = next_pre_keys(&state, 5).await.unwrap();
        state.apply_creds_update(second.update.clone()).await;

        let first_max = *first.pre_keys.keys().max().unwrap();
        let second_min = *second.pre_keys.keys().min().unwrap();
        assert_eq!(first.pre_keys.len(), 5);
        assert_eq!(second.pre_keys.len(), 5);
        assert!(second_min > first_max);

        let creds = state.creds().await;
        assert_eq!(creds.next_pre_key_id, 11);
        assert_eq!(creds.first_unuploaded_pre_key_id, 11);
        assert!(creds.first_unuploaded_pre_key_id <= creds.next_pre_key_id);
        assert_eq!(state.keys.ids(Category::PreKey).await.len(), 10);
    }

    #[tokio::test]
    async fn fetch_range_skips_consumed_keys() {
        let state = SignalAuthState::in_memory().unwrap();
        let batch = next_pre_keys(&state, 4).await.unwrap();
        state
            .keys
            .set(KeyUpdates::new().delete(Category::PreKey, "2"))
            .await
            .unwrap();
        let fetched = fetch_range(state.keys.as_ref(), 1, 4).await;
        assert_eq!(fetched.keys().copied().collect::<Vec<_>>(), vec![1, 3, 4]);
        assert_eq!(fetched[&3], batch.pre_keys[&3]);
    }

    #[tokio::test]
    async fn upload_payload_layout() {
        let state = SignalAuthState::in_memory().unwrap();
        let creds = state.creds().await;
        let batch = next_pre_keys_upload(&state, 3, false).await.unwrap();
        let upload = batch.upload;

        assert_eq!(upload.to, "s.whatsapp.net");
        assert_eq!(upload.registration, encode_big_endian(creds.registration_id, 4));
        assert_eq!(upload.key_type, KEY_BUNDLE_TYPE);
        assert_eq!(upload.identity, creds.signed_identity_key.raw_public());
        assert_eq!(upload.pre_keys.len(), 3);
        assert_eq!(upload.pre_keys[0].id, vec![0, 0, 1]);
        assert_eq!(upload.pre_keys[2].id, vec![0, 0, 3]);
        assert!(upload.pre_keys.iter().all(|key| key.value.len() == 32));
        assert_eq!(upload.signed_pre_key.id, vec![0, 0, 1]);
        assert_eq!(upload.signed_pre_key.signature.len(), 64);
        assert_eq!(batch.update.next_pre_key_id, Some(4));

        let lid = next_pre_keys_upload_for(&state, 1, Some("999@lid")).await.unwrap();
        assert_eq!(lid.upload.to, "lid");
    }

    #[test]
    fn replenish_threshold() {
        let config = SignalConfig::default();
        assert_eq!(pre_keys_to_upload(&config, 0), Some(INITIAL_PRE_KEY_COUNT));
        assert_eq!(pre_keys_to_upload(&config, MIN_PRE_KEY_COUNT), Some(INITIAL_PRE_KEY_COUNT));
        assert_eq!(pre_keys_to_upload(&config, MIN_PRE_KEY_COUNT + 1), None);
    }

    #[test]
    fn rotation_advances_signed_pre_key_id() {
        let mut creds = init_auth_creds().unwrap();
        let update = rotate_signed_pre_key(&creds).unwrap();
        creds.apply(update);
        assert_eq!(creds.signed_pre_key.key_id, 2);
        let update = rotate_signed_pre_key(&creds).unwrap();
        creds.apply(update);
        assert_eq!(creds.signed_pre_key.key_id, 3);
    }
}

//! The persisted key store: a durable mapping from `(category, id)` to key material.
//!
//! The value shape depends on the category, so records are a closed enum
//! and each category has exactly one body encoding. Backends only ever
//! see encoded bodies for the category they were asked about.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::identity::KeyPairData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Session,
    PreKey,
    SenderKey,
    AppStateSyncKey,
    SenderKeyMemory,
    IdentityKey,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Session,
        Category::PreKey,
        Category::SenderKey,
        Category::AppStateSyncKey,
        Category::SenderKeyMemory,
        Category::IdentityKey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Session => "session",
            Category::PreKey => "pre-key",
            Category::SenderKey => "sender-key",
            Category::AppStateSyncKey => "app-state-sync-key",
            Category::SenderKeyMemory => "sender-key-memory",
            Category::IdentityKey => "identity-key",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStateSyncKeyFingerprint {
    pub raw_id: u32,
    pub current_index: u32,
    #[serde(default)]
    pub device_indexes: Vec<u32>,
}

/// Key used to decrypt app-state sync patches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStateSyncKeyData {
    #[serde(with = "wamd_protocol::serde_b64")]
    pub key_data: Vec<u8>,
    #[serde(default)]
    pub fingerprint: Option<AppStateSyncKeyFingerprint>,
    pub timestamp: i64,
}

/// A stored record; the variant determines its category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRecord {
    /// Serialized ratchet session.
    Session(Vec<u8>),
    /// One-time pre-key pair.
    PreKey(KeyPairData),
    /// Serialized sender-key record.
    SenderKey(Vec<u8>),
    AppStateSyncKey(AppStateSyncKeyData),
    /// Canonical device address -> whether it already holds our sender key.
    SenderKeyMemory(BTreeMap<String, bool>),
    /// Pinned typed identity key of a peer.
    IdentityKey(Vec<u8>),
}

#[derive(Serialize)]
#[serde(transparent)]
struct BlobRef<'a>(#[serde(with = "wamd_protocol::serde_b64")] &'a [u8]);

#[derive(Deserialize)]
#[serde(transparent)]
struct Blob(#[serde(with = "wamd_protocol::serde_b64")] Vec<u8>);

trait Codec {
    type Error;
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Self::Error>;
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Self::Error>;
}

struct Json;

impl Codec for Json {
    type Error = serde_json::Error;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(value)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(bytes)
    }
}

struct Binary;

impl Codec for Binary {
    type Error = postcard::Error;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Self::Error> {
        postcard::to_allocvec(value)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Self::Error> {
        postcard::from_bytes(bytes)
    }
}

impl KeyRecord {
    pub fn category(&self) -> Category {
        match self {
            KeyRecord::Session(_) => Category::Session,
            KeyRecord::PreKey(_) => Category::PreKey,
            KeyRecord::SenderKey(_) => Category::SenderKey,
            KeyRecord::AppStateSyncKey(_) => Category::AppStateSyncKey,
            KeyRecord::SenderKeyMemory(_) => Category::SenderKeyMemory,
            KeyRecord::IdentityKey(_) => Category::IdentityKey,
        }
    }

    fn encode_with<C: Codec>(&self) -> Result<Vec<u8>, C::Error> {
        match self {
            KeyRecord::Session(bytes) | KeyRecord::SenderKey(bytes) | KeyRecord::IdentityKey(bytes) => {
                C::encode(&BlobRef(bytes))
            }
            KeyRecord::PreKey(pair) => C::encode(pair),
            KeyRecord::AppStateSyncKey(key) => C::encode(key),
            KeyRecord::SenderKeyMemory(memory) => C::encode(memory),
        }
    }

    fn decode_with<C: Codec>(category: Category, bytes: &[u8]) -> Result<Self, C::Error> {
        Ok(match category {
            Category::Session => KeyRecord::Session(C::decode::<Blob>(bytes)?.0),
            Category::PreKey => KeyRecord::PreKey(C::decode(bytes)?),
            Category::SenderKey => KeyRecord::SenderKey(C::decode::<Blob>(bytes)?.0),
            Category::AppStateSyncKey => KeyRecord::AppStateSyncKey(C::decode(bytes)?),
            Category::SenderKeyMemory => KeyRecord::SenderKeyMemory(C::decode(bytes)?),
            Category::IdentityKey => KeyRecord::IdentityKey(C::decode::<Blob>(bytes)?.0),
        })
    }

    /// JSON body of the record (the category is not included).
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        self.encode_with::<Json>()
    }

    pub fn from_json(category: Category, bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Self::decode_with::<Json>(category, bytes)
    }

    /// Compact binary body of the record (the category is not included).
    pub fn to_binary(&self) -> Result<Vec<u8>, postcard::Error> {
        self.encode_with::<Binary>()
    }

    pub fn from_binary(category: Category, bytes: &[u8]) -> Result<Self, postcard::Error> {
        Self::decode_with::<Binary>(category, bytes)
    }
}

/// A batch of mutations applied by one [`KeyStore::set`] call.
///
/// `None` is a tombstone: the record is deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyUpdates {
    entries: BTreeMap<Category, BTreeMap<String, Option<KeyRecord>>>,
}

impl KeyUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` under `id` in the record's own category.
    pub fn put(mut self, id: impl Into<String>, record: KeyRecord) -> Self {
        self.entries
            .entry(record.category())
            .or_default()
            .insert(id.into(), Some(record));
        self
    }

    pub fn delete(mut self, category: Category, id: impl Into<String>) -> Self {
        self.entries
            .entry(category)
            .or_default()
            .insert(id.into(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeMap::is_empty)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &str, Option<&KeyRecord>)> {
        self.entries.iter().flat_map(|(category, ids)| {
            ids.iter()
                .map(move |(id, record)| (*category, id.as_str(), record.as_ref()))
        })
    }

    pub fn into_entries(self) -> impl Iterator<Item = (Category, String, Option<KeyRecord>)> {
        self.entries.into_iter().flat_map(|(category, ids)| {
            ids.into_iter()
                .map(move |(id, record)| (category, id, record))
        })
    }
}

/// A durable, lockable `(category, id) -> record` store.
///
/// `get` never fails: missing records are simply absent from the result,
/// and backends log and drop records they cannot read. `set` applies the
/// whole batch before returning; a later `get` by the same caller sees it.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, category: Category, ids: &[String]) -> HashMap<String, KeyRecord>;

    async fn set(&self, updates: KeyUpdates) -> Result<(), StoreError>;

    /// Every id currently stored in `category`.
    async fn ids(&self, category: Category) -> Vec<String>;

    async fn get_one(&self, category: Category, id: &str) -> Option<KeyRecord> {
        self.get(category, &[id.to_string()]).await.remove(id)
    }
}

/// Volatile store; each batch is applied under one write lock.
#[derive(Default)]
pub struct MemoryKeyStore {
    records: RwLock<HashMap<Category, HashMap<String, KeyRecord>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, category: Category, ids: &[String]) -> HashMap<String, KeyRecord> {
        let records = self.records.read().await;
        let Some(records) = records.get(&category) else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|id| records.get(id).map(|record| (id.clone(), record.clone())))
            .collect()
    }

    async fn set(&self, updates: KeyUpdates) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        for (category, id, record) in updates.into_entries() {
            let bucket = records.entry(category).or_default();
            match record {
                Some(record) => {
                    bucket.insert(id, record);
                }
                None => {
                    bucket.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn ids(&self, category: Category) -> Vec<String> {
        let records = self.records.read().await;
        records
            .get(&category)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn category_names_roundtrip() {
        for category in Category::ALL {
            assert_eq!(Category::from_name(category.as_str()), Some(category));
        }
        assert_eq!(Category::from_name("nope"), None);
    }

    #[test]
    fn record_bodies_per_category() {
        let records = [
            KeyRecord::Session(vec![1, 2, 3]),
            KeyRecord::PreKey(KeyPairData::generate()),
            KeyRecord::SenderKey(vec![]),
            KeyRecord::AppStateSyncKey(AppStateSyncKeyData {
                key_data: vec![9; 32],
                fingerprint: Some(AppStateSyncKeyFingerprint {
                    raw_id: 1,
                    current_index: 2,
                    device_indexes: vec![0, 3],
                }),
                timestamp: 1_700_000_000,
            }),
            KeyRecord::SenderKeyMemory(BTreeMap::from([("1.0@s.whatsapp.net".to_string(), true)])),
            KeyRecord::IdentityKey(vec![5; 33]),
        ];
        for record in records {
            let category = record.category();
            let json = record.to_json().unwrap();
            assert_eq!(KeyRecord::from_json(category, &json).unwrap(), record);
            let binary = record.to_binary().unwrap();
            assert_eq!(KeyRecord::from_binary(category, &binary).unwrap(), record);
        }
    }

    #[test]
    fn session_body_is_a_base64_string() {
        let json = KeyRecord::Session(vec![0xff, 0x00]).to_json().unwrap();
        assert_eq!(json, b"\"/wA=\"");
    }

    #[test]
    fn wrong_category_fails_to_decode() {
        let json = KeyRecord::Session(vec![1, 2]).to_json().unwrap();
        assert!(KeyRecord::from_json(Category::PreKey, &json).is_err());
    }

    #[test]
    fn updates_route_by_record_category() {
        let updates = KeyUpdates::new()
            .put("1", KeyRecord::SenderKey(vec![1]))
            .delete(Category::Session, "a");
        assert_eq!(updates.len(), 2);
        let entries: Vec<_> = updates.iter().collect();
        assert!(entries.contains(&(Category::SenderKey, "1", Some(&KeyRecord::SenderKey(vec![1])))));
        assert!(entries.contains(&(Category::Session, "a", None)));
        assert!(KeyUpdates::new().is_empty());
    }

    #[tokio::test]
    async fn memory_get_set_delete() {
        let store = MemoryKeyStore::new();
        store
            .set(
                KeyUpdates::new()
                    .put("a", KeyRecord::Session(vec![1]))
                    .put("b", KeyRecord::Session(vec![2])),
            )
            .await
            .unwrap();

        let got = store.get(Category::Session, &ids(&["a", "b", "c"])).await;
        assert_eq!(got.len(), 2);
        assert_eq!(got["a"], KeyRecord::Session(vec![1]));
        assert!(!got.contains_key("c"));

        store
            .set(KeyUpdates::new().delete(Category::Session, "a"))
            .await
            .unwrap();
        assert!(store.get_one(Category::Session, "a").await.is_none());
        assert_eq!(store.ids(Category::Session).await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn memory_categories_are_separate() {
        let store = MemoryKeyStore::new();
        store
            .set(KeyUpdates::new().put("1", KeyRecord::SenderKey(vec![7])))
            .await
            .unwrap();
        assert!(store.get_one(Category::Session, "1").await.is_none());
        assert!(store.ids(Category::PreKey).await.is_empty());
    }
}

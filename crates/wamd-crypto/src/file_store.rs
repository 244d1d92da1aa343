//! Multi-file key store: one file per record in a single folder.
//!
//! Every file access goes through a per-path `tokio::sync::Mutex`, so
//! concurrent batches touching different records never wait on each other
//! while operations on the same record run in submission order. Waiters
//! queue without limit; a path's lock is dropped once nobody holds it.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::keystore::{Category, KeyRecord, KeyStore, KeyUpdates};
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::persistence::{RecordSealer, SALT_LEN};

/// File holding the PBKDF2 salt of a sealed store.
const SALT_FILE: &str = "keystore.salt";

/// Make an arbitrary id safe to use as a file name.
///
/// The mapping is idempotent, so ids listed by [`KeyStore::ids`] (which are
/// returned in this form) address the same file when passed back in.
pub fn fix_file_name(file: &str) -> String {
    file.replace('/', "__").replace(':', "-")
}

pub struct FileKeyStore {
    folder: PathBuf,
    locks: KeyedLocks<PathBuf>,
    sealer: Option<RecordSealer>,
}

impl FileKeyStore {
    /// Open (creating if needed) a store folder.
    pub async fn open(folder: impl Into<PathBuf>, config: &StoreConfig) -> Result<Self, StoreError> {
        let folder = folder.into();
        match tokio::fs::metadata(&folder).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(StoreError::NotADirectory {
                    path: folder.display().to_string(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&folder).await?;
            }
            Err(e) => return Err(e.into()),
        }

        let sealer = match &config.passphrase {
            Some(passphrase) => {
                let salt = load_or_create_salt(&folder).await?;
                let iterations = config.kdf_iterations;
                let passphrase = passphrase.clone();
                let sealer = tokio::task::spawn_blocking(move || {
                    RecordSealer::derive(&passphrase, &salt, iterations)
                })
                .await
                .map_err(|e| StoreError::Sealing(e.into()))??;
                Some(sealer)
            }
            None => None,
        };

        Ok(Self {
            folder,
            locks: KeyedLocks::new(),
            sealer,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn is_sealed(&self) -> bool {
        self.sealer.is_some()
    }

    fn extension(&self) -> &'static str {
        if self.sealer.is_some() {
            "sealed"
        } else {
            "json"
        }
    }

    fn record_file_name(&self, category: Category, id: &str) -> String {
        fix_file_name(&format!("{category}-{id}.{}", self.extension()))
    }

    async fn lock_for(&self, path: &Path) -> KeyedGuard<'_, PathBuf> {
        self.locks.lock(path.to_path_buf()).await
    }

    fn encode<T: Serialize>(&self, file_name: &str, value: &T) -> Result<Vec<u8>, StoreError> {
        match &self.sealer {
            Some(sealer) => Ok(sealer.seal(file_name, &postcard::to_allocvec(value)?)?),
            None => Ok(serde_json::to_vec(value)?),
        }
    }

    fn decode<T: DeserializeOwned>(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<T> {
        match &self.sealer {
            Some(sealer) => Ok(postcard::from_bytes(&sealer.open(file_name, bytes)?)?),
            None => Ok(serde_json::from_slice(bytes)?),
        }
    }

    fn encode_record(&self, file_name: &str, record: &KeyRecord) -> Result<Vec<u8>, StoreError> {
        match &self.sealer {
            Some(sealer) => Ok(sealer.seal(file_name, &record.to_binary()?)?),
            None => Ok(record.to_json()?),
        }
    }

    fn decode_record(
        &self,
        file_name: &str,
        category: Category,
        bytes: &[u8],
    ) -> anyhow::Result<KeyRecord> {
        match &self.sealer {
            Some(sealer) => Ok(KeyRecord::from_binary(category, &sealer.open(file_name, bytes)?)?),
            None => Ok(KeyRecord::from_json(category, bytes)?),
        }
    }

    /// Read a file; `Ok(None)` when it does not exist.
    async fn try_read_file(&self, file_name: &str) -> std::io::Result<Option<Vec<u8>>> {
        let path = self.folder.join(file_name);
        let _guard = self.lock_for(&path).await;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a file; `None` when it does not exist or cannot be read.
    async fn read_file(&self, file_name: &str) -> Option<Vec<u8>> {
        self.try_read_file(file_name).await.unwrap_or_else(|e| {
            error!("failed to read {} in {}: {e}", file_name, self.folder.display());
            None
        })
    }

    async fn write_file(&self, file_name: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.folder.join(file_name);
        let _guard = self.lock_for(&path).await;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn remove_file(&self, file_name: &str) {
        let path = self.folder.join(file_name);
        let _guard = self.lock_for(&path).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {e}", path.display()),
        }
    }

    async fn read_record(&self, category: Category, id: &str) -> Option<KeyRecord> {
        let file_name = self.record_file_name(category, id);
        let bytes = self.read_file(&file_name).await?;
        match self.decode_record(&file_name, category, &bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                error!("failed to decode {file_name}: {e}");
                None
            }
        }
    }

    /// Read a standalone value file such as `creds.json`.
    ///
    /// Unlike records, a value file that exists but cannot be read or
    /// decoded is an error, not an absence.
    pub async fn read_value<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>, StoreError> {
        let file_name = fix_file_name(file);
        let Some(bytes) = self.try_read_file(&file_name).await? else {
            return Ok(None);
        };
        self.decode(&file_name, &bytes)
            .map(Some)
            .map_err(|source| StoreError::UnreadableValue {
                file: file_name,
                reason: source.to_string(),
            })
    }

    /// Write a standalone value file such as `creds.json`.
    pub async fn write_value<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StoreError> {
        let file_name = fix_file_name(file);
        let bytes = self.encode(&file_name, value)?;
        self.write_file(&file_name, bytes).await
    }
}

async fn load_or_create_salt(folder: &Path) -> Result<[u8; SALT_LEN], StoreError> {
    let path = folder.join(SALT_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => <[u8; SALT_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
            StoreError::Sealing(anyhow::anyhow!("{} is corrupted", path.display()))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let salt = RecordSealer::generate_salt()?;
            tokio::fs::write(&path, salt).await?;
            Ok(salt)
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn get(&self, category: Category, ids: &[String]) -> HashMap<String, KeyRecord> {
        let reads = ids.iter().map(|id| async move {
            self.read_record(category, id)
                .await
                .map(|record| (id.clone(), record))
        });
        join_all(reads).await.into_iter().flatten().collect()
    }

    async fn set(&self, updates: KeyUpdates) -> Result<(), StoreError> {
        let mut writes = Vec::new();
        let mut removals = Vec::new();
        for (category, id, record) in updates.iter() {
            let file_name = self.record_file_name(category, id);
            match record {
                Some(record) => {
                    let bytes = self.encode_record(&file_name, record)?;
                    writes.push((file_name, bytes));
                }
                None => removals.push(file_name),
            }
        }
        debug!(writes = writes.len(), removals = removals.len(), "key store batch");

        let removing = join_all(removals.iter().map(|file_name| self.remove_file(file_name)));
        let writing = try_join_all(
            writes
                .into_iter()
                .map(|(file_name, bytes)| async move { self.write_file(&file_name, bytes).await }),
        );
        let (_, written) = tokio::join!(removing, writing);
        written.map(|_| ())
    }

    async fn ids(&self, category: Category) -> Vec<String> {
        let prefix = format!("{category}-");
        let suffix = format!(".{}", self.extension());
        // "sender-key-" is also a prefix of "sender-key-memory-"
        let shadowing: Vec<String> = Category::ALL
            .into_iter()
            .filter(|other| *other != category && other.as_str().starts_with(&prefix))
            .map(|other| format!("{other}-"))
            .collect();

        let mut entries = match tokio::fs::read_dir(&self.folder).await {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to list {}: {e}", self.folder.display());
                return Vec::new();
            }
        };

        let mut ids = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("failed to list {}: {e}", self.folder.display());
                    break;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if shadowing.iter().any(|other| name.starts_with(other.as_str())) {
                continue;
            }
            if let Some(id) = name
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_suffix(suffix.as_str()))
            {
                ids.push(id.to_string());
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn sealed_config() -> StoreConfig {
        StoreConfig {
            folder: None,
            passphrase: Some("correct horse".into()),
            kdf_iterations: 1_000,
        }
    }

    #[test]
    fn file_names_are_sanitised_idempotently() {
        let fixed = fix_file_name("sender-key-123-456@g.us::1.0@s.whatsapp.net.json");
        assert!(!fixed.contains(':'));
        assert_eq!(fix_file_name(&fixed), fixed);
        assert_eq!(fix_file_name("a/b"), "a__b");
    }

    #[tokio::test]
    async fn set_get_and_tombstone() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(tmp.path(), &StoreConfig::default()).await.unwrap();

        store
            .set(KeyUpdates::new().put("1.0@s.whatsapp.net", KeyRecord::Session(vec![1, 2])))
            .await
            .unwrap();
        assert!(tmp.path().join("session-1.0@s.whatsapp.net.json").exists());

        let got = store.get(Category::Session, &ids(&["1.0@s.whatsapp.net", "2.0@lid"])).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got["1.0@s.whatsapp.net"], KeyRecord::Session(vec![1, 2]));

        store
            .set(KeyUpdates::new().delete(Category::Session, "1.0@s.whatsapp.net"))
            .await
            .unwrap();
        assert!(store.get_one(Category::Session, "1.0@s.whatsapp.net").await.is_none());
    }

    #[tokio::test]
    async fn deleting_missing_record_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(tmp.path(), &StoreConfig::default()).await.unwrap();
        store
            .set(KeyUpdates::new().delete(Category::PreKey, "42"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreadable_record_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(tmp.path(), &StoreConfig::default()).await.unwrap();
        std::fs::write(tmp.path().join("pre-key-5.json"), b"{not json").unwrap();
        assert!(store.get_one(Category::PreKey, "5").await.is_none());
    }

    #[tokio::test]
    async fn ids_do_not_leak_across_categories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(tmp.path(), &StoreConfig::default()).await.unwrap();
        store
            .set(
                KeyUpdates::new()
                    .put("g::a", KeyRecord::SenderKey(vec![1]))
                    .put("g", KeyRecord::SenderKeyMemory(BTreeMap::new()))
                    .put("1.0@lid", KeyRecord::Session(vec![2])),
            )
            .await
            .unwrap();

        assert_eq!(store.ids(Category::SenderKey).await, vec!["g--a".to_string()]);
        assert_eq!(store.ids(Category::SenderKeyMemory).await, vec!["g".to_string()]);
        assert_eq!(store.ids(Category::Session).await, vec!["1.0@lid".to_string()]);
        // a listed id addresses the same file
        assert!(store.get_one(Category::SenderKey, "g--a").await.is_some());
    }

    #[tokio::test]
    async fn rejects_file_as_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let result = FileKeyStore::open(&file, &StoreConfig::default()).await;
        assert!(matches!(result, Err(StoreError::NotADirectory { .. })));
    }

    #[tokio::test]
    async fn sealed_store_roundtrip_and_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sealed_config();
        {
            let store = FileKeyStore::open(tmp.path(), &config).await.unwrap();
            assert!(store.is_sealed());
            store
                .set(KeyUpdates::new().put("7", KeyRecord::SenderKey(vec![7; 40])))
                .await
                .unwrap();
            let raw = std::fs::read(tmp.path().join("sender-key-7.sealed")).unwrap();
            assert!(crate::persistence::has_valid_header(&raw));
        }

        let reopened = FileKeyStore::open(tmp.path(), &config).await.unwrap();
        assert_eq!(
            reopened.get_one(Category::SenderKey, "7").await,
            Some(KeyRecord::SenderKey(vec![7; 40]))
        );

        let mut wrong = sealed_config();
        wrong.passphrase = Some("battery staple".into());
        let wrong = FileKeyStore::open(tmp.path(), &wrong).await.unwrap();
        assert!(wrong.get_one(Category::SenderKey, "7").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_disjoint_batches_lose_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(tmp.path(), &StoreConfig::default()).await.unwrap();

        let batches = (0..16u8).map(|batch| {
            let store = &store;
            async move {
                let mut updates = KeyUpdates::new();
                for i in 0..8u8 {
                    updates = updates.put(format!("{batch}-{i}"), KeyRecord::Session(vec![batch, i]));
                }
                store.set(updates).await
            }
        });
        for result in join_all(batches).await {
            result.unwrap();
        }

        let mut listed = store.ids(Category::Session).await;
        listed.sort();
        assert_eq!(listed.len(), 16 * 8);
        for batch in 0..16u8 {
            for i in 0..8u8 {
                let id = format!("{batch}-{i}");
                assert_eq!(
                    store.get_one(Category::Session, &id).await,
                    Some(KeyRecord::Session(vec![batch, i]))
                );
            }
        }
    }

    #[tokio::test]
    async fn same_record_writes_apply_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(tmp.path(), &StoreConfig::default()).await.unwrap();

        let writes = (0..10u8).map(|n| {
            let store = &store;
            async move {
                store
                    .set(KeyUpdates::new().put("same", KeyRecord::Session(vec![n])))
                    .await
            }
        });
        for result in join_all(writes).await {
            result.unwrap();
        }
        assert_eq!(
            store.get_one(Category::Session, "same").await,
            Some(KeyRecord::Session(vec![9]))
        );
    }

    #[tokio::test]
    async fn value_files_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(tmp.path(), &sealed_config()).await.unwrap();
        store.write_value("creds.json", &vec![1u32, 2, 3]).await.unwrap();
        assert_eq!(
            store.read_value::<Vec<u32>>("creds.json").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(store.read_value::<Vec<u32>>("missing.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn undecodable_value_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(tmp.path(), &StoreConfig::default()).await.unwrap();
        std::fs::write(tmp.path().join("creds.json"), b"{\"noiseKey\":").unwrap();

        let result = store.read_value::<Vec<u32>>("creds.json").await;
        assert!(matches!(result, Err(StoreError::UnreadableValue { .. })));
    }

    #[tokio::test]
    async fn path_locks_are_released() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(tmp.path(), &StoreConfig::default()).await.unwrap();

        for n in 0..500u32 {
            store
                .set(KeyUpdates::new().put(n.to_string(), KeyRecord::Session(vec![1])))
                .await
                .unwrap();
            store.get_one(Category::Session, &n.to_string()).await;
        }
        store.get_one(Category::PreKey, "missing").await;
        store.ids(Category::Session).await;
        store
            .set(KeyUpdates::new().delete(Category::Session, "0"))
            .await
            .unwrap();
        store.write_value("creds.json", &1u32).await.unwrap();
        store.read_value::<u32>("creds.json").await.unwrap();

        assert_eq!(store.locks.len(), 0);
    }
}

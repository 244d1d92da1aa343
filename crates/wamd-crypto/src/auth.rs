//! Authentication state: credentials plus the key store they index into.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{SignalConfig, StoreConfig};
use crate::creds::{init_auth_creds, AuthenticationCreds, CredsUpdate};
use crate::error::{Result, StoreError};
use crate::file_store::FileKeyStore;
use crate::keystore::{KeyStore, MemoryKeyStore};

/// File holding the credentials inside a multi-file store folder.
pub const CREDS_FILE: &str = "creds.json";

/// Credentials and key store of one authenticated session.
///
/// Cloning is cheap and every clone refers to the same state.
#[derive(Clone)]
pub struct SignalAuthState {
    pub creds: Arc<RwLock<AuthenticationCreds>>,
    pub keys: Arc<dyn KeyStore>,
}

impl SignalAuthState {
    pub fn new(creds: AuthenticationCreds, keys: Arc<dyn KeyStore>) -> Self {
        Self {
            creds: Arc::new(RwLock::new(creds)),
            keys,
        }
    }

    /// Fresh credentials over a volatile store.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(init_auth_creds()?, Arc::new(MemoryKeyStore::new())))
    }

    /// Snapshot of the current credentials.
    pub async fn creds(&self) -> AuthenticationCreds {
        self.creds.read().await.clone()
    }

    pub async fn apply_creds_update(&self, update: CredsUpdate) {
        if update.is_empty() {
            return;
        }
        self.creds.write().await.apply(update);
    }
}

/// Auth state persisted as one file per record in a folder.
pub struct MultiFileAuthState {
    pub state: SignalAuthState,
    store: Arc<FileKeyStore>,
}

impl MultiFileAuthState {
    pub fn folder(&self) -> PathBuf {
        self.store.folder().to_path_buf()
    }

    /// Write the current credentials to `creds.json`.
    pub async fn save_creds(&self) -> Result<(), StoreError> {
        let creds = self.state.creds().await;
        self.store.write_value(CREDS_FILE, &creds).await?;
        debug!("saved credentials to {}", self.store.folder().display());
        Ok(())
    }

    /// Merge a credentials delta and persist the result.
    pub async fn apply_and_save(&self, update: CredsUpdate) -> Result<(), StoreError> {
        self.state.apply_creds_update(update).await;
        self.save_creds().await
    }
}

/// Open a store folder, loading credentials from it or creating new ones.
///
/// New credentials are generated only when `creds.json` does not exist; one
/// that cannot be read or decoded (wrong passphrase, truncated file) is an
/// error and is left untouched. Freshly created credentials are only written
/// by [`MultiFileAuthState::save_creds`].
pub async fn use_multi_file_auth_state(
    folder: impl Into<PathBuf>,
    config: &StoreConfig,
) -> Result<MultiFileAuthState> {
    let store = Arc::new(FileKeyStore::open(folder, config).await?);

    let creds = match store.read_value::<AuthenticationCreds>(CREDS_FILE).await? {
        Some(creds) => {
            debug!(
                registration_id = creds.registration_id,
                "loaded credentials from {}",
                store.folder().display()
            );
            creds
        }
        None => {
            info!("no credentials in {}, generating new ones", store.folder().display());
            init_auth_creds()?
        }
    };

    let keys: Arc<dyn KeyStore> = store.clone();
    Ok(MultiFileAuthState {
        state: SignalAuthState::new(creds, keys),
        store,
    })
}

/// Open the store folder named by `config.store.folder`.
pub async fn use_multi_file_auth_state_from(config: &SignalConfig) -> Result<MultiFileAuthState> {
    let folder = config.store.folder.clone().ok_or(StoreError::NoFolder)?;
    use_multi_file_auth_state(folder, &config.store).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalError;
    use crate::keystore::{Category, KeyRecord, KeyUpdates};

    fn sealed(passphrase: &str) -> StoreConfig {
        StoreConfig {
            folder: None,
            passphrase: Some(passphrase.into()),
            kdf_iterations: 1_000,
        }
    }

    #[tokio::test]
    async fn creds_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let config = StoreConfig::default();

        let first = use_multi_file_auth_state(tmp.path(), &config).await.unwrap();
        first
            .apply_and_save(CredsUpdate {
                next_pre_key_id: Some(31),
                ..Default::default()
            })
            .await
            .unwrap();
        first
            .state
            .keys
            .set(KeyUpdates::new().put("1.0@lid", KeyRecord::Session(vec![1])))
            .await
            .unwrap();
        let saved = first.state.creds().await;
        drop(first);

        let second = use_multi_file_auth_state(tmp.path(), &config).await.unwrap();
        assert_eq!(second.state.creds().await, saved);
        assert!(second.state.keys.get_one(Category::Session, "1.0@lid").await.is_some());
    }

    #[tokio::test]
    async fn sealed_creds_are_not_plain_json() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sealed("pw");
        let auth = use_multi_file_auth_state(tmp.path(), &config).await.unwrap();
        auth.save_creds().await.unwrap();

        let raw = std::fs::read(tmp.path().join(CREDS_FILE)).unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&raw).is_err());

        let reopened = use_multi_file_auth_state(tmp.path(), &config).await.unwrap();
        assert_eq!(reopened.state.creds().await, auth.state.creds().await);
    }

    #[tokio::test]
    async fn wrong_passphrase_does_not_replace_creds() {
        let tmp = tempfile::tempdir().unwrap();
        let auth = use_multi_file_auth_state(tmp.path(), &sealed("pw")).await.unwrap();
        auth.save_creds().await.unwrap();
        let raw = std::fs::read(tmp.path().join(CREDS_FILE)).unwrap();
        drop(auth);

        let result = use_multi_file_auth_state(tmp.path(), &sealed("not pw")).await;
        assert!(matches!(
            result,
            Err(SignalError::Store(StoreError::UnreadableValue { .. }))
        ));
        let unsealed = use_multi_file_auth_state(tmp.path(), &StoreConfig::default()).await;
        assert!(unsealed.is_err());
        assert_eq!(std::fs::read(tmp.path().join(CREDS_FILE)).unwrap(), raw);

        let reopened = use_multi_file_auth_state(tmp.path(), &sealed("pw")).await.unwrap();
        assert_eq!(std::fs::read(tmp.path().join(CREDS_FILE)).unwrap(), raw);
        reopened.save_creds().await.unwrap();
    }

    #[tokio::test]
    async fn truncated_creds_are_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let auth = use_multi_file_auth_state(tmp.path(), &StoreConfig::default())
            .await
            .unwrap();
        auth.save_creds().await.unwrap();
        let raw = std::fs::read(tmp.path().join(CREDS_FILE)).unwrap();
        std::fs::write(tmp.path().join(CREDS_FILE), &raw[..raw.len() / 2]).unwrap();

        let result = use_multi_file_auth_state(tmp.path(), &StoreConfig::default()).await;
        assert!(result.is_err());
        assert_eq!(
            std::fs::read(tmp.path().join(CREDS_FILE)).unwrap(),
            &raw[..raw.len() / 2]
        );
    }

    #[tokio::test]
    async fn opens_the_configured_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let toml = format!("[store]\nfolder = {:?}\n", tmp.path().display().to_string());
        let config = SignalConfig::from_toml_str(&toml).unwrap();

        let auth = use_multi_file_auth_state_from(&config).await.unwrap();
        assert_eq!(auth.folder(), tmp.path());
        auth.save_creds().await.unwrap();
        assert!(tmp.path().join(CREDS_FILE).exists());
    }

    #[tokio::test]
    async fn missing_folder_setting_is_an_error() {
        let result = use_multi_file_auth_state_from(&SignalConfig::default()).await;
        assert!(matches!(result, Err(SignalError::Store(StoreError::NoFolder))));
    }

    #[tokio::test]
    async fn empty_update_is_ignored() {
        let state = SignalAuthState::in_memory().unwrap();
        let before = state.creds().await;
        state.apply_creds_update(CredsUpdate::default()).await;
        assert_eq!(state.creds().await, before);
    }
}

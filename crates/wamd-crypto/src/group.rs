//! Group encryption using Signal's Sender Keys.
//!
//! Each author keeps one sender-key chain per group and shares it with
//! every member device through a distribution message sent pairwise.
//! Which devices already received our chain is tracked per group in the
//! sender-key memory, so fan-out only re-sends it to new devices.

use libsignal_protocol::{
    create_sender_key_distribution_message, group_decrypt, group_encrypt,
    process_sender_key_distribution_message, SenderKeyDistributionMessage,
};
use rand::rngs::OsRng;
use tracing::debug;
use uuid::Uuid;
use wamd_protocol::Address;

use crate::error::{Result, SignalError};
use crate::keystore::{Category, KeyRecord, KeyUpdates};
use crate::session::SignalRepository;
use crate::stores::{load_sender_key_memory, protocol_address, sender_key_id, KeyStoreSenderKeyStore};

/// Distribution id of a group's sender keys, derived from the group id.
pub fn group_distribution_id(group: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("wamd-group-{group}").as_bytes())
}

/// Output of [`SignalRepository::encrypt_group_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEncrypted {
    pub ciphertext: Vec<u8>,
    /// Distribution message for our current chain, to be sent to members lacking it.
    pub sender_key_distribution_message: Vec<u8>,
}

impl SignalRepository {
    fn sender_key_store(&self, group: &str) -> KeyStoreSenderKeyStore {
        KeyStoreSenderKeyStore::new(group, self.auth.keys.clone())
    }

    /// Encrypt a message to a group, creating our sender key if needed.
    pub async fn encrypt_group_message(
        &self,
        group: &str,
        self_address: &Address,
        plaintext: &[u8],
    ) -> Result<GroupEncrypted> {
        let id = sender_key_id(group, self_address);
        let address = protocol_address(self_address);
        let distribution_id = group_distribution_id(group);

        let _guard = self.lock_for(&id).await;
        let mut store = self.sender_key_store(group);

        let distribution =
            create_sender_key_distribution_message(&address, distribution_id, &mut store, &mut OsRng)
                .await?;
        let ciphertext =
            group_encrypt(&mut store, &address, distribution_id, plaintext, &mut OsRng).await?;

        Ok(GroupEncrypted {
            ciphertext: ciphertext.serialized().to_vec(),
            sender_key_distribution_message: distribution.serialized().to_vec(),
        })
    }

    /// Decrypt a group message from `author`.
    pub async fn decrypt_group_message(
        &self,
        group: &str,
        author: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let id = sender_key_id(group, author);
        let address = protocol_address(author);

        let _guard = self.lock_for(&id).await;

        if self.auth.keys.get_one(Category::SenderKey, &id).await.is_none() {
            return Err(SignalError::MissingSenderKey {
                group: group.to_string(),
                author: author.signal_key(),
            });
        }

        let mut store = self.sender_key_store(group);
        group_decrypt(ciphertext, &mut store, &address)
            .await
            .map_err(|source| SignalError::DecryptionFailure { peer: id, source })
    }

    /// Record a sender-key distribution message received from `author`.
    pub async fn process_sender_key_distribution(
        &self,
        group: &str,
        author: &Address,
        payload: &[u8],
    ) -> Result<()> {
        let id = sender_key_id(group, author);
        let address = protocol_address(author);
        let message = SenderKeyDistributionMessage::try_from(payload)?;

        let _guard = self.lock_for(&id).await;
        let mut store = self.sender_key_store(group);

        process_sender_key_distribution_message(&address, &message, &mut store).await?;
        debug!("processed sender key distribution for {id}");
        Ok(())
    }

    /// The subset of `devices` that has not yet received our sender key for `group`.
    pub async fn devices_missing_sender_key(&self, group: &str, devices: &[Address]) -> Vec<Address> {
        let memory = load_sender_key_memory(self.auth.keys.as_ref(), group).await;
        devices
            .iter()
            .filter(|device| !memory.get(&device.signal_key()).copied().unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Remember that `devices` now hold our sender key for `group`.
    pub async fn mark_sender_key_shared(&self, group: &str, devices: &[Address]) -> Result<()> {
        if devices.is_empty() {
            return Ok(());
        }
        let _guard = self.lock_for(&format!("{group}::memory")).await;

        let mut memory = load_sender_key_memory(self.auth.keys.as_ref(), group).await;
        for device in devices {
            memory.insert(device.signal_key(), true);
        }
        self.auth
            .keys
            .set(KeyUpdates::new().put(group, KeyRecord::SenderKeyMemory(memory)))
            .await?;
        Ok(())
    }

    /// Forget which devices hold our sender key, forcing a full re-distribution.
    pub async fn reset_sender_key_memory(&self, group: &str) -> Result<()> {
        self.auth
            .keys
            .set(KeyUpdates::new().delete(Category::SenderKeyMemory, group))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::repository;

    const GROUP: &str = "120363000000000000@g.us";

    #[test]
    fn distribution_id_is_stable_per_group() {
        assert_eq!(group_distribution_id(GROUP), group_distribution_id(GROUP));
        assert_ne!(group_distribution_id(GROUP), group_distribution_id("other@g.us"));
    }

    #[tokio::test]
    async fn distribute_then_decrypt() {
        let alice = repository();
        let bob = repository();
        let alice_addr = Address::lid("111").with_device(1);

        let sent = alice
            .encrypt_group_message(GROUP, &alice_addr, b"hello group")
            .await
            .unwrap();
        assert!(!sent.sender_key_distribution_message.is_empty());

        bob.process_sender_key_distribution(GROUP, &alice_addr, &sent.sender_key_distribution_message)
            .await
            .unwrap();
        // a replayed distribution message leaves the record usable
        bob.process_sender_key_distribution(GROUP, &alice_addr, &sent.sender_key_distribution_message)
            .await
            .unwrap();

        let plaintext = bob
            .decrypt_group_message(GROUP, &alice_addr, &sent.ciphertext)
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello group");

        let second = alice
            .encrypt_group_message(GROUP, &alice_addr, b"again")
            .await
            .unwrap();
        assert_eq!(
            bob.decrypt_group_message(GROUP, &alice_addr, &second.ciphertext)
                .await
                .unwrap(),
            b"again"
        );
    }

    #[tokio::test]
    async fn missing_sender_key_is_reported() {
        let alice = repository();
        let bob = repository();
        let alice_addr = Address::phone("111", 0);
        let sent = alice
            .encrypt_group_message(GROUP, &alice_addr, b"x")
            .await
            .unwrap();

        let result = bob.decrypt_group_message(GROUP, &alice_addr, &sent.ciphertext).await;
        assert!(matches!(result, Err(SignalError::MissingSenderKey { .. })));
    }

    #[tokio::test]
    async fn sender_keys_are_scoped_by_namespace() {
        let alice = repository();
        let bob = repository();
        let phone = Address::phone("111", 0);
        let lid = Address::lid("111");

        let sent = alice.encrypt_group_message(GROUP, &phone, b"x").await.unwrap();
        bob.process_sender_key_distribution(GROUP, &phone, &sent.sender_key_distribution_message)
            .await
            .unwrap();
        let result = bob.decrypt_group_message(GROUP, &lid, &sent.ciphertext).await;
        assert!(matches!(result, Err(SignalError::MissingSenderKey { .. })));
    }

    #[tokio::test]
    async fn sender_key_memory_tracks_fan_out() {
        let repo = repository();
        let a1 = Address::phone("1", 0);
        let a2 = Address::phone("1", 2);
        let b = Address::lid("9");
        let devices = vec![a1.clone(), a2.clone(), b.clone()];

        assert_eq!(repo.devices_missing_sender_key(GROUP, &devices).await, devices);

        repo.mark_sender_key_shared(GROUP, &[a1.clone(), b.clone()]).await.unwrap();
        assert_eq!(repo.devices_missing_sender_key(GROUP, &devices).await, vec![a2.clone()]);
        assert_eq!(
            repo.devices_missing_sender_key("other@g.us", &devices).await,
            devices
        );

        repo.reset_sender_key_memory(GROUP).await.unwrap();
        assert_eq!(repo.devices_missing_sender_key(GROUP, &devices).await, devices);
    }
}

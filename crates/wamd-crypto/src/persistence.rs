//! At-rest sealing for key store files.
//!
//! Uses the same PBKDF2 + AES-256-GCM construction for every record. The
//! key is derived once per store from a passphrase and a per-folder salt;
//! each file gets a fresh nonce, and its file name is bound into the AAD
//! so a sealed record cannot be replayed under a different id.

use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroize;

const MAGIC: &[u8; 4] = b"WKEY"; // "WhatsApp KEY store"
const VERSION: u8 = 0x01;
pub const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + 1 + NONCE_LEN + 4; // 21 bytes

/// Default PBKDF2 work factor.
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

/// Seals and opens record bodies with a key derived from a passphrase.
pub struct RecordSealer {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl RecordSealer {
    /// Derive the 256-bit AES-GCM key from passphrase and salt.
    pub fn derive(passphrase: &str, salt: &[u8; SALT_LEN], iterations: u32) -> anyhow::Result<Self> {
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| anyhow::anyhow!("KDF iteration count must be non-zero"))?;

        let mut key_bytes = [0u8; 32];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            passphrase.as_bytes(),
            &mut key_bytes,
        );
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| anyhow::anyhow!("invalid key length"));
        key_bytes.zeroize();

        Ok(Self {
            key: LessSafeKey::new(unbound?),
            rng: SystemRandom::new(),
        })
    }

    /// Generate a fresh random salt for a new store folder.
    pub fn generate_salt() -> anyhow::Result<[u8; SALT_LEN]> {
        let mut salt = [0u8; SALT_LEN];
        SystemRandom::new()
            .fill(&mut salt)
            .map_err(|_| anyhow::anyhow!("RNG failed"))?;
        Ok(salt)
    }

    fn aad(file_name: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(5 + file_name.len());
        aad.extend_from_slice(MAGIC);
        aad.push(VERSION);
        aad.extend_from_slice(file_name.as_bytes());
        aad
    }

    /// Seal a record body for storage under `file_name`.
    ///
    /// Format: [WKEY magic(4)] [version(1)] [nonce(12)] [length(4)] [encrypted payload + tag(16)]
    pub fn seal(&self, file_name: &str, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow::anyhow!("RNG failed"))?;

        let mut in_out = plaintext.to_vec();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(Self::aad(file_name)), &mut in_out)
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;

        let payload_len = u32::try_from(in_out.len())
            .map_err(|_| anyhow::anyhow!("record too large: {} bytes", in_out.len()))?;
        let mut file_data = Vec::with_capacity(HEADER_LEN + in_out.len());
        file_data.extend_from_slice(MAGIC);
        file_data.push(VERSION);
        file_data.extend_from_slice(&nonce_bytes);
        file_data.extend_from_slice(&payload_len.to_be_bytes());
        file_data.extend_from_slice(&in_out);

        Ok(file_data)
    }

    /// Open a record sealed under `file_name`.
    pub fn open(&self, file_name: &str, file_data: &[u8]) -> anyhow::Result<Vec<u8>> {
        if !has_valid_header(file_data) {
            anyhow::bail!("invalid record format (expected WKEY header)");
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&file_data[5..5 + NONCE_LEN]);

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&file_data[5 + NONCE_LEN..HEADER_LEN]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;

        if file_data.len() < HEADER_LEN + payload_len {
            anyhow::bail!("record truncated");
        }

        let mut ciphertext = file_data[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(Self::aad(file_name)), &mut ciphertext)
            .map_err(|_| anyhow::anyhow!("incorrect passphrase or corrupted record"))?;

        Ok(plaintext.to_vec())
    }
}

/// Check if file data starts with a valid WKEY header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && &file_data[0..4] == MAGIC && file_data[4] == VERSION
}

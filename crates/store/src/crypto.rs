/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use aes_gcm_siv::{
    Aes256GcmSiv, Nonce,
    aead::{Aead, KeyInit},
};
use sha2::{Digest, Sha256};
use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use utils::codec::dumb::TAG_ENCRYPTED;

pub const NONCE_LEN: usize = 12;

/// Salted one-way hash used for hashed keys and key fingerprints:
/// `sha256(salt ‖ data ‖ salt)`.
pub fn salted_hash(salt: &[u8], data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(data);
    hasher.update(salt);
    hasher.finalize().into()
}

/// Fingerprint of the caller-supplied master key, written into file
/// prefixes so wrong-key opens fail fast without trial decryption. The
/// master key is fingerprinted before derivation.
pub fn encryption_id(salt: &[u8], master_key: Option<&[u8]>) -> String {
    match master_key {
        None => "no".to_string(),
        Some(key) => {
            let mut data = Vec::with_capacity(key.len() + 6);
            data.extend_from_slice(b"KEY-ID");
            data.extend_from_slice(key);
            salted_hash(salt, &data)
                .iter()
                .take(8)
                .map(|byte| format!("{byte:02x}"))
                .collect()
        }
    }
}

/// Derives the working key from a caller-supplied master key of any
/// length by mixing it with the file's prefix string, so two files
/// sharing a master key never share a data key.
pub fn derive_key(prefix: &[u8], master_key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prefix);
    hasher.update(master_key);
    hasher.update(prefix);
    hasher.finalize().into()
}

/// Authenticated record envelope. Each sealed record carries a fresh
/// nonce built from a monotonic counter mixed with the wall clock; the
/// counter protects against clock jumps.
pub struct RecordCipher {
    cipher: Aes256GcmSiv,
    counter: AtomicU32,
}

impl std::fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCipher").finish_non_exhaustive()
    }
}

impl RecordCipher {
    pub fn new(prefix: &[u8], master_key: &[u8]) -> Self {
        let key = derive_key(prefix, master_key);
        RecordCipher {
            cipher: Aes256GcmSiv::new((&key).into()),
            counter: AtomicU32::new(0),
        }
    }

    fn next_nonce(&self) -> [u8; NONCE_LEN] {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&counter.to_le_bytes());
        nonce[4..8].copy_from_slice(&(now.as_secs() as u32).to_le_bytes());
        nonce[8..].copy_from_slice(&now.subsec_micros().to_le_bytes());
        nonce
    }

    /// Wraps a tagged payload as `e ‖ nonce ‖ ciphertext`.
    pub fn seal(&self, payload: &[u8]) -> trc::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| {
                trc::StoreEvent::UnexpectedError
                    .caused_by(trc::location!())
                    .details("encryption failed")
            })?;
        let mut sealed = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        sealed.push(TAG_ENCRYPTED);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Unwraps an `e` envelope; authentication failure is a per-record
    /// corruption.
    pub fn open(&self, sealed: &[u8]) -> trc::Result<Vec<u8>> {
        let body = sealed
            .strip_prefix(&[TAG_ENCRYPTED])
            .filter(|body| body.len() > NONCE_LEN)
            .ok_or_else(|| {
                trc::StoreEvent::DecryptError
                    .caused_by(trc::location!())
                    .details("not an encrypted envelope")
            })?;
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                trc::StoreEvent::DecryptError
                    .caused_by(trc::location!())
                    .details("authentication failed")
            })
    }
}

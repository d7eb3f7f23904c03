//! Frame encryption for encrypted peers
//!
//! Unicast frames to encrypted peers are sealed with AES-256-GCM. The frame
//! key is derived with HKDF-SHA256 from the peer's local master key, salted
//! with the primary master key. Sealed frames are `[nonce (12)][ciphertext]`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use super::error::RadioError;
use super::radio::KEY_LEN;

/// Size of the nonce (96 bits for AES-GCM)
const NONCE_SIZE: usize = 12;

/// Size of the authentication tag (AES-GCM)
pub const TAG_SIZE: usize = 16;

/// Bytes added to a frame by sealing it
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

const FRAME_KEY_INFO: &[u8] = b"moodlink-frame-key";

/// Seals and opens frames under a primary master key
#[derive(Clone)]
pub struct FrameCipher {
    pmk: [u8; KEY_LEN],
}

impl FrameCipher {
    pub fn new(pmk: [u8; KEY_LEN]) -> Self {
        Self { pmk }
    }

    fn cipher_for(&self, lmk: &[u8; KEY_LEN]) -> Result<Aes256Gcm, RadioError> {
        let hk = Hkdf::<Sha256>::new(Some(&self.pmk), lmk);
        let mut key_bytes = [0u8; 32];
        hk.expand(FRAME_KEY_INFO, &mut key_bytes)
            .map_err(|e| RadioError::Encryption(e.to_string()))?;

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Aes256Gcm::new(key))
    }

    /// Encrypt a frame for a peer holding `lmk`
    pub fn seal(&self, lmk: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, RadioError> {
        let cipher = self.cipher_for(lmk)?;
        let nonce_bytes: [u8; NONCE_SIZE] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| RadioError::Encryption("Encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a frame sealed for `lmk`
    pub fn open(&self, lmk: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, RadioError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(RadioError::Encryption("Sealed frame too short".to_string()));
        }

        let cipher = self.cipher_for(lmk)?;
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| RadioError::Encryption("Decryption failed".to_string()))
    }
}

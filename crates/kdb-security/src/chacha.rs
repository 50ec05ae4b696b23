use crate::{CryptoError, CryptoProvider};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use std::fmt;
use zeroize::Zeroizing;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12; // IETF ChaCha20

const KEY_CONTEXT: &[u8] = b"kdb/kek-key/v1";
const NONCE_CONTEXT: &[u8] = b"kdb/kek-nonce/v1";

/// ChaCha20 keystream provider.
///
/// Stream ciphers keep the ciphertext the same length as the plaintext,
/// which the fixed 512-byte KEK field requires.
pub struct ChaChaCrypto {
    key: Zeroizing<[u8; KEY_SIZE]>,
    nonce: [u8; NONCE_SIZE],
}

impl ChaChaCrypto {
    pub fn new(key: [u8; KEY_SIZE], nonce: [u8; NONCE_SIZE]) -> Self {
        Self {
            key: Zeroizing::new(key),
            nonce,
        }
    }

    /// Derives key and nonce from a passphrase with domain-separated SHA3-256.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        if passphrase.is_empty() {
            return Err(CryptoError::InvalidKey("empty passphrase"));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&derive(KEY_CONTEXT, passphrase)[..KEY_SIZE]);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&derive(NONCE_CONTEXT, passphrase)[..NONCE_SIZE]);

        let crypto = Self::new(key, nonce);
        zeroize::Zeroize::zeroize(&mut key);
        Ok(crypto)
    }

    fn apply_keystream(&self, buf: &[u8]) -> Vec<u8> {
        let mut out = buf.to_vec();
        let mut cipher = ChaCha20::new(Key::from_slice(&self.key[..]), Nonce::from_slice(&self.nonce));
        cipher.apply_keystream(&mut out);
        out
    }
}

fn derive(context: &[u8], passphrase: &str) -> Zeroizing<Vec<u8>> {
    let mut hasher = Sha3_256::new();
    hasher.update(context);
    hasher.update(passphrase.as_bytes());
    Zeroizing::new(hasher.finalize().to_vec())
}

impl CryptoProvider for ChaChaCrypto {
    fn name(&self) -> &'static str {
        "chacha20"
    }

    fn encrypt(&self, buf: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.apply_keystream(buf))
    }

    fn decrypt(&self, buf: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.apply_keystream(buf))
    }

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        Ok(buf)
    }
}

impl fmt::Debug for ChaChaCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaChaCrypto").finish_non_exhaustive()
    }
}

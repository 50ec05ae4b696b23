//! Non-production providers. `NoopCrypto` exists for tests; `XorCrypto` is an
//! illustration of the provider contract and offers no real protection.

use crate::{CryptoError, CryptoProvider};
use rand::RngCore;
use zeroize::Zeroizing;

/// Identity transform with all-zero "entropy".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCrypto;

impl CryptoProvider for NoopCrypto {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn encrypt(&self, buf: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(buf.to_vec())
    }

    fn decrypt(&self, buf: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(buf.to_vec())
    }

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        Ok(vec![0u8; len])
    }
}

/// Repeating-key XOR.
pub struct XorCrypto {
    key: Zeroizing<Vec<u8>>,
}

impl XorCrypto {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let key = Zeroizing::new(key.into());
        if key.is_empty() {
            return Err(CryptoError::InvalidKey("empty xor key"));
        }
        Ok(Self { key })
    }

    fn xor(&self, buf: &[u8]) -> Vec<u8> {
        buf.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl CryptoProvider for XorCrypto {
    fn name(&self) -> &'static str {
        "xor-sample"
    }

    fn encrypt(&self, buf: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.xor(buf))
    }

    fn decrypt(&self, buf: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.xor(buf))
    }

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        Ok(buf)
    }
}

use crate::{CryptoError, CryptoProvider};
use kdb_common::KEK_LEN;
use std::fmt;
use zeroize::Zeroizing;

/// Cleartext key-encryption-key. Lives only in memory and is wiped on drop.
pub struct Kek(Zeroizing<Vec<u8>>);

impl Kek {
    /// Draws a fresh KEK from the provider's entropy source.
    pub fn generate(provider: &dyn CryptoProvider) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(provider.generate_random(KEK_LEN)?);
        Self::from_bytes(bytes)
    }

    /// Encrypts the KEK into the form stored in the header.
    pub fn seal(&self, provider: &dyn CryptoProvider) -> Result<[u8; KEK_LEN], CryptoError> {
        let sealed = provider.encrypt(&self.0)?;
        if sealed.len() != KEK_LEN {
            return Err(CryptoError::LengthMismatch {
                expected: KEK_LEN,
                found: sealed.len(),
            });
        }
        let mut out = [0u8; KEK_LEN];
        out.copy_from_slice(&sealed);
        Ok(out)
    }

    /// Recovers the KEK from its sealed header form.
    pub fn unseal(provider: &dyn CryptoProvider, sealed: &[u8; KEK_LEN]) -> Result<Self, CryptoError> {
        let clear = Zeroizing::new(provider.decrypt(sealed)?);
        Self::from_bytes(clear)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn from_bytes(bytes: Zeroizing<Vec<u8>>) -> Result<Self, CryptoError> {
        if bytes.len() != KEK_LEN {
            return Err(CryptoError::LengthMismatch {
                expected: KEK_LEN,
                found: bytes.len(),
            });
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Kek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Kek(<redacted>)")
    }
}

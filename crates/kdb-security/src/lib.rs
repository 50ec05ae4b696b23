pub mod chacha;
pub mod kek;
pub mod sample;

pub use chacha::ChaChaCrypto;
pub use kek::Kek;
pub use sample::{NoopCrypto, XorCrypto};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Entropy source failed: {0}")]
    Entropy(String),
    #[error("Invalid key: {0}")]
    InvalidKey(&'static str),
    #[error("Length mismatch: expected {expected} bytes, got {found}")]
    LengthMismatch { expected: usize, found: usize },
}

/// Symmetric protection for the key-encryption-key at rest.
///
/// `encrypt` and `decrypt` are length-preserving mutual inverses. A provider
/// knows nothing about the header format; the kernel decides what to feed it.
pub trait CryptoProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn encrypt(&self, buf: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, buf: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Fills a fresh buffer of `len` bytes with provider-chosen entropy.
    fn generate_random(&self, len: usize) -> Result<Vec<u8>, CryptoError>;
}

use thiserror::Error;

/// Header identity/version failures. Fatal to bring-up, never repaired.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Bad identity: expected db tag {expected:#04x}, found {found:#04x}")]
    BadIdentity { expected: u8, found: u8 },

    #[error("Bad version: expected {expected:02x?}, found {found:02x?}")]
    BadVersion { expected: [u8; 2], found: [u8; 2] },

    #[error("Header checksum mismatch")]
    ChecksumMismatch,
}

/// A value does not fit the fixed width of its on-disk field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("Field `{field}` holds {len} bytes, limit is {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

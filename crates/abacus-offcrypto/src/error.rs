use thiserror::Error;

/// Errors returned by this crate.
///
/// Every failure is typed and surfaced to the caller; nothing is downgraded to
/// an "open anyway" success. [`OffCryptoError::InvalidPassword`] is the only
/// variant a caller should treat as retryable.
#[derive(Debug, Error)]
pub enum OffCryptoError {
    /// The password verifier check failed.
    #[error("invalid password")]
    InvalidPassword,

    /// Recognized container, but the cipher/hash/version combination (or the
    /// whole scheme, e.g. XOR obfuscation or certificate key encryptors) is
    /// not implemented.
    #[error("unsupported encryption scheme: {0}")]
    UnsupportedScheme(String),

    /// A required stream or header is missing or structurally invalid.
    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    /// The Agile `dataIntegrity` HMAC did not match the `EncryptedPackage`
    /// stream, after the password verifier already passed.
    #[error("package integrity check failed")]
    IntegrityMismatch,

    /// DoS guard: the file declared an Agile spin count above the configured
    /// maximum. Returned before the key-derivation loop runs.
    #[error("spin count {spin_count} exceeds configured maximum {max}")]
    SpinCountTooLarge { spin_count: u32, max: u32 },

    /// The declared plaintext size needs more ciphertext than the stream has.
    #[error("EncryptedPackage is truncated: need {expected} ciphertext bytes, got {got}")]
    TruncatedPackage { expected: usize, got: usize },

    /// A caller-provided cancellation flag was observed mid key derivation.
    #[error("operation cancelled")]
    Cancelled,

    /// Container stream access failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

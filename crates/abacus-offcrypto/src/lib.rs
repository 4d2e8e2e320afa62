//! Password encryption/decryption for Office spreadsheet containers
//! (MS-OFFCRYPTO).
//!
//! Supported schemes:
//! - **Agile** encryption (XML descriptor, Office 2010+): decrypt and encrypt,
//!   including `dataIntegrity` HMAC validation.
//! - **Standard / CryptoAPI** encryption (binary descriptor, Office 2007-era,
//!   AES subset): decrypt.
//! - **Legacy BIFF8 `FILEPASS`** RC4 CryptoAPI workbook streams: decrypt.
//!
//! The OOXML schemes live inside an OLE/CFB container as the `EncryptionInfo`
//! and `EncryptedPackage` streams; this crate consumes the container through
//! the `cfb` crate's named-stream interface and never parses sector chains
//! itself. Decrypted output is raw package bytes (for OOXML, the ZIP/OPC
//! archive) and is handed to the caller uninterpreted.
//!
//! Secrets (passwords, intermediate hash states, derived keys) are held in
//! zeroize-on-drop buffers, verifier comparisons are constant-time, and the
//! file-declared Agile spin count is clamped before the key-derivation loop
//! runs.

mod agile;
mod agile_writer;
mod biff;
mod crypto;
mod error;
mod info;
mod rc4;
mod standard;
mod util;

use std::io::{Cursor, Read, Seek, Write as _};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rand::{CryptoRng, RngCore};

pub use crate::agile::agile_derive_key_material;
pub use crate::biff::{
    decrypt_biff_filepass, decrypt_biff_filepass_in_place,
    decrypt_biff_filepass_in_place_with_options, parse_filepass_payload, BiffFilepassRecord,
};
pub use crate::crypto::{DerivedKeyMaterial, HashAlgorithm};
pub use crate::error::OffCryptoError;
pub use crate::info::{
    classify_encryption_info, parse_encryption_descriptor, AgileDataIntegrity,
    AgileEncryptionInfo, AgileKeyData, AgilePasswordKeyEncryptor, DetectedScheme,
    EncryptionDescriptor, EncryptionVersionInfo, SchemeInfo, StandardEncryptionHeader,
    StandardEncryptionVerifier,
};
pub use crate::standard::standard_derive_key;

const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Default ceiling for the file-declared Agile spin count.
///
/// Office writes 100,000; the guard leaves generous headroom while keeping a
/// hostile descriptor from pinning a core for minutes.
pub const DEFAULT_MAX_SPIN_COUNT: u32 = 250_000;

/// Knobs for a decryption attempt.
#[derive(Debug, Clone)]
pub struct DecryptOptions {
    /// Reject Agile descriptors declaring a spin count above this value.
    pub max_spin_count: u32,
    /// Validate the Agile `dataIntegrity` HMAC when the descriptor carries
    /// one. On by default.
    pub verify_integrity: bool,
    /// Cooperative cancellation flag, polled once per KDF iteration.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for DecryptOptions {
    fn default() -> Self {
        Self {
            max_spin_count: DEFAULT_MAX_SPIN_COUNT,
            verify_integrity: true,
            cancel: None,
        }
    }
}

/// Scheme selector for the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionScheme {
    Agile,
    Standard,
}

/// Parameters for [`encrypt`]. The defaults match what current Excel writes;
/// override them only for explicit compatibility needs.
#[derive(Debug, Clone)]
pub struct EncryptOptions {
    pub scheme: EncryptionScheme,
    pub key_bits: usize,
    pub hash_algorithm: HashAlgorithm,
    pub spin_count: u32,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            scheme: EncryptionScheme::Agile,
            key_bits: 256,
            hash_algorithm: HashAlgorithm::Sha512,
            spin_count: 100_000,
        }
    }
}

fn stream_exists<F: Read + Seek>(ole: &mut cfb::CompoundFile<F>, name: &str) -> bool {
    ole.open_stream(name).is_ok()
}

fn read_stream_bytes<F: Read + Seek>(
    ole: &mut cfb::CompoundFile<F>,
    name: &str,
) -> Result<Vec<u8>, OffCryptoError> {
    let mut stream = ole.open_stream(name).map_err(|_| {
        OffCryptoError::CorruptContainer(format!("missing `{name}` stream"))
    })?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Classify an encrypted container without attempting decryption.
///
/// Recognizes OOXML `EncryptionInfo`/`EncryptedPackage` wrappers (Standard,
/// Agile, or an unsupported version pair) and legacy BIFF workbook streams
/// carrying a `FILEPASS` record. Returns `None` for anything that is not a
/// recognizable encrypted container.
pub fn detect_encryption(container: &[u8]) -> Option<SchemeInfo> {
    if container.len() < OLE_MAGIC.len() || container[..OLE_MAGIC.len()] != OLE_MAGIC {
        return None;
    }
    let mut ole = cfb::CompoundFile::open(Cursor::new(container)).ok()?;

    if stream_exists(&mut ole, "EncryptionInfo") && stream_exists(&mut ole, "EncryptedPackage") {
        let info = read_stream_bytes(&mut ole, "EncryptionInfo").ok()?;
        return classify_encryption_info(&info).ok();
    }

    // Legacy `.xls`: the workbook stream is named "Workbook" in BIFF8 ("Book"
    // in older files).
    for name in ["Workbook", "Book"] {
        if stream_exists(&mut ole, name) {
            let stream = read_stream_bytes(&mut ole, name).ok()?;
            if biff::workbook_stream_has_filepass(&stream) {
                return Some(SchemeInfo {
                    scheme: DetectedScheme::BiffFilepass,
                    version: None,
                });
            }
            return None;
        }
    }
    None
}

/// Decrypt an encrypted OOXML OLE/CFB container with default options.
pub fn decrypt(container: &[u8], password: &str) -> Result<Vec<u8>, OffCryptoError> {
    decrypt_with_options(container, password, &DecryptOptions::default())
}

/// Decrypt an encrypted OOXML OLE/CFB container.
///
/// Reads the `EncryptionInfo` and `EncryptedPackage` streams, dispatches on
/// the detected scheme, and returns the plaintext package bytes.
pub fn decrypt_with_options(
    container: &[u8],
    password: &str,
    options: &DecryptOptions,
) -> Result<Vec<u8>, OffCryptoError> {
    let mut ole = cfb::CompoundFile::open(Cursor::new(container)).map_err(|err| {
        OffCryptoError::CorruptContainer(format!("not an OLE/CFB container: {err}"))
    })?;
    let encryption_info = read_stream_bytes(&mut ole, "EncryptionInfo")?;
    let encrypted_package = read_stream_bytes(&mut ole, "EncryptedPackage")?;
    decrypt_package(&encryption_info, &encrypted_package, password, options)
}

/// Decrypt from raw `EncryptionInfo` and `EncryptedPackage` stream bytes.
///
/// This is the container-free entry point for callers that already hold the
/// two streams.
pub fn decrypt_package(
    encryption_info: &[u8],
    encrypted_package: &[u8],
    password: &str,
    options: &DecryptOptions,
) -> Result<Vec<u8>, OffCryptoError> {
    match parse_encryption_descriptor(encryption_info)? {
        EncryptionDescriptor::Standard {
            header, verifier, ..
        } => {
            log::debug!("decrypting a Standard (CryptoAPI) EncryptedPackage");
            standard::decrypt_standard_package(
                &header,
                &verifier,
                encrypted_package,
                password,
                options,
            )
        }
        EncryptionDescriptor::Agile { info, .. } => {
            log::debug!("decrypting an Agile EncryptedPackage");
            agile::decrypt_agile_package(&info, encrypted_package, password, options)
        }
    }
}

/// Encrypt package bytes into a new OLE/CFB container using entropy from the
/// OS random number generator.
pub fn encrypt(
    package: &[u8],
    password: &str,
    options: &EncryptOptions,
) -> Result<Vec<u8>, OffCryptoError> {
    encrypt_with_rng(package, password, options, &mut rand::rng())
}

/// Encrypt package bytes into a new OLE/CFB container with a caller-provided
/// CSPRNG (useful for deterministic tests).
pub fn encrypt_with_rng(
    package: &[u8],
    password: &str,
    options: &EncryptOptions,
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<Vec<u8>, OffCryptoError> {
    let (encryption_info, encrypted_package) = match options.scheme {
        EncryptionScheme::Agile => {
            agile_writer::encrypt_agile_streams(package, password, options, rng)?
        }
        EncryptionScheme::Standard => {
            return Err(OffCryptoError::UnsupportedScheme(
                "Standard encryption writer".to_string(),
            ))
        }
    };

    let mut ole = cfb::CompoundFile::create(Cursor::new(Vec::new()))?;
    ole.create_stream("EncryptionInfo")?
        .write_all(&encryption_info)?;
    ole.create_stream("EncryptedPackage")?
        .write_all(&encrypted_package)?;
    Ok(ole.into_inner().into_inner())
}

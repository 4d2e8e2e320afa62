//! Legacy BIFF8 `FILEPASS` (RC4 CryptoAPI) workbook-stream decryption.
//!
//! Only record payload bytes are ciphertext; the 4-byte record headers stay
//! plaintext so the stream can be walked without decrypting. The RC4
//! keystream is re-keyed every 1024 bytes of cumulative payload, with the
//! block index incrementing per re-key.
//!
//! After a successful decryption the `FILEPASS` record id is overwritten with
//! `0xFFFF` (its length is left intact) so non-crypto-aware BIFF consumers can
//! walk the stream without any offset drift.

use zeroize::Zeroizing;

use crate::crypto::{spin_hash, HashAlgorithm};
use crate::error::OffCryptoError;
use crate::rc4::Rc4;
use crate::util::{ct_eq, password_to_utf16le, Reader};

const RECORD_FILEPASS: u16 = 0x002F;
const RECORD_BOF: u16 = 0x0809;
const RECORD_EOF: u16 = 0x000A;
// Not a defined BIFF record id; used to mask FILEPASS after decryption.
const RECORD_MASKED: u16 = 0xFFFF;

// FILEPASS.wEncryptionType values [MS-XLS] 2.4.117.
const ENCRYPTION_TYPE_XOR: u16 = 0x0000;
const ENCRYPTION_TYPE_RC4: u16 = 0x0001;
// For wEncryptionType == 0x0001, the next u16 is the EncryptionVersionInfo
// major: 1 selects the legacy (non-CryptoAPI) RC4 layout, 2-4 select RC4
// CryptoAPI.
const ENCRYPTION_SUBTYPE_LEGACY_RC4: u16 = 0x0001;

// CryptoAPI algorithm identifiers.
const CALG_RC4: u32 = 0x0000_6801;
const CALG_SHA1: u32 = 0x0000_8004;

// Fixed iteration count of the FILEPASS CryptoAPI password hash.
const FILEPASS_SPIN_COUNT: u32 = 50_000;

/// RC4 re-keying interval, in bytes of cumulative record payload.
const PAYLOAD_BLOCK_LEN: usize = 1024;

const MAX_ENCRYPTION_HEADER_SIZE: usize = 4096;

/// Parsed `FILEPASS` record payload (RC4 CryptoAPI subset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiffFilepassRecord {
    pub encryption_type: u16,
    pub encryption_sub_type: u16,
    pub key_size_bits: u32,
    pub salt: [u8; 16],
    pub encrypted_verifier: [u8; 16],
    pub encrypted_verifier_hash: [u8; 20],
}

impl BiffFilepassRecord {
    /// RC4 key length in bytes: 40-bit keys are 5 bytes, 56-bit 7, 128-bit 16.
    pub fn key_len(&self) -> usize {
        (self.key_size_bits / 8) as usize
    }
}

/// Parse a `FILEPASS` record payload (the record header is not included).
pub fn parse_filepass_payload(data: &[u8]) -> Result<BiffFilepassRecord, OffCryptoError> {
    let mut r = Reader::new(data);
    let encryption_type = r.read_u16_le("FILEPASS.wEncryptionType")?;
    match encryption_type {
        ENCRYPTION_TYPE_RC4 => {}
        ENCRYPTION_TYPE_XOR => {
            return Err(OffCryptoError::UnsupportedScheme(
                "BIFF XOR obfuscation".to_string(),
            ))
        }
        other => {
            return Err(OffCryptoError::UnsupportedScheme(format!(
                "FILEPASS wEncryptionType 0x{other:04X}"
            )))
        }
    }

    let encryption_sub_type = r.read_u16_le("FILEPASS.wEncryptionSubType")?;
    match encryption_sub_type {
        2..=4 => {}
        ENCRYPTION_SUBTYPE_LEGACY_RC4 => {
            return Err(OffCryptoError::UnsupportedScheme(
                "BIFF8 legacy RC4".to_string(),
            ))
        }
        other => {
            return Err(OffCryptoError::UnsupportedScheme(format!(
                "FILEPASS RC4 subtype 0x{other:04X}"
            )))
        }
    }

    let _version_minor = r.read_u16_le("FILEPASS.vMinor")?;
    let _flags = r.read_u32_le("FILEPASS.flags")?;
    let header_size = r.read_u32_le("FILEPASS.headerSize")? as usize;
    if header_size > MAX_ENCRYPTION_HEADER_SIZE {
        return Err(OffCryptoError::CorruptContainer(format!(
            "FILEPASS headerSize {header_size} exceeds maximum {MAX_ENCRYPTION_HEADER_SIZE}"
        )));
    }
    let header_bytes = r.take(header_size, "FILEPASS.EncryptionHeader")?;
    if header_bytes.len() < 8 * 4 {
        return Err(OffCryptoError::CorruptContainer(
            "FILEPASS EncryptionHeader is missing fixed fields".to_string(),
        ));
    }

    let mut hr = Reader::new(header_bytes);
    let _header_flags = hr.read_u32_le("EncryptionHeader.flags")?;
    let _size_extra = hr.read_u32_le("EncryptionHeader.sizeExtra")?;
    let alg_id = hr.read_u32_le("EncryptionHeader.algId")?;
    let alg_id_hash = hr.read_u32_le("EncryptionHeader.algIdHash")?;
    let key_size_bits = hr.read_u32_le("EncryptionHeader.keySize")?;
    if alg_id != CALG_RC4 {
        return Err(OffCryptoError::UnsupportedScheme(format!(
            "FILEPASS cipher AlgID 0x{alg_id:08X}"
        )));
    }
    if alg_id_hash != CALG_SHA1 {
        return Err(OffCryptoError::UnsupportedScheme(format!(
            "FILEPASS hash AlgIDHash 0x{alg_id_hash:08X}"
        )));
    }
    // keySize == 0 means 40-bit RC4 (legacy export restrictions).
    let key_size_bits = if key_size_bits == 0 { 40 } else { key_size_bits };
    if !matches!(key_size_bits, 40 | 56 | 128) {
        return Err(OffCryptoError::UnsupportedScheme(format!(
            "FILEPASS RC4 keySize {key_size_bits}"
        )));
    }

    let salt_size = r.read_u32_le("EncryptionVerifier.saltSize")?;
    if salt_size != 16 {
        return Err(OffCryptoError::CorruptContainer(format!(
            "FILEPASS saltSize {salt_size} (expected 16)"
        )));
    }
    let mut salt = [0u8; 16];
    salt.copy_from_slice(r.take(16, "EncryptionVerifier.salt")?);
    let mut encrypted_verifier = [0u8; 16];
    encrypted_verifier.copy_from_slice(r.take(16, "EncryptionVerifier.encryptedVerifier")?);
    let verifier_hash_size = r.read_u32_le("EncryptionVerifier.verifierHashSize")?;
    if verifier_hash_size != 20 {
        return Err(OffCryptoError::CorruptContainer(format!(
            "FILEPASS verifierHashSize {verifier_hash_size} (expected 20 for SHA-1)"
        )));
    }
    let mut encrypted_verifier_hash = [0u8; 20];
    encrypted_verifier_hash
        .copy_from_slice(r.take(20, "EncryptionVerifier.encryptedVerifierHash")?);

    Ok(BiffFilepassRecord {
        encryption_type,
        encryption_sub_type,
        key_size_bits,
        salt,
        encrypted_verifier,
        encrypted_verifier_hash,
    })
}

/// FILEPASS CryptoAPI key material:
///
/// ```text
/// H0 = SHA1(UTF16LE(password))
/// H  = SHA1(salt || H0)
/// H  = SHA1(LE32(i) || H)   for i in 0..50000
/// ```
fn derive_key_material(
    password: &str,
    salt: &[u8],
    cancel: Option<&std::sync::atomic::AtomicBool>,
) -> Result<Zeroizing<Vec<u8>>, OffCryptoError> {
    let password_utf16 = password_to_utf16le(password);
    let h_pw = Zeroizing::new(HashAlgorithm::Sha1.digest(&password_utf16));
    let h0 = Zeroizing::new(HashAlgorithm::Sha1.digest_chunks(&[salt, &h_pw]));
    spin_hash(h0, HashAlgorithm::Sha1, FILEPASS_SPIN_COUNT, cancel)
}

/// Per-block RC4 key: `SHA1(H || LE32(block))` truncated to the key length.
fn derive_block_key(h: &[u8], block: u32, key_len: usize) -> Zeroizing<Vec<u8>> {
    let mut digest = Zeroizing::new(
        HashAlgorithm::Sha1.digest_chunks(&[h, &block.to_le_bytes()]),
    );
    digest.truncate(key_len);
    digest
}

/// Check the password against the verifier fields.
///
/// Verifier and verifier hash are decrypted sequentially with the block-0 RC4
/// keystream; `SHA1(verifier)` must match the decrypted hash (constant-time).
fn verify_password(
    record: &BiffFilepassRecord,
    key_material: &[u8],
) -> Result<(), OffCryptoError> {
    let key0 = derive_block_key(key_material, 0, record.key_len());
    let mut rc4 = Rc4::new(&key0);

    let mut buf = Zeroizing::new([0u8; 36]);
    buf[..16].copy_from_slice(&record.encrypted_verifier);
    buf[16..].copy_from_slice(&record.encrypted_verifier_hash);
    rc4.apply_keystream(&mut buf[..]);

    let digest = Zeroizing::new(HashAlgorithm::Sha1.digest(&buf[..16]));
    if !ct_eq(&digest, &buf[16..]) {
        return Err(OffCryptoError::InvalidPassword);
    }
    Ok(())
}

/// RC4 keystream over record payload bytes, re-keyed every 1024 bytes of
/// cumulative payload. Record headers never advance the payload position.
struct PayloadCipher<'a> {
    key_material: &'a [u8],
    key_len: usize,
    rc4: Rc4,
    block: u32,
    pos_in_block: usize,
}

impl<'a> PayloadCipher<'a> {
    fn new(key_material: &'a [u8], key_len: usize) -> Self {
        let key0 = derive_block_key(key_material, 0, key_len);
        PayloadCipher {
            key_material,
            key_len,
            rc4: Rc4::new(&key0),
            block: 0,
            pos_in_block: 0,
        }
    }

    fn apply(&mut self, mut data: &mut [u8]) -> Result<(), OffCryptoError> {
        while !data.is_empty() {
            if self.pos_in_block == PAYLOAD_BLOCK_LEN {
                self.block = self.block.checked_add(1).ok_or_else(|| {
                    OffCryptoError::CorruptContainer("RC4 block index overflow".to_string())
                })?;
                let key = derive_block_key(self.key_material, self.block, self.key_len);
                self.rc4 = Rc4::new(&key);
                self.pos_in_block = 0;
            }
            let take = data.len().min(PAYLOAD_BLOCK_LEN - self.pos_in_block);
            let (chunk, rest) = data.split_at_mut(take);
            self.rc4.apply_keystream(chunk);
            self.pos_in_block += take;
            data = rest;
        }
        Ok(())
    }
}

/// Locate the `FILEPASS` record within the workbook globals substream.
///
/// Returns `(record_offset, payload_len)`. The scan stops at the first EOF
/// record or at the next substream's BOF; FILEPASS only appears in the
/// globals substream.
fn find_filepass_record(stream: &[u8]) -> Result<Option<(usize, usize)>, OffCryptoError> {
    let mut pos = 0usize;
    while pos + 4 <= stream.len() {
        let id = u16::from_le_bytes([stream[pos], stream[pos + 1]]);
        let len = u16::from_le_bytes([stream[pos + 2], stream[pos + 3]]) as usize;
        if id == RECORD_EOF || (pos != 0 && id == RECORD_BOF) {
            return Ok(None);
        }
        let payload_end = pos
            .checked_add(4)
            .and_then(|v| v.checked_add(len))
            .filter(|end| *end <= stream.len())
            .ok_or_else(|| {
                OffCryptoError::CorruptContainer(format!(
                    "BIFF record at offset {pos} extends past the end of the stream"
                ))
            })?;
        if id == RECORD_FILEPASS {
            return Ok(Some((pos, len)));
        }
        pos = payload_end;
    }
    Ok(None)
}

/// Whether a workbook stream's globals substream carries a `FILEPASS` record.
pub(crate) fn workbook_stream_has_filepass(stream: &[u8]) -> bool {
    matches!(find_filepass_record(stream), Ok(Some(_)))
}

/// Decrypt a BIFF8 workbook stream in place.
///
/// Records before `FILEPASS` are already plaintext; encryption starts with the
/// first record after it. On success the `FILEPASS` record id has been masked
/// with `0xFFFF`.
pub fn decrypt_biff_filepass_in_place(
    workbook_stream: &mut [u8],
    password: &str,
) -> Result<(), OffCryptoError> {
    decrypt_biff_filepass_in_place_with_options(
        workbook_stream,
        password,
        &crate::DecryptOptions::default(),
    )
}

/// [`decrypt_biff_filepass_in_place`] with a cancellation flag threaded into
/// the KDF loop. The FILEPASS iteration count is fixed at 50,000, so the
/// spin-count guard does not apply.
pub fn decrypt_biff_filepass_in_place_with_options(
    workbook_stream: &mut [u8],
    password: &str,
    options: &crate::DecryptOptions,
) -> Result<(), OffCryptoError> {
    let (filepass_offset, filepass_len) = find_filepass_record(workbook_stream)?.ok_or_else(|| {
        OffCryptoError::CorruptContainer(
            "no FILEPASS record in the workbook globals substream".to_string(),
        )
    })?;
    let payload_start = filepass_offset + 4;
    let record =
        parse_filepass_payload(&workbook_stream[payload_start..payload_start + filepass_len])?;

    let key_material = derive_key_material(password, &record.salt, options.cancel.as_deref())?;
    verify_password(&record, &key_material)?;
    log::debug!(
        "FILEPASS RC4 CryptoAPI password verified (keySize {} bits)",
        record.key_size_bits
    );

    // Decrypt every record payload after FILEPASS. Headers are plaintext.
    let mut cipher = PayloadCipher::new(&key_material, record.key_len());
    let mut pos = payload_start + filepass_len;
    while pos + 4 <= workbook_stream.len() {
        let len =
            u16::from_le_bytes([workbook_stream[pos + 2], workbook_stream[pos + 3]]) as usize;
        let payload_end = pos
            .checked_add(4)
            .and_then(|v| v.checked_add(len))
            .filter(|end| *end <= workbook_stream.len())
            .ok_or_else(|| {
                OffCryptoError::CorruptContainer(format!(
                    "BIFF record at offset {pos} extends past the end of the stream"
                ))
            })?;
        cipher.apply(&mut workbook_stream[pos + 4..payload_end])?;
        pos = payload_end;
    }
    if pos != workbook_stream.len() {
        return Err(OffCryptoError::CorruptContainer(
            "trailing bytes after the final BIFF record".to_string(),
        ));
    }

    workbook_stream[filepass_offset..filepass_offset + 2]
        .copy_from_slice(&RECORD_MASKED.to_le_bytes());
    Ok(())
}

/// Allocating wrapper around [`decrypt_biff_filepass_in_place`].
pub fn decrypt_biff_filepass(
    workbook_stream: &[u8],
    password: &str,
) -> Result<Vec<u8>, OffCryptoError> {
    let mut out = workbook_stream.to_vec();
    decrypt_biff_filepass_in_place(&mut out, password)?;
    Ok(out)
}

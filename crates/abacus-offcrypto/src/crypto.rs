//! Shared cryptographic plumbing: hash-algorithm dispatch, the iterated
//! password hash, AES-ECB/AES-CBC helpers, HMAC, and the 4096-byte segment
//! model used by the `EncryptedPackage` stream.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{digest::KeyInit as MacKeyInit, Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use crate::error::OffCryptoError;
use crate::util::Reader;

pub(crate) const AES_BLOCK_LEN: usize = 16;

/// Plaintext segment length of the `EncryptedPackage` stream.
///
/// Both Standard and Agile encryption divide the package into 4096-byte
/// plaintext segments; only the last segment is padded to the AES block size.
pub(crate) const SEGMENT_LEN: usize = 0x1000;

#[cfg(test)]
thread_local! {
    static SPIN_LOOP_CALLS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

#[cfg(test)]
pub(crate) fn spin_loop_call_count() -> usize {
    SPIN_LOOP_CALLS.with(|c| c.get())
}

#[cfg(test)]
pub(crate) fn reset_spin_loop_calls() {
    SPIN_LOOP_CALLS.with(|c| c.set(0));
}

/// Hash algorithms accepted by the OOXML encryption schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Parse the `hashAlgorithm` attribute of an Agile descriptor.
    pub(crate) fn parse_descriptor_name(name: &str) -> Result<Self, OffCryptoError> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SHA1" | "SHA-1" => Ok(HashAlgorithm::Sha1),
            "SHA256" | "SHA-256" => Ok(HashAlgorithm::Sha256),
            "SHA384" | "SHA-384" => Ok(HashAlgorithm::Sha384),
            "SHA512" | "SHA-512" => Ok(HashAlgorithm::Sha512),
            other => Err(OffCryptoError::UnsupportedScheme(format!(
                "hashAlgorithm {other:?}"
            ))),
        }
    }

    /// Map a CryptoAPI `AlgIDHash` value. Excel writes CALG_SHA1; the SHA-2
    /// identifiers appear from non-Excel producers and are gated explicitly.
    pub(crate) fn from_cryptoapi_alg_id(alg_id_hash: u32) -> Option<Self> {
        match alg_id_hash {
            0x0000_8004 => Some(HashAlgorithm::Sha1),
            0x0000_800C => Some(HashAlgorithm::Sha256),
            0x0000_800D => Some(HashAlgorithm::Sha384),
            0x0000_800E => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    pub(crate) fn descriptor_name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }

    pub(crate) fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub(crate) fn digest(self, data: &[u8]) -> Vec<u8> {
        self.digest_chunks(&[data])
    }

    /// Digest of the concatenation of `chunks` without an intermediate copy.
    pub(crate) fn digest_chunks(self, chunks: &[&[u8]]) -> Vec<u8> {
        fn digest_with<D: hmac::digest::Digest>(chunks: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for chunk in chunks {
                hasher.update(chunk);
            }
            hasher.finalize().to_vec()
        }
        match self {
            HashAlgorithm::Sha1 => digest_with::<Sha1>(chunks),
            HashAlgorithm::Sha256 => digest_with::<Sha256>(chunks),
            HashAlgorithm::Sha384 => digest_with::<Sha384>(chunks),
            HashAlgorithm::Sha512 => digest_with::<Sha512>(chunks),
        }
    }
}

/// HMAC of the concatenation of `chunks` under `key`.
pub(crate) fn hmac_digest(
    hash_alg: HashAlgorithm,
    key: &[u8],
    chunks: &[&[u8]],
) -> Result<Vec<u8>, OffCryptoError> {
    fn hmac_with<D>(key: &[u8], chunks: &[&[u8]]) -> Result<Vec<u8>, OffCryptoError>
    where
        D: Mac + MacKeyInit,
    {
        let mut mac = <D as Mac>::new_from_slice(key).map_err(|_| {
            OffCryptoError::CorruptContainer("invalid HMAC key length".to_string())
        })?;
        for chunk in chunks {
            mac.update(chunk);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    }
    match hash_alg {
        HashAlgorithm::Sha1 => hmac_with::<Hmac<Sha1>>(key, chunks),
        HashAlgorithm::Sha256 => hmac_with::<Hmac<Sha256>>(key, chunks),
        HashAlgorithm::Sha384 => hmac_with::<Hmac<Sha384>>(key, chunks),
        HashAlgorithm::Sha512 => hmac_with::<Hmac<Sha512>>(key, chunks),
    }
}

/// Run the iterated hash loop `H = Hash(LE32(i) || H)` for `spin_count` rounds.
///
/// This is the deliberately expensive part of every password KDF in this
/// crate. The caller-provided cancellation flag is polled once per iteration
/// so a cancelled password attempt returns promptly.
pub(crate) fn spin_hash(
    h0: Zeroizing<Vec<u8>>,
    hash_alg: HashAlgorithm,
    spin_count: u32,
    cancel: Option<&AtomicBool>,
) -> Result<Zeroizing<Vec<u8>>, OffCryptoError> {
    #[cfg(test)]
    SPIN_LOOP_CALLS.with(|c| c.set(c.get() + 1));

    let digest_len = hash_alg.digest_len();
    debug_assert_eq!(h0.len(), digest_len);

    let mut h = h0;
    // Reuse one buffer for all rounds instead of allocating per iteration.
    let mut round = Zeroizing::new(vec![0u8; 4 + digest_len]);
    for i in 0..spin_count {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(OffCryptoError::Cancelled);
            }
        }
        round[..4].copy_from_slice(&i.to_le_bytes());
        round[4..].copy_from_slice(&h);
        h.copy_from_slice(&Zeroizing::new(hash_alg.digest(&round)));
    }
    Ok(h)
}

/// `H = Hash(salt || password_utf16le)`, then the spin loop.
///
/// This is the shared first stage of the Standard and Agile KDFs (they differ
/// only in what they do with `H` afterwards).
pub(crate) fn iterated_hash_from_password(
    password_utf16le: &[u8],
    salt: &[u8],
    hash_alg: HashAlgorithm,
    spin_count: u32,
    cancel: Option<&AtomicBool>,
) -> Result<Zeroizing<Vec<u8>>, OffCryptoError> {
    let h0 = Zeroizing::new(hash_alg.digest_chunks(&[salt, password_utf16le]));
    spin_hash(h0, hash_alg, spin_count, cancel)
}

/// Agile block-key derivation: `Hash(H || blockKey)` truncated to the key
/// length, padded with 0x36 when the digest is shorter (MS-OFFCRYPTO 2.3.4.11).
pub(crate) fn derive_agile_key(
    h: &[u8],
    block_key: &[u8],
    hash_alg: HashAlgorithm,
    key_bits: usize,
) -> Zeroizing<Vec<u8>> {
    let key_len = key_bits / 8;
    let mut derived = Zeroizing::new(hash_alg.digest_chunks(&[h, block_key]));
    if derived.len() < key_len {
        derived.resize(key_len, 0x36);
    }
    derived.truncate(key_len);
    derived
}

/// Segment/block IV derivation: `Hash(salt || suffix)` truncated to the cipher
/// block size, padded with 0x36 when the digest is shorter.
pub(crate) fn derive_iv(
    hash_alg: HashAlgorithm,
    salt: &[u8],
    suffix: &[u8],
    block_size: usize,
) -> Vec<u8> {
    let mut iv = hash_alg.digest_chunks(&[salt, suffix]);
    if iv.len() < block_size {
        iv.resize(block_size, 0x36);
    }
    iv.truncate(block_size);
    iv
}

/// AES-ECB decryption (no IV), as used for the Standard verifier fields.
pub(crate) fn aes_ecb_decrypt_in_place(key: &[u8], buf: &mut [u8]) -> Result<(), OffCryptoError> {
    if buf.len() % AES_BLOCK_LEN != 0 {
        return Err(OffCryptoError::CorruptContainer(format!(
            "AES-ECB ciphertext length {} is not a multiple of 16",
            buf.len()
        )));
    }

    fn decrypt_with<C>(key: &[u8], buf: &mut [u8]) -> Result<(), OffCryptoError>
    where
        C: BlockDecrypt + KeyInit,
    {
        let cipher = C::new_from_slice(key)
            .map_err(|_| invalid_aes_key_length(key.len()))?;
        for block in buf.chunks_mut(AES_BLOCK_LEN) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    match key.len() {
        16 => decrypt_with::<Aes128>(key, buf),
        24 => decrypt_with::<Aes192>(key, buf),
        32 => decrypt_with::<Aes256>(key, buf),
        _ => Err(invalid_aes_key_length(key.len())),
    }
}

/// AES-CBC decryption with no unpadding (the formats carry explicit plaintext
/// lengths, so PKCS#7 unpadding must not be applied).
pub(crate) fn aes_cbc_decrypt(
    ciphertext: &[u8],
    key: &[u8],
    iv: &[u8],
) -> Result<Vec<u8>, OffCryptoError> {
    if ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(OffCryptoError::CorruptContainer(format!(
            "AES-CBC ciphertext length {} is not a multiple of 16",
            ciphertext.len()
        )));
    }
    let iv = iv.get(..AES_BLOCK_LEN).ok_or_else(|| {
        OffCryptoError::CorruptContainer(format!("AES-CBC IV is too short ({} bytes)", iv.len()))
    })?;

    fn decrypt_with<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), OffCryptoError>
    where
        C: aes::cipher::BlockDecryptMut + aes::cipher::BlockCipher + KeyInit,
    {
        cbc::Decryptor::<C>::new_from_slices(key, iv)
            .map_err(|_| invalid_aes_key_length(key.len()))?
            .decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|_| {
                OffCryptoError::CorruptContainer("AES-CBC decryption failed".to_string())
            })?;
        Ok(())
    }

    let mut buf = ciphertext.to_vec();
    match key.len() {
        16 => decrypt_with::<Aes128>(key, iv, &mut buf)?,
        24 => decrypt_with::<Aes192>(key, iv, &mut buf)?,
        32 => decrypt_with::<Aes256>(key, iv, &mut buf)?,
        other => return Err(invalid_aes_key_length(other)),
    }
    Ok(buf)
}

/// AES-CBC encryption of an already block-aligned buffer.
pub(crate) fn aes_cbc_encrypt_in_place(
    buf: &mut [u8],
    key: &[u8],
    iv: &[u8],
) -> Result<(), OffCryptoError> {
    if buf.len() % AES_BLOCK_LEN != 0 {
        return Err(OffCryptoError::CorruptContainer(format!(
            "AES-CBC plaintext length {} is not a multiple of 16",
            buf.len()
        )));
    }
    let iv = iv.get(..AES_BLOCK_LEN).ok_or_else(|| {
        OffCryptoError::CorruptContainer(format!("AES-CBC IV is too short ({} bytes)", iv.len()))
    })?;

    fn encrypt_with<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), OffCryptoError>
    where
        C: aes::cipher::BlockEncryptMut + aes::cipher::BlockCipher + KeyInit,
    {
        let len = buf.len();
        cbc::Encryptor::<C>::new_from_slices(key, iv)
            .map_err(|_| invalid_aes_key_length(key.len()))?
            .encrypt_padded_mut::<NoPadding>(buf, len)
            .map_err(|_| {
                OffCryptoError::CorruptContainer("AES-CBC encryption failed".to_string())
            })?;
        Ok(())
    }

    match key.len() {
        16 => encrypt_with::<Aes128>(key, iv, buf),
        24 => encrypt_with::<Aes192>(key, iv, buf),
        32 => encrypt_with::<Aes256>(key, iv, buf),
        other => Err(invalid_aes_key_length(other)),
    }
}

fn invalid_aes_key_length(len: usize) -> OffCryptoError {
    OffCryptoError::CorruptContainer(format!(
        "invalid AES key length {len}; expected 16, 24, or 32 bytes"
    ))
}

pub(crate) fn padded_aes_len(len: usize) -> usize {
    len.div_ceil(AES_BLOCK_LEN) * AES_BLOCK_LEN
}

/// Key material derived from a successful password attempt.
///
/// Owned by exactly one open session. The package key is immutable after
/// derivation, so the only synchronization a multi-threaded streaming reader
/// needs is shared read access. The key bytes are zeroized on drop.
pub struct DerivedKeyMaterial {
    pub(crate) key: Zeroizing<Vec<u8>>,
    pub(crate) hash_algorithm: HashAlgorithm,
    pub(crate) block_size: usize,
    pub(crate) salt: Vec<u8>,
    pub(crate) verified: bool,
}

impl fmt::Debug for DerivedKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose the key bytes, not even in debug output.
        f.debug_struct("DerivedKeyMaterial")
            .field("key_bits", &(self.key.len() * 8))
            .field("hash_algorithm", &self.hash_algorithm)
            .field("block_size", &self.block_size)
            .field("verified", &self.verified)
            .finish()
    }
}

impl DerivedKeyMaterial {
    /// Whether the password verifier check passed for this key.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Decrypt a full `EncryptedPackage` stream (8-byte size prefix followed
    /// by ciphertext) with this key.
    pub fn decrypt_package_stream(&self, encrypted_package: &[u8]) -> Result<Vec<u8>, OffCryptoError> {
        let mut r = Reader::new(encrypted_package);
        let original_size = r.read_u64_le("EncryptedPackage.original_size")?;
        decrypt_segmented(
            r.remaining(),
            original_size,
            &self.key,
            self.hash_algorithm,
            self.block_size,
            &self.salt,
        )
    }
}

/// Decrypt the ciphertext part of an `EncryptedPackage` stream.
///
/// Segments are independent: the IV for segment `i` depends only on
/// `(salt, i)`, never on the previous segment's output. The final ciphertext
/// segment may carry up to one full extra AES block of padding beyond the
/// minimum; everything past `original_size` is discarded.
pub(crate) fn decrypt_segmented(
    ciphertext: &[u8],
    original_size: u64,
    key: &[u8],
    hash_alg: HashAlgorithm,
    block_size: usize,
    salt: &[u8],
) -> Result<Vec<u8>, OffCryptoError> {
    if ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(OffCryptoError::CorruptContainer(format!(
            "EncryptedPackage ciphertext length {} is not a multiple of 16",
            ciphertext.len()
        )));
    }

    // Validate the declared size against the available ciphertext *before*
    // allocating anything proportional to it, so a hostile header cannot force
    // a huge allocation.
    let full_segments = original_size / SEGMENT_LEN as u64;
    let last_plain = (original_size % SEGMENT_LEN as u64) as usize;
    let min_cipher_len = full_segments
        .checked_mul(SEGMENT_LEN as u64)
        .and_then(|n| n.checked_add(padded_aes_len(last_plain) as u64))
        .ok_or_else(|| {
            OffCryptoError::CorruptContainer("EncryptedPackage size overflow".to_string())
        })?;
    if (ciphertext.len() as u64) < min_cipher_len {
        return Err(OffCryptoError::TruncatedPackage {
            expected: usize::try_from(min_cipher_len).unwrap_or(usize::MAX),
            got: ciphertext.len(),
        });
    }
    // min_cipher_len <= ciphertext.len() <= usize::MAX, so this cannot fail.
    let expected_len = original_size as usize;

    let mut out = Vec::new();
    out.try_reserve_exact(expected_len).map_err(|_| {
        OffCryptoError::CorruptContainer(format!(
            "failed to allocate {expected_len}-byte package buffer"
        ))
    })?;

    let mut offset = 0usize;
    let mut segment: u32 = 0;
    let mut remaining = expected_len;
    while remaining > 0 {
        let is_last = remaining <= SEGMENT_LEN;
        let cipher_len = if is_last {
            ciphertext.len() - offset
        } else {
            SEGMENT_LEN
        };
        let seg = &ciphertext[offset..offset + cipher_len];
        let iv = derive_iv(hash_alg, salt, &segment.to_le_bytes(), block_size);
        let plain = aes_cbc_decrypt(seg, key, &iv)?;
        out.extend_from_slice(&plain[..remaining.min(plain.len())]);

        offset += cipher_len;
        remaining -= remaining.min(plain.len());
        segment = segment.checked_add(1).ok_or_else(|| {
            OffCryptoError::CorruptContainer("EncryptedPackage segment index overflow".to_string())
        })?;
    }

    Ok(out)
}

/// Build a full `EncryptedPackage` stream (size prefix + segment ciphertext)
/// from plaintext. Segments are zero-padded to the AES block size.
pub(crate) fn encrypt_segmented(
    payload: &[u8],
    key: &[u8],
    hash_alg: HashAlgorithm,
    block_size: usize,
    salt: &[u8],
) -> Result<Vec<u8>, OffCryptoError> {
    let mut out = Vec::with_capacity(8 + padded_aes_len(payload.len()));
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());

    for (i, chunk) in payload.chunks(SEGMENT_LEN).enumerate() {
        let segment = u32::try_from(i).map_err(|_| {
            OffCryptoError::CorruptContainer("EncryptedPackage segment index overflow".to_string())
        })?;
        let mut buf = chunk.to_vec();
        buf.resize(padded_aes_len(chunk.len()), 0);
        let iv = derive_iv(hash_alg, salt, &segment.to_le_bytes(), block_size);
        aes_cbc_encrypt_in_place(&mut buf, key, &iv)?;
        out.extend_from_slice(&buf);
    }

    Ok(out)
}

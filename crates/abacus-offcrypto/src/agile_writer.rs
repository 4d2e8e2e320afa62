//! Agile encryption writer: the inverse of the Agile decryptor.
//!
//! Produces an `EncryptionInfo` stream (version header + XML descriptor) and
//! an `EncryptedPackage` stream from plaintext package bytes, with fresh
//! CSPRNG salts, a fresh random package key, and a `dataIntegrity` HMAC over
//! the emitted stream.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::agile::{
    HMAC_KEY_BLOCK, HMAC_VALUE_BLOCK, KEY_VALUE_BLOCK, VERIFIER_HASH_INPUT_BLOCK,
    VERIFIER_HASH_VALUE_BLOCK,
};
use crate::crypto::{
    aes_cbc_encrypt_in_place, derive_agile_key, derive_iv, encrypt_segmented, hmac_digest,
    iterated_hash_from_password, padded_aes_len,
};
use crate::error::OffCryptoError;
use crate::util::password_to_utf16le;
use crate::EncryptOptions;

const SALT_LEN: usize = 16;
const VERIFIER_INPUT_LEN: usize = 16;

/// Zero-pad to the AES block size and encrypt in CBC mode.
fn cbc_encrypt_padded(
    plaintext: &[u8],
    key: &[u8],
    iv: &[u8],
) -> Result<Vec<u8>, OffCryptoError> {
    let mut buf = plaintext.to_vec();
    buf.resize(padded_aes_len(plaintext.len()), 0);
    aes_cbc_encrypt_in_place(&mut buf, key, iv)?;
    Ok(buf)
}

/// Encrypt package bytes into `(EncryptionInfo, EncryptedPackage)` stream
/// contents using the Agile scheme.
pub(crate) fn encrypt_agile_streams(
    package: &[u8],
    password: &str,
    options: &EncryptOptions,
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<(Vec<u8>, Vec<u8>), OffCryptoError> {
    let hash_alg = options.hash_algorithm;
    if !matches!(options.key_bits, 128 | 192 | 256) {
        return Err(OffCryptoError::UnsupportedScheme(format!(
            "Agile keyBits {}",
            options.key_bits
        )));
    }
    let key_len = options.key_bits / 8;

    let mut key_data_salt = vec![0u8; SALT_LEN];
    rng.fill_bytes(&mut key_data_salt);
    let mut password_salt = vec![0u8; SALT_LEN];
    rng.fill_bytes(&mut password_salt);
    let mut verifier_input = Zeroizing::new([0u8; VERIFIER_INPUT_LEN]);
    rng.fill_bytes(&mut verifier_input[..]);
    let mut package_key = Zeroizing::new(vec![0u8; key_len]);
    rng.fill_bytes(&mut package_key);
    // MS-OFFCRYPTO asks for salt-sized HMAC keys, but files written by the
    // reference implementation use digest-sized keys; match those.
    let mut hmac_key = Zeroizing::new(vec![0u8; hash_alg.digest_len()]);
    rng.fill_bytes(&mut hmac_key);

    // Segment-encrypt the package, then HMAC the full emitted stream
    // (including the 8-byte size prefix).
    let encrypted_package = encrypt_segmented(
        package,
        &package_key,
        hash_alg,
        crate::crypto::AES_BLOCK_LEN,
        &key_data_salt,
    )?;
    let hmac_value = Zeroizing::new(hmac_digest(hash_alg, &hmac_key, &[&encrypted_package])?);

    let iv_hmac_key = derive_iv(hash_alg, &key_data_salt, &HMAC_KEY_BLOCK, SALT_LEN);
    let encrypted_hmac_key = cbc_encrypt_padded(&hmac_key, &package_key, &iv_hmac_key)?;
    let iv_hmac_value = derive_iv(hash_alg, &key_data_salt, &HMAC_VALUE_BLOCK, SALT_LEN);
    let encrypted_hmac_value = cbc_encrypt_padded(&hmac_value, &package_key, &iv_hmac_value)?;

    // Password key encryptor: wrap the verifier fields and the package key
    // under keys derived from the iterated password hash.
    let password_utf16 = password_to_utf16le(password);
    let h = iterated_hash_from_password(
        &password_utf16,
        &password_salt,
        hash_alg,
        options.spin_count,
        None,
    )?;

    let key_input = derive_agile_key(&h, &VERIFIER_HASH_INPUT_BLOCK, hash_alg, options.key_bits);
    let encrypted_verifier_hash_input =
        cbc_encrypt_padded(&verifier_input[..], &key_input, &password_salt)?;

    let key_value = derive_agile_key(&h, &VERIFIER_HASH_VALUE_BLOCK, hash_alg, options.key_bits);
    let digest = Zeroizing::new(hash_alg.digest(&verifier_input[..]));
    let encrypted_verifier_hash_value = cbc_encrypt_padded(&digest, &key_value, &password_salt)?;

    let key_key = derive_agile_key(&h, &KEY_VALUE_BLOCK, hash_alg, options.key_bits);
    let encrypted_key_value = cbc_encrypt_padded(&package_key, &key_key, &password_salt)?;

    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption" xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password"><keyData saltSize="{salt_len}" blockSize="16" keyBits="{key_bits}" hashSize="{hash_size}" cipherAlgorithm="AES" cipherChaining="ChainingModeCBC" hashAlgorithm="{hash_name}" saltValue="{key_data_salt}"/><dataIntegrity encryptedHmacKey="{hmac_key}" encryptedHmacValue="{hmac_value}"/><keyEncryptors><keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password"><p:encryptedKey spinCount="{spin_count}" saltSize="{salt_len}" blockSize="16" keyBits="{key_bits}" hashSize="{hash_size}" cipherAlgorithm="AES" cipherChaining="ChainingModeCBC" hashAlgorithm="{hash_name}" saltValue="{password_salt}" encryptedVerifierHashInput="{evhi}" encryptedVerifierHashValue="{evhv}" encryptedKeyValue="{ekv}"/></keyEncryptor></keyEncryptors></encryption>"#,
        salt_len = SALT_LEN,
        key_bits = options.key_bits,
        hash_size = hash_alg.digest_len(),
        hash_name = hash_alg.descriptor_name(),
        spin_count = options.spin_count,
        key_data_salt = STANDARD.encode(&key_data_salt),
        password_salt = STANDARD.encode(&password_salt),
        hmac_key = STANDARD.encode(&encrypted_hmac_key),
        hmac_value = STANDARD.encode(&encrypted_hmac_value),
        evhi = STANDARD.encode(&encrypted_verifier_hash_input),
        evhv = STANDARD.encode(&encrypted_verifier_hash_value),
        ekv = STANDARD.encode(&encrypted_key_value),
    );

    let mut encryption_info = Vec::with_capacity(8 + xml.len());
    encryption_info.extend_from_slice(&4u16.to_le_bytes());
    encryption_info.extend_from_slice(&4u16.to_le_bytes());
    encryption_info.extend_from_slice(&0x40u32.to_le_bytes());
    encryption_info.extend_from_slice(xml.as_bytes());

    Ok((encryption_info, encrypted_package))
}

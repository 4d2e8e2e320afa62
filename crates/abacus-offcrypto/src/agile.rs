//! Agile (XML descriptor) decryption: the spin-count-hardened KDF, the
//! verifier check, package-key unwrap, and `dataIntegrity` HMAC validation.
//!
//! All five block keys are derived from one expensive iterated password hash,
//! which is computed exactly once per open attempt.

use zeroize::Zeroizing;

use crate::crypto::{
    aes_cbc_decrypt, derive_agile_key, derive_iv, hmac_digest, iterated_hash_from_password,
    DerivedKeyMaterial,
};
use crate::error::OffCryptoError;
use crate::info::AgileEncryptionInfo;
use crate::util::{ct_eq, password_to_utf16le};
use crate::DecryptOptions;

/// Block key for deriving the `encryptedVerifierHashInput` key.
pub(crate) const VERIFIER_HASH_INPUT_BLOCK: [u8; 8] =
    [0xFE, 0xA7, 0xD2, 0x76, 0x3B, 0x4B, 0x9E, 0x79];
/// Block key for deriving the `encryptedVerifierHashValue` key.
pub(crate) const VERIFIER_HASH_VALUE_BLOCK: [u8; 8] =
    [0xD7, 0xAA, 0x0F, 0x6D, 0x30, 0x61, 0x34, 0x4E];
/// Block key for deriving the `encryptedKeyValue` (package key) key.
pub(crate) const KEY_VALUE_BLOCK: [u8; 8] = [0x14, 0x6E, 0x0B, 0xE7, 0xAB, 0xAC, 0xD0, 0xD6];
/// Block key for the `dataIntegrity` HMAC key IV.
pub(crate) const HMAC_KEY_BLOCK: [u8; 8] = [0x5F, 0xB2, 0xAD, 0x01, 0x0C, 0xB9, 0xE1, 0xF6];
/// Block key for the `dataIntegrity` HMAC value IV.
pub(crate) const HMAC_VALUE_BLOCK: [u8; 8] = [0xA0, 0x67, 0x7F, 0x02, 0xB2, 0x2C, 0x84, 0x33];

const VERIFIER_HASH_INPUT_LEN: usize = 16;

/// Verify the password and unwrap the package key.
///
/// The file-declared spin count is clamped against
/// [`DecryptOptions::max_spin_count`] *before* the KDF loop runs; an
/// over-limit descriptor never costs more than a parse.
pub fn agile_derive_key_material(
    info: &AgileEncryptionInfo,
    password: &str,
    options: &DecryptOptions,
) -> Result<DerivedKeyMaterial, OffCryptoError> {
    let pw = &info.password;
    if pw.spin_count > options.max_spin_count {
        return Err(OffCryptoError::SpinCountTooLarge {
            spin_count: pw.spin_count,
            max: options.max_spin_count,
        });
    }
    let key_len = pw.key_bits / 8;

    let password_utf16 = password_to_utf16le(password);
    let h = iterated_hash_from_password(
        &password_utf16,
        &pw.salt,
        pw.hash_algorithm,
        pw.spin_count,
        options.cancel.as_deref(),
    )?;

    // Verifier input: decrypt and hash.
    let key_input = derive_agile_key(&h, &VERIFIER_HASH_INPUT_BLOCK, pw.hash_algorithm, pw.key_bits);
    let verifier_hash_input = Zeroizing::new(aes_cbc_decrypt(
        &pw.encrypted_verifier_hash_input,
        &key_input,
        &pw.salt,
    )?);
    if verifier_hash_input.len() < VERIFIER_HASH_INPUT_LEN {
        return Err(OffCryptoError::CorruptContainer(
            "decrypted verifierHashInput is truncated".to_string(),
        ));
    }

    // Verifier value: decrypt and compare against Hash(input), constant-time.
    // The stored value may carry CBC padding past the digest length.
    let key_value = derive_agile_key(&h, &VERIFIER_HASH_VALUE_BLOCK, pw.hash_algorithm, pw.key_bits);
    let verifier_hash_value = Zeroizing::new(aes_cbc_decrypt(
        &pw.encrypted_verifier_hash_value,
        &key_value,
        &pw.salt,
    )?);
    let digest = Zeroizing::new(
        pw.hash_algorithm
            .digest(&verifier_hash_input[..VERIFIER_HASH_INPUT_LEN]),
    );
    let expected = verifier_hash_value
        .get(..digest.len())
        .ok_or(OffCryptoError::InvalidPassword)?;
    if !ct_eq(&digest, expected) {
        return Err(OffCryptoError::InvalidPassword);
    }

    // Package key unwrap.
    let key_key = derive_agile_key(&h, &KEY_VALUE_BLOCK, pw.hash_algorithm, pw.key_bits);
    let mut package_key = Zeroizing::new(aes_cbc_decrypt(
        &pw.encrypted_key_value,
        &key_key,
        &pw.salt,
    )?);
    if package_key.len() < key_len {
        return Err(OffCryptoError::CorruptContainer(
            "decrypted keyValue is shorter than keyBits/8".to_string(),
        ));
    }
    package_key.truncate(key_len);

    Ok(DerivedKeyMaterial {
        key: package_key,
        // Package decryption is governed by keyData, which may use a
        // different hash algorithm than the password key encryptor.
        hash_algorithm: info.key_data.hash_algorithm,
        block_size: info.key_data.block_size,
        salt: info.key_data.salt.clone(),
        verified: true,
    })
}

/// Validate the `dataIntegrity` HMAC over the full `EncryptedPackage` stream
/// bytes, including the 8-byte size prefix.
pub(crate) fn verify_data_integrity(
    info: &AgileEncryptionInfo,
    material: &DerivedKeyMaterial,
    encrypted_package: &[u8],
) -> Result<(), OffCryptoError> {
    let Some(integrity) = &info.data_integrity else {
        // Old producers omit dataIntegrity; nothing to check.
        log::warn!("Agile descriptor has no dataIntegrity element; skipping HMAC validation");
        return Ok(());
    };
    let key_data = &info.key_data;
    let hash_alg = key_data.hash_algorithm;

    let iv_key = derive_iv(hash_alg, &key_data.salt, &HMAC_KEY_BLOCK, key_data.block_size);
    let mut hmac_key = Zeroizing::new(aes_cbc_decrypt(
        &integrity.encrypted_hmac_key,
        &material.key,
        &iv_key,
    )?);
    if hmac_key.len() < hash_alg.digest_len() {
        return Err(OffCryptoError::CorruptContainer(
            "decrypted HMAC key is shorter than the digest length".to_string(),
        ));
    }
    hmac_key.truncate(hash_alg.digest_len());

    let iv_value = derive_iv(hash_alg, &key_data.salt, &HMAC_VALUE_BLOCK, key_data.block_size);
    let hmac_value = Zeroizing::new(aes_cbc_decrypt(
        &integrity.encrypted_hmac_value,
        &material.key,
        &iv_value,
    )?);

    let computed = Zeroizing::new(hmac_digest(hash_alg, &hmac_key, &[encrypted_package])?);
    let expected = hmac_value
        .get(..computed.len())
        .ok_or(OffCryptoError::IntegrityMismatch)?;
    if !ct_eq(&computed, expected) {
        return Err(OffCryptoError::IntegrityMismatch);
    }
    Ok(())
}

/// Verify the password, check integrity, and decrypt an Agile
/// `EncryptedPackage` stream.
pub(crate) fn decrypt_agile_package(
    info: &AgileEncryptionInfo,
    encrypted_package: &[u8],
    password: &str,
    options: &DecryptOptions,
) -> Result<Vec<u8>, OffCryptoError> {
    let material = agile_derive_key_material(info, password, options)?;
    if options.verify_integrity {
        verify_data_integrity(info, &material, encrypted_package)?;
    }
    material.decrypt_package_stream(encrypted_package)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{
        aes_cbc_encrypt_in_place, padded_aes_len, reset_spin_loop_calls, spin_loop_call_count,
        HashAlgorithm,
    };
    use crate::info::{AgileKeyData, AgilePasswordKeyEncryptor};
    use crate::util::{ct_eq_call_count, reset_ct_eq_calls};

    fn cbc_encrypt(plain: &[u8], key: &[u8], iv: &[u8]) -> Vec<u8> {
        let mut buf = plain.to_vec();
        buf.resize(padded_aes_len(plain.len()), 0);
        aes_cbc_encrypt_in_place(&mut buf, key, iv).expect("encrypt");
        buf
    }

    /// Build a descriptor whose encrypted fields verify for `password`.
    fn synthetic_info(password: &str, spin_count: u32) -> AgileEncryptionInfo {
        let hash = HashAlgorithm::Sha256;
        let key_bits = 128usize;
        let salt = vec![0x11u8; 16];

        let pw_utf16 = password_to_utf16le(password);
        let h = iterated_hash_from_password(&pw_utf16, &salt, hash, spin_count, None).unwrap();

        let key1 = derive_agile_key(&h, &VERIFIER_HASH_INPUT_BLOCK, hash, key_bits);
        let verifier_input = vec![0x22u8; VERIFIER_HASH_INPUT_LEN];
        let encrypted_verifier_hash_input = cbc_encrypt(&verifier_input, &key1, &salt);

        let key2 = derive_agile_key(&h, &VERIFIER_HASH_VALUE_BLOCK, hash, key_bits);
        let digest = hash.digest(&verifier_input);
        let encrypted_verifier_hash_value = cbc_encrypt(&digest, &key2, &salt);

        let key3 = derive_agile_key(&h, &KEY_VALUE_BLOCK, hash, key_bits);
        let package_key = vec![0x33u8; key_bits / 8];
        let encrypted_key_value = cbc_encrypt(&package_key, &key3, &salt);

        AgileEncryptionInfo {
            key_data: AgileKeyData {
                salt: vec![0x44u8; 16],
                hash_algorithm: hash,
                block_size: 16,
            },
            data_integrity: None,
            password: AgilePasswordKeyEncryptor {
                spin_count,
                salt,
                hash_algorithm: hash,
                key_bits,
                block_size: 16,
                encrypted_key_value,
                encrypted_verifier_hash_input,
                encrypted_verifier_hash_value,
            },
        }
    }

    #[test]
    fn unwraps_package_key_for_correct_password() {
        reset_ct_eq_calls();
        let info = synthetic_info("open sesame", 1_000);
        let material =
            agile_derive_key_material(&info, "open sesame", &DecryptOptions::default()).unwrap();
        assert_eq!(material.key.as_slice(), &[0x33u8; 16]);
        assert!(material.is_verified());
        assert!(ct_eq_call_count() >= 1, "verifier compare must be constant-time");
    }

    #[test]
    fn rejects_wrong_password() {
        let info = synthetic_info("open sesame", 1_000);
        let err = agile_derive_key_material(&info, "open Sesame", &DecryptOptions::default())
            .expect_err("wrong password");
        assert!(matches!(err, OffCryptoError::InvalidPassword));
    }

    #[test]
    fn spin_count_guard_fires_before_the_kdf_loop() {
        let mut info = synthetic_info("pw", 1_000);
        info.password.spin_count = 10_000_000;

        reset_spin_loop_calls();
        let err = agile_derive_key_material(&info, "pw", &DecryptOptions::default())
            .expect_err("spin count over limit");
        assert!(matches!(
            err,
            OffCryptoError::SpinCountTooLarge {
                spin_count: 10_000_000,
                max: 250_000,
            }
        ));
        assert_eq!(
            spin_loop_call_count(),
            0,
            "the KDF loop must never run for an over-limit spin count"
        );
    }

    #[test]
    fn raising_the_limit_allows_larger_spin_counts() {
        let info = synthetic_info("pw", 300_000);
        let err = agile_derive_key_material(&info, "pw", &DecryptOptions::default())
            .expect_err("over default limit");
        assert!(matches!(err, OffCryptoError::SpinCountTooLarge { .. }));

        let options = DecryptOptions {
            max_spin_count: 400_000,
            ..DecryptOptions::default()
        };
        agile_derive_key_material(&info, "pw", &options).expect("within raised limit");
    }

    #[test]
    fn key_material_uses_key_data_parameters() {
        // keyData governs package decryption and may differ from the password
        // key encryptor's hash algorithm.
        let mut info = synthetic_info("pw", 100);
        info.key_data.hash_algorithm = HashAlgorithm::Sha512;
        let material = agile_derive_key_material(&info, "pw", &DecryptOptions::default()).unwrap();
        assert_eq!(material.hash_algorithm, HashAlgorithm::Sha512);
        assert_eq!(material.salt, vec![0x44u8; 16]);
    }
}

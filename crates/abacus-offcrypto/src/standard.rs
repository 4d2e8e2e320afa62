//! ECMA-376 Standard (CryptoAPI) decryption: password→key derivation, the
//! AES-ECB verifier check, and segmented `EncryptedPackage` decryption.

use zeroize::Zeroizing;

use crate::crypto::{
    self, aes_ecb_decrypt_in_place, iterated_hash_from_password, DerivedKeyMaterial, HashAlgorithm,
};
use crate::error::OffCryptoError;
use crate::info::{StandardEncryptionHeader, StandardEncryptionVerifier};
use crate::util::{ct_eq, password_to_utf16le};
use crate::DecryptOptions;

/// Standard encryption does not carry an iteration count in the file; Office
/// uses a fixed 50,000-round password hash. Not attacker-controlled, so the
/// spin-count guard does not apply here.
pub(crate) const STANDARD_SPIN_COUNT: u32 = 50_000;

/// Standard password→key derivation.
///
/// ```text
/// H      = Hash(salt || UTF16LE(password))
/// H      = Hash(LE32(i) || H)            for i in 0..50000
/// Hfinal = Hash(H || LE32(0))
/// key    = (Hash(ipad ^ Hfinal) || Hash(opad ^ Hfinal))[..keyBits/8]
/// ```
///
/// where `ipad`/`opad` are 64 bytes of 0x36/0x5C (the CryptoAPI
/// `CryptDeriveKey` expansion).
pub fn standard_derive_key(
    header: &StandardEncryptionHeader,
    verifier: &StandardEncryptionVerifier,
    password: &str,
    options: &DecryptOptions,
) -> Result<DerivedKeyMaterial, OffCryptoError> {
    let hash_alg = HashAlgorithm::from_cryptoapi_alg_id(header.alg_id_hash).ok_or_else(|| {
        OffCryptoError::UnsupportedScheme(format!(
            "Standard hash AlgIDHash 0x{:08X}",
            header.alg_id_hash
        ))
    })?;
    if header.key_bits % 8 != 0 {
        return Err(OffCryptoError::CorruptContainer(format!(
            "keySize {} is not a multiple of 8 bits",
            header.key_bits
        )));
    }
    let key_len = (header.key_bits / 8) as usize;

    let password_utf16 = password_to_utf16le(password);
    let h = iterated_hash_from_password(
        &password_utf16,
        &verifier.salt,
        hash_alg,
        STANDARD_SPIN_COUNT,
        options.cancel.as_deref(),
    )?;

    let hfinal = Zeroizing::new(hash_alg.digest_chunks(&[&h, &0u32.to_le_bytes()]));

    let digest_len = hash_alg.digest_len();
    let mut buf1 = Zeroizing::new([0x36u8; 64]);
    let mut buf2 = Zeroizing::new([0x5Cu8; 64]);
    for i in 0..digest_len.min(64) {
        buf1[i] ^= hfinal[i];
        buf2[i] ^= hfinal[i];
    }
    let x1 = Zeroizing::new(hash_alg.digest(&buf1[..]));
    let x2 = Zeroizing::new(hash_alg.digest(&buf2[..]));

    let mut key_material = Zeroizing::new(Vec::with_capacity(x1.len() + x2.len()));
    key_material.extend_from_slice(&x1);
    key_material.extend_from_slice(&x2);
    if key_len > key_material.len() {
        return Err(OffCryptoError::CorruptContainer(format!(
            "keySize {} exceeds the {}-byte derivation output",
            header.key_bits,
            key_material.len()
        )));
    }
    key_material.truncate(key_len);

    Ok(DerivedKeyMaterial {
        key: key_material,
        hash_algorithm: hash_alg,
        block_size: crypto::AES_BLOCK_LEN,
        salt: verifier.salt.clone(),
        verified: false,
    })
}

/// Check a derived key against the `EncryptionVerifier` fields.
///
/// Both fields are AES-ECB ciphertext (no IV). The stored hash is padded to
/// the AES block boundary, so only the digest prefix is compared, in constant
/// time.
pub(crate) fn standard_verify_key(
    verifier: &StandardEncryptionVerifier,
    material: &mut DerivedKeyMaterial,
) -> Result<(), OffCryptoError> {
    let mut verifier_plain = Zeroizing::new(verifier.encrypted_verifier);
    aes_ecb_decrypt_in_place(&material.key, &mut verifier_plain[..])?;
    let expected_hash = Zeroizing::new(material.hash_algorithm.digest(&verifier_plain[..]));

    let mut verifier_hash = Zeroizing::new(verifier.encrypted_verifier_hash.clone());
    aes_ecb_decrypt_in_place(&material.key, &mut verifier_hash)?;

    let hash_len = verifier.verifier_hash_size as usize;
    if verifier_hash.len() < hash_len || expected_hash.len() < hash_len {
        return Err(OffCryptoError::CorruptContainer(
            "decrypted verifier hash is shorter than verifierHashSize".to_string(),
        ));
    }

    if !ct_eq(&expected_hash[..hash_len], &verifier_hash[..hash_len]) {
        return Err(OffCryptoError::InvalidPassword);
    }
    material.verified = true;
    Ok(())
}

/// Verify the password and decrypt a Standard `EncryptedPackage` stream.
pub(crate) fn decrypt_standard_package(
    header: &StandardEncryptionHeader,
    verifier: &StandardEncryptionVerifier,
    encrypted_package: &[u8],
    password: &str,
    options: &DecryptOptions,
) -> Result<Vec<u8>, OffCryptoError> {
    let mut material = standard_derive_key(header, verifier, password, options)?;
    standard_verify_key(verifier, &mut material)?;
    material.decrypt_package_stream(encrypted_package)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{ct_eq_call_count, reset_ct_eq_calls};
    use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
    use aes::Aes128;
    use sha1::{Digest as _, Sha1};

    fn test_header() -> StandardEncryptionHeader {
        StandardEncryptionHeader {
            flags: 0x24,
            alg_id: 0x0000_660E,  // CALG_AES_128
            alg_id_hash: 0x0000_8004, // CALG_SHA1
            key_bits: 128,
            provider_type: 0x18,
            csp_name: String::new(),
        }
    }

    fn aes128_ecb_encrypt(key: &[u8], data: &mut [u8]) {
        let cipher = Aes128::new_from_slice(key).unwrap();
        for block in data.chunks_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
    }

    /// Independent re-derivation of the Standard key, written step by step
    /// against SHA-1 directly. This intentionally does not call
    /// `standard_derive_key` so byte-order or padding regressions there are
    /// caught.
    fn reference_sha1_key(salt: &[u8], password: &str, key_len: usize) -> Vec<u8> {
        let pw: Vec<u8> = password
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();

        let mut hasher = Sha1::new();
        hasher.update(salt);
        hasher.update(&pw);
        let mut h: [u8; 20] = hasher.finalize().into();
        for i in 0..STANDARD_SPIN_COUNT {
            let mut hasher = Sha1::new();
            hasher.update(i.to_le_bytes());
            hasher.update(h);
            h = hasher.finalize().into();
        }
        let mut hasher = Sha1::new();
        hasher.update(h);
        hasher.update(0u32.to_le_bytes());
        let hfinal: [u8; 20] = hasher.finalize().into();

        let mut buf1 = [0x36u8; 64];
        let mut buf2 = [0x5Cu8; 64];
        for i in 0..20 {
            buf1[i] ^= hfinal[i];
            buf2[i] ^= hfinal[i];
        }
        let x1: [u8; 20] = Sha1::digest(buf1).into();
        let x2: [u8; 20] = Sha1::digest(buf2).into();
        let mut out = Vec::new();
        out.extend_from_slice(&x1);
        out.extend_from_slice(&x2);
        out.truncate(key_len);
        out
    }

    fn build_verifier(salt: [u8; 16], password: &str) -> StandardEncryptionVerifier {
        let key = reference_sha1_key(&salt, password, 16);

        let verifier_plain = *b"standard-ver-txt";
        let mut encrypted_verifier = verifier_plain;
        aes128_ecb_encrypt(&key, &mut encrypted_verifier);

        let digest: [u8; 20] = Sha1::digest(verifier_plain).into();
        let mut hash_padded = [0u8; 32];
        hash_padded[..20].copy_from_slice(&digest);
        aes128_ecb_encrypt(&key, &mut hash_padded);

        StandardEncryptionVerifier {
            salt: salt.to_vec(),
            encrypted_verifier,
            verifier_hash_size: 20,
            encrypted_verifier_hash: hash_padded.to_vec(),
        }
    }

    #[test]
    fn derived_key_matches_reference_derivation() {
        let salt = [0x10u8; 16];
        let header = test_header();
        let verifier = build_verifier(salt, "Password");
        let material =
            standard_derive_key(&header, &verifier, "Password", &DecryptOptions::default())
                .expect("derive");
        assert_eq!(
            material.key.as_slice(),
            reference_sha1_key(&salt, "Password", 16).as_slice()
        );
        assert!(!material.is_verified());
    }

    #[test]
    fn verifier_accepts_correct_password_and_uses_ct_eq() {
        reset_ct_eq_calls();
        let header = test_header();
        let verifier = build_verifier([0x22u8; 16], "secret");
        let mut material =
            standard_derive_key(&header, &verifier, "secret", &DecryptOptions::default())
                .expect("derive");
        standard_verify_key(&verifier, &mut material).expect("verify");
        assert!(material.is_verified());
        assert!(ct_eq_call_count() >= 1, "verifier compare must be constant-time");
    }

    #[test]
    fn verifier_rejects_wrong_password() {
        let header = test_header();
        let verifier = build_verifier([0x22u8; 16], "secret");
        let mut material =
            standard_derive_key(&header, &verifier, "not-secret", &DecryptOptions::default())
                .expect("derive");
        let err = standard_verify_key(&verifier, &mut material).expect_err("wrong password");
        assert!(matches!(err, OffCryptoError::InvalidPassword));
        assert!(!material.is_verified());
    }

    #[test]
    fn empty_password_is_a_valid_password() {
        let header = test_header();
        let verifier = build_verifier([0x33u8; 16], "");
        let mut material = standard_derive_key(&header, &verifier, "", &DecryptOptions::default())
            .expect("derive");
        standard_verify_key(&verifier, &mut material).expect("verify empty password");
    }
}

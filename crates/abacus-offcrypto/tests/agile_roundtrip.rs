use std::io::{Cursor, Read};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use abacus_offcrypto::{
    decrypt_package, decrypt_with_options, encrypt_with_rng, DecryptOptions, EncryptOptions,
    OffCryptoError,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn test_options(spin_count: u32) -> EncryptOptions {
    EncryptOptions {
        spin_count,
        ..EncryptOptions::default()
    }
}

fn extract_stream(container: &[u8], name: &str) -> Vec<u8> {
    let mut ole = cfb::CompoundFile::open(Cursor::new(container)).expect("open cfb");
    let mut stream = ole.open_stream(name).expect("open stream");
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("read stream");
    buf
}

#[test]
fn roundtrip_covers_segment_boundaries() {
    let mut rng = StdRng::from_seed([2u8; 32]);
    for len in [0usize, 1, 4095, 4096, 4097, 8192, 8193] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let container = encrypt_with_rng(&payload, "correct horse", &test_options(1_000), &mut rng)
            .expect("encrypt");
        let decrypted = decrypt_with_options(
            &container,
            "correct horse",
            &DecryptOptions::default(),
        )
        .expect("decrypt");
        assert_eq!(decrypted, payload, "len={len}");
    }
}

#[test]
fn roundtrip_with_unicode_and_empty_passwords() {
    let mut rng = StdRng::from_seed([3u8; 32]);
    for password in ["", "p\u{00E4}ssw\u{00F6}rd \u{1F511}", "ascii"] {
        let payload = b"package bytes".to_vec();
        let container =
            encrypt_with_rng(&payload, password, &test_options(500), &mut rng).expect("encrypt");
        let decrypted =
            decrypt_with_options(&container, password, &DecryptOptions::default())
                .expect("decrypt");
        assert_eq!(decrypted, payload, "password={password:?}");
    }
}

#[test]
fn roundtrip_with_each_hash_algorithm_and_key_size() {
    use abacus_offcrypto::HashAlgorithm;
    let mut rng = StdRng::from_seed([4u8; 32]);
    let cases = [
        (HashAlgorithm::Sha1, 128),
        (HashAlgorithm::Sha256, 192),
        (HashAlgorithm::Sha384, 256),
        (HashAlgorithm::Sha512, 256),
    ];
    for (hash_algorithm, key_bits) in cases {
        let options = EncryptOptions {
            hash_algorithm,
            key_bits,
            spin_count: 200,
            ..EncryptOptions::default()
        };
        let payload = vec![0x5Au8; 5000];
        let container = encrypt_with_rng(&payload, "pw", &options, &mut rng).expect("encrypt");
        let decrypted =
            decrypt_with_options(&container, "pw", &DecryptOptions::default()).expect("decrypt");
        assert_eq!(decrypted, payload, "{hash_algorithm:?}/{key_bits}");
    }
}

#[test]
fn wrong_password_fails_closed() {
    let mut rng = StdRng::from_seed([5u8; 32]);
    let container =
        encrypt_with_rng(b"payload", "password-1", &test_options(1_000), &mut rng)
            .expect("encrypt");
    let err = decrypt_with_options(&container, "password-2", &DecryptOptions::default())
        .expect_err("wrong password");
    assert!(matches!(err, OffCryptoError::InvalidPassword));
}

#[test]
fn flipped_ciphertext_byte_is_an_integrity_mismatch() {
    let mut rng = StdRng::from_seed([6u8; 32]);
    let payload = vec![0x77u8; 6000];
    let container =
        encrypt_with_rng(&payload, "pw", &test_options(1_000), &mut rng).expect("encrypt");

    let encryption_info = extract_stream(&container, "EncryptionInfo");
    let mut encrypted_package = extract_stream(&container, "EncryptedPackage");
    // Flip one ciphertext byte past the 8-byte size prefix. The password
    // verifier is independent of package bytes, so only the HMAC can catch it.
    encrypted_package[8 + 100] ^= 0x01;

    let err = decrypt_package(
        &encryption_info,
        &encrypted_package,
        "pw",
        &DecryptOptions::default(),
    )
    .expect_err("tampered package");
    assert!(matches!(err, OffCryptoError::IntegrityMismatch));

    // With integrity validation disabled the tampering goes unnoticed and the
    // output silently differs; that is exactly why validation defaults to on.
    let garbage = decrypt_package(
        &encryption_info,
        &encrypted_package,
        "pw",
        &DecryptOptions {
            verify_integrity: false,
            ..DecryptOptions::default()
        },
    )
    .expect("decrypts without validation");
    assert_ne!(garbage, payload);
}

fn descriptor_with_spin_count(spin_count: u32) -> Vec<u8> {
    let b16 = STANDARD.encode([0x42u8; 16]);
    let b32 = STANDARD.encode([0x42u8; 32]);
    let xml = format!(
        r#"<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption" xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password"><keyData saltSize="16" blockSize="16" keyBits="256" hashSize="64" cipherAlgorithm="AES" cipherChaining="ChainingModeCBC" hashAlgorithm="SHA512" saltValue="{b16}"/><keyEncryptors><keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password"><p:encryptedKey spinCount="{spin_count}" saltSize="16" blockSize="16" keyBits="256" hashSize="64" cipherAlgorithm="AES" cipherChaining="ChainingModeCBC" hashAlgorithm="SHA512" saltValue="{b16}" encryptedVerifierHashInput="{b16}" encryptedVerifierHashValue="{b32}" encryptedKeyValue="{b32}"/></keyEncryptor></keyEncryptors></encryption>"#,
    );
    let mut info = Vec::new();
    info.extend_from_slice(&4u16.to_le_bytes());
    info.extend_from_slice(&4u16.to_le_bytes());
    info.extend_from_slice(&0x40u32.to_le_bytes());
    info.extend_from_slice(xml.as_bytes());
    info
}

#[test]
fn declared_spin_count_of_ten_million_is_rejected() {
    let info = descriptor_with_spin_count(10_000_000);
    let package = 0u64.to_le_bytes().to_vec();
    let err = decrypt_package(&info, &package, "pw", &DecryptOptions::default())
        .expect_err("spin count guard");
    assert!(matches!(
        err,
        OffCryptoError::SpinCountTooLarge {
            spin_count: 10_000_000,
            ..
        }
    ));
}

#[test]
fn preset_cancellation_flag_aborts_the_kdf() {
    let info = descriptor_with_spin_count(200_000);
    let package = 0u64.to_le_bytes().to_vec();
    let cancel = Arc::new(AtomicBool::new(true));
    let options = DecryptOptions {
        cancel: Some(cancel),
        ..DecryptOptions::default()
    };
    let err = decrypt_package(&info, &package, "pw", &options).expect_err("cancelled");
    assert!(matches!(err, OffCryptoError::Cancelled));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn roundtrip_arbitrary_payloads(
        payload in proptest::collection::vec(any::<u8>(), 0..10_000),
        seed in any::<[u8; 32]>(),
    ) {
        let mut rng = StdRng::from_seed(seed);
        let container = encrypt_with_rng(&payload, "prop", &test_options(64), &mut rng)
            .expect("encrypt");
        let decrypted = decrypt_with_options(&container, "prop", &DecryptOptions::default())
            .expect("decrypt");
        prop_assert_eq!(decrypted, payload);
    }
}

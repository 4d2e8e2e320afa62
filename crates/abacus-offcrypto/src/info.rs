//! `EncryptionInfo` stream parsing: scheme classification from the fixed
//! 8-byte version header, the Standard (CryptoAPI) binary descriptor, and the
//! Agile XML descriptor.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader as XmlReader;

use crate::crypto::{HashAlgorithm, AES_BLOCK_LEN};
use crate::error::OffCryptoError;
use crate::util::{decode_csp_name_utf16le, Reader};

const PASSWORD_KEY_ENCRYPTOR_NS: &str =
    "http://schemas.microsoft.com/office/2006/keyEncryptor/password";
const CERTIFICATE_KEY_ENCRYPTOR_NS: &str =
    "http://schemas.microsoft.com/office/2006/keyEncryptor/certificate";

// CryptoAPI algorithm identifiers used by Standard encryption.
const CALG_AES_128: u32 = 0x0000_660E;
const CALG_AES_192: u32 = 0x0000_660F;
const CALG_AES_256: u32 = 0x0000_6610;
const CALG_RC4: u32 = 0x0000_6801;

// The EncryptionHeader is 8 DWORDs plus a CSP name; cap it so malformed files
// cannot request unbounded allocations.
const MAX_ENCRYPTION_HEADER_SIZE: usize = 4096;
const MAX_SALT_SIZE: usize = 64;
const MAX_ENCRYPTED_FIELD_SIZE: usize = 1024;

/// Parsed `EncryptionVersionInfo` (the first 8 bytes of `EncryptionInfo`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionVersionInfo {
    pub major: u16,
    pub minor: u16,
    pub flags: u32,
}

/// Scheme classification of an `EncryptionInfo` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedScheme {
    /// Standard (CryptoAPI) binary descriptor.
    Standard,
    /// Agile XML descriptor.
    Agile,
    /// Legacy BIFF workbook stream with a FILEPASS record.
    BiffFilepass,
    /// Recognized container, unrecognized version pair.
    Unsupported,
}

/// Result of scheme detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemeInfo {
    pub scheme: DetectedScheme,
    /// `EncryptionInfo` version header, when one exists (OOXML schemes only).
    pub version: Option<EncryptionVersionInfo>,
}

/// Classify an `EncryptionInfo` stream from its fixed header.
///
/// Pure classification: reads only the first 8 bytes and has no side effects.
/// `versionMinor == 2` with `versionMajor` 2, 3, or 4 is Standard; `4.4` is
/// Agile; anything else is reported as unsupported rather than an error so
/// callers can surface the version pair.
pub fn classify_encryption_info(bytes: &[u8]) -> Result<SchemeInfo, OffCryptoError> {
    let mut r = Reader::new(bytes);
    let major = r.read_u16_le("EncryptionVersionInfo.major")?;
    let minor = r.read_u16_le("EncryptionVersionInfo.minor")?;
    let flags = r.read_u32_le("EncryptionVersionInfo.flags")?;
    let version = EncryptionVersionInfo { major, minor, flags };

    let scheme = match (major, minor) {
        (4, 4) => DetectedScheme::Agile,
        (2..=4, 2) => DetectedScheme::Standard,
        _ => DetectedScheme::Unsupported,
    };
    Ok(SchemeInfo {
        scheme,
        version: Some(version),
    })
}

/// Parsed Standard (CryptoAPI) `EncryptionHeader`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionHeader {
    pub flags: u32,
    pub alg_id: u32,
    pub alg_id_hash: u32,
    pub key_bits: u32,
    pub provider_type: u32,
    pub csp_name: String,
}

/// Parsed Standard (CryptoAPI) `EncryptionVerifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionVerifier {
    pub salt: Vec<u8>,
    pub encrypted_verifier: [u8; 16],
    pub verifier_hash_size: u32,
    pub encrypted_verifier_hash: Vec<u8>,
}

/// Agile `keyData` element: parameters governing package encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileKeyData {
    pub salt: Vec<u8>,
    pub hash_algorithm: HashAlgorithm,
    pub block_size: usize,
}

/// Agile `dataIntegrity` element (optional in the descriptor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileDataIntegrity {
    pub encrypted_hmac_key: Vec<u8>,
    pub encrypted_hmac_value: Vec<u8>,
}

/// Agile password key encryptor (`p:encryptedKey`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgilePasswordKeyEncryptor {
    pub spin_count: u32,
    pub salt: Vec<u8>,
    pub hash_algorithm: HashAlgorithm,
    pub key_bits: usize,
    pub block_size: usize,
    pub encrypted_key_value: Vec<u8>,
    pub encrypted_verifier_hash_input: Vec<u8>,
    pub encrypted_verifier_hash_value: Vec<u8>,
}

/// Parsed contents of an Agile `EncryptionInfo` stream, restricted to the
/// password key-encryptor subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileEncryptionInfo {
    pub key_data: AgileKeyData,
    pub data_integrity: Option<AgileDataIntegrity>,
    pub password: AgilePasswordKeyEncryptor,
}

/// Parsed `EncryptionInfo` stream, one variant per supported scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionDescriptor {
    Standard {
        version: EncryptionVersionInfo,
        header: StandardEncryptionHeader,
        verifier: StandardEncryptionVerifier,
    },
    Agile {
        version: EncryptionVersionInfo,
        info: AgileEncryptionInfo,
    },
}

/// Parse an `EncryptionInfo` stream into a descriptor.
///
/// The descriptor is parsed once per open attempt and is immutable afterwards.
pub fn parse_encryption_descriptor(bytes: &[u8]) -> Result<EncryptionDescriptor, OffCryptoError> {
    let scheme = classify_encryption_info(bytes)?;
    let Some(version) = scheme.version else {
        return Err(OffCryptoError::CorruptContainer(
            "EncryptionInfo has no version header".to_string(),
        ));
    };
    match scheme.scheme {
        DetectedScheme::Agile => {
            // The Agile payload is a UTF-8 XML document starting at offset 8.
            let info = parse_agile_descriptor_xml(&bytes[8..])?;
            Ok(EncryptionDescriptor::Agile { version, info })
        }
        DetectedScheme::Standard => {
            let (header, verifier) = parse_standard_descriptor(&bytes[8..])?;
            Ok(EncryptionDescriptor::Standard {
                version,
                header,
                verifier,
            })
        }
        _ => Err(OffCryptoError::UnsupportedScheme(format!(
            "EncryptionInfo version {}.{}",
            version.major, version.minor
        ))),
    }
}

fn parse_standard_descriptor(
    bytes: &[u8],
) -> Result<(StandardEncryptionHeader, StandardEncryptionVerifier), OffCryptoError> {
    let mut r = Reader::new(bytes);
    let header_size = r.read_u32_le("EncryptionInfo.headerSize")? as usize;
    if header_size > MAX_ENCRYPTION_HEADER_SIZE {
        return Err(OffCryptoError::CorruptContainer(format!(
            "EncryptionHeader size {header_size} exceeds maximum {MAX_ENCRYPTION_HEADER_SIZE}"
        )));
    }
    let header_bytes = r.take(header_size, "EncryptionHeader")?;
    if header_bytes.len() < 8 * 4 {
        return Err(OffCryptoError::CorruptContainer(
            "EncryptionHeader is missing fixed fields".to_string(),
        ));
    }

    let mut hr = Reader::new(header_bytes);
    let flags = hr.read_u32_le("EncryptionHeader.flags")?;
    let _size_extra = hr.read_u32_le("EncryptionHeader.sizeExtra")?;
    let alg_id = hr.read_u32_le("EncryptionHeader.algId")?;
    let alg_id_hash = hr.read_u32_le("EncryptionHeader.algIdHash")?;
    let key_bits = hr.read_u32_le("EncryptionHeader.keySize")?;
    let provider_type = hr.read_u32_le("EncryptionHeader.providerType")?;
    let _reserved1 = hr.read_u32_le("EncryptionHeader.reserved1")?;
    let _reserved2 = hr.read_u32_le("EncryptionHeader.reserved2")?;
    let csp_name = decode_csp_name_utf16le(hr.remaining())?;

    // Restrict the parser to the AES subset so downstream crypto code can rely
    // on the parameters being consistent. RC4 Standard EncryptedPackage exists
    // in the wild but is a different (stream cipher) layout.
    let expected_key_bits = match alg_id {
        CALG_AES_128 => 128,
        CALG_AES_192 => 192,
        CALG_AES_256 => 256,
        CALG_RC4 => {
            return Err(OffCryptoError::UnsupportedScheme(
                "Standard RC4 EncryptedPackage".to_string(),
            ))
        }
        other => {
            return Err(OffCryptoError::UnsupportedScheme(format!(
                "Standard cipher AlgID 0x{other:08X}"
            )))
        }
    };
    if key_bits != expected_key_bits {
        return Err(OffCryptoError::CorruptContainer(format!(
            "keySize {key_bits} does not match cipher AlgID 0x{alg_id:08X}"
        )));
    }
    let hash_alg = HashAlgorithm::from_cryptoapi_alg_id(alg_id_hash).ok_or_else(|| {
        OffCryptoError::UnsupportedScheme(format!("Standard hash AlgIDHash 0x{alg_id_hash:08X}"))
    })?;

    let header = StandardEncryptionHeader {
        flags,
        alg_id,
        alg_id_hash,
        key_bits,
        provider_type,
        csp_name,
    };

    // EncryptionVerifier follows the header.
    let salt_size = r.read_u32_le("EncryptionVerifier.saltSize")? as usize;
    if salt_size == 0 || salt_size > MAX_SALT_SIZE {
        return Err(OffCryptoError::CorruptContainer(format!(
            "EncryptionVerifier saltSize {salt_size} is out of range"
        )));
    }
    let salt = r.take(salt_size, "EncryptionVerifier.salt")?.to_vec();

    let mut encrypted_verifier = [0u8; 16];
    encrypted_verifier.copy_from_slice(r.take(16, "EncryptionVerifier.encryptedVerifier")?);

    let verifier_hash_size = r.read_u32_le("EncryptionVerifier.verifierHashSize")?;
    if verifier_hash_size as usize != hash_alg.digest_len() {
        return Err(OffCryptoError::CorruptContainer(format!(
            "verifierHashSize {verifier_hash_size} does not match hash AlgIDHash 0x{alg_id_hash:08X}"
        )));
    }
    // The hash is stored padded to the AES block boundary (e.g. a 20-byte SHA-1
    // digest occupies 32 bytes on disk).
    let padded_len = (verifier_hash_size as usize).div_ceil(AES_BLOCK_LEN) * AES_BLOCK_LEN;
    let encrypted_verifier_hash = r
        .take(padded_len, "EncryptionVerifier.encryptedVerifierHash")?
        .to_vec();

    let verifier = StandardEncryptionVerifier {
        salt,
        encrypted_verifier,
        verifier_hash_size,
        encrypted_verifier_hash,
    };

    Ok((header, verifier))
}

// --- Agile XML descriptor ---------------------------------------------------

#[derive(Default)]
struct NamespaceFrame {
    decls: Vec<(Vec<u8>, Vec<u8>)>, // (prefix, uri)
}

fn push_namespace_frame(
    stack: &mut Vec<NamespaceFrame>,
    elem: &quick_xml::events::BytesStart<'_>,
) -> Result<(), OffCryptoError> {
    let mut frame = NamespaceFrame::default();
    for attr in elem.attributes().with_checks(false) {
        let attr = attr.map_err(|_| {
            OffCryptoError::CorruptContainer("invalid XML attribute in EncryptionInfo".to_string())
        })?;
        let key = attr.key.as_ref();
        if key == b"xmlns" {
            frame.decls.push((Vec::new(), attr.value.to_vec()));
        } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            frame.decls.push((prefix.to_vec(), attr.value.to_vec()));
        }
    }
    stack.push(frame);
    Ok(())
}

fn resolve_namespace_uri<'a>(stack: &'a [NamespaceFrame], prefix: &[u8]) -> Option<&'a [u8]> {
    for frame in stack.iter().rev() {
        for (p, uri) in &frame.decls {
            if p.as_slice() == prefix {
                return Some(uri.as_slice());
            }
        }
    }
    None
}

fn element_prefix(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| &name[..idx])
        .unwrap_or(&[])
}

fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| &name[idx + 1..])
        .unwrap_or(name)
}

#[derive(Default)]
struct AgileParseState {
    key_data: Option<AgileKeyData>,
    data_integrity: Option<AgileDataIntegrity>,
    password: Option<AgilePasswordKeyEncryptor>,
    saw_certificate_encryptor: bool,
}

fn parse_agile_descriptor_xml(xml_bytes: &[u8]) -> Result<AgileEncryptionInfo, OffCryptoError> {
    let xml = std::str::from_utf8(xml_bytes).map_err(|_| {
        OffCryptoError::CorruptContainer("Agile EncryptionInfo XML is not valid UTF-8".to_string())
    })?;

    let mut reader = XmlReader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut ns_stack: Vec<NamespaceFrame> = Vec::new();
    let mut state = AgileParseState::default();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|_| {
            OffCryptoError::CorruptContainer("Agile EncryptionInfo XML parse error".to_string())
        })?;
        match event {
            XmlEvent::Start(e) => {
                push_namespace_frame(&mut ns_stack, &e)?;
                parse_agile_element(&ns_stack, &e, &mut state)?;
            }
            XmlEvent::Empty(e) => {
                push_namespace_frame(&mut ns_stack, &e)?;
                parse_agile_element(&ns_stack, &e, &mut state)?;
                ns_stack.pop();
            }
            XmlEvent::End(_) => {
                ns_stack.pop();
            }
            XmlEvent::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let key_data = state.key_data.ok_or_else(|| {
        OffCryptoError::CorruptContainer("missing <keyData> element".to_string())
    })?;
    let password = match state.password {
        Some(p) => p,
        // A descriptor with only certificate key encryptors is recognized but
        // outside the password-based subset this crate implements.
        None if state.saw_certificate_encryptor => {
            return Err(OffCryptoError::UnsupportedScheme(
                "certificate key encryptor".to_string(),
            ))
        }
        None => {
            return Err(OffCryptoError::CorruptContainer(
                "missing password <encryptedKey> element".to_string(),
            ))
        }
    };

    Ok(AgileEncryptionInfo {
        key_data,
        data_integrity: state.data_integrity,
        password,
    })
}

fn parse_agile_element(
    ns_stack: &[NamespaceFrame],
    e: &quick_xml::events::BytesStart<'_>,
    state: &mut AgileParseState,
) -> Result<(), OffCryptoError> {
    match local_name(e.name().as_ref()) {
        b"keyData" => state.key_data = Some(parse_key_data_attrs(e)?),
        b"dataIntegrity" => state.data_integrity = Some(parse_data_integrity_attrs(e)?),
        b"keyEncryptor" => {
            for attr in e.attributes().with_checks(false) {
                let attr = attr.map_err(|_| {
                    OffCryptoError::CorruptContainer(
                        "invalid XML attribute in EncryptionInfo".to_string(),
                    )
                })?;
                if local_name(attr.key.as_ref()) == b"uri"
                    && attr.value.as_ref() == CERTIFICATE_KEY_ENCRYPTOR_NS.as_bytes()
                {
                    state.saw_certificate_encryptor = true;
                }
            }
        }
        b"encryptedKey" => {
            let name = e.name();
            let ns_uri = resolve_namespace_uri(ns_stack, element_prefix(name.as_ref()));
            if ns_uri == Some(PASSWORD_KEY_ENCRYPTOR_NS.as_bytes()) {
                state.password = Some(parse_password_encrypted_key_attrs(e)?);
            }
        }
        _ => {}
    }
    Ok(())
}

fn attr_value_utf8(value: &[u8]) -> Result<&str, OffCryptoError> {
    std::str::from_utf8(value).map_err(|_| {
        OffCryptoError::CorruptContainer("invalid UTF-8 attribute value".to_string())
    })
}

/// Decode a base64 attribute value, tolerating embedded whitespace and missing
/// `=` padding from producers that pretty-print the descriptor XML.
fn decode_b64_attr(value: &[u8]) -> Result<Vec<u8>, OffCryptoError> {
    let s = attr_value_utf8(value)?;
    let bytes = s.as_bytes();

    let mut cleaned: Option<Vec<u8>> = None;
    if bytes.iter().any(|b| matches!(b, b'\r' | b'\n' | b'\t' | b' ')) {
        cleaned = Some(
            bytes
                .iter()
                .copied()
                .filter(|b| !matches!(b, b'\r' | b'\n' | b'\t' | b' '))
                .collect(),
        );
    }
    let input = cleaned.as_deref().unwrap_or(bytes);

    STANDARD
        .decode(input)
        .or_else(|_| STANDARD_NO_PAD.decode(input))
        .map_err(|_| OffCryptoError::CorruptContainer("invalid base64 attribute value".to_string()))
}

fn parse_decimal<T: std::str::FromStr>(value: &[u8], name: &str) -> Result<T, OffCryptoError> {
    attr_value_utf8(value)?
        .trim()
        .parse::<T>()
        .map_err(|_| OffCryptoError::CorruptContainer(format!("invalid numeric attribute {name}")))
}

/// Gate the cipher attributes: only AES in CBC chaining mode is implemented.
fn check_cipher_attrs(
    cipher_algorithm: Option<&str>,
    cipher_chaining: Option<&str>,
) -> Result<(), OffCryptoError> {
    if let Some(alg) = cipher_algorithm {
        if !alg.eq_ignore_ascii_case("AES") {
            return Err(OffCryptoError::UnsupportedScheme(format!(
                "cipherAlgorithm {alg:?}"
            )));
        }
    }
    if let Some(chaining) = cipher_chaining {
        if chaining != "ChainingModeCBC" {
            return Err(OffCryptoError::UnsupportedScheme(format!(
                "cipherChaining {chaining:?}"
            )));
        }
    }
    Ok(())
}

fn check_encrypted_field(name: &str, value: &[u8]) -> Result<(), OffCryptoError> {
    if value.is_empty() || value.len() % AES_BLOCK_LEN != 0 || value.len() > MAX_ENCRYPTED_FIELD_SIZE
    {
        return Err(OffCryptoError::CorruptContainer(format!(
            "{name} length {} is not a bounded multiple of the AES block size",
            value.len()
        )));
    }
    Ok(())
}

fn parse_key_data_attrs(
    e: &quick_xml::events::BytesStart<'_>,
) -> Result<AgileKeyData, OffCryptoError> {
    let mut salt: Option<Vec<u8>> = None;
    let mut hash_algorithm: Option<HashAlgorithm> = None;
    let mut block_size: Option<usize> = None;
    let mut cipher_algorithm: Option<String> = None;
    let mut cipher_chaining: Option<String> = None;

    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|_| {
            OffCryptoError::CorruptContainer("invalid XML attribute in EncryptionInfo".to_string())
        })?;
        let value = attr.value.as_ref();
        match local_name(attr.key.as_ref()) {
            b"saltValue" => salt = Some(decode_b64_attr(value)?),
            b"hashAlgorithm" => {
                hash_algorithm = Some(HashAlgorithm::parse_descriptor_name(attr_value_utf8(value)?)?)
            }
            b"blockSize" => block_size = Some(parse_decimal(value, "keyData.blockSize")?),
            b"cipherAlgorithm" => cipher_algorithm = Some(attr_value_utf8(value)?.to_string()),
            b"cipherChaining" => cipher_chaining = Some(attr_value_utf8(value)?.to_string()),
            _ => {}
        }
    }

    check_cipher_attrs(cipher_algorithm.as_deref(), cipher_chaining.as_deref())?;

    let salt = salt.ok_or_else(|| {
        OffCryptoError::CorruptContainer("missing keyData.saltValue".to_string())
    })?;
    if salt.is_empty() || salt.len() > MAX_SALT_SIZE {
        return Err(OffCryptoError::CorruptContainer(format!(
            "keyData.saltValue length {} is out of range",
            salt.len()
        )));
    }
    let block_size = block_size.ok_or_else(|| {
        OffCryptoError::CorruptContainer("missing keyData.blockSize".to_string())
    })?;
    if block_size != AES_BLOCK_LEN {
        return Err(OffCryptoError::UnsupportedScheme(format!(
            "keyData.blockSize {block_size}"
        )));
    }

    Ok(AgileKeyData {
        salt,
        hash_algorithm: hash_algorithm.ok_or_else(|| {
            OffCryptoError::CorruptContainer("missing keyData.hashAlgorithm".to_string())
        })?,
        block_size,
    })
}

fn parse_data_integrity_attrs(
    e: &quick_xml::events::BytesStart<'_>,
) -> Result<AgileDataIntegrity, OffCryptoError> {
    let mut encrypted_hmac_key: Option<Vec<u8>> = None;
    let mut encrypted_hmac_value: Option<Vec<u8>> = None;

    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|_| {
            OffCryptoError::CorruptContainer("invalid XML attribute in EncryptionInfo".to_string())
        })?;
        let value = attr.value.as_ref();
        match local_name(attr.key.as_ref()) {
            b"encryptedHmacKey" => encrypted_hmac_key = Some(decode_b64_attr(value)?),
            b"encryptedHmacValue" => encrypted_hmac_value = Some(decode_b64_attr(value)?),
            _ => {}
        }
    }

    let encrypted_hmac_key = encrypted_hmac_key.ok_or_else(|| {
        OffCryptoError::CorruptContainer("missing dataIntegrity.encryptedHmacKey".to_string())
    })?;
    let encrypted_hmac_value = encrypted_hmac_value.ok_or_else(|| {
        OffCryptoError::CorruptContainer("missing dataIntegrity.encryptedHmacValue".to_string())
    })?;
    check_encrypted_field("dataIntegrity.encryptedHmacKey", &encrypted_hmac_key)?;
    check_encrypted_field("dataIntegrity.encryptedHmacValue", &encrypted_hmac_value)?;

    Ok(AgileDataIntegrity {
        encrypted_hmac_key,
        encrypted_hmac_value,
    })
}

fn parse_password_encrypted_key_attrs(
    e: &quick_xml::events::BytesStart<'_>,
) -> Result<AgilePasswordKeyEncryptor, OffCryptoError> {
    let mut spin_count: Option<u32> = None;
    let mut salt: Option<Vec<u8>> = None;
    let mut hash_algorithm: Option<HashAlgorithm> = None;
    let mut key_bits: Option<usize> = None;
    let mut block_size: Option<usize> = None;
    let mut cipher_algorithm: Option<String> = None;
    let mut cipher_chaining: Option<String> = None;
    let mut encrypted_key_value: Option<Vec<u8>> = None;
    let mut encrypted_verifier_hash_input: Option<Vec<u8>> = None;
    let mut encrypted_verifier_hash_value: Option<Vec<u8>> = None;

    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|_| {
            OffCryptoError::CorruptContainer("invalid XML attribute in EncryptionInfo".to_string())
        })?;
        let value = attr.value.as_ref();
        match local_name(attr.key.as_ref()) {
            b"spinCount" => spin_count = Some(parse_decimal(value, "encryptedKey.spinCount")?),
            b"saltValue" => salt = Some(decode_b64_attr(value)?),
            b"hashAlgorithm" => {
                hash_algorithm = Some(HashAlgorithm::parse_descriptor_name(attr_value_utf8(value)?)?)
            }
            b"keyBits" => key_bits = Some(parse_decimal(value, "encryptedKey.keyBits")?),
            b"blockSize" => block_size = Some(parse_decimal(value, "encryptedKey.blockSize")?),
            b"cipherAlgorithm" => cipher_algorithm = Some(attr_value_utf8(value)?.to_string()),
            b"cipherChaining" => cipher_chaining = Some(attr_value_utf8(value)?.to_string()),
            b"encryptedKeyValue" => encrypted_key_value = Some(decode_b64_attr(value)?),
            b"encryptedVerifierHashInput" => {
                encrypted_verifier_hash_input = Some(decode_b64_attr(value)?)
            }
            b"encryptedVerifierHashValue" => {
                encrypted_verifier_hash_value = Some(decode_b64_attr(value)?)
            }
            _ => {}
        }
    }

    check_cipher_attrs(cipher_algorithm.as_deref(), cipher_chaining.as_deref())?;

    let salt = salt.ok_or_else(|| {
        OffCryptoError::CorruptContainer("missing encryptedKey.saltValue".to_string())
    })?;
    // The password salt doubles as the verifier CBC IV, so it must be a full
    // AES block.
    if salt.len() != AES_BLOCK_LEN {
        return Err(OffCryptoError::CorruptContainer(format!(
            "encryptedKey.saltValue length {} (expected 16)",
            salt.len()
        )));
    }

    let key_bits = key_bits.ok_or_else(|| {
        OffCryptoError::CorruptContainer("missing encryptedKey.keyBits".to_string())
    })?;
    if !matches!(key_bits, 128 | 192 | 256) {
        return Err(OffCryptoError::UnsupportedScheme(format!(
            "encryptedKey.keyBits {key_bits}"
        )));
    }

    let block_size = block_size.unwrap_or(AES_BLOCK_LEN);
    if block_size != AES_BLOCK_LEN {
        return Err(OffCryptoError::UnsupportedScheme(format!(
            "encryptedKey.blockSize {block_size}"
        )));
    }

    let encrypted_key_value = encrypted_key_value.ok_or_else(|| {
        OffCryptoError::CorruptContainer("missing encryptedKey.encryptedKeyValue".to_string())
    })?;
    let encrypted_verifier_hash_input = encrypted_verifier_hash_input.ok_or_else(|| {
        OffCryptoError::CorruptContainer(
            "missing encryptedKey.encryptedVerifierHashInput".to_string(),
        )
    })?;
    let encrypted_verifier_hash_value = encrypted_verifier_hash_value.ok_or_else(|| {
        OffCryptoError::CorruptContainer(
            "missing encryptedKey.encryptedVerifierHashValue".to_string(),
        )
    })?;
    check_encrypted_field("encryptedKey.encryptedKeyValue", &encrypted_key_value)?;
    check_encrypted_field(
        "encryptedKey.encryptedVerifierHashInput",
        &encrypted_verifier_hash_input,
    )?;
    check_encrypted_field(
        "encryptedKey.encryptedVerifierHashValue",
        &encrypted_verifier_hash_value,
    )?;

    Ok(AgilePasswordKeyEncryptor {
        spin_count: spin_count.ok_or_else(|| {
            OffCryptoError::CorruptContainer("missing encryptedKey.spinCount".to_string())
        })?,
        salt,
        hash_algorithm: hash_algorithm.ok_or_else(|| {
            OffCryptoError::CorruptContainer("missing encryptedKey.hashAlgorithm".to_string())
        })?,
        key_bits,
        block_size,
        encrypted_key_value,
        encrypted_verifier_hash_input,
        encrypted_verifier_hash_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_b64_attr_padded_unpadded_and_whitespace() {
        assert_eq!(decode_b64_attr(b"AQIDBA==").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(decode_b64_attr(b"AQIDBA").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(decode_b64_attr(b"A QID\r\nBA==\t").unwrap(), vec![1, 2, 3, 4]);
    }

    fn agile_info_bytes(xml: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&0x40u32.to_le_bytes());
        bytes.extend_from_slice(xml.as_bytes());
        bytes
    }

    #[test]
    fn parses_minimal_agile_descriptor() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption"
    xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
  <keyData saltSize="16" blockSize="16" hashAlgorithm="SHA256"
    cipherAlgorithm="AES" cipherChaining="ChainingModeCBC"
    saltValue="AAECAwQFBgcICQoLDA0ODw=="/>
  <dataIntegrity encryptedHmacKey="EBESExQVFhcYGRobHB0eHw=="
    encryptedHmacValue="ICEiIyQlJicoKSorLC0uLw=="/>
  <keyEncryptors>
    <keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
      <p:encryptedKey spinCount="100000" saltValue="AAECAwQFBgcICQoLDA0ODw=="
        hashAlgorithm="SHA512" keyBits="256" blockSize="16"
        cipherAlgorithm="AES" cipherChaining="ChainingModeCBC"
        encryptedKeyValue="MDEyMzQ1Njc4OWFiY2RlZg=="
        encryptedVerifierHashInput="MDEyMzQ1Njc4OWFiY2RlZg=="
        encryptedVerifierHashValue="MDEyMzQ1Njc4OWFiY2RlZg=="/>
    </keyEncryptor>
  </keyEncryptors>
</encryption>"#;

        let parsed = parse_encryption_descriptor(&agile_info_bytes(xml)).expect("parse");
        let EncryptionDescriptor::Agile { version, info } = parsed else {
            panic!("expected an Agile descriptor");
        };
        assert_eq!((version.major, version.minor), (4, 4));
        assert_eq!(info.key_data.salt, (0u8..16).collect::<Vec<_>>());
        assert_eq!(info.key_data.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(info.password.spin_count, 100_000);
        assert_eq!(info.password.hash_algorithm, HashAlgorithm::Sha512);
        assert_eq!(info.password.key_bits, 256);
        assert!(info.data_integrity.is_some());
    }

    #[test]
    fn data_integrity_is_optional() {
        let xml = r#"<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption"
    xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
  <keyData blockSize="16" hashAlgorithm="SHA256" saltValue="AAECAwQFBgcICQoLDA0ODw=="/>
  <keyEncryptors>
    <keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
      <p:encryptedKey spinCount="1000" saltValue="AAECAwQFBgcICQoLDA0ODw=="
        hashAlgorithm="SHA256" keyBits="128"
        encryptedKeyValue="MDEyMzQ1Njc4OWFiY2RlZg=="
        encryptedVerifierHashInput="MDEyMzQ1Njc4OWFiY2RlZg=="
        encryptedVerifierHashValue="MDEyMzQ1Njc4OWFiY2RlZg=="/>
    </keyEncryptor>
  </keyEncryptors>
</encryption>"#;
        let parsed = parse_encryption_descriptor(&agile_info_bytes(xml)).expect("parse");
        let EncryptionDescriptor::Agile { info, .. } = parsed else {
            panic!("expected an Agile descriptor");
        };
        assert!(info.data_integrity.is_none());
    }

    #[test]
    fn certificate_only_descriptor_is_unsupported() {
        let xml = r#"<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption">
  <keyData blockSize="16" hashAlgorithm="SHA256" saltValue="AAECAwQFBgcICQoLDA0ODw=="/>
  <keyEncryptors>
    <keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/certificate"/>
  </keyEncryptors>
</encryption>"#;
        let err = parse_encryption_descriptor(&agile_info_bytes(xml)).unwrap_err();
        assert!(matches!(err, OffCryptoError::UnsupportedScheme(_)));
    }

    #[test]
    fn non_cbc_chaining_is_unsupported() {
        let xml = r#"<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption">
  <keyData blockSize="16" hashAlgorithm="SHA256" cipherChaining="ChainingModeCFB"
    saltValue="AAECAwQFBgcICQoLDA0ODw=="/>
</encryption>"#;
        let err = parse_encryption_descriptor(&agile_info_bytes(xml)).unwrap_err();
        assert!(matches!(err, OffCryptoError::UnsupportedScheme(_)));
    }

    #[test]
    fn rejects_misaligned_encrypted_fields() {
        // 17-byte encryptedKeyValue is not block-aligned.
        let xml = r#"<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption"
    xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
  <keyData blockSize="16" hashAlgorithm="SHA256" saltValue="AAECAwQFBgcICQoLDA0ODw=="/>
  <keyEncryptors>
    <keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
      <p:encryptedKey spinCount="1000" saltValue="AAECAwQFBgcICQoLDA0ODw=="
        hashAlgorithm="SHA256" keyBits="128"
        encryptedKeyValue="MDEyMzQ1Njc4OWFiY2RlZjA="
        encryptedVerifierHashInput="MDEyMzQ1Njc4OWFiY2RlZg=="
        encryptedVerifierHashValue="MDEyMzQ1Njc4OWFiY2RlZg=="/>
    </keyEncryptor>
  </keyEncryptors>
</encryption>"#;
        let err = parse_encryption_descriptor(&agile_info_bytes(xml)).unwrap_err();
        assert!(matches!(err, OffCryptoError::CorruptContainer(_)));
    }

    #[test]
    fn truncated_header_is_corrupt() {
        let err = classify_encryption_info(&[4, 0, 4]).unwrap_err();
        assert!(matches!(err, OffCryptoError::CorruptContainer(_)));
    }
}

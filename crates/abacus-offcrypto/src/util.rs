use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::OffCryptoError;

#[cfg(test)]
thread_local! {
    static CT_EQ_CALLS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Constant-time byte slice equality.
///
/// Used for all verifier/HMAC comparisons to avoid timing side channels from
/// early-exit comparisons (`==` / `!=`).
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    #[cfg(test)]
    CT_EQ_CALLS.with(|c| c.set(c.get() + 1));
    bool::from(a.ct_eq(b))
}

#[cfg(test)]
pub(crate) fn ct_eq_call_count() -> usize {
    CT_EQ_CALLS.with(|c| c.get())
}

#[cfg(test)]
pub(crate) fn reset_ct_eq_calls() {
    CT_EQ_CALLS.with(|c| c.set(0));
}

/// Encode a password as UTF-16LE code units, no BOM, no terminator.
///
/// The empty password is valid and encodes to an empty buffer.
pub(crate) fn password_to_utf16le(password: &str) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(password.len() * 2));
    for unit in password.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Little-endian byte cursor over a borrowed slice.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub(crate) fn take(
        &mut self,
        n: usize,
        context: &'static str,
    ) -> Result<&'a [u8], OffCryptoError> {
        let end = self.pos.saturating_add(n);
        if end > self.bytes.len() {
            return Err(OffCryptoError::CorruptContainer(format!(
                "truncated data while reading {context}"
            )));
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn read_u16_le(&mut self, context: &'static str) -> Result<u16, OffCryptoError> {
        let b = self.take(2, context)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32_le(&mut self, context: &'static str) -> Result<u32, OffCryptoError> {
        let b = self.take(4, context)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_u64_le(&mut self, context: &'static str) -> Result<u64, OffCryptoError> {
        let b = self.take(8, context)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Decode a UTF-16LE CSP name, tolerating a missing NUL terminator.
pub(crate) fn decode_csp_name_utf16le(bytes: &[u8]) -> Result<String, OffCryptoError> {
    if bytes.is_empty() {
        return Ok(String::new());
    }
    if bytes.len() % 2 != 0 {
        return Err(OffCryptoError::CorruptContainer(
            "CSPName has an odd byte length".to_string(),
        ));
    }

    let mut code_units: Vec<u16> = Vec::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks_exact(2) {
        code_units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
    }

    let end = if let Some(nul_pos) = code_units.iter().position(|u| *u == 0) {
        nul_pos
    } else {
        code_units.len()
    };

    String::from_utf16(&code_units[..end])
        .map_err(|_| OffCryptoError::CorruptContainer("CSPName is not valid UTF-16LE".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ct_eq_true_for_equal_slices() {
        assert!(ct_eq(b"", b""));
        assert!(ct_eq(b"abc", b"abc"));
    }

    #[test]
    fn ct_eq_false_for_mismatched_or_shorter_slices() {
        assert!(!ct_eq(b"abc", b"abx"));
        assert!(!ct_eq(b"ab", b"abc"));
    }

    #[test]
    fn password_utf16le_has_no_bom_or_terminator() {
        assert_eq!(password_to_utf16le("").as_slice(), b"");
        assert_eq!(password_to_utf16le("Ab").as_slice(), &[0x41, 0x00, 0x62, 0x00]);
    }

    #[test]
    fn csp_name_tolerates_missing_terminator() {
        let with_nul = [b'A', 0, b'E', 0, b'S', 0, 0, 0];
        assert_eq!(decode_csp_name_utf16le(&with_nul).unwrap(), "AES");
        let without_nul = [b'A', 0, b'E', 0, b'S', 0];
        assert_eq!(decode_csp_name_utf16le(&without_nul).unwrap(), "AES");
    }

    #[test]
    fn reader_reports_truncation() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert!(r.read_u32_le("test").is_err());
    }
}

//! ECDSA P-256 signature form conversion
//!
//! Signers emit DER `SEQUENCE { INTEGER r, INTEGER s }`; the token wire
//! format carries the fixed 64-byte `r || s` form. Both directions are
//! strict: non-minimal DER, oversized scalars and trailing bytes are
//! rejected as `invalid-format`.

use crate::error::{CryptoError, Result};

const SEQUENCE_TAG: u8 = 0x30;
const INTEGER_TAG: u8 = 0x02;

/// Convert a DER-encoded P-256 ECDSA signature to the raw 64-byte form.
pub fn der_to_raw64(der: &[u8]) -> Result<[u8; 64]> {
    let mut cursor = Cursor::new(der);

    if cursor.take_byte()? != SEQUENCE_TAG {
        return Err(invalid("expected SEQUENCE"));
    }
    let body_len = cursor.take_length()?;
    if body_len != cursor.remaining() {
        return Err(invalid("SEQUENCE length mismatch"));
    }

    let r = cursor.take_integer()?;
    let s = cursor.take_integer()?;
    if cursor.remaining() != 0 {
        return Err(invalid("trailing bytes after s"));
    }

    let mut out = [0u8; 64];
    out[32 - r.len()..32].copy_from_slice(r);
    out[64 - s.len()..64].copy_from_slice(s);
    Ok(out)
}

/// Convert a raw 64-byte `r || s` signature back to DER.
pub fn raw64_to_der(raw: &[u8; 64]) -> Vec<u8> {
    let r = encode_integer(&raw[..32]);
    let s = encode_integer(&raw[32..]);

    let mut der = Vec::with_capacity(2 + r.len() + s.len());
    der.push(SEQUENCE_TAG);
    der.push((r.len() + s.len()) as u8);
    der.extend_from_slice(&r);
    der.extend_from_slice(&s);
    der
}

/// DER INTEGER for an unsigned 32-byte scalar: strip leading zeros, then
/// re-insert one when the high bit would flip the sign.
fn encode_integer(scalar: &[u8]) -> Vec<u8> {
    let mut start = 0;
    while start < scalar.len() - 1 && scalar[start] == 0 {
        start += 1;
    }
    let trimmed = &scalar[start..];

    let mut out = Vec::with_capacity(trimmed.len() + 3);
    out.push(INTEGER_TAG);
    if trimmed[0] & 0x80 != 0 {
        out.push((trimmed.len() + 1) as u8);
        out.push(0x00);
    } else {
        out.push(trimmed.len() as u8);
    }
    out.extend_from_slice(trimmed);
    out
}

fn invalid(msg: &str) -> CryptoError {
    CryptoError::InvalidFormat(format!("ecdsa der: {msg}"))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take_byte(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos).ok_or_else(|| invalid("truncated"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(invalid("truncated"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    // A valid P-256 signature body is at most 70 bytes, so only the
    // single-byte length form is acceptable.
    fn take_length(&mut self) -> Result<usize> {
        let len = self.take_byte()?;
        if len & 0x80 != 0 {
            return Err(invalid("long-form length"));
        }
        Ok(len as usize)
    }

    /// Parse one INTEGER and return the scalar with sign-padding stripped,
    /// at most 32 bytes.
    fn take_integer(&mut self) -> Result<&'a [u8]> {
        if self.take_byte()? != INTEGER_TAG {
            return Err(invalid("expected INTEGER"));
        }
        let len = self.take_length()?;
        if len == 0 {
            return Err(invalid("empty INTEGER"));
        }
        let mut content = self.take_bytes(len)?;

        if content[0] == 0x00 {
            if content.len() == 1 {
                return Ok(content);
            }
            if content[1] & 0x80 == 0 {
                return Err(invalid("non-minimal INTEGER"));
            }
            content = &content[1..];
        } else if content[0] & 0x80 != 0 {
            return Err(invalid("negative INTEGER"));
        }

        if content.len() > 32 {
            return Err(invalid("scalar exceeds 32 bytes"));
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_high_bit_scalars() {
        let mut raw = [0u8; 64];
        raw[0] = 0xff;
        raw[31] = 0x01;
        raw[32] = 0x80;
        raw[63] = 0x02;

        let der = raw64_to_der(&raw);
        // Both scalars have the high bit set, so each gets a 0x00 pad.
        assert_eq!(der.len(), 2 + 2 + 33 + 2 + 33);
        assert_eq!(der_to_raw64(&der).unwrap(), raw);
    }

    #[test]
    fn round_trips_short_scalars() {
        let mut raw = [0u8; 64];
        raw[31] = 0x05;
        raw[63] = 0x7f;

        let der = raw64_to_der(&raw);
        assert_eq!(der, vec![0x30, 0x06, 0x02, 0x01, 0x05, 0x02, 0x01, 0x7f]);
        assert_eq!(der_to_raw64(&der).unwrap(), raw);
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut raw = [0u8; 64];
        raw[31] = 1;
        raw[63] = 1;
        let mut der = raw64_to_der(&raw);
        der.push(0x00);
        assert!(der_to_raw64(&der).is_err());
    }

    #[test]
    fn rejects_non_minimal_padding() {
        // INTEGER 00 05 - the pad byte is not required here.
        let der = vec![0x30, 0x07, 0x02, 0x02, 0x00, 0x05, 0x02, 0x01, 0x01];
        assert!(der_to_raw64(&der).is_err());
    }

    #[test]
    fn rejects_oversized_scalar() {
        let mut der = vec![0x30, 0x26, 0x02, 0x21];
        der.push(0x01);
        der.extend_from_slice(&[0u8; 32]); // 33-byte positive scalar
        der.extend_from_slice(&[0x02, 0x01, 0x01]);
        assert!(der_to_raw64(&der).is_err());
    }

    #[test]
    fn rejects_wrong_tags() {
        assert!(der_to_raw64(&[0x31, 0x00]).is_err());
        assert!(der_to_raw64(&[0x30, 0x03, 0x03, 0x01, 0x01]).is_err());
    }
}

//! JWK thumbprints and raw public key handling
//!
//! Key identifiers are RFC 7638 thumbprints over the canonical P-256 JWK
//! `{"crv":"P-256","kty":"EC","x":…,"y":…}` - member order is part of the
//! contract and must not change.

use crate::b64::b64u_encode;
use crate::error::{CryptoError, Result};
use crate::kdf::sha256;

/// Length of an uncompressed SEC1 P-256 point.
pub const RAW_PUBLIC_KEY_LEN: usize = 65;

/// Split an uncompressed point `0x04 || X || Y` into its coordinates.
pub fn split_uncompressed_point(raw: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    if raw.len() != RAW_PUBLIC_KEY_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "public key must be {RAW_PUBLIC_KEY_LEN} bytes, got {}",
            raw.len()
        )));
    }
    if raw[0] != 0x04 {
        return Err(CryptoError::InvalidFormat(
            "public key must be an uncompressed point (leading 0x04)".into(),
        ));
    }
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    x.copy_from_slice(&raw[1..33]);
    y.copy_from_slice(&raw[33..65]);
    Ok((x, y))
}

/// RFC 7638 thumbprint of a P-256 public key, base64url encoded.
pub fn jwk_thumbprint_p256(x: &[u8; 32], y: &[u8; 32]) -> String {
    let canonical = format!(
        r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
        b64u_encode(x),
        b64u_encode(y)
    );
    b64u_encode(sha256(canonical.as_bytes()))
}

/// Thumbprint straight from the 65-byte uncompressed form.
pub fn thumbprint_of_raw_public(raw: &[u8]) -> Result<String> {
    let (x, y) = split_uncompressed_point(raw)?;
    Ok(jwk_thumbprint_p256(&x, &y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::b64::b64u_decode;

    fn sample_point() -> Vec<u8> {
        let mut raw = vec![0x04];
        raw.extend((1..=32).map(|b| b as u8));
        raw.extend((101..=132).map(|b| b as u8));
        raw
    }

    #[test]
    fn thumbprint_is_32_byte_digest() {
        let kid = thumbprint_of_raw_public(&sample_point()).unwrap();
        assert_eq!(b64u_decode(&kid).unwrap().len(), 32);
    }

    #[test]
    fn thumbprint_is_deterministic_and_key_dependent() {
        let a = thumbprint_of_raw_public(&sample_point()).unwrap();
        let b = thumbprint_of_raw_public(&sample_point()).unwrap();
        assert_eq!(a, b);

        let mut other = sample_point();
        other[10] ^= 0x01;
        assert_ne!(a, thumbprint_of_raw_public(&other).unwrap());
    }

    #[test]
    fn rejects_bad_point_shapes() {
        assert!(split_uncompressed_point(&[0x04; 64]).is_err());
        assert!(split_uncompressed_point(&[0x04; 66]).is_err());

        let mut compressed = sample_point();
        compressed[0] = 0x02;
        assert!(split_uncompressed_point(&compressed).is_err());
    }
}

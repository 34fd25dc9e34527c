//! Key derivation functions
//!
//! HKDF-SHA-256 for the wrapping hierarchy, PBKDF2-SHA-256 for passphrase
//! enrollment. Derived material comes back in `Zeroizing` buffers.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

/// HKDF-SHA-256 extract-and-expand.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    out_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new(vec![0u8; out_len]);
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::InvalidFormat(format!("hkdf output length {out_len}")))?;
    Ok(okm)
}

/// PBKDF2-SHA-256 with a caller-supplied iteration count.
pub fn pbkdf2_sha256(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    out_len: usize,
) -> Zeroizing<Vec<u8>> {
    let mut okm = Zeroizing::new(vec![0u8; out_len]);
    pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut okm);
    okm
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// `n` bytes from the OS RNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Fixed-size random array from the OS RNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic_per_inputs() {
        let a = hkdf_sha256(b"ikm", b"salt", b"info", 32).unwrap();
        let b = hkdf_sha256(b"ikm", b"salt", b"info", 32).unwrap();
        assert_eq!(&*a, &*b);

        let c = hkdf_sha256(b"ikm", b"other", b"info", 32).unwrap();
        assert_ne!(&*a, &*c);
        let d = hkdf_sha256(b"ikm", b"salt", b"other", 32).unwrap();
        assert_ne!(&*a, &*d);
    }

    #[test]
    fn pbkdf2_depends_on_iterations() {
        let a = pbkdf2_sha256(b"pass", b"salt", 1000, 64);
        let b = pbkdf2_sha256(b"pass", b"salt", 1001, 64);
        assert_eq!(a.len(), 64);
        assert_ne!(&*a, &*b);
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn random_bytes_differ() {
        assert_ne!(random_bytes(32), random_bytes(32));
    }
}

//! base64url codec
//!
//! The wire and storage formats use the URL alphabet without padding.
//! Decoding tolerates padded input since host-side encoders differ.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{CryptoError, Result};

/// Encode bytes as base64url without padding.
pub fn b64u_encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode base64url input, accepting trailing `=` padding.
pub fn b64u_decode(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| CryptoError::InvalidFormat(format!("base64url: {e}")))
}

/// Serde adapter for byte fields carried as base64url strings.
pub mod serde_b64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::b64u_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        super::b64u_decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_lengths() {
        for len in 0..70 {
            let data: Vec<u8> = (0..len as u8).collect();
            let encoded = b64u_encode(&data);
            assert!(!encoded.contains('='));
            assert!(!encoded.contains('+'));
            assert!(!encoded.contains('/'));
            assert_eq!(b64u_decode(&encoded).unwrap(), data);
        }
    }

    #[test]
    fn accepts_padded_input() {
        assert_eq!(b64u_decode("aGk=").unwrap(), b"hi");
        assert_eq!(b64u_decode("aGV5").unwrap(), b"hey");
    }

    #[test]
    fn rejects_standard_alphabet() {
        assert!(b64u_decode("a+b/").is_err());
    }
}

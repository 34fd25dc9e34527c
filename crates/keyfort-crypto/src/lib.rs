//! Keyfort crypto primitives
//!
//! Pure building blocks shared by the rest of the workspace: base64url
//! encoding, ECDSA signature form conversion, JWK thumbprints, AEAD key
//! wrapping and the KDFs the key hierarchy derives from.
//!
//! Everything here is synchronous and strict about input shape; structural
//! errors surface as [`CryptoError::InvalidFormat`].

pub mod aead;
pub mod b64;
pub mod ecdsa_der;
pub mod error;
pub mod jwk;
pub mod kdf;
pub mod provider;

pub use aead::{unwrap_key, wrap_key, WrappedBlob};
pub use b64::{b64u_decode, b64u_encode};
pub use ecdsa_der::{der_to_raw64, raw64_to_der};
pub use error::{CryptoError, Result};
pub use jwk::{jwk_thumbprint_p256, split_uncompressed_point, thumbprint_of_raw_public};
pub use kdf::{hkdf_sha256, pbkdf2_sha256, random_array, random_bytes, sha256};
pub use provider::{verify_ed25519, KeyHandle, KeyProvider, SoftwareKeyProvider};

//! AEAD key wrapping
//!
//! All wrapped secrets in the store are AES-256-GCM blobs with a fresh
//! 12-byte IV per operation. The associated data binds a wrap to its owning
//! record (signing-key id, lease id) so blobs cannot be swapped between
//! records without detection.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::b64::serde_b64;
use crate::error::{CryptoError, Result};
use crate::kdf::random_array;

/// IV length for AES-GCM.
pub const WRAP_IV_LEN: usize = 12;

/// An AEAD-wrapped secret as it is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrappedBlob {
    #[serde(with = "serde_b64")]
    pub iv: Vec<u8>,
    #[serde(with = "serde_b64")]
    pub ciphertext: Vec<u8>,
}

/// Wrap `plaintext` under a 32-byte key, binding it to `aad`.
pub fn wrap_key(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<WrappedBlob> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::CipherFailure(e.to_string()))?;
    let iv = random_array::<WRAP_IV_LEN>();

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::CipherFailure(e.to_string()))?;

    Ok(WrappedBlob {
        iv: iv.to_vec(),
        ciphertext,
    })
}

/// Unwrap a blob. The plaintext is zeroized when the return value drops.
pub fn unwrap_key(key: &[u8; 32], blob: &WrappedBlob, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if blob.iv.len() != WRAP_IV_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "wrap IV must be {WRAP_IV_LEN} bytes"
        )));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::CipherFailure(e.to_string()))?;

    cipher
        .decrypt(
            Nonce::from_slice(&blob.iv),
            Payload {
                msg: &blob.ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::CipherFailure(e.to_string()))
}

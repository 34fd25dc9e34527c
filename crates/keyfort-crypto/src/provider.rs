//! Opaque key handles
//!
//! The signing keys of the service never travel as bytes: they live behind
//! a [`KeyProvider`] that hands out opaque handles, mirroring a platform
//! keystore with non-extractable keys. A freshly generated P-256 key may be
//! exported exactly once (to be wrapped by the key hierarchy); imported
//! handles are never exportable. Ed25519 audit keys are registered under
//! stable names so signers can be re-attached after a context is rebuilt.

use async_trait::async_trait;
use dashmap::DashMap;
use ed25519_dalek::{Signer as _, SigningKey as Ed25519SigningKey};
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{DerSignature, SigningKey as P256SigningKey, VerifyingKey as P256VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

/// Opaque reference to a private key held by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub String);

#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Generate a P-256 signing key. Returns the handle and the raw
    /// uncompressed public key (65 bytes).
    async fn generate_p256(&self) -> Result<(KeyHandle, Vec<u8>)>;

    /// Export the raw private scalar of a freshly generated key. Allowed
    /// exactly once per handle and never for imported handles - the caller
    /// wraps the bytes immediately and the plaintext dies with the return
    /// value.
    async fn export_p256_once(&self, handle: &KeyHandle) -> Result<Zeroizing<Vec<u8>>>;

    /// Import a raw private scalar into a fresh non-exportable handle.
    async fn import_p256(&self, raw: &[u8]) -> Result<(KeyHandle, Vec<u8>)>;

    /// ECDSA-SHA-256 signature in DER form.
    async fn sign_es256_der(&self, handle: &KeyHandle, message: &[u8]) -> Result<Vec<u8>>;

    /// Generate an Ed25519 key registered under `name`, returning the
    /// handle and public key. Fails if the name is taken.
    async fn generate_ed25519(&self, name: &str) -> Result<(KeyHandle, [u8; 32])>;

    /// Look up a named Ed25519 key.
    async fn ed25519_by_name(&self, name: &str) -> Result<Option<(KeyHandle, [u8; 32])>>;

    async fn sign_ed25519(&self, handle: &KeyHandle, message: &[u8]) -> Result<[u8; 64]>;

    /// Discard a handle and its key material.
    async fn drop_key(&self, handle: &KeyHandle);
}

/// Verify an Ed25519 signature. Pure helper for chain verification.
pub fn verify_ed25519(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    match VerifyingKey::from_bytes(public_key) {
        Ok(vk) => vk.verify(message, &Signature::from_bytes(signature)).is_ok(),
        Err(_) => false,
    }
}

enum ProviderKey {
    P256 {
        key: P256SigningKey,
        exportable: bool,
    },
    Ed25519 {
        key: Ed25519SigningKey,
        name: String,
    },
}

/// In-process provider. Key material stays inside this struct for the
/// lifetime of the process, the stand-in for a platform keystore.
#[derive(Default)]
pub struct SoftwareKeyProvider {
    keys: DashMap<String, ProviderKey>,
    names: DashMap<String, String>,
}

impl SoftwareKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_handle(&self) -> String {
        let mut id = [0u8; 16];
        OsRng.fill_bytes(&mut id);
        hex::encode(id)
    }

    fn raw_public(key: &P256SigningKey) -> Vec<u8> {
        P256VerifyingKey::from(key)
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }
}

#[async_trait]
impl KeyProvider for SoftwareKeyProvider {
    async fn generate_p256(&self) -> Result<(KeyHandle, Vec<u8>)> {
        let key = P256SigningKey::random(&mut OsRng);
        let public = Self::raw_public(&key);
        let id = self.fresh_handle();
        self.keys.insert(
            id.clone(),
            ProviderKey::P256 {
                key,
                exportable: true,
            },
        );
        Ok((KeyHandle(id), public))
    }

    async fn export_p256_once(&self, handle: &KeyHandle) -> Result<Zeroizing<Vec<u8>>> {
        let mut entry = self
            .keys
            .get_mut(&handle.0)
            .ok_or_else(|| CryptoError::InvalidFormat("unknown key handle".into()))?;
        match entry.value_mut() {
            ProviderKey::P256 { key, exportable } => {
                if !*exportable {
                    return Err(CryptoError::InvalidFormat(
                        "key handle is not exportable".into(),
                    ));
                }
                *exportable = false;
                Ok(Zeroizing::new(key.to_bytes().to_vec()))
            }
            ProviderKey::Ed25519 { .. } => {
                Err(CryptoError::InvalidFormat("not a P-256 handle".into()))
            }
        }
    }

    async fn import_p256(&self, raw: &[u8]) -> Result<(KeyHandle, Vec<u8>)> {
        let key = P256SigningKey::from_slice(raw)
            .map_err(|_| CryptoError::InvalidFormat("invalid P-256 private scalar".into()))?;
        let public = Self::raw_public(&key);
        let id = self.fresh_handle();
        self.keys.insert(
            id.clone(),
            ProviderKey::P256 {
                key,
                exportable: false,
            },
        );
        Ok((KeyHandle(id), public))
    }

    async fn sign_es256_der(&self, handle: &KeyHandle, message: &[u8]) -> Result<Vec<u8>> {
        let entry = self
            .keys
            .get(&handle.0)
            .ok_or_else(|| CryptoError::InvalidFormat("unknown key handle".into()))?;
        match entry.value() {
            ProviderKey::P256 { key, .. } => {
                let sig: DerSignature = key.sign(message);
                Ok(sig.as_bytes().to_vec())
            }
            ProviderKey::Ed25519 { .. } => {
                Err(CryptoError::InvalidFormat("not a P-256 handle".into()))
            }
        }
    }

    async fn generate_ed25519(&self, name: &str) -> Result<(KeyHandle, [u8; 32])> {
        if self.names.contains_key(name) {
            return Err(CryptoError::InvalidFormat(format!(
                "signer name already registered: {name}"
            )));
        }
        let mut secret = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *secret);
        let key = Ed25519SigningKey::from_bytes(&secret);
        let public = key.verifying_key().to_bytes();

        let id = self.fresh_handle();
        self.keys.insert(
            id.clone(),
            ProviderKey::Ed25519 {
                key,
                name: name.to_string(),
            },
        );
        self.names.insert(name.to_string(), id.clone());
        Ok((KeyHandle(id), public))
    }

    async fn ed25519_by_name(&self, name: &str) -> Result<Option<(KeyHandle, [u8; 32])>> {
        let Some(id) = self.names.get(name).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let entry = self
            .keys
            .get(&id)
            .ok_or_else(|| CryptoError::InvalidFormat("dangling signer name".into()))?;
        match entry.value() {
            ProviderKey::Ed25519 { key, .. } => {
                Ok(Some((KeyHandle(id.clone()), key.verifying_key().to_bytes())))
            }
            ProviderKey::P256 { .. } => Err(CryptoError::InvalidFormat("not an Ed25519 handle".into())),
        }
    }

    async fn sign_ed25519(&self, handle: &KeyHandle, message: &[u8]) -> Result<[u8; 64]> {
        let entry = self
            .keys
            .get(&handle.0)
            .ok_or_else(|| CryptoError::InvalidFormat("unknown key handle".into()))?;
        match entry.value() {
            ProviderKey::Ed25519 { key, .. } => Ok(key.sign(message).to_bytes()),
            ProviderKey::P256 { .. } => {
                Err(CryptoError::InvalidFormat("not an Ed25519 handle".into()))
            }
        }
    }

    async fn drop_key(&self, handle: &KeyHandle) {
        if let Some((_, key)) = self.keys.remove(&handle.0) {
            if let ProviderKey::Ed25519 { name, .. } = key {
                self.names.remove(&name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecdsa_der::der_to_raw64;
    use crate::jwk::thumbprint_of_raw_public;

    #[tokio::test]
    async fn p256_generate_export_import_cycle() {
        let provider = SoftwareKeyProvider::new();
        let (handle, public) = provider.generate_p256().await.unwrap();
        assert_eq!(public.len(), 65);
        assert_eq!(public[0], 0x04);

        let raw = provider.export_p256_once(&handle).await.unwrap();
        // Second export must be refused.
        assert!(provider.export_p256_once(&handle).await.is_err());

        let (imported, public2) = provider.import_p256(&raw).await.unwrap();
        assert_eq!(public, public2);
        assert!(provider.export_p256_once(&imported).await.is_err());
        assert_eq!(
            thumbprint_of_raw_public(&public).unwrap(),
            thumbprint_of_raw_public(&public2).unwrap()
        );
    }

    #[tokio::test]
    async fn es256_signature_is_der() {
        let provider = SoftwareKeyProvider::new();
        let (handle, _) = provider.generate_p256().await.unwrap();
        let der = provider.sign_es256_der(&handle, b"msg").await.unwrap();
        assert_eq!(der[0], 0x30);
        der_to_raw64(&der).unwrap();
    }

    #[tokio::test]
    async fn named_ed25519_signers() {
        let provider = SoftwareKeyProvider::new();
        let (handle, public) = provider.generate_ed25519("audit.system").await.unwrap();
        assert!(provider.generate_ed25519("audit.system").await.is_err());

        let (found, found_pub) = provider
            .ed25519_by_name("audit.system")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, handle);
        assert_eq!(found_pub, public);

        let sig = provider.sign_ed25519(&handle, b"entry").await.unwrap();
        assert!(verify_ed25519(&public, b"entry", &sig));
        assert!(!verify_ed25519(&public, b"other", &sig));

        provider.drop_key(&handle).await;
        assert!(provider
            .ed25519_by_name("audit.system")
            .await
            .unwrap()
            .is_none());
    }
}

//! Signing engine
//!
//! Builds the compact three-part tokens and enforces the signing policy.
//! The signature segment is always the raw 64-byte form; the DER output of
//! the signer is converted before encoding.

use std::sync::Arc;

use serde_json::json;
use url::Url;

use keyfort_config::Config;
use keyfort_crypto::{b64u_encode, der_to_raw64, random_array, KeyProvider};

use crate::error::{KmsError, Result};
use crate::types::SigningKeyRecord;

/// Fixed token header. Byte-exact; do not reorder.
const TOKEN_HEADER: &str = r#"{"typ":"JWT","alg":"ES256"}"#;

/// One issued token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    /// Unix seconds.
    pub exp: i64,
}

pub struct SigningEngine {
    provider: Arc<dyn KeyProvider>,
    config: Arc<Config>,
}

impl SigningEngine {
    pub fn new(provider: Arc<dyn KeyProvider>, config: Arc<Config>) -> Self {
        Self { provider, config }
    }

    /// Expiration ladder for a batch: the k-th token lives
    /// `base + k * stagger` seconds.
    pub fn staggered_expirations(&self, now_secs: i64, count: u32) -> Vec<i64> {
        (0..count as i64)
            .map(|k| {
                now_secs
                    + self.config.batch_base_ttl_secs as i64
                    + k * self.config.batch_stagger_secs as i64
            })
            .collect()
    }

    /// Single-issue expiration.
    pub fn single_expiration(&self, now_secs: i64) -> i64 {
        now_secs + self.config.token_ttl_secs as i64
    }

    /// The `aud` claim for an endpoint: its https origin.
    pub fn audience_for_endpoint(&self, endpoint: &str) -> Result<String> {
        let url = Url::parse(endpoint)
            .map_err(|e| KmsError::InvalidEndpoint(format!("unparseable endpoint: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| KmsError::InvalidEndpoint("endpoint has no host".into()))?;
        Ok(match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        })
    }

    /// Signing policy, checked before any signature is produced.
    pub fn validate_policy(&self, aud: &str, sub: &str, exp: i64, now_secs: i64) -> Result<()> {
        if exp <= now_secs {
            return Err(KmsError::PolicyViolation("exp is in the past".into()));
        }
        let max = now_secs + self.config.max_token_ttl_secs as i64;
        if exp > max {
            return Err(KmsError::PolicyViolation(format!(
                "exp exceeds the {}s ceiling",
                self.config.max_token_ttl_secs
            )));
        }

        let aud_url =
            Url::parse(aud).map_err(|_| KmsError::PolicyViolation("aud is not a URL".into()))?;
        if aud_url.scheme() != "https" {
            return Err(KmsError::PolicyViolation("aud must be https".into()));
        }

        if !sub.starts_with("mailto:") && !sub.starts_with("https:") {
            return Err(KmsError::PolicyViolation(
                "sub must start with mailto: or https:".into(),
            ));
        }
        Ok(())
    }

    /// Sign one token per expiration with the raw private scalar. The
    /// scalar is imported into a throwaway handle that is dropped before
    /// returning.
    pub async fn sign_tokens(
        &self,
        raw_private: &[u8],
        record: &SigningKeyRecord,
        aud: &str,
        sub: &str,
        expirations: &[i64],
    ) -> Result<Vec<IssuedToken>> {
        let (handle, public_key) = self.provider.import_p256(raw_private).await?;
        if public_key != record.public_key {
            self.provider.drop_key(&handle).await;
            return Err(KmsError::Internal(
                "unwrapped key does not match the stored public key".into(),
            ));
        }

        let header = b64u_encode(TOKEN_HEADER.as_bytes());
        let mut tokens = Vec::with_capacity(expirations.len());
        for &exp in expirations {
            let jti = b64u_encode(random_array::<16>());
            let payload = b64u_encode(
                serde_json::to_vec(&json!({
                    "aud": aud,
                    "sub": sub,
                    "exp": exp,
                    "jti": jti,
                }))
                .map_err(KmsError::from)?,
            );

            let signing_input = format!("{header}.{payload}");
            let der = match self.provider.sign_es256_der(&handle, signing_input.as_bytes()).await {
                Ok(der) => der,
                Err(e) => {
                    self.provider.drop_key(&handle).await;
                    return Err(e.into());
                }
            };
            let raw = der_to_raw64(&der)?;
            tokens.push(IssuedToken {
                token: format!("{signing_input}.{}", b64u_encode(raw)),
                jti,
                exp,
            });
        }
        self.provider.drop_key(&handle).await;
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyfort_crypto::SoftwareKeyProvider;

    fn engine() -> SigningEngine {
        SigningEngine::new(
            Arc::new(SoftwareKeyProvider::new()),
            Arc::new(Config::default()),
        )
    }

    #[test]
    fn policy_bounds_exp() {
        let engine = engine();
        let now = 1_700_000_000;
        assert!(engine
            .validate_policy("https://fcm.googleapis.com", "mailto:a@b", now + 900, now)
            .is_ok());
        assert!(engine
            .validate_policy("https://fcm.googleapis.com", "mailto:a@b", now, now)
            .is_err());
        assert!(engine
            .validate_policy(
                "https://fcm.googleapis.com",
                "mailto:a@b",
                now + 48 * 3600,
                now
            )
            .is_err());
    }

    #[test]
    fn policy_requires_https_aud_and_known_sub_scheme() {
        let engine = engine();
        let now = 1_700_000_000;
        assert!(engine
            .validate_policy("http://fcm.googleapis.com", "mailto:a@b", now + 60, now)
            .is_err());
        assert!(engine
            .validate_policy("not a url", "mailto:a@b", now + 60, now)
            .is_err());
        assert!(engine
            .validate_policy("https://x.test", "tel:+123", now + 60, now)
            .is_err());
        assert!(engine
            .validate_policy("https://x.test", "https://contact.test", now + 60, now)
            .is_ok());
    }

    #[test]
    fn audience_is_the_origin() {
        let engine = engine();
        assert_eq!(
            engine
                .audience_for_endpoint("https://fcm.googleapis.com/fcm/send/abc")
                .unwrap(),
            "https://fcm.googleapis.com"
        );
        assert_eq!(
            engine
                .audience_for_endpoint("https://push.example.test:8443/x")
                .unwrap(),
            "https://push.example.test:8443"
        );
    }

    #[test]
    fn stagger_ladder_shape() {
        let engine = engine();
        let exps = engine.staggered_expirations(0, 3);
        assert_eq!(exps, vec![6_000, 9_600, 13_200]);
    }
}

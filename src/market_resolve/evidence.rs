//! Resolution evidence
//!
//! Evidence is a tagged enum keyed by resolution mode. Shape rules are
//! checked before any lock is taken; ORACLE provenance (signature or trusted
//! source host) is verified against the engine configuration.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::engine::canonical_hash;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::ResolutionMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Evidence {
    Oracle {
        source_url: String,
        /// Signed message; required together with `signature`
        #[serde(default)]
        payload: Option<String>,
        /// Hex Ed25519 signature over `payload`
        #[serde(default)]
        signature: Option<String>,
        /// Hex key that produced `signature`; any configured key is tried if absent
        #[serde(default)]
        public_key: Option<String>,
    },
    Authority {
        statement: String,
        #[serde(default)]
        attachments: Vec<String>,
    },
    Opinion {
        #[serde(default)]
        comment: Option<String>,
    },
}

impl Evidence {
    pub fn mode(&self) -> ResolutionMode {
        match self {
            Evidence::Oracle { .. } => ResolutionMode::Oracle,
            Evidence::Authority { .. } => ResolutionMode::Authority,
            Evidence::Opinion { .. } => ResolutionMode::Opinion,
        }
    }

    /// Field rules for the variant
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Evidence::Oracle { source_url, payload, signature, .. } => {
                let url = Url::parse(source_url)
                    .map_err(|e| EngineError::Validation(format!("invalid source_url: {}", e)))?;
                if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                    return Err(EngineError::Validation(format!(
                        "source_url must be an http(s) URL: {}",
                        source_url
                    )));
                }
                if signature.is_some() && payload.as_deref().map_or(true, str::is_empty) {
                    return Err(EngineError::Validation("signed oracle evidence needs a payload".into()));
                }
                Ok(())
            }
            Evidence::Authority { statement, .. } => {
                if statement.trim().is_empty() {
                    return Err(EngineError::Validation("authority evidence needs a statement".into()));
                }
                Ok(())
            }
            Evidence::Opinion { .. } => Ok(()),
        }
    }

    /// Check that the evidence variant fits the market's mode
    pub fn ensure_mode(&self, mode: ResolutionMode) -> EngineResult<()> {
        if self.mode() != mode {
            return Err(EngineError::Validation(format!(
                "{} evidence submitted for a {} market",
                self.mode(),
                mode
            )));
        }
        Ok(())
    }

    /// ORACLE provenance: a valid signature by a configured key, or a trusted source host
    pub fn verify(&self, config: &EngineConfig) -> EngineResult<()> {
        let Evidence::Oracle { source_url, payload, signature, public_key } = self else {
            return Ok(());
        };

        if let (Some(signature), Some(payload)) = (signature, payload) {
            let candidates: Vec<&String> = match public_key {
                Some(key) => config.oracle_public_keys.iter().filter(|k| k.eq_ignore_ascii_case(key)).collect(),
                None => config.oracle_public_keys.iter().collect(),
            };
            for key in candidates {
                if verify_signature(key, payload.as_bytes(), signature)? {
                    return Ok(());
                }
            }
            return Err(EngineError::Forbidden("oracle signature is not from a trusted key".into()));
        }

        let host = Url::parse(source_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_default();
        if is_trusted_host(&host, &config.trusted_oracle_sources) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!("oracle source {} is not verified", host)))
        }
    }

    /// SHA-256 of the evidence's canonical JSON
    pub fn hash(&self) -> EngineResult<String> {
        let value = serde_json::to_value(self)
            .map_err(|e| EngineError::Internal(format!("evidence serialization failed: {}", e)))?;
        Ok(canonical_hash(&value))
    }
}

fn is_trusted_host(host: &str, trusted: &[String]) -> bool {
    !host.is_empty()
        && trusted.iter().any(|t| {
            let t = t.trim().to_ascii_lowercase();
            host == t || host.ends_with(&format!(".{}", t))
        })
}

fn verify_signature(pubkey_hex: &str, message: &[u8], signature_hex: &str) -> EngineResult<bool> {
    let key_bytes: [u8; 32] = hex::decode(pubkey_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| EngineError::Internal(format!("configured oracle key {} is not 32 hex bytes", pubkey_hex)))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| EngineError::Internal(format!("configured oracle key is invalid: {}", e)))?;

    let sig_bytes: [u8; 64] = match hex::decode(signature_hex).ok().and_then(|b| b.try_into().ok()) {
        Some(bytes) => bytes,
        None => return Err(EngineError::Validation("signature must be 64 hex-encoded bytes".into())),
    };
    let signature = Signature::from_bytes(&sig_bytes);
    Ok(verifying_key.verify(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn oracle(url: &str) -> Evidence {
        Evidence::Oracle { source_url: url.into(), payload: None, signature: None, public_key: None }
    }

    #[test]
    fn test_shape_rules() {
        assert!(oracle("https://feeds.example.com/result").validate().is_ok());
        assert!(oracle("not a url").validate().is_err());
        assert!(oracle("ftp://feeds.example.com").validate().is_err());
        assert!(Evidence::Authority { statement: "  ".into(), attachments: vec![] }.validate().is_err());
        assert!(Evidence::Opinion { comment: None }.validate().is_ok());
    }

    #[test]
    fn test_mode_must_match() {
        let evidence = Evidence::Opinion { comment: None };
        assert!(evidence.ensure_mode(ResolutionMode::Opinion).is_ok());
        assert!(evidence.ensure_mode(ResolutionMode::Authority).is_err());
    }

    #[test]
    fn test_trusted_host_allows_subdomains() {
        let config = EngineConfig { trusted_oracle_sources: vec!["example.com".into()], ..Default::default() };
        assert!(oracle("https://feeds.example.com/x").verify(&config).is_ok());
        assert!(oracle("https://example.com/x").verify(&config).is_ok());
        assert!(matches!(
            oracle("https://badexample.com/x").verify(&config),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn test_signed_evidence() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let public_hex = hex::encode(signing.verifying_key().to_bytes());
        let payload = "m1/o1=YES".to_string();
        let signature = hex::encode(signing.sign(payload.as_bytes()).to_bytes());

        let config = EngineConfig { oracle_public_keys: vec![public_hex], ..Default::default() };
        let evidence = Evidence::Oracle {
            source_url: "https://anywhere.test/".into(),
            payload: Some(payload),
            signature: Some(signature.clone()),
            public_key: None,
        };
        assert!(evidence.verify(&config).is_ok());

        let tampered = Evidence::Oracle {
            source_url: "https://anywhere.test/".into(),
            payload: Some("m1/o1=NO".into()),
            signature: Some(signature),
            public_key: None,
        };
        assert!(matches!(tampered.verify(&config), Err(EngineError::Forbidden(_))));
    }

    #[test]
    fn test_hash_is_stable() {
        let a = Evidence::Authority { statement: "Official result".into(), attachments: vec![] };
        let b = a.clone();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
        assert_ne!(a.hash().unwrap(), Evidence::Opinion { comment: None }.hash().unwrap());
    }
}

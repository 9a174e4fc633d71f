//! W3C ClearKey engine.
//!
//! License requests and responses are the JSON documents defined by the
//! Encrypted Media Extensions ClearKey key system, with key ids and keys as
//! unpadded base64url.
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::engine::{CdmEngine, LicenseContext};
use crate::error::{Error, Result};
use crate::key::KeyMaterial;
use crate::scheme::KeyType;

/// ClearKey content decryption module.
#[derive(Debug, Clone, Default)]
pub struct ClearKeyEngine {
    key_type: KeyType,
}

impl ClearKeyEngine {
    /// Engine producing AES-128 keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine producing keys of the given cipher family.
    pub fn with_key_type(key_type: KeyType) -> Self {
        Self { key_type }
    }
}

#[derive(Debug, Serialize)]
struct LicenseRequestBody {
    kids: Vec<String>,
    #[serde(rename = "type")]
    session_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct LicenseResponseBody {
    keys: Vec<JsonWebKey>,
}

#[derive(Debug, Deserialize)]
struct JsonWebKey {
    kty: String,
    kid: String,
    k: String,
}

fn decode_b64url(value: &str) -> Result<Vec<u8>> {
    let trimmed = value.trim_end_matches('=');
    match URL_SAFE_NO_PAD.decode(trimmed) {
        Ok(bytes) => Ok(bytes),
        Err(_) => Ok(URL_SAFE.decode(value)?),
    }
}

impl CdmEngine for ClearKeyEngine {
    fn provision_request(&self) -> Result<Option<Vec<u8>>> {
        // ClearKey has no device credentials.
        Ok(None)
    }

    fn process_provision_response(&self, _response: &[u8]) -> Result<()> {
        Ok(())
    }

    fn license_request(&self, ctx: &LicenseContext<'_>) -> Result<Vec<u8>> {
        if ctx.key_ids.is_empty() {
            return Err(Error::InvalidConfig(
                "ClearKey license requests need at least one key id".to_string(),
            ));
        }
        let body = LicenseRequestBody {
            kids: ctx
                .key_ids
                .iter()
                .map(|kid| URL_SAFE_NO_PAD.encode(kid.as_bytes()))
                .collect(),
            session_type: "temporary",
        };
        Ok(serde_json::to_vec(&body)?)
    }

    fn process_license_response(
        &self,
        _ctx: &LicenseContext<'_>,
        response: &[u8],
    ) -> Result<Vec<KeyMaterial>> {
        let body: LicenseResponseBody = serde_json::from_slice(response)
            .map_err(|e| Error::InvalidLicenseMessage(format!("Invalid ClearKey JSON: {}", e)))?;

        let mut keys = Vec::with_capacity(body.keys.len());
        for jwk in body.keys {
            if jwk.kty != "oct" {
                warn!("Skipping ClearKey entry with key type {}", jwk.kty);
                continue;
            }
            let kid = KeyMaterial::kid_to_uuid(&decode_b64url(&jwk.kid)?)?;
            let key = decode_b64url(&jwk.k)?;
            keys.push(KeyMaterial::new(self.key_type, Some(kid), key, None));
        }
        if keys.is_empty() {
            return Err(Error::InvalidLicenseMessage(
                "License carries no symmetric keys".to_string(),
            ));
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::scheme::DrmScheme;

    const KID: Uuid = Uuid::from_u128(0x0123456789abcdef0123456789abcdef);

    fn ctx(kids: &[Uuid]) -> LicenseContext<'_> {
        LicenseContext {
            scheme: DrmScheme::ClearKey,
            key_ids: kids,
            init_data: None,
        }
    }

    #[test]
    fn request_lists_kids_as_base64url() {
        let body = ClearKeyEngine::new().license_request(&ctx(&[KID])).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["type"], "temporary");
        assert_eq!(json["kids"][0], URL_SAFE_NO_PAD.encode(KID.as_bytes()));
    }

    #[test]
    fn request_without_kids_is_rejected() {
        assert!(ClearKeyEngine::new().license_request(&ctx(&[])).is_err());
    }

    #[test]
    fn response_yields_keys() {
        let response = serde_json::json!({
            "keys": [
                { "kty": "oct", "kid": URL_SAFE_NO_PAD.encode(KID.as_bytes()), "k": URL_SAFE.encode([7u8; 16]) },
                { "kty": "RSA", "kid": "ignored", "k": "ignored" },
            ],
            "type": "temporary"
        });
        let keys = ClearKeyEngine::with_key_type(KeyType::Sm4)
            .process_license_response(&ctx(&[KID]), response.to_string().as_bytes())
            .unwrap();

        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_id, Some(KID));
        assert_eq!(keys[0].key(), &[7u8; 16]);
        assert_eq!(keys[0].key_type, KeyType::Sm4);
    }

    #[test]
    fn garbage_response_is_invalid_license() {
        let err = ClearKeyEngine::new()
            .process_license_response(&ctx(&[KID]), b"<html>")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLicenseMessage(_)));
    }

    #[test]
    fn no_provisioning_needed() {
        assert!(ClearKeyEngine::new().provision_request().unwrap().is_none());
    }
}

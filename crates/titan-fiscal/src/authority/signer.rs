//! Ticket request signing.
//!
//! The ticket grant endpoint expects the request (unique id, generation and
//! expiration time, service) plus a detached signature made with the holder's
//! private key. The signature is a JWS whose payload segment is removed
//! (`header..signature`); the payload travels separately as
//! `loginTicketRequest`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{AuthoritySettings, SigningAlgorithm};
use crate::error::{Failure, FiscalError, FiscalResult, TerminalError};

/// The document signed to obtain a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketRequest {
    pub unique_id: u32,
    pub generation_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    pub service: String,
}

impl TicketRequest {
    /// Request generated at `now - skew`, expiring at `now + ttl`.
    pub fn new(service: &str, now: DateTime<Utc>, skew: Duration, ttl: Duration) -> Self {
        let skew = chrono::Duration::from_std(skew).unwrap_or_default();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_default();
        TicketRequest {
            unique_id: now.timestamp() as u32,
            generation_time: now - skew,
            expiration_time: now + ttl,
            service: service.to_string(),
        }
    }
}

/// A signed request ready for the grant endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTicketRequest {
    /// base64url of the request JSON.
    pub request: String,
    /// JWS with the payload detached.
    pub signature: String,
}

pub struct TicketSigner {
    algorithm: Algorithm,
    key: EncodingKey,
}

impl std::fmt::Debug for TicketSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketSigner")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl TicketSigner {
    /// RS256 signer from a PEM-encoded RSA private key.
    pub fn rsa_pem(pem: &[u8]) -> FiscalResult<Self> {
        let key = EncodingKey::from_rsa_pem(pem)
            .map_err(|e| FiscalError::SigningKey(e.to_string()))?;
        Ok(TicketSigner {
            algorithm: Algorithm::RS256,
            key,
        })
    }

    /// HS256 signer from a shared secret.
    pub fn hmac(secret: &[u8]) -> Self {
        TicketSigner {
            algorithm: Algorithm::HS256,
            key: EncodingKey::from_secret(secret),
        }
    }

    pub fn from_settings(settings: &AuthoritySettings) -> FiscalResult<Self> {
        let material = settings.load_signing_key()?;
        match settings.signing_algorithm {
            SigningAlgorithm::Rs256 => Self::rsa_pem(&material),
            SigningAlgorithm::Hs256 => Ok(Self::hmac(&material)),
        }
    }

    /// Signs the request. A signing failure means our key is unusable.
    pub fn sign(&self, request: &TicketRequest) -> Result<SignedTicketRequest, Failure> {
        let token = jsonwebtoken::encode(&Header::new(self.algorithm), request, &self.key)
            .map_err(|e| Failure::Terminal(TerminalError::Credentials(e.to_string())))?;

        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Failure::protocol("signer produced a malformed JWS"));
        };

        Ok(SignedTicketRequest {
            request: payload.to_string(),
            signature: format!("{header}..{signature}"),
        })
    }
}

/// Decodes the request carried by a signed ticket request.
pub fn decode_request(signed: &SignedTicketRequest) -> Option<TicketRequest> {
    let bytes = URL_SAFE_NO_PAD.decode(&signed.request).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_request_window() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        let request = TicketRequest::new(
            "wsfe",
            now,
            Duration::from_secs(60),
            Duration::from_secs(600),
        );

        assert_eq!(request.generation_time, now - chrono::Duration::seconds(60));
        assert_eq!(request.expiration_time, now + chrono::Duration::minutes(10));
        assert_eq!(request.service, "wsfe");
        assert_eq!(request.unique_id, now.timestamp() as u32);
    }

    #[test]
    fn test_signature_is_detached() {
        let signer = TicketSigner::hmac(b"test-secret");
        let request = TicketRequest::new(
            "wsfe",
            Utc::now(),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );

        let signed = signer.sign(&request).unwrap();
        assert!(signed.signature.contains(".."));
        assert_eq!(signed.signature.split('.').count(), 3);
        assert_eq!(decode_request(&signed), Some(request));
    }

    #[test]
    fn test_invalid_pem_is_rejected() {
        let err = TicketSigner::rsa_pem(b"not a key").unwrap_err();
        assert!(err.is_config_error());
    }
}

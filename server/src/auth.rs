//! Credential validation for channel handshakes
//!
//! A credential is `base64url(claims) "." base64url(signature)`, where the
//! claims are a protobuf `CredentialClaims` and the signature is Ed25519 over
//! the raw claim bytes. Validation happens exactly once per connection
//! attempt and touches nothing but the key ring.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use fleetsync_shared::{limits, now_ms, CredentialClaims, Role};
use prost::Message;
use rand::rngs::OsRng;

use crate::error::AuthError;

/// Authenticated identity bound to a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Turns an opaque handshake credential into a principal
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, credential: &str) -> Result<Principal, AuthError>;
}

/// Verifying keys by key id
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, VerifyingKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(key_id.into(), key);
    }

    pub fn get(&self, key_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(key_id)
    }
}

/// Validates Ed25519-signed bearer tokens against a key ring
pub struct SignedTokenValidator {
    keys: KeyRing,
    clock_skew_ms: u64,
}

impl SignedTokenValidator {
    pub fn new(keys: KeyRing) -> Self {
        Self {
            keys,
            clock_skew_ms: limits::CREDENTIAL_CLOCK_SKEW_MS,
        }
    }

    /// Validate as of `now` (milliseconds since epoch)
    pub fn validate_at(&self, credential: &str, now: u64) -> Result<Principal, AuthError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AuthError::Missing);
        }

        let (claims_b64, signature_b64) = credential
            .split_once('.')
            .ok_or_else(|| AuthError::Malformed("expected two segments".into()))?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|e| AuthError::Malformed(format!("claims segment: {e}")))?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| AuthError::Malformed(format!("signature segment: {e}")))?;

        let claims = CredentialClaims::decode(claims_bytes.as_slice())
            .map_err(|e| AuthError::Malformed(format!("claims body: {e}")))?;

        let key = self
            .keys
            .get(&claims.key_id)
            .ok_or_else(|| AuthError::UnknownKey(claims.key_id.clone()))?;

        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| AuthError::BadSignature)?;
        key.verify_strict(&claims_bytes, &signature)
            .map_err(|_| AuthError::BadSignature)?;

        // Claims are only trusted past this point
        if claims.principal_id.trim().is_empty() {
            return Err(AuthError::Malformed("empty principal".into()));
        }

        let role = match Role::try_from(claims.role) {
            Ok(Role::Unspecified) | Err(_) => {
                return Err(AuthError::Malformed(format!("unknown role {}", claims.role)))
            }
            Ok(role) => role,
        };

        if now >= claims.expires_at_ms {
            return Err(AuthError::Expired {
                expires_at_ms: claims.expires_at_ms,
            });
        }

        if claims.issued_at_ms > now.saturating_add(self.clock_skew_ms) {
            return Err(AuthError::NotYetValid {
                issued_at_ms: claims.issued_at_ms,
            });
        }

        Ok(Principal::new(claims.principal_id, role))
    }
}

impl CredentialValidator for SignedTokenValidator {
    fn validate(&self, credential: &str) -> Result<Principal, AuthError> {
        self.validate_at(credential, now_ms())
    }
}

/// Signing side of the credential format, used by tooling and tests
pub struct TokenIssuer {
    key_id: String,
    signing_key: SigningKey,
}

impl TokenIssuer {
    pub fn new(key_id: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            key_id: key_id.into(),
            signing_key,
        }
    }

    /// Build an issuer from a base64 (standard alphabet) 32-byte seed
    pub fn from_seed(key_id: impl Into<String>, seed_b64: &str) -> Result<Self, AuthError> {
        let bytes = STANDARD
            .decode(seed_b64.trim())
            .map_err(|e| AuthError::Malformed(format!("signing seed: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthError::Malformed("signing seed must be 32 bytes".into()))?;
        Ok(Self::new(key_id, SigningKey::from_bytes(&seed)))
    }

    /// Fresh random issuer
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self::new(key_id, SigningKey::generate(&mut OsRng))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Base64 seed for this issuer's key
    pub fn seed(&self) -> String {
        STANDARD.encode(self.signing_key.to_bytes())
    }

    /// Key ring that accepts this issuer's credentials
    pub fn key_ring(&self) -> KeyRing {
        let mut ring = KeyRing::new();
        ring.insert(self.key_id.clone(), self.verifying_key());
        ring
    }

    pub fn issue(&self, principal_id: &str, role: Role, ttl: Duration) -> String {
        self.issue_at(principal_id, role, now_ms(), ttl)
    }

    pub fn issue_at(&self, principal_id: &str, role: Role, issued_at_ms: u64, ttl: Duration) -> String {
        let claims = CredentialClaims {
            key_id: self.key_id.clone(),
            principal_id: principal_id.to_string(),
            role: role.into(),
            issued_at_ms,
            expires_at_ms: issued_at_ms.saturating_add(ttl.as_millis() as u64),
        };
        let claims_bytes = claims.encode_to_vec();
        let signature = self.signing_key.sign(&claims_bytes);

        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&claims_bytes),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn validator_for(issuer: &TokenIssuer) -> SignedTokenValidator {
        SignedTokenValidator::new(issuer.key_ring())
    }

    #[test]
    fn test_valid_credential_yields_principal() {
        let issuer = TokenIssuer::generate("primary");
        let token = issuer.issue_at("op-17", Role::Operator, 1_000, HOUR);

        let principal = validator_for(&issuer)
            .validate_at(&token, 2_000)
            .expect("valid credential");
        assert_eq!(principal, Principal::new("op-17", Role::Operator));
    }

    #[test]
    fn test_missing_and_malformed_credentials() {
        let issuer = TokenIssuer::generate("primary");
        let validator = validator_for(&issuer);

        assert_eq!(validator.validate_at("", 0), Err(AuthError::Missing));
        assert_eq!(validator.validate_at("   ", 0), Err(AuthError::Missing));
        assert!(matches!(
            validator.validate_at("no-dot-here", 0),
            Err(AuthError::Malformed(_))
        ));
        assert!(matches!(
            validator.validate_at("!!!.???", 0),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_expired_credential_rejected() {
        let issuer = TokenIssuer::generate("primary");
        let token = issuer.issue_at("op-1", Role::Operator, 1_000, Duration::from_millis(500));

        assert_eq!(
            validator_for(&issuer).validate_at(&token, 1_500),
            Err(AuthError::Expired { expires_at_ms: 1_500 })
        );
    }

    #[test]
    fn test_future_credential_rejected_beyond_skew() {
        let issuer = TokenIssuer::generate("primary");
        let issued = 1_000_000;
        let token = issuer.issue_at("op-1", Role::Viewer, issued, HOUR);
        let validator = validator_for(&issuer);

        let within_skew = issued - limits::CREDENTIAL_CLOCK_SKEW_MS;
        assert!(validator.validate_at(&token, within_skew).is_ok());

        assert_eq!(
            validator.validate_at(&token, within_skew - 1),
            Err(AuthError::NotYetValid { issued_at_ms: issued })
        );
    }

    #[test]
    fn test_foreign_key_rejected() {
        let trusted = TokenIssuer::generate("primary");
        let forger = TokenIssuer::generate("primary");
        let token = forger.issue_at("admin", Role::Admin, 1_000, HOUR);

        assert_eq!(
            validator_for(&trusted).validate_at(&token, 2_000),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn test_unknown_key_id_rejected() {
        let trusted = TokenIssuer::generate("primary");
        let other = TokenIssuer::generate("rotated");
        let token = other.issue_at("op-1", Role::Operator, 1_000, HOUR);

        assert_eq!(
            validator_for(&trusted).validate_at(&token, 2_000),
            Err(AuthError::UnknownKey("rotated".into()))
        );
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let issuer = TokenIssuer::generate("primary");
        let token = issuer.issue_at("viewer-1", Role::Viewer, 1_000, HOUR);
        let admin = issuer.issue_at("viewer-1", Role::Admin, 1_000, HOUR);

        // Splice the admin claims onto the viewer signature
        let (_, viewer_sig) = token.split_once('.').expect("two segments");
        let (admin_claims, _) = admin.split_once('.').expect("two segments");
        let spliced = format!("{admin_claims}.{viewer_sig}");

        assert_eq!(
            validator_for(&issuer).validate_at(&spliced, 2_000),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn test_unspecified_role_rejected() {
        let issuer = TokenIssuer::generate("primary");
        let token = issuer.issue_at("who", Role::Unspecified, 1_000, HOUR);

        assert!(matches!(
            validator_for(&issuer).validate_at(&token, 2_000),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_seed_round_trip_keeps_key() {
        let issuer = TokenIssuer::generate("primary");
        let restored = TokenIssuer::from_seed("primary", &issuer.seed()).expect("seed");
        assert_eq!(issuer.verifying_key(), restored.verifying_key());

        assert!(TokenIssuer::from_seed("primary", "c2hvcnQ=").is_err());
    }
}

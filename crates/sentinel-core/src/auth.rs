// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bearer-token authentication.
//!
//! Tokens are three-segment dot-separated structures with base64url-encoded
//! header, payload, and signature. This module owns the validation contract
//! (issuer, audience, lifetime with clock skew) and the derivation of the
//! per-request [`TenantContext`]. Cryptographic signature verification sits
//! behind [`TokenVerifier`]; the built-in default enforces verification and
//! fails closed, so a deployment without a wired verifier rejects every
//! token instead of accepting unverified ones.

use std::time::Duration;

use base64::prelude::*;
use chrono::Utc;
use serde::Deserialize;

/// Clock skew tolerated when checking `exp` and `iat`.
pub const CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Identity and authorization scope derived from a validated token.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub is_system: bool,
}

impl TenantContext {
    /// Context used by internal maintenance paths.
    pub fn system() -> Self {
        Self {
            tenant_id: "system".to_string(),
            user_id: None,
            roles: vec![],
            is_system: true,
        }
    }

    /// System contexts and holders of the `admin` role may cross tenant
    /// boundaries.
    pub fn bypasses_tenant_isolation(&self) -> bool {
        self.is_system || self.roles.iter().any(|r| r == "admin")
    }
}

/// Authentication failures. All map to HTTP 401.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("Authorization header is not a bearer token")]
    MalformedHeader,
    #[error("malformed token: {0}")]
    MalformedToken(&'static str),
    #[error("token issuer mismatch")]
    IssuerMismatch,
    #[error("token audience mismatch")]
    AudienceMismatch,
    #[error("token expired")]
    Expired,
    #[error("token issued in the future")]
    IssuedInFuture,
    #[error("token carries no tenant")]
    MissingTenant,
    #[error("signature rejected")]
    SignatureRejected,
    #[error("signature verification unavailable")]
    VerificationUnavailable,
}

/// JWT header fields the service inspects.
#[derive(Debug, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
    #[serde(default)]
    pub kid: Option<String>,
}

/// `aud` may be a single string or an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn matches(&self, expected: &str) -> bool {
        match self {
            Audience::One(aud) => aud == expected,
            Audience::Many(auds) => auds.iter().any(|a| a == expected),
        }
    }
}

/// Claims the validation contract inspects.
#[derive(Debug, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: Audience,
    pub exp: i64,
    pub iat: i64,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub system: bool,
}

/// Signature verification seam.
///
/// The production verifier checks the signature against the key set named
/// by `OAUTH2_JWK_SET_URI`; that integration lives outside this crate. The
/// contract here: return `Ok` only for a signature actually verified.
pub trait TokenVerifier: Send + Sync {
    fn verify(
        &self,
        header: &TokenHeader,
        signing_input: &[u8],
        signature: &[u8],
    ) -> Result<(), AuthError>;
}

/// Default verifier: enforcement is on and nothing is wired, so every
/// token is rejected rather than accepted unverified.
pub struct UnavailableVerifier;

impl TokenVerifier for UnavailableVerifier {
    fn verify(&self, _: &TokenHeader, _: &[u8], _: &[u8]) -> Result<(), AuthError> {
        Err(AuthError::VerificationUnavailable)
    }
}

/// Development escape hatch: accepts any signature. Claims validation
/// still applies. Never select this outside a development deployment; the
/// configuration default keeps it off.
pub struct InsecureAcceptAllVerifier;

impl TokenVerifier for InsecureAcceptAllVerifier {
    fn verify(&self, _: &TokenHeader, _: &[u8], _: &[u8]) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Validates bearer tokens and derives tenant contexts.
pub struct Authenticator {
    issuer: String,
    audience: String,
    verifier: Box<dyn TokenVerifier>,
}

impl Authenticator {
    pub fn new(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        verifier: Box<dyn TokenVerifier>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            verifier,
        }
    }

    /// Authenticate from the raw `Authorization` header value (or its
    /// absence) and return the caller's tenant context.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<TenantContext, AuthError> {
        let header_value = authorization.ok_or(AuthError::MissingHeader)?;
        let token = bearer_token(header_value)?;
        self.validate_token(token)
    }

    /// Validate a bare token string.
    pub fn validate_token(&self, token: &str) -> Result<TenantContext, AuthError> {
        let (header, claims, signing_input, signature) = decode_token(token)?;

        self.verifier
            .verify(&header, signing_input.as_bytes(), &signature)?;

        if claims.iss != self.issuer {
            return Err(AuthError::IssuerMismatch);
        }
        if !claims.aud.matches(&self.audience) {
            return Err(AuthError::AudienceMismatch);
        }

        let now = Utc::now().timestamp();
        let skew = CLOCK_SKEW.as_secs() as i64;
        if claims.exp + skew <= now {
            return Err(AuthError::Expired);
        }
        if claims.iat - skew > now {
            return Err(AuthError::IssuedInFuture);
        }

        let is_system = claims.system || claims.roles.iter().any(|r| r == "system");
        let tenant_id = match claims.tenant_id {
            Some(t) if !t.is_empty() => t,
            // System principals have no tenant of their own.
            _ if is_system => "system".to_string(),
            _ => return Err(AuthError::MissingTenant),
        };

        Ok(TenantContext {
            tenant_id,
            user_id: claims.sub,
            roles: claims.roles,
            is_system,
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
fn bearer_token(header_value: &str) -> Result<&str, AuthError> {
    let trimmed = header_value.trim();
    let (scheme, rest) = trimmed
        .split_once(' ')
        .ok_or(AuthError::MalformedHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MalformedHeader);
    }
    let token = rest.trim();
    if token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

/// Split and decode the three token segments.
fn decode_token(token: &str) -> Result<(TokenHeader, Claims, String, Vec<u8>), AuthError> {
    let mut segments = token.split('.');
    let (Some(h), Some(p), Some(s), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(AuthError::MalformedToken("expected three segments"));
    };

    let header_bytes = b64url_decode(h)
        .ok_or(AuthError::MalformedToken("header is not base64url"))?;
    let claims_bytes = b64url_decode(p)
        .ok_or(AuthError::MalformedToken("payload is not base64url"))?;
    let signature = b64url_decode(s)
        .ok_or(AuthError::MalformedToken("signature is not base64url"))?;

    let header: TokenHeader = serde_json::from_slice(&header_bytes)
        .map_err(|_| AuthError::MalformedToken("header is not valid JSON"))?;
    let claims: Claims = serde_json::from_slice(&claims_bytes)
        .map_err(|_| AuthError::MalformedToken("payload is not valid JSON"))?;

    let signing_input = format!("{h}.{p}");
    Ok((header, claims, signing_input, signature))
}

/// base64url decode, tolerating present or stripped padding.
pub fn b64url_decode(s: &str) -> Option<Vec<u8>> {
    BASE64_URL_SAFE_NO_PAD.decode(s.trim_end_matches('=')).ok()
}

/// base64url encode without padding.
pub fn b64url_encode(bytes: &[u8]) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(bearer_token("Bearer abc.def.ghi").unwrap(), "abc.def.ghi");
        assert_eq!(bearer_token("bearer tok").unwrap(), "tok");
        assert!(matches!(
            bearer_token("Basic dXNlcjpwYXNz"),
            Err(AuthError::MalformedHeader)
        ));
        assert!(matches!(bearer_token("Bearer "), Err(AuthError::MalformedHeader)));
        assert!(matches!(bearer_token("token"), Err(AuthError::MalformedHeader)));
    }

    #[test]
    fn test_base64url_round_trip() {
        for bytes in [
            &b""[..],
            &b"f"[..],
            &b"fo"[..],
            &b"foo"[..],
            &[0u8, 255, 128, 7][..],
        ] {
            let encoded = b64url_encode(bytes);
            assert_eq!(b64url_decode(&encoded).unwrap(), bytes);
            // Padded forms decode identically.
            let padded = format!("{encoded}{}", "=".repeat((4 - encoded.len() % 4) % 4));
            assert_eq!(b64url_decode(&padded).unwrap(), bytes);
        }
    }

    #[test]
    fn test_default_verifier_fails_closed() {
        let auth = Authenticator::new(
            "https://issuer",
            "clm-service",
            Box::new(UnavailableVerifier),
        );
        let token = make_token("https://issuer", "clm-service", 600, 0);
        assert_eq!(
            auth.validate_token(&token),
            Err(AuthError::VerificationUnavailable)
        );
    }

    /// Verifier stub used by the validation-contract tests below; the
    /// crypto itself is out of scope here.
    struct AcceptSignature;

    impl TokenVerifier for AcceptSignature {
        fn verify(&self, _: &TokenHeader, _: &[u8], _: &[u8]) -> Result<(), AuthError> {
            Ok(())
        }
    }

    fn make_token(iss: &str, aud: &str, exp_in: i64, iat_ago: i64) -> String {
        let now = Utc::now().timestamp();
        let header = serde_json::json!({"alg": "RS256", "typ": "JWT"});
        let claims = serde_json::json!({
            "iss": iss,
            "aud": aud,
            "exp": now + exp_in,
            "iat": now - iat_ago,
            "sub": "user-1",
            "tenant_id": "T1",
            "roles": ["viewer"],
        });
        format!(
            "{}.{}.{}",
            b64url_encode(header.to_string().as_bytes()),
            b64url_encode(claims.to_string().as_bytes()),
            b64url_encode(b"sig")
        )
    }

    fn authenticator() -> Authenticator {
        Authenticator::new("https://issuer", "clm-service", Box::new(AcceptSignature))
    }

    #[test]
    fn test_valid_token_yields_context() {
        let ctx = authenticator()
            .validate_token(&make_token("https://issuer", "clm-service", 600, 10))
            .unwrap();
        assert_eq!(ctx.tenant_id, "T1");
        assert_eq!(ctx.user_id.as_deref(), Some("user-1"));
        assert!(!ctx.bypasses_tenant_isolation());
    }

    #[test]
    fn test_issuer_and_audience_checked() {
        let auth = authenticator();
        assert_eq!(
            auth.validate_token(&make_token("https://other", "clm-service", 600, 0)),
            Err(AuthError::IssuerMismatch)
        );
        assert_eq!(
            auth.validate_token(&make_token("https://issuer", "other-aud", 600, 0)),
            Err(AuthError::AudienceMismatch)
        );
    }

    #[test]
    fn test_expiry_with_clock_skew() {
        let auth = authenticator();
        // Expired beyond the skew window.
        assert_eq!(
            auth.validate_token(&make_token("https://issuer", "clm-service", -120, 300)),
            Err(AuthError::Expired)
        );
        // Expired but within the 60 s skew: accepted.
        assert!(auth
            .validate_token(&make_token("https://issuer", "clm-service", -30, 300))
            .is_ok());
        // Issued in the future beyond the skew.
        assert_eq!(
            auth.validate_token(&make_token("https://issuer", "clm-service", 600, -300)),
            Err(AuthError::IssuedInFuture)
        );
        // Slightly in the future, inside the skew: accepted.
        assert!(auth
            .validate_token(&make_token("https://issuer", "clm-service", 600, -30))
            .is_ok());
    }

    #[test]
    fn test_malformed_tokens() {
        let auth = authenticator();
        assert!(matches!(
            auth.validate_token("only.two"),
            Err(AuthError::MalformedToken(_))
        ));
        assert!(matches!(
            auth.validate_token("a.b.c.d"),
            Err(AuthError::MalformedToken(_))
        ));
        assert!(matches!(
            auth.validate_token("!!!.???.###"),
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_audience_array_form() {
        let now = Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": "https://issuer",
            "aud": ["other", "clm-service"],
            "exp": now + 600,
            "iat": now,
            "tenant_id": "T1",
        });
        let token = format!(
            "{}.{}.{}",
            b64url_encode(br#"{"alg":"RS256"}"#),
            b64url_encode(claims.to_string().as_bytes()),
            b64url_encode(b"sig")
        );
        assert!(authenticator().validate_token(&token).is_ok());
    }

    #[test]
    fn test_missing_tenant_rejected_unless_system() {
        let now = Utc::now().timestamp();
        let base = serde_json::json!({
            "iss": "https://issuer",
            "aud": "clm-service",
            "exp": now + 600,
            "iat": now,
        });

        let token = format!(
            "{}.{}.{}",
            b64url_encode(br#"{"alg":"RS256"}"#),
            b64url_encode(base.to_string().as_bytes()),
            b64url_encode(b"sig")
        );
        assert_eq!(
            authenticator().validate_token(&token),
            Err(AuthError::MissingTenant)
        );

        let mut system = base;
        system["system"] = serde_json::json!(true);
        let token = format!(
            "{}.{}.{}",
            b64url_encode(br#"{"alg":"RS256"}"#),
            b64url_encode(system.to_string().as_bytes()),
            b64url_encode(b"sig")
        );
        let ctx = authenticator().validate_token(&token).unwrap();
        assert!(ctx.is_system);
        assert!(ctx.bypasses_tenant_isolation());
    }
}

use super::keys::KeyRegistry;
use super::traits::SessionClaims;
use axum::http::{HeaderMap, header};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, Header, Validation, decode, decode_header, encode};
use thiserror::Error;

pub const SESSION_COOKIE: &str = "u";
pub const SESSION_COOKIE_PATH: &str = "/authorize";

/// how long a session credential verifies
pub const SESSION_VALIDITY: Duration = Duration::days(7);
/// cookie outlives the credential so an expired session shows up as present-but-invalid
pub const SESSION_COOKIE_MAX_AGE: Duration = Duration::days(14);

// algorithm is fixed here, never taken from the token header
const SESSION_ALGORITHM: Algorithm = Algorithm::RS256;

/// Every verification failure looks the same from outside
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session credential")]
pub struct InvalidCredential;

#[derive(Debug, Error)]
#[error("failed to sign session credential: {0}")]
pub struct SigningError(String);

/// Mints and checks the signed credential stored in the session cookie
#[derive(Clone)]
pub struct SessionCodec {
    keys: KeyRegistry,
    validity: Duration,
    validation: Validation,
}

impl SessionCodec {
    pub fn new(keys: KeyRegistry) -> Self {
        Self::with_validity(keys, SESSION_VALIDITY)
    }

    pub fn with_validity(keys: KeyRegistry, validity: Duration) -> Self {
        let mut validation = Validation::new(SESSION_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.required_spec_claims = ["exp".to_string()].into_iter().collect();

        Self {
            keys,
            validity,
            validation,
        }
    }

    /// Sign a credential for `user_id` with the default key
    pub fn issue(&self, user_id: &str) -> Result<String, SigningError> {
        let key = self.keys.default_key();
        let now = Utc::now();

        let claims = SessionClaims {
            uid: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.validity).timestamp(),
        };

        let mut header = Header::new(SESSION_ALGORITHM);
        header.kid = Some(key.id().to_string());

        encode(&header, &claims, key.encoding_key()).map_err(|e| SigningError(e.to_string()))
    }

    /// The user id inside a valid credential. Malformed, forged, expired,
    /// unknown-key and wrong-algorithm all come back as the same error.
    pub fn verify(&self, credential: &str) -> Result<String, InvalidCredential> {
        let header = decode_header(credential).map_err(|e| {
            tracing::debug!("session credential header rejected: {}", e);
            InvalidCredential
        })?;

        if header.alg != SESSION_ALGORITHM {
            tracing::debug!("session credential declares {:?}, rejecting", header.alg);
            return Err(InvalidCredential);
        }

        let kid = header.kid.unwrap_or_default();
        let key = self.keys.lookup(&kid).map_err(|e| {
            tracing::debug!("session credential key lookup failed: {}", e);
            InvalidCredential
        })?;

        let data = decode::<SessionClaims>(credential, key.decoding_key(), &self.validation)
            .map_err(|e| {
                tracing::debug!("session credential rejected: {}", e);
                InvalidCredential
            })?;

        if data.claims.uid.is_empty() {
            return Err(InvalidCredential);
        }

        Ok(data.claims.uid)
    }
}

/// What the request carried in the session cookie slot
#[derive(Debug, PartialEq, Eq)]
pub enum SessionCookie {
    Absent,
    Present(String),
}

pub fn read_session_cookie(headers: &HeaderMap) -> SessionCookie {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| SessionCookie::Present(value.to_string()))
        .unwrap_or(SessionCookie::Absent)
}

/// Set-Cookie value carrying a session credential
pub fn session_cookie(credential: &str) -> String {
    format!(
        "{}={}; Path={}; Max-Age={}; HttpOnly; SameSite=Lax",
        SESSION_COOKIE,
        credential,
        SESSION_COOKIE_PATH,
        SESSION_COOKIE_MAX_AGE.num_seconds()
    )
}

/// Set-Cookie value that wipes the session cookie
pub fn clear_session_cookie() -> String {
    format!(
        "{}=; Path={}; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly",
        SESSION_COOKIE, SESSION_COOKIE_PATH
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::test_keys::{primary, registry, secondary};
    use axum::http::HeaderValue;
    use jsonwebtoken::EncodingKey;

    #[test]
    fn test_issue_then_verify_round_trip() {
        let codec = SessionCodec::new(registry());
        let credential = codec.issue("alice@example.com").unwrap();
        assert_eq!(codec.verify(&credential).unwrap(), "alice@example.com");
    }

    #[test]
    fn test_credential_embeds_default_kid() {
        let codec = SessionCodec::new(registry());
        let credential = codec.issue("alice").unwrap();
        let header = decode_header(&credential).unwrap();
        assert_eq!(header.kid.as_deref(), Some("1"));
        assert_eq!(header.alg, Algorithm::RS256);
    }

    #[test]
    fn test_expired_credential_rejected() {
        let codec = SessionCodec::with_validity(registry(), Duration::seconds(-10));
        let credential = codec.issue("alice").unwrap();
        assert_eq!(codec.verify(&credential), Err(InvalidCredential));
    }

    #[test]
    fn test_garbage_rejected() {
        let codec = SessionCodec::new(registry());
        assert_eq!(codec.verify(""), Err(InvalidCredential));
        assert_eq!(codec.verify("not.a.jwt"), Err(InvalidCredential));
        assert_eq!(codec.verify("abc"), Err(InvalidCredential));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let codec = SessionCodec::new(registry());
        let credential = codec.issue("alice").unwrap();
        let other = codec.issue("mallory").unwrap();
        let mut parts: Vec<&str> = credential.split('.').collect();
        let other_parts: Vec<&str> = other.split('.').collect();
        parts[1] = other_parts[1];
        let forged = parts.join(".");
        if forged != other {
            assert_eq!(codec.verify(&forged), Err(InvalidCredential));
        }
    }

    #[test]
    fn test_symmetric_algorithm_downgrade_rejected() {
        let codec = SessionCodec::new(registry());
        let claims = SessionClaims {
            uid: "mallory".into(),
            iat: Utc::now().timestamp(),
            exp: (Utc::now() + Duration::hours(1)).timestamp(),
        };
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("1".into());
        let forged = encode(&header, &claims, &EncodingKey::from_secret(b"guessable")).unwrap();
        assert_eq!(codec.verify(&forged), Err(InvalidCredential));
    }

    #[test]
    fn test_unknown_kid_rejected() {
        let issuer = SessionCodec::new(KeyRegistry::new(vec![secondary("retired")]).unwrap());
        let credential = issuer.issue("alice").unwrap();
        let verifier = SessionCodec::new(registry());
        assert_eq!(verifier.verify(&credential), Err(InvalidCredential));
    }

    #[test]
    fn test_rotated_key_still_verifies() {
        let old = SessionCodec::new(KeyRegistry::new(vec![secondary("old")]).unwrap());
        let credential = old.issue("alice").unwrap();

        let rotated = SessionCodec::new(
            KeyRegistry::new(vec![primary("new"), secondary("old")]).unwrap(),
        );
        assert_eq!(rotated.verify(&credential).unwrap(), "alice");
        let fresh = rotated.issue("alice").unwrap();
        assert_eq!(decode_header(&fresh).unwrap().kid.as_deref(), Some("new"));
    }

    #[test]
    fn test_signature_from_wrong_key_rejected() {
        // same kid, different key material
        let impostor = SessionCodec::new(KeyRegistry::new(vec![secondary("1")]).unwrap());
        let credential = impostor.issue("alice").unwrap();
        let codec = SessionCodec::new(registry());
        assert_eq!(codec.verify(&credential), Err(InvalidCredential));
    }

    #[test]
    fn test_read_session_cookie() {
        let mut headers = HeaderMap::new();
        assert_eq!(read_session_cookie(&headers), SessionCookie::Absent);

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; u=abc.def.ghi; other=1"),
        );
        assert_eq!(
            read_session_cookie(&headers),
            SessionCookie::Present("abc.def.ghi".into())
        );
    }

    #[test]
    fn test_cookie_attributes() {
        let set = session_cookie("tok");
        assert!(set.starts_with("u=tok;"));
        assert!(set.contains("Path=/authorize"));
        assert!(set.contains("HttpOnly"));
        assert!(set.contains(&format!("Max-Age={}", 14 * 24 * 60 * 60)));

        let clear = clear_session_cookie();
        assert!(clear.starts_with("u=;"));
        assert!(clear.contains("Path=/authorize"));
        assert!(clear.contains("Max-Age=0"));
    }
}

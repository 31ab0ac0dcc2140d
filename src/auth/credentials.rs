use super::traits::CredentialVerifier;
use anyhow::Result;
use async_trait::async_trait;
use subtle::ConstantTimeEq;

/// Fixed single-account verifier. The user id is the username.
/// Future: something backed by a real identity store.
pub struct StaticCredentialVerifier {
    account: Option<(String, String)>,
}

impl StaticCredentialVerifier {
    pub fn new(username: String, password: String) -> Self {
        Self {
            account: Some((username, password)),
        }
    }

    /// nobody gets in
    pub fn disabled() -> Self {
        Self { account: None }
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentialVerifier {
    async fn verify(&self, username: &str, password: &str) -> Result<Option<String>> {
        let Some((expected_username, expected_password)) = &self.account else {
            return Ok(None);
        };

        // Constant-time comparison to prevent timing attacks
        let user_matches: bool = username
            .as_bytes()
            .ct_eq(expected_username.as_bytes())
            .into();
        let password_matches: bool = password
            .as_bytes()
            .ct_eq(expected_password.as_bytes())
            .into();

        if user_matches && password_matches {
            Ok(Some(username.to_string()))
        } else {
            tracing::warn!("Invalid login attempted for user: {}", username);
            Ok(None)
        }
    }
}

/// constant-time string equality for client secrets
pub fn secrets_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_verifier() {
        let verifier = StaticCredentialVerifier::new("alice".into(), "wonderland".into());
        assert_eq!(
            verifier.verify("alice", "wonderland").await.unwrap(),
            Some("alice".to_string())
        );
        assert_eq!(verifier.verify("alice", "wrong").await.unwrap(), None);
        assert_eq!(verifier.verify("bob", "wonderland").await.unwrap(), None);
        assert_eq!(verifier.verify("", "").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disabled_verifier_rejects_everything() {
        let verifier = StaticCredentialVerifier::disabled();
        assert_eq!(verifier.verify("", "").await.unwrap(), None);
        assert_eq!(verifier.verify("alice", "wonderland").await.unwrap(), None);
    }

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cre"));
        assert!(!secrets_match("", "s3cret"));
    }
}

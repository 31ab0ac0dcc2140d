use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A registered OAuth client. Never mutated once written.
#[derive(Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub secret: String,
    pub redirect_uri: String,
}

// keep the secret out of logs
impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("secret", &"***REDACTED***")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Issued by the authorize endpoint, redeemed once at the token endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub client_id: String,
    pub code: String,
    #[serde(default)]
    pub scope: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_in: i64, // seconds
}

impl AuthorizationCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        expired(self.created_at, self.expires_in, now)
    }
}

/// Access token record. `refresh_token` is emptied (not deleted) on rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: String,
    pub client_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_in: i64,
}

impl AccessToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        expired(self.created_at, self.expires_in, now)
    }

    /// seconds left before expiry, floored at zero
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        match expires_at(self.created_at, self.expires_in) {
            Some(at) => (at - now).num_seconds().max(0),
            None => i64::MAX,
        }
    }
}

/// None when the lifetime runs past what a timestamp can hold
fn expires_at(created_at: DateTime<Utc>, expires_in: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(expires_in).and_then(|ttl| created_at.checked_add_signed(ttl))
}

fn expired(created_at: DateTime<Utc>, expires_in: i64, now: DateTime<Utc>) -> bool {
    expires_at(created_at, expires_in).is_some_and(|at| at < now)
}

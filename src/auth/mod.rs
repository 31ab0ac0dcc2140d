mod credentials;
mod error;
mod grants;
mod handlers;
mod keys;
mod login;
mod middleware;
mod session;
mod traits;

pub use credentials::StaticCredentialVerifier;
pub use grants::{GrantConfig, GrantEngine};
pub use handlers::{OAuthAppState, routes};
pub use keys::{KeyRegistry, SigningKey};
pub use session::SessionCodec;
pub use traits::CredentialVerifier;

use crate::store::TokenStore;
use std::sync::Arc;

/// Everything needed to stand up the OAuth routes
pub struct AuthConfig {
    pub keys: KeyRegistry,
    pub verifier: Arc<dyn CredentialVerifier + Send + Sync>,
    pub grants: GrantConfig,
    pub base_url: String,
    pub profile_client_id: String,
}

impl AuthConfig {
    pub fn into_state(self, store: TokenStore) -> OAuthAppState {
        OAuthAppState {
            engine: GrantEngine::new(store, self.verifier, self.grants),
            sessions: SessionCodec::new(self.keys),
            base_url: self.base_url,
            profile_client_id: self.profile_client_id,
        }
    }
}

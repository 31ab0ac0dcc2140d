use super::credentials::secrets_match;
use super::error::OAuthError;
use super::traits::{CredentialVerifier, GrantType, ResponseType, TokenResponse};
use crate::store::{AccessToken, AuthorizationCode, Client, TokenStore};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TOKEN_TYPE: &str = "bearer";

/// Lifetimes and switches for issued grants
#[derive(Debug, Clone)]
pub struct GrantConfig {
    pub authorization_expiration: Duration,
    pub access_expiration: Duration,
    pub allow_get_token: bool,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            authorization_expiration: Duration::from_secs(250),
            access_expiration: Duration::from_secs(3600),
            allow_get_token: true,
        }
    }
}

/// Raw authorize parameters, from the query string or the login form
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeParams {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    pub scope: Option<String>,
}

impl AuthorizeParams {
    /// fill gaps from another source (query first, then form body)
    pub fn or(self, other: AuthorizeParams) -> Self {
        Self {
            response_type: self.response_type.or(other.response_type),
            client_id: self.client_id.or(other.client_id),
            redirect_uri: self.redirect_uri.or(other.redirect_uri),
            state: self.state.or(other.state),
            scope: self.scope.or(other.scope),
        }
    }
}

/// An authorize request whose client and redirect URI checked out
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub response_type: ResponseType,
    pub client: Client,
    pub redirect_uri: String,
    pub state: String,
    pub scope: String,
}

/// Errors before the redirect URI is trusted are answered directly;
/// after that they go back to the client.
#[derive(Debug)]
pub enum AuthorizeFailure {
    Direct(OAuthError),
    Redirect {
        redirect_uri: String,
        state: String,
        error: OAuthError,
    },
}

impl From<OAuthError> for AuthorizeFailure {
    fn from(e: OAuthError) -> Self {
        AuthorizeFailure::Direct(e)
    }
}

/// OAuth 2.0 token request (all four grant types)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub refresh_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub scope: Option<String>,
}

/// Client id and secret, from the form or an HTTP Basic header
#[derive(Debug, Clone)]
pub struct ClientAuth {
    pub client_id: String,
    pub client_secret: String,
}

/// The authorize and token state machines
#[derive(Clone)]
pub struct GrantEngine {
    store: TokenStore,
    verifier: Arc<dyn CredentialVerifier + Send + Sync>,
    config: GrantConfig,
}

impl GrantEngine {
    pub fn new(
        store: TokenStore,
        verifier: Arc<dyn CredentialVerifier + Send + Sync>,
        config: GrantConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            config,
        }
    }

    pub fn config(&self) -> &GrantConfig {
        &self.config
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn verifier(&self) -> &(dyn CredentialVerifier + Send + Sync) {
        self.verifier.as_ref()
    }

    /// Resolve the client and pin down the redirect URI before anything else happens
    pub async fn validate_authorize(
        &self,
        params: &AuthorizeParams,
    ) -> Result<AuthorizeRequest, AuthorizeFailure> {
        let client_id = non_empty(&params.client_id).ok_or_else(|| {
            OAuthError::InvalidRequest("Missing required parameter: client_id".into())
        })?;

        let client = self
            .store
            .get_client(client_id)
            .await
            .map_err(OAuthError::from)?
            .ok_or_else(|| {
                tracing::warn!("authorize request for unknown client '{}'", client_id);
                OAuthError::UnauthorizedClient
            })?;

        let redirect_uri = match non_empty(&params.redirect_uri) {
            Some(requested) if requested == client.redirect_uri => requested.to_string(),
            Some(requested) => {
                tracing::warn!(
                    "rejected redirect_uri '{}' for client '{}'",
                    requested,
                    client.id
                );
                return Err(OAuthError::RedirectUriMismatch.into());
            }
            None => client.redirect_uri.clone(),
        };

        let state = params.state.clone().unwrap_or_default();
        let redirect_error = |error: OAuthError| AuthorizeFailure::Redirect {
            redirect_uri: redirect_uri.clone(),
            state: state.clone(),
            error,
        };

        let response_type = match non_empty(&params.response_type) {
            None => {
                return Err(redirect_error(OAuthError::InvalidRequest(
                    "Missing required parameter: response_type".into(),
                )));
            }
            Some(raw) => raw
                .parse::<ResponseType>()
                .map_err(|_| redirect_error(OAuthError::UnsupportedResponseType))?,
        };

        Ok(AuthorizeRequest {
            response_type,
            client,
            redirect_uri,
            state,
            scope: params.scope.clone().unwrap_or_default(),
        })
    }

    /// Issue the code (or implicit token) for an authenticated user and build the redirect
    pub async fn finish_authorize(
        &self,
        req: &AuthorizeRequest,
        user_id: &str,
    ) -> Result<String, AuthorizeFailure> {
        match req.response_type {
            ResponseType::Code => {
                let code = AuthorizationCode {
                    client_id: req.client.id.clone(),
                    code: TokenStore::generate_secret(),
                    scope: req.scope.clone(),
                    redirect_uri: req.redirect_uri.clone(),
                    state: req.state.clone(),
                    user_id: Some(user_id.to_string()),
                    created_at: Utc::now(),
                    expires_in: lifetime_secs(self.config.authorization_expiration),
                };
                self.store
                    .save_authorization_code(&code)
                    .await
                    .map_err(OAuthError::from)?;

                tracing::info!(
                    "Issued authorization code for client_id={}, user={}",
                    req.client.id,
                    user_id
                );

                let mut params = vec![("code", code.code.as_str())];
                if !req.state.is_empty() {
                    params.push(("state", req.state.as_str()));
                }
                Ok(append_query(&req.redirect_uri, &params))
            }
            ResponseType::Token => {
                let token = self.new_token(
                    &req.client,
                    &req.scope,
                    &req.redirect_uri,
                    Some(user_id),
                    false,
                );
                self.store
                    .save_access_token(&token)
                    .await
                    .map_err(OAuthError::from)?;

                tracing::info!(
                    "Issued implicit access token for client_id={}, user={}",
                    req.client.id,
                    user_id
                );

                let expires_in = token.expires_in.to_string();
                let mut params = vec![
                    ("access_token", token.access_token.as_str()),
                    ("token_type", TOKEN_TYPE),
                    ("expires_in", expires_in.as_str()),
                ];
                if !token.scope.is_empty() {
                    params.push(("scope", token.scope.as_str()));
                }
                if !req.state.is_empty() {
                    params.push(("state", req.state.as_str()));
                }
                Ok(append_fragment(&req.redirect_uri, &params))
            }
        }
    }

    /// Token endpoint dispatch. Nothing is reported as issued unless it was stored.
    pub async fn token(
        &self,
        req: &TokenRequest,
        basic: Option<ClientAuth>,
    ) -> Result<TokenResponse, OAuthError> {
        let grant_type = non_empty(&req.grant_type)
            .and_then(|raw| raw.parse::<GrantType>().ok())
            .ok_or(OAuthError::UnsupportedGrantType)?;

        tracing::info!("Token request: grant_type={}", grant_type);

        let client = self.authenticate_client(req, basic).await?;

        let token = match grant_type {
            GrantType::AuthorizationCode => self.authorization_code_grant(&client, req).await?,
            GrantType::RefreshToken => self.refresh_token_grant(&client, req).await?,
            GrantType::Password => self.password_grant(&client, req).await?,
            GrantType::ClientCredentials => self.client_credentials_grant(&client, req).await?,
        };

        tracing::info!(
            "Issued access token via {} for client: {}",
            grant_type,
            client.id
        );

        Ok(token_response(&token))
    }

    async fn authenticate_client(
        &self,
        req: &TokenRequest,
        basic: Option<ClientAuth>,
    ) -> Result<Client, OAuthError> {
        let auth = match basic {
            Some(auth) => auth,
            None => ClientAuth {
                client_id: req.client_id.clone().unwrap_or_default(),
                client_secret: req.client_secret.clone().unwrap_or_default(),
            },
        };

        if auth.client_id.is_empty() {
            return Err(OAuthError::InvalidClient);
        }

        let Some(client) = self.store.get_client(&auth.client_id).await? else {
            tracing::warn!("Token request for unknown client: {}", auth.client_id);
            return Err(OAuthError::InvalidClient);
        };

        if !secrets_match(&auth.client_secret, &client.secret) {
            tracing::warn!(
                "Invalid client credentials attempted for client_id: {}",
                auth.client_id
            );
            return Err(OAuthError::InvalidClient);
        }

        Ok(client)
    }

    async fn authorization_code_grant(
        &self,
        client: &Client,
        req: &TokenRequest,
    ) -> Result<AccessToken, OAuthError> {
        let raw_code = non_empty(&req.code)
            .ok_or_else(|| OAuthError::InvalidRequest("Missing required parameter: code".into()))?;

        let Some((code, owner)) = self.store.load_authorization_code(raw_code).await? else {
            tracing::warn!("Invalid or expired authorization code");
            return Err(OAuthError::InvalidGrant);
        };

        if owner.id != client.id {
            tracing::warn!(
                "client {} presented a code issued to {}",
                client.id,
                owner.id
            );
            return Err(OAuthError::InvalidGrant);
        }

        if code.is_expired_at(Utc::now()) {
            tracing::warn!("expired authorization code for client {}", client.id);
            self.store.delete_authorization_code(raw_code).await?;
            return Err(OAuthError::InvalidGrant);
        }

        let redirect_uri =
            non_empty(&req.redirect_uri).unwrap_or(client.redirect_uri.as_str());
        if redirect_uri != code.redirect_uri {
            tracing::warn!(
                "redirect_uri mismatch for client {}: expected '{}', got '{}'",
                client.id,
                code.redirect_uri,
                redirect_uri
            );
            return Err(OAuthError::InvalidGrant);
        }

        let token = self.new_token(
            client,
            &code.scope,
            &code.redirect_uri,
            code.user_id.as_deref(),
            true,
        );

        // write the replacement first, then take the code. losing the take undoes the write.
        self.store.save_access_token(&token).await?;
        match self.store.consume_authorization_code(raw_code).await {
            Ok(Some(_)) => Ok(token),
            Ok(None) => {
                tracing::warn!("authorization code replayed for client {}", client.id);
                self.roll_back(&token).await;
                Err(OAuthError::InvalidGrant)
            }
            Err(e) => {
                self.roll_back(&token).await;
                Err(e.into())
            }
        }
    }

    async fn refresh_token_grant(
        &self,
        client: &Client,
        req: &TokenRequest,
    ) -> Result<AccessToken, OAuthError> {
        let raw_refresh = non_empty(&req.refresh_token).ok_or_else(|| {
            OAuthError::InvalidRequest("Missing required parameter: refresh_token".into())
        })?;

        let Some((previous, owner)) = self.store.find_by_refresh_token(raw_refresh).await? else {
            tracing::warn!("Unknown or already rotated refresh token");
            return Err(OAuthError::InvalidGrant);
        };

        if owner.id != client.id {
            tracing::warn!(
                "client {} presented a refresh token issued to {}",
                client.id,
                owner.id
            );
            return Err(OAuthError::InvalidGrant);
        }

        let scope = match non_empty(&req.scope) {
            Some(requested) if scope_within(requested, &previous.scope) => requested,
            Some(_) => return Err(OAuthError::InvalidScope),
            None => previous.scope.as_str(),
        };

        let token = self.new_token(
            client,
            scope,
            &previous.redirect_uri,
            previous.user_id.as_deref(),
            true,
        );

        self.store.save_access_token(&token).await?;
        match self.store.invalidate_refresh_token(raw_refresh).await {
            Ok(0) => {
                tracing::warn!("refresh token reused concurrently for client {}", client.id);
                self.roll_back(&token).await;
                Err(OAuthError::InvalidGrant)
            }
            Ok(_) => Ok(token),
            Err(e) => {
                self.roll_back(&token).await;
                Err(e.into())
            }
        }
    }

    async fn password_grant(
        &self,
        client: &Client,
        req: &TokenRequest,
    ) -> Result<AccessToken, OAuthError> {
        let (Some(username), Some(password)) = (non_empty(&req.username), non_empty(&req.password))
        else {
            return Err(OAuthError::InvalidRequest(
                "Missing required parameters: username, password".into(),
            ));
        };

        let user_id = self
            .verifier
            .verify(username, password)
            .await
            .map_err(|e| OAuthError::Internal(format!("credential verifier failed: {}", e)))?
            .ok_or(OAuthError::AccessDenied)?;

        let scope = req.scope.clone().unwrap_or_default();
        let token = self.new_token(client, &scope, &client.redirect_uri, Some(&user_id), true);
        self.store.save_access_token(&token).await?;
        Ok(token)
    }

    async fn client_credentials_grant(
        &self,
        client: &Client,
        req: &TokenRequest,
    ) -> Result<AccessToken, OAuthError> {
        let scope = req.scope.clone().unwrap_or_default();
        let token = self.new_token(client, &scope, &client.redirect_uri, None, false);
        self.store.save_access_token(&token).await?;
        Ok(token)
    }

    fn new_token(
        &self,
        client: &Client,
        scope: &str,
        redirect_uri: &str,
        user_id: Option<&str>,
        with_refresh: bool,
    ) -> AccessToken {
        AccessToken {
            id: Uuid::new_v4().simple().to_string(),
            client_id: client.id.clone(),
            access_token: TokenStore::generate_secret(),
            refresh_token: if with_refresh {
                TokenStore::generate_secret()
            } else {
                String::new()
            },
            scope: scope.to_string(),
            redirect_uri: redirect_uri.to_string(),
            user_id: user_id.map(str::to_string),
            created_at: Utc::now(),
            expires_in: lifetime_secs(self.config.access_expiration),
        }
    }

    /// undo a token written ahead of a transition we then lost
    async fn roll_back(&self, token: &AccessToken) {
        if let Err(e) = self.store.delete_access_token(&token.access_token).await {
            tracing::error!("failed to roll back access token {}: {}", token.id, e);
        }
    }
}

fn token_response(token: &AccessToken) -> TokenResponse {
    TokenResponse {
        access_token: token.access_token.clone(),
        token_type: TOKEN_TYPE.to_string(),
        expires_in: token.expires_in,
        refresh_token: Some(token.refresh_token.clone()).filter(|r| !r.is_empty()),
        scope: Some(token.scope.clone()).filter(|s| !s.is_empty()),
    }
}

fn lifetime_secs(lifetime: Duration) -> i64 {
    i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// every requested scope was part of the original grant
fn scope_within(requested: &str, granted: &str) -> bool {
    requested
        .split_whitespace()
        .all(|scope| granted.split_whitespace().any(|g| g == scope))
}

pub fn append_query(redirect_uri: &str, params: &[(&str, &str)]) -> String {
    let mut url = redirect_uri.to_string();
    let mut separator = if url.contains('?') { '&' } else { '?' };
    for (key, value) in params {
        url.push(separator);
        url.push_str(&format!("{}={}", key, urlencoding::encode(value)));
        separator = '&';
    }
    url
}

pub fn append_fragment(redirect_uri: &str, params: &[(&str, &str)]) -> String {
    let mut url = redirect_uri.to_string();
    let mut separator = '#';
    for (key, value) in params {
        url.push(separator);
        url.push_str(&format!("{}={}", key, urlencoding::encode(value)));
        separator = '&';
    }
    url
}

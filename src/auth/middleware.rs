use super::error::OAuthError;
use crate::store::{AccessToken, Client, TokenStore};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;

#[derive(Clone)]
pub struct BearerAuthConfig {
    pub store: TokenStore,
    pub realm: String,
}

/// The grant behind a bearer token, handed to protected handlers as an extension
#[derive(Debug, Clone)]
pub struct AuthenticatedGrant {
    pub token: AccessToken,
    pub client: Client,
}

/// Resolves `Authorization: Bearer <token>` through the token store.
/// Unknown and expired tokens get a 401 with a WWW-Authenticate challenge.
pub async fn bearer_auth_middleware(
    State(config): State<BearerAuthConfig>,
    mut req: Request,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let Some(presented) = presented else {
        tracing::warn!(
            "Missing or invalid Authorization header for {} {}",
            req.method(),
            req.uri()
        );
        return unauthorized_response(&config.realm, None);
    };

    match config.store.find_by_access_token(&presented).await {
        Ok(Some((token, client))) if !token.is_expired_at(Utc::now()) => {
            tracing::debug!("Valid bearer token for client: {}", client.id);
            req.extensions_mut()
                .insert(AuthenticatedGrant { token, client });
            next.run(req).await
        }
        Ok(Some(_)) => {
            tracing::warn!("Expired bearer token presented");
            unauthorized_response(&config.realm, Some("invalid_token"))
        }
        Ok(None) => {
            tracing::warn!("Unknown bearer token presented");
            unauthorized_response(&config.realm, Some("invalid_token"))
        }
        Err(e) => OAuthError::Storage(e).into_response(),
    }
}

fn unauthorized_response(realm: &str, error: Option<&str>) -> Response {
    let challenge = match error {
        Some(err) => format!("Bearer realm=\"{}\", error=\"{}\"", realm, err),
        None => format!("Bearer realm=\"{}\"", realm),
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_str(&challenge).unwrap_or_else(|_| HeaderValue::from_static("Bearer")),
    );

    (StatusCode::UNAUTHORIZED, headers).into_response()
}

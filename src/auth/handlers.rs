use super::error::OAuthError;
use super::grants::{
    AuthorizeFailure, AuthorizeParams, ClientAuth, GrantEngine, TokenRequest, append_query,
};
use super::login::{LoginForm, LoginOutcome, challenge_response, resolve_login};
use super::middleware::{AuthenticatedGrant, BearerAuthConfig, bearer_auth_middleware};
use super::session::SessionCodec;
use axum::{
    Extension, Form, Router,
    extract::{
        Query, State,
        rejection::{FormRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::store::{AccessToken, Client};

/// Shared state for every OAuth handler
#[derive(Clone)]
pub struct OAuthAppState {
    pub engine: GrantEngine,
    pub sessions: SessionCodec,
    pub base_url: String,
    /// client whose redirect target is `/profile`
    pub profile_client_id: String,
}

/// Everything the authorize endpoint may receive in a form body
#[derive(Debug, Default, Deserialize)]
pub struct AuthorizeForm {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    pub scope: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

impl AuthorizeForm {
    fn split(self) -> (AuthorizeParams, LoginForm) {
        (
            AuthorizeParams {
                response_type: self.response_type,
                client_id: self.client_id,
                redirect_uri: self.redirect_uri,
                state: self.state,
                scope: self.scope,
            },
            LoginForm {
                email: self.email,
                password: self.password,
            },
        )
    }
}

/// All routes, without rate limiting
pub fn routes(state: OAuthAppState) -> Router {
    let token_route = if state.engine.config().allow_get_token {
        get(token_get_handler).post(token_handler)
    } else {
        post(token_handler)
    };

    let bearer = BearerAuthConfig {
        store: state.engine.store().clone(),
        realm: state.base_url.clone(),
    };

    let protected = Router::new()
        .route("/me", get(me_handler))
        .route_layer(middleware::from_fn_with_state(bearer, bearer_auth_middleware));

    Router::new()
        .route("/authorize", get(authorize_handler).post(authorize_submit_handler))
        .route("/token", token_route)
        .route("/profile", get(profile_handler))
        .merge(protected)
        .with_state(state)
}

/// GET /authorize
pub async fn authorize_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    params: Result<Query<AuthorizeParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return malformed(rejection),
    };
    authorize(&state, params, LoginForm::default(), &headers).await
}

/// POST /authorize, usually the login page submitting
pub async fn authorize_submit_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    query: Result<Query<AuthorizeParams>, QueryRejection>,
    form: Result<Form<AuthorizeForm>, FormRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return malformed(rejection),
    };
    let Form(form) = match form {
        Ok(form) => form,
        Err(rejection) => return malformed(rejection),
    };
    let (params, login) = form.split();
    authorize(&state, query.or(params), login, &headers).await
}

async fn authorize(
    state: &OAuthAppState,
    params: AuthorizeParams,
    login: LoginForm,
    headers: &HeaderMap,
) -> Response {
    tracing::info!(
        "Authorization request from client_id={:?}, response_type={:?}",
        params.client_id,
        params.response_type
    );

    let request = match state.engine.validate_authorize(&params).await {
        Ok(request) => request,
        Err(failure) => return failure_response(failure),
    };

    let outcome =
        match resolve_login(&state.sessions, state.engine.verifier(), headers, &login).await {
            Ok(outcome) => outcome,
            Err(e) => return e.into_response(),
        };

    match outcome {
        LoginOutcome::Challenge { rejected, cookie } => {
            challenge_response(&params, rejected, cookie)
        }
        LoginOutcome::Authenticated { user_id, cookie } => {
            match state.engine.finish_authorize(&request, &user_id).await {
                Ok(location) => found(&location, Some(&cookie)),
                Err(failure) => failure_response(failure),
            }
        }
    }
}

fn failure_response(failure: AuthorizeFailure) -> Response {
    match failure {
        AuthorizeFailure::Direct(e) => e.into_response(),
        AuthorizeFailure::Redirect {
            redirect_uri,
            state,
            error,
        } => {
            tracing::warn!("authorize request rejected: {}", error);
            let description = error.description();
            let mut params = vec![
                ("error", error.code()),
                ("error_description", description.as_str()),
            ];
            if !state.is_empty() {
                params.push(("state", state.as_str()));
            }
            found(&append_query(&redirect_uri, &params), None)
        }
    }
}

/// Extractor failures answer with the OAuth error shape, never axum's plain text
fn malformed(rejection: impl std::fmt::Display) -> Response {
    tracing::debug!("rejected request parameters: {}", rejection);
    OAuthError::InvalidRequest("malformed request parameters".to_string()).into_response()
}

/// 302 to `location`, optionally setting a cookie on the way
fn found(location: &str, cookie: Option<&str>) -> Response {
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(header::LOCATION, value);
        }
        Err(_) => {
            return OAuthError::Internal(format!("unusable redirect location {:?}", location))
                .into_response();
        }
    }
    if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(c).ok()) {
        headers.insert(header::SET_COOKIE, value);
    }
    (StatusCode::FOUND, headers).into_response()
}

/// POST /token
pub async fn token_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    req: Result<Form<TokenRequest>, FormRejection>,
) -> Response {
    match req {
        Ok(Form(req)) => token(&state, &headers, req).await,
        Err(rejection) => malformed(rejection),
    }
}

/// GET /token, only routed when enabled
pub async fn token_get_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    req: Result<Query<TokenRequest>, QueryRejection>,
) -> Response {
    match req {
        Ok(Query(req)) => token(&state, &headers, req).await,
        Err(rejection) => malformed(rejection),
    }
}

async fn token(state: &OAuthAppState, headers: &HeaderMap, req: TokenRequest) -> Response {
    let basic = match basic_client_auth(headers) {
        Ok(basic) => basic,
        Err(e) => return e.into_response(),
    };

    match state.engine.token(&req, basic).await {
        Ok(body) => no_store(Json(body)),
        Err(e) => e.into_response(),
    }
}

fn no_store(body: impl IntoResponse) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    (StatusCode::OK, headers, body).into_response()
}

/// Client credentials from `Authorization: Basic`, if that scheme was used
fn basic_client_auth(headers: &HeaderMap) -> Result<Option<ClientAuth>, OAuthError> {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    else {
        return Ok(None);
    };

    let Some(encoded) = value.strip_prefix("Basic ") else {
        return Ok(None);
    };

    let decoded = STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(OAuthError::InvalidClient)?;

    let (id, secret) = decoded.split_once(':').ok_or(OAuthError::InvalidClient)?;

    // both halves are form-encoded before being joined
    let client_id = urlencoding::decode(id).map_err(|_| OAuthError::InvalidClient)?;
    let client_secret = urlencoding::decode(secret).map_err(|_| OAuthError::InvalidClient)?;

    Ok(Some(ClientAuth {
        client_id: client_id.into_owned(),
        client_secret: client_secret.into_owned(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub user_id: Option<String>,
    pub client_id: String,
    pub scope: String,
    pub expires_in: i64,
}

impl MeResponse {
    fn new(token: AccessToken, client: Client) -> Self {
        Self {
            expires_in: token.remaining_secs(Utc::now()),
            user_id: token.user_id,
            client_id: client.id,
            scope: token.scope,
        }
    }
}

/// GET /me, the owner of the presented bearer token
pub async fn me_handler(Extension(grant): Extension<AuthenticatedGrant>) -> Json<MeResponse> {
    Json(MeResponse::new(grant.token, grant.client))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProfileParams {
    pub code: Option<String>,
}

/// GET /profile, the landing page of the bootstrap client.
///
/// Without a code it sends the browser through `/authorize`. With one it redeems
/// the code as that client and shows who signed in. A code that no longer
/// redeems starts the flow over.
pub async fn profile_handler(
    State(state): State<OAuthAppState>,
    params: Result<Query<ProfileParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return malformed(rejection),
    };

    let store = state.engine.store();
    let client = match store.get_client(&state.profile_client_id).await {
        Ok(Some(client)) => client,
        Ok(None) => {
            return OAuthError::Internal(format!(
                "profile client {} is not registered",
                state.profile_client_id
            ))
            .into_response();
        }
        Err(e) => return OAuthError::from(e).into_response(),
    };

    let Some(code) = params.code.filter(|code| !code.is_empty()) else {
        return start_profile_flow(&state, &client);
    };

    let exchange = TokenRequest {
        grant_type: Some("authorization_code".to_string()),
        client_id: Some(client.id.clone()),
        client_secret: Some(client.secret.clone()),
        code: Some(code),
        redirect_uri: Some(client.redirect_uri.clone()),
        ..Default::default()
    };

    let issued = match state.engine.token(&exchange, None).await {
        Ok(issued) => issued,
        Err(OAuthError::InvalidGrant) => {
            tracing::info!("profile code did not redeem, restarting the flow");
            return start_profile_flow(&state, &client);
        }
        Err(e) => return e.into_response(),
    };

    match store.find_by_access_token(&issued.access_token).await {
        Ok(Some((token, owner))) => no_store(Json(MeResponse::new(token, owner))),
        Ok(None) => start_profile_flow(&state, &client),
        Err(e) => OAuthError::from(e).into_response(),
    }
}

fn start_profile_flow(state: &OAuthAppState, client: &Client) -> Response {
    let authorize = format!("{}/authorize", state.base_url);
    found(
        &append_query(
            &authorize,
            &[
                ("response_type", "code"),
                ("client_id", client.id.as_str()),
                ("redirect_uri", client.redirect_uri.as_str()),
            ],
        ),
        None,
    )
}

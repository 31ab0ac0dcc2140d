use super::error::OAuthError;
use super::grants::AuthorizeParams;
use super::session::{
    SessionCodec, SessionCookie, clear_session_cookie, read_session_cookie, session_cookie,
};
use super::traits::CredentialVerifier;
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;

/// Credentials posted by the login page
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginForm {
    pub email: Option<String>,
    pub password: Option<String>,
}

impl LoginForm {
    fn is_submission(&self) -> bool {
        self.email.is_some() || self.password.is_some()
    }
}

/// Where a login attempt ended up. `cookie` is a Set-Cookie value to send back.
#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated {
        user_id: String,
        cookie: String,
    },
    Challenge {
        rejected: bool,
        cookie: Option<String>,
    },
}

/// Cookie first, then posted credentials, else ask.
pub async fn resolve_login(
    codec: &SessionCodec,
    verifier: &(dyn CredentialVerifier + Send + Sync),
    headers: &HeaderMap,
    form: &LoginForm,
) -> Result<LoginOutcome, OAuthError> {
    let mut cleared = None;

    if let SessionCookie::Present(credential) = read_session_cookie(headers) {
        match codec.verify(&credential) {
            Ok(user_id) => {
                // slide the session forward
                let cookie = issue_cookie(codec, &user_id)?;
                return Ok(LoginOutcome::Authenticated { user_id, cookie });
            }
            Err(_) => {
                tracing::debug!("discarding unusable session cookie");
                cleared = Some(clear_session_cookie());
            }
        }
    }

    if !form.is_submission() {
        return Ok(LoginOutcome::Challenge {
            rejected: false,
            cookie: cleared,
        });
    }

    let email = form.email.as_deref().unwrap_or_default();
    let password = form.password.as_deref().unwrap_or_default();

    let verified = verifier
        .verify(email, password)
        .await
        .map_err(|e| OAuthError::Internal(format!("credential verifier failed: {}", e)))?;

    match verified {
        Some(user_id) => {
            tracing::info!("user {} logged in", user_id);
            let cookie = issue_cookie(codec, &user_id)?;
            Ok(LoginOutcome::Authenticated { user_id, cookie })
        }
        None => Ok(LoginOutcome::Challenge {
            rejected: true,
            cookie: cleared,
        }),
    }
}

fn issue_cookie(codec: &SessionCodec, user_id: &str) -> Result<String, OAuthError> {
    let credential = codec
        .issue(user_id)
        .map_err(|e| OAuthError::Internal(e.to_string()))?;
    Ok(session_cookie(&credential))
}

/// The login page. Its form posts back to /authorize with the original request intact.
pub fn challenge_response(
    params: &AuthorizeParams,
    rejected: bool,
    cookie: Option<String>,
) -> Response {
    let action = resume_action(params);
    let error = rejected.then_some("Invalid email or password");
    let html = login_page(&action, error);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(
            "default-src 'none'; style-src 'unsafe-inline'; form-action 'self'; frame-ancestors 'none'",
        ),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
        headers.insert(header::SET_COOKIE, value);
    }

    let status = if rejected {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::OK
    };

    (status, headers, Html(html)).into_response()
}

/// `/authorize?...` carrying the parameters needed to pick the request back up
pub fn resume_action(params: &AuthorizeParams) -> String {
    let pairs: Vec<(&str, &str)> = [
        ("response_type", &params.response_type),
        ("client_id", &params.client_id),
        ("state", &params.state),
        ("redirect_uri", &params.redirect_uri),
        ("scope", &params.scope),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
    .collect();

    match serde_urlencoded::to_string(&pairs) {
        Ok(query) if !query.is_empty() => format!("/authorize?{}", query),
        _ => "/authorize".to_string(),
    }
}

fn login_page(action: &str, error: Option<&str>) -> String {
    let error_html = error
        .map(|msg| format!(r#"<div class="error">{}</div>"#, html_escape(msg)))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Sign in</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            max-width: 360px;
            margin: 100px auto;
            padding: 20px;
        }}
        h1 {{ color: #333; text-align: center; }}
        label {{ display: block; margin-top: 16px; color: #555; }}
        input {{
            width: 100%;
            padding: 10px;
            margin-top: 4px;
            border: 1px solid #ccc;
            border-radius: 4px;
            box-sizing: border-box;
        }}
        button {{
            width: 100%;
            margin-top: 24px;
            padding: 12px;
            border: none;
            border-radius: 4px;
            background: #0066cc;
            color: white;
            font-size: 16px;
            cursor: pointer;
        }}
        .error {{
            background: #fdecea;
            color: #b3261e;
            padding: 10px;
            border-radius: 4px;
        }}
    </style>
</head>
<body>
    <h1>Sign in</h1>
    {error}
    <form method="post" action="{action}">
        <label for="email">Email</label>
        <input id="email" name="email" type="text" autocomplete="username" required>
        <label for="password">Password</label>
        <input id="password" name="password" type="password" autocomplete="current-password" required>
        <button type="submit">Sign in</button>
    </form>
</body>
</html>"#,
        error = error_html,
        action = html_escape(action),
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

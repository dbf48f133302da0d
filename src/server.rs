//! HTTP endpoints for the browser side of the sign-in.
//!
//! `/login` sends the browser to Azure AD, `/callback` receives the
//! authorization code, `/logout` ends the session and forwards to the
//! provider's global logout. Every sign-in failure is a bare 403.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, LOCATION};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::auth::{CallbackQuery, IdentityProvider, LoginFlow, LogoutCoordinator};
use crate::config::{Config, LOGGED_OUT_MARKER};
use crate::directory::UserLookup;
use crate::error::AuthError;
use crate::session::{SessionIssuer, SessionTransport};

/// Shared state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub login: Arc<LoginFlow>,
    pub logout: Arc<LogoutCoordinator>,
    pub sessions: SessionIssuer,
    pub home_path: String,
    pub login_path: String,
}

impl AppState {
    /// Wire the collaborators together.
    pub fn new(
        config: &Config,
        provider: Arc<dyn IdentityProvider>,
        directory: Arc<dyn UserLookup>,
        transport: Arc<dyn SessionTransport>,
    ) -> Self {
        let sessions = SessionIssuer::new(transport, config.session.serial_counter);

        Self {
            login: Arc::new(LoginFlow::new(
                config,
                Arc::clone(&provider),
                directory,
                sessions.clone(),
            )),
            logout: Arc::new(LogoutCoordinator::new(config, provider, sessions.clone())),
            sessions,
            home_path: config.site.home_path.clone(),
            login_path: config.site.login_path.clone(),
        }
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    let home_path = state.home_path.clone();
    let login_path = state.login_path.clone();

    Router::new()
        .route("/login", get(login))
        .route("/callback", get(callback))
        .route("/logout", get(logout))
        // Host logged-out page, kept so existing links keep working
        .route("/user/logged_out", get(logout))
        .route(&login_path, get(login_page))
        .route(&home_path, get(dashboard))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(config: &Config, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(&config.site.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.site.bind_address))?;

    info!("Sign-in bridge listening on {}", config.site.bind_address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown requested");
}

/// `302 Found` to `location`, carrying `headers`.
fn found(location: &str, mut headers: HeaderMap) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(LOCATION, value);
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
            (StatusCode::FOUND, headers).into_response()
        }
        Err(e) => {
            error!("Invalid redirect location: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn login(State(state): State<AppState>) -> Response {
    let url = state.login.begin_login();
    debug!("Redirecting to authorization endpoint");
    found(url.as_str(), HeaderMap::new())
}

async fn callback(
    State(state): State<AppState>,
    query: Result<Query<CallbackQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return AuthError::MalformedCallback(e.body_text()).into_response(),
    };

    let mut headers = HeaderMap::new();
    match state.login.handle_callback(&query, &mut headers).await {
        Ok(success) => found(&success.redirect_to, headers),
        Err(e) => e.into_response(),
    }
}

async fn logout(State(state): State<AppState>, request: HeaderMap) -> Response {
    let mut headers = HeaderMap::new();
    let url = state.logout.logout(&request, &mut headers).await;
    info!("Signed out, redirecting to provider logout");
    found(url.as_str(), headers)
}

#[derive(Debug, Default, Deserialize)]
struct LoginPageQuery {
    logged_out: Option<String>,
}

async fn login_page(query: Result<Query<LoginPageQuery>, QueryRejection>) -> Html<String> {
    // Set on the provider's post-logout redirect
    let logged_out = query.map(|Query(q)| q.logged_out.is_some()).unwrap_or(false);
    let notice = if logged_out {
        r#"<p class="notice">You are now logged out.</p>"#
    } else {
        ""
    };

    Html(page(
        "Sign in",
        &format!(
            r#"{notice}
        <h1>Sign in</h1>
        <p>Use your organization account to continue.</p>
        <a class="button" href="/login">Sign in with Microsoft</a>"#
        ),
    ))
}

async fn dashboard(State(state): State<AppState>, request: HeaderMap) -> Response {
    match state.sessions.current(&request).await {
        Some(session) => Html(page(
            "Dashboard",
            &format!(
                r#"<h1>You are signed in</h1>
        <p>Signed in as <strong>{}</strong>.</p>
        <a class="button" href="/logout">Sign out</a>"#,
                escape_html(&session.username)
            ),
        ))
        .into_response(),
        None => found(&state.login_path, HeaderMap::new()),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            align-items: center;
            justify-content: center;
            min-height: 100vh;
            margin: 0;
        }}
        .container {{ text-align: center; max-width: 400px; }}
        .notice {{ color: #15803D; }}
        .button {{
            display: inline-block;
            padding: 0.75rem 1.5rem;
            background: #2563EB;
            color: white;
            border-radius: 0.5rem;
            text-decoration: none;
        }}
    </style>
</head>
<body>
    <div class="container">
        {body}
    </div>
</body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::flow::fake::FakeProvider;
    use crate::config::test_config;
    use crate::directory::{user, FileDirectory, UserState};
    use crate::session::CookieSessionTransport;
    use axum::body::Body;
    use axum::http::header::{COOKIE, SET_COOKIE};
    use axum::http::Request;
    use serde_json::json;
    use std::collections::HashMap;
    use tower::ServiceExt;
    use url::Url;

    fn app(provider: FakeProvider, state: UserState) -> (Router, Arc<CookieSessionTransport>) {
        let config = test_config("https://idp.test/tenant");
        let directory = Arc::new(FileDirectory::from_users([user(
            "7f1e",
            "john_smith",
            "john.smith@example.com",
            state,
        )]));
        let transport = Arc::new(CookieSessionTransport::new(&config.session));
        let app_state = AppState::new(&config, Arc::new(provider), directory, transport.clone());
        (router(app_state), transport)
    }

    fn john() -> FakeProvider {
        FakeProvider::returning(json!({ "preferred_username": "John.Smith@example.com" }))
    }

    async fn get(app: Router, uri: &str, cookie: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }
        app.oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn location(response: &Response) -> &str {
        response.headers().get(LOCATION).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn test_login_redirects_to_provider() {
        let (app, _) = app(john(), UserState::Active);
        let response = get(app, "/login", None).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).starts_with("https://idp.test/tenant/oauth2/v2.0/authorize"));
    }

    #[tokio::test]
    async fn test_callback_success_sets_session_and_redirects_home() {
        let (app, transport) = app(john(), UserState::Active);
        let response = get(app, "/callback?code=abc123", None).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/dashboard");
        assert!(response.headers().contains_key(SET_COOKIE));
        assert_eq!(transport.len().await, 1);
    }

    #[tokio::test]
    async fn test_callback_failures_are_indistinguishable() {
        let cases = [
            (john(), UserState::Deleted, "/callback?code=abc123"),
            (FakeProvider::failing(), UserState::Active, "/callback?code=abc123"),
            (
                FakeProvider::returning(json!({ "preferred_username": "john.smith@other.org" })),
                UserState::Active,
                "/callback?code=abc123",
            ),
            (john(), UserState::Active, "/callback"),
            (
                john(),
                UserState::Active,
                "/callback?error=access_denied&error_description=User%20cancelled",
            ),
            (john(), UserState::Active, "/callback?code=a&code=b"),
        ];

        for (provider, state, uri) in cases {
            let (app, transport) = app(provider, state);
            let response = get(app, uri, None).await;

            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
            assert!(!response.headers().contains_key(SET_COOKIE), "{uri}");
            assert_eq!(body_text(response).await, "Not authorized.");
            assert!(transport.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_logout_without_session() {
        let (app, _) = app(john(), UserState::Active);
        let response = get(app, "/logout", None).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        let url = Url::parse(location(&response)).unwrap();
        assert_eq!(url.path(), "/tenant/oauth2/v2.0/logout");
        let params: HashMap<_, _> = url.query_pairs().collect();
        assert_eq!(
            params["post_logout_redirect_uri"],
            format!("http://localhost:8080/user/login?{LOGGED_OUT_MARKER}=1")
        );
    }

    #[tokio::test]
    async fn test_sign_in_then_out() {
        let (app, transport) = app(john(), UserState::Active);

        let response = get(app.clone(), "/callback?code=abc123", None).await;
        let set_cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        let cookie = set_cookie.split(';').next().unwrap().to_string();

        let response = get(app.clone(), "/dashboard", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("Signed in as <strong>john_smith</strong>"));

        let response = get(app.clone(), "/user/logged_out", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(transport.is_empty().await);

        let response = get(app, "/dashboard", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/user/login");
    }

    #[tokio::test]
    async fn test_login_page_and_health() {
        let (app, _) = app(john(), UserState::Active);

        let response = get(app.clone(), "/user/login", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("href=\"/login\""));
        assert!(!body.contains("You are now logged out."));

        let response = get(app, "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_page_after_logout_shows_notice() {
        let (app, _) = app(john(), UserState::Active);

        let response = get(app, "/user/login?logged_out=1", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("You are now logged out."));
        assert!(body.contains("href=\"/login\""));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("john_smith"), "john_smith");
        assert_eq!(
            escape_html("<b>\"o'neil\" & co</b>"),
            "&lt;b&gt;&quot;o&#39;neil&quot; &amp; co&lt;/b&gt;"
        );
    }
}

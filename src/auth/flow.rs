//! Sign-in and sign-out orchestration.

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::info;
use url::Url;

use super::claims::{normalize_username, validate_domain, validate_local_account};
use super::oauth::IdentityProvider;
use crate::config::Config;
use crate::directory::{LocalUser, UserLookup};
use crate::error::AuthError;
use crate::session::{Session, SessionIssuer};

/// Query parameters of the provider's redirect back to us.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Result of a completed sign-in.
#[derive(Debug)]
pub struct LoginSuccess {
    pub user: LocalUser,
    pub session: Session,
    /// Application home to redirect the browser to.
    pub redirect_to: String,
}

/// Drives the authorization-code sign-in.
pub struct LoginFlow {
    provider: Arc<dyn IdentityProvider>,
    directory: Arc<dyn UserLookup>,
    sessions: SessionIssuer,
    allowed_domains: HashSet<String>,
    home_path: String,
}

impl LoginFlow {
    pub fn new(
        config: &Config,
        provider: Arc<dyn IdentityProvider>,
        directory: Arc<dyn UserLookup>,
        sessions: SessionIssuer,
    ) -> Self {
        Self {
            provider,
            directory,
            sessions,
            allowed_domains: config.policy.allowed_domains.clone(),
            home_path: config.site.home_path.clone(),
        }
    }

    /// Provider authorization URL to send the browser to.
    pub fn begin_login(&self) -> Url {
        self.provider.authorization_url()
    }

    /// Handle the provider callback.
    pub async fn handle_callback(
        &self,
        query: &CallbackQuery,
        response: &mut HeaderMap,
    ) -> Result<LoginSuccess, AuthError> {
        if let Some(error) = &query.error {
            let description = query
                .error_description
                .clone()
                .unwrap_or_else(|| error.clone());
            return Err(AuthError::ProviderDenied(description));
        }

        let code = query
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCode)?;

        self.complete_login_flow(code, response).await
    }

    /// Exchange the code, map the identity onto a local account and issue a session.
    ///
    /// `response` only receives session headers when every step succeeded.
    pub async fn complete_login_flow(
        &self,
        code: &str,
        response: &mut HeaderMap,
    ) -> Result<LoginSuccess, AuthError> {
        let tokens = self.provider.exchange_code(code).await?;

        let email = tokens
            .preferred_username()
            .ok_or(AuthError::MissingClaim)?
            .to_string();
        let username = normalize_username(&email);

        if !validate_domain(&email, &self.allowed_domains) {
            return Err(AuthError::DomainRejected(email));
        }

        let user = validate_local_account(&email, &username, self.directory.as_ref())
            .await
            .ok_or(AuthError::AccountNotFound(username))?;

        let session = self.sessions.issue(&user, response).await;
        info!(username = %user.username, "User signed in");

        Ok(LoginSuccess {
            user,
            session,
            redirect_to: self.home_path.clone(),
        })
    }
}

/// Ends the local session and hands the browser to the provider's logout.
pub struct LogoutCoordinator {
    provider: Arc<dyn IdentityProvider>,
    sessions: SessionIssuer,
    post_logout_redirect_uri: String,
}

impl LogoutCoordinator {
    pub fn new(config: &Config, provider: Arc<dyn IdentityProvider>, sessions: SessionIssuer) -> Self {
        Self {
            provider,
            sessions,
            post_logout_redirect_uri: config.post_logout_redirect_uri(),
        }
    }

    /// Clear the session (if any) and return the provider logout URL.
    pub async fn logout(&self, request: &HeaderMap, response: &mut HeaderMap) -> Url {
        self.sessions.clear(request, response).await;
        self.provider.logout_url(&self.post_logout_redirect_uri)
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeProvider;
    use super::*;
    use crate::config::test_config;
    use crate::directory::{user, FileDirectory, UserState};
    use crate::error::ExchangeError;
    use crate::session::CookieSessionTransport;
    use axum::http::header::SET_COOKIE;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Harness {
        flow: LoginFlow,
        logout: LogoutCoordinator,
        transport: Arc<CookieSessionTransport>,
        provider: Arc<FakeProvider>,
    }

    fn harness(provider: FakeProvider, state: UserState) -> Harness {
        let config = test_config("https://idp.test/tenant");
        let provider = Arc::new(provider);
        let directory = Arc::new(FileDirectory::from_users([user(
            "7f1e",
            "john_smith",
            "john.smith@example.com",
            state,
        )]));
        let transport = Arc::new(CookieSessionTransport::new(&config.session));
        let sessions = SessionIssuer::new(transport.clone(), config.session.serial_counter);

        Harness {
            flow: LoginFlow::new(&config, provider.clone(), directory, sessions.clone()),
            logout: LogoutCoordinator::new(&config, provider.clone(), sessions),
            transport,
            provider,
        }
    }

    fn john() -> FakeProvider {
        FakeProvider::returning(json!({ "preferred_username": "John.Smith@example.com" }))
    }

    #[tokio::test]
    async fn test_complete_login_flow_success() {
        let h = harness(john(), UserState::Active);

        let mut response = HeaderMap::new();
        let success = h.flow.complete_login_flow("code", &mut response).await.unwrap();

        assert_eq!(success.user.id, "7f1e");
        assert_eq!(success.session.identifier, "7f1e");
        assert_eq!(success.redirect_to, "/dashboard");
        assert!(response.contains_key(SET_COOKIE));
        assert_eq!(h.transport.len().await, 1);
    }

    #[tokio::test]
    async fn test_complete_login_flow_deleted_user() {
        let h = harness(john(), UserState::Deleted);

        let mut response = HeaderMap::new();
        let result = h.flow.complete_login_flow("code", &mut response).await;

        assert!(matches!(result, Err(AuthError::AccountNotFound(_))));
        assert!(response.is_empty());
        assert!(h.transport.is_empty().await);
    }

    #[tokio::test]
    async fn test_complete_login_flow_foreign_domain() {
        let provider =
            FakeProvider::returning(json!({ "preferred_username": "john.smith@guest.org" }));
        let h = harness(provider, UserState::Active);

        let mut response = HeaderMap::new();
        let result = h.flow.complete_login_flow("code", &mut response).await;

        assert!(matches!(result, Err(AuthError::DomainRejected(_))));
        assert!(h.transport.is_empty().await);
    }

    #[tokio::test]
    async fn test_complete_login_flow_missing_claim() {
        let provider = FakeProvider::returning(json!({ "name": "John Smith" }));
        let h = harness(provider, UserState::Active);

        let result = h
            .flow
            .complete_login_flow("code", &mut HeaderMap::new())
            .await;
        assert!(matches!(result, Err(AuthError::MissingClaim)));
    }

    #[tokio::test]
    async fn test_complete_login_flow_exchange_failure() {
        let h = harness(FakeProvider::failing(), UserState::Active);

        let result = h
            .flow
            .complete_login_flow("code", &mut HeaderMap::new())
            .await;
        assert!(matches!(
            result,
            Err(AuthError::Exchange(ExchangeError::Provider { .. }))
        ));
        assert!(h.transport.is_empty().await);
    }

    #[tokio::test]
    async fn test_handle_callback_provider_error_skips_exchange() {
        let h = harness(john(), UserState::Active);
        let query = CallbackQuery {
            code: None,
            error: Some("access_denied".into()),
            error_description: Some("User cancelled".into()),
        };

        let result = h.flow.handle_callback(&query, &mut HeaderMap::new()).await;
        assert!(matches!(result, Err(AuthError::ProviderDenied(_))));
        assert_eq!(h.provider.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handle_callback_missing_code() {
        let h = harness(john(), UserState::Active);

        let result = h
            .flow
            .handle_callback(&CallbackQuery::default(), &mut HeaderMap::new())
            .await;
        assert!(matches!(result, Err(AuthError::MissingCode)));
    }

    #[tokio::test]
    async fn test_logout_always_redirects_to_provider() {
        let h = harness(john(), UserState::Active);

        // Anonymous logout
        let url = h.logout.logout(&HeaderMap::new(), &mut HeaderMap::new()).await;
        let redirect: Vec<_> = url
            .query_pairs()
            .filter(|(k, _)| k == "post_logout_redirect_uri")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(redirect, vec!["http://localhost:8080/user/login?logged_out=1".to_string()]);

        // Authenticated logout clears the session
        let mut response = HeaderMap::new();
        let success = h.flow.complete_login_flow("code", &mut response).await.unwrap();
        let mut request = HeaderMap::new();
        request.insert(
            axum::http::header::COOKIE,
            format!("bridge_session={}", success.session.token)
                .parse()
                .unwrap(),
        );

        h.logout.logout(&request, &mut HeaderMap::new()).await;
        assert!(h.transport.is_empty().await);
    }
}

//! Local session issuance.
//!
//! `SessionIssuer` binds a session to a resolved user's stable identifier
//! through a `SessionTransport`. The bundled `CookieSessionTransport` keeps
//! sessions in memory behind an opaque cookie; a host with its own session
//! machinery supplies another transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::directory::LocalUser;

/// An established local session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque token handed to the browser.
    pub token: String,
    /// Identifier the session is bound to.
    pub identifier: String,
    /// Local username, for display only.
    pub username: String,
}

/// Host-side session machinery.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Establish a session for `identifier`, adding whatever headers the response needs.
    async fn remember(&self, identifier: &str, username: &str, response: &mut HeaderMap)
        -> Session;

    /// Live session of the request, if any.
    async fn resolve(&self, request: &HeaderMap) -> Option<Session>;

    /// Drop the request's session. Must be a no-op when there is none.
    async fn forget(&self, request: &HeaderMap, response: &mut HeaderMap);
}

#[derive(Debug, Clone)]
struct SessionRecord {
    identifier: String,
    username: String,
    created_at: DateTime<Utc>,
}

/// In-memory session store keyed by an opaque cookie.
pub struct CookieSessionTransport {
    cookie_name: String,
    secure: bool,
    max_age: Duration,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl CookieSessionTransport {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            cookie_name: config.cookie_name.clone(),
            secure: config.secure_cookie,
            max_age: Duration::seconds(i64::try_from(config.max_age_secs).unwrap_or(i64::MAX)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored sessions, expired ones included until they are pruned.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn is_expired(&self, record: &SessionRecord, now: DateTime<Utc>) -> bool {
        now - record.created_at >= self.max_age
    }

    fn cookie_attributes(&self) -> &'static str {
        if self.secure {
            "HttpOnly; Secure; SameSite=Lax; Path=/"
        } else {
            "HttpOnly; SameSite=Lax; Path=/"
        }
    }

    fn set_cookie(&self, token: &str) -> HeaderValue {
        // Lax, not Strict: the cookie is set on the provider's cross-site redirect
        let value = format!(
            "{}={}; Max-Age={}; {}",
            self.cookie_name,
            token,
            self.max_age.num_seconds(),
            self.cookie_attributes()
        );
        HeaderValue::from_str(&value).expect("cookie name and token are visible ASCII")
    }

    fn clear_cookie(&self) -> HeaderValue {
        let value = format!(
            "{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=0; {}",
            self.cookie_name,
            self.cookie_attributes()
        );
        HeaderValue::from_str(&value).expect("cookie name is visible ASCII")
    }
}

#[async_trait]
impl SessionTransport for CookieSessionTransport {
    async fn remember(
        &self,
        identifier: &str,
        username: &str,
        response: &mut HeaderMap,
    ) -> Session {
        let token = generate_token();
        let now = Utc::now();

        {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|_, record| !self.is_expired(record, now));
            if sessions.len() < before {
                debug!(pruned = before - sessions.len(), "Expired sessions pruned");
            }

            sessions.insert(
                token.clone(),
                SessionRecord {
                    identifier: identifier.to_string(),
                    username: username.to_string(),
                    created_at: now,
                },
            );
        }
        response.append(SET_COOKIE, self.set_cookie(&token));

        Session {
            token,
            identifier: identifier.to_string(),
            username: username.to_string(),
        }
    }

    async fn resolve(&self, request: &HeaderMap) -> Option<Session> {
        let token = parse_cookie(request, &self.cookie_name)?;
        let mut sessions = self.sessions.write().await;
        let record = sessions.get(&token)?;

        if self.is_expired(record, Utc::now()) {
            info!(identifier = %record.identifier, "Session expired");
            sessions.remove(&token);
            return None;
        }

        debug!(since = %record.created_at, "Session resolved");
        Some(Session {
            identifier: record.identifier.clone(),
            username: record.username.clone(),
            token,
        })
    }

    async fn forget(&self, request: &HeaderMap, response: &mut HeaderMap) {
        if let Some(token) = parse_cookie(request, &self.cookie_name) {
            if let Some(record) = self.sessions.write().await.remove(&token) {
                info!(identifier = %record.identifier, "Session cleared");
            }
        }
        response.append(SET_COOKIE, self.clear_cookie());
    }
}

/// Generate a random 256-bit session token.
fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Binds sessions to resolved local users.
#[derive(Clone)]
pub struct SessionIssuer {
    transport: Arc<dyn SessionTransport>,
    serial_counter: Option<u32>,
}

impl SessionIssuer {
    pub fn new(transport: Arc<dyn SessionTransport>, serial_counter: Option<u32>) -> Self {
        Self {
            transport,
            serial_counter,
        }
    }

    /// Identifier handed to the transport: the stable user id, optionally
    /// suffixed with the serial counter some session backends expect.
    pub fn bound_identifier(&self, identity: &LocalUser) -> String {
        match self.serial_counter {
            Some(counter) => format!("{},{}", identity.id, counter),
            None => identity.id.clone(),
        }
    }

    /// Establish a session for an already validated identity.
    pub async fn issue(&self, identity: &LocalUser, response: &mut HeaderMap) -> Session {
        let identifier = self.bound_identifier(identity);
        let session = self
            .transport
            .remember(&identifier, &identity.username, response)
            .await;
        info!(username = %identity.username, identifier = %identifier, "Session issued");
        session
    }

    /// Session of the current request, if signed in.
    pub async fn current(&self, request: &HeaderMap) -> Option<Session> {
        self.transport.resolve(request).await
    }

    /// Clear the current session, if any.
    pub async fn clear(&self, request: &HeaderMap, response: &mut HeaderMap) {
        self.transport.forget(request, response).await;
    }
}

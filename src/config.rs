//! Configuration loading and management.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Everything is validated once at startup; a bad value stops the process
//! instead of surfacing on the first sign-in.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;
use crate::secure::SecureString;

/// Default configuration file, resolved relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Environment variable naming an alternative configuration file.
const CONFIG_PATH_ENV: &str = "BRIDGE_CONFIG";

/// Routes served by the bridge itself; configurable pages may not reuse them.
pub const RESERVED_PATHS: &[&str] = &[
    "/login",
    "/callback",
    "/logout",
    "/user/logged_out",
    "/health",
];

/// Query marker added to the post-logout redirect so the login page can say so.
pub const LOGGED_OUT_MARKER: &str = "logged_out";

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub oauth: OAuthConfig,
    pub site: SiteConfig,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: SecureString,
    /// Authority base URL, e.g. `https://login.microsoftonline.com/<tenant>`.
    pub authority: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub base_url: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_home_path")]
    pub home_path: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub allowed_domains: HashSet<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_true")]
    pub secure_cookie: bool,
    /// Counter appended to the bound identifier as `"{id},{counter}"`.
    #[serde(default)]
    pub serial_counter: Option<u32>,
    /// Session lifetime, both server-side and as the cookie `Max-Age`.
    #[serde(default = "default_session_max_age")]
    pub max_age_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            secure_cookie: true,
            serial_counter: None,
            max_age_secs: default_session_max_age(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub users_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_exchange_timeout() -> u64 {
    10
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_home_path() -> String {
    "/dashboard".to_string()
}

fn default_login_path() -> String {
    "/user/login".to_string()
}

fn default_cookie_name() -> String {
    "bridge_session".to_string()
}

fn default_session_max_age() -> u64 {
    8 * 60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from `BRIDGE_CONFIG` (or `config.toml`) with environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(&path)?;

        config.apply_overrides(|key| env::var(key).ok());
        config.normalize();
        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration file without applying overrides or validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply environment variable overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(client_id) = lookup("AZURE_CLIENT_ID") {
            self.oauth.client_id = client_id;
        }

        if let Some(secret) = lookup("AZURE_CLIENT_SECRET") {
            self.oauth.client_secret = SecureString::new(secret);
        }

        if let Some(authority) = lookup("AZURE_AUTHORITY") {
            self.oauth.authority = authority;
        }

        if let Some(redirect_uri) = lookup("AZURE_REDIRECT_URI") {
            self.oauth.redirect_uri = redirect_uri;
        }

        if let Some(site_url) = lookup("BRIDGE_SITE_URL") {
            self.site.base_url = site_url;
        }

        if let Some(bind) = lookup("BRIDGE_BIND") {
            self.site.bind_address = bind;
        }

        if let Some(domains) = lookup("BRIDGE_ALLOWED_DOMAINS") {
            self.policy.allowed_domains = domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(log_level) = lookup("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    /// Lower-case allowlisted domains and strip trailing slashes from base URLs.
    pub fn normalize(&mut self) {
        self.policy.allowed_domains = self
            .policy
            .allowed_domains
            .iter()
            .map(|d| d.trim().to_lowercase())
            .collect();
        self.oauth.authority = self.oauth.authority.trim_end_matches('/').to_string();
        self.site.base_url = self.site.base_url.trim_end_matches('/').to_string();
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.oauth.client_id.is_empty() || self.oauth.client_id == "YOUR_AZURE_AD_CLIENT_ID" {
            return Err(ConfigError::Missing(
                "Azure AD client_id (set AZURE_CLIENT_ID or update config.toml)",
            ));
        }

        if self.oauth.client_secret.is_empty()
            || self.oauth.client_secret.as_str() == "YOUR_AZURE_AD_CLIENT_SECRET"
        {
            return Err(ConfigError::Missing(
                "Azure AD client_secret (set AZURE_CLIENT_SECRET or update config.toml)",
            ));
        }

        check_url("oauth.authority", &self.oauth.authority)?;
        check_url("oauth.redirect_uri", &self.oauth.redirect_uri)?;
        check_url("site.base_url", &self.site.base_url)?;

        if self.oauth.scopes.is_empty() {
            return Err(ConfigError::Missing("oauth.scopes"));
        }

        if self.oauth.exchange_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "oauth.exchange_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }

        if self.policy.allowed_domains.is_empty() {
            return Err(ConfigError::Missing("policy.allowed_domains"));
        }

        for (field, path) in [
            ("site.home_path", &self.site.home_path),
            ("site.login_path", &self.site.login_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{path:?} must start with '/'"),
                });
            }

            if RESERVED_PATHS.contains(&path.as_str()) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{path:?} is a built-in route"),
                });
            }
        }

        if self.site.home_path == self.site.login_path {
            return Err(ConfigError::Invalid {
                field: "site.home_path",
                reason: "must differ from site.login_path".into(),
            });
        }

        if self.session.max_age_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "session.max_age_secs",
                reason: "must be greater than zero".into(),
            });
        }

        if self.session.cookie_name.is_empty() {
            return Err(ConfigError::Missing("session.cookie_name"));
        }

        if !self
            .session
            .cookie_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::Invalid {
                field: "session.cookie_name",
                reason: "only ASCII letters, digits, '_' and '-' are allowed".into(),
            });
        }

        Ok(())
    }

    /// Get the authorization URL for the configured authority.
    pub fn authorize_url(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.oauth.authority)
    }

    /// Get the token URL for the configured authority.
    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.oauth.authority)
    }

    /// Get the global logout URL for the configured authority.
    pub fn logout_url(&self) -> String {
        format!("{}/oauth2/v2.0/logout", self.oauth.authority)
    }

    /// Local page the provider sends the browser back to after logout.
    pub fn post_logout_redirect_uri(&self) -> String {
        format!(
            "{}{}?{}=1",
            self.site.base_url, self.site.login_path, LOGGED_OUT_MARKER
        )
    }
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "https" | "http" => Ok(()),
        other => Err(ConfigError::Invalid {
            field,
            reason: format!("unsupported scheme {other:?}"),
        }),
    }
}

#[cfg(test)]
pub(crate) fn test_config(authority: &str) -> Config {
    Config {
        oauth: OAuthConfig {
            client_id: "test-client".into(),
            client_secret: SecureString::from("test-secret"),
            authority: authority.trim_end_matches('/').into(),
            redirect_uri: "http://localhost:8080/callback".into(),
            scopes: vec!["User.Read".into()],
            exchange_timeout_secs: 10,
        },
        site: SiteConfig {
            base_url: "http://localhost:8080".into(),
            bind_address: default_bind_address(),
            home_path: default_home_path(),
            login_path: default_login_path(),
        },
        policy: PolicyConfig {
            allowed_domains: HashSet::from(["example.com".to_string()]),
        },
        session: SessionConfig {
            secure_cookie: false,
            ..SessionConfig::default()
        },
        directory: DirectoryConfig {
            users_file: PathBuf::from("users.toml"),
        },
        logging: LoggingConfig::default(),
    }
}

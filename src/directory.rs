//! Read-only access to the local user directory.
//!
//! Accounts are provisioned by whoever owns the directory; the bridge only
//! looks them up. `FileDirectory` backs standalone deployments with a TOML file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, DirectoryError};

/// Account lifecycle state of a local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    Active,
    Pending,
    Deleted,
}

/// A local user record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocalUser {
    /// Stable unique identifier. Sessions are bound to this, never to the username.
    pub id: String,
    pub username: String,
    pub email: String,
    pub state: UserState,
}

impl LocalUser {
    pub fn is_active(&self) -> bool {
        self.state == UserState::Active
    }
}

/// Directory query used during sign-in.
#[async_trait]
pub trait UserLookup: Send + Sync {
    /// Find a user by exact (already normalized) username.
    async fn find_user_by_username(&self, name: &str)
        -> Result<Option<LocalUser>, DirectoryError>;
}

#[derive(Debug, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<LocalUser>,
}

/// In-memory directory loaded once from a TOML file of `[[users]]` records.
#[derive(Debug, Default)]
pub struct FileDirectory {
    users: HashMap<String, LocalUser>,
}

impl FileDirectory {
    /// Load the directory file. Failing to read it is a startup error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let file: UsersFile = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        let directory = Self::from_users(file.users);
        info!(
            "Loaded {} local users from {}",
            directory.len(),
            path.display()
        );
        Ok(directory)
    }

    pub fn from_users(users: impl IntoIterator<Item = LocalUser>) -> Self {
        let mut map = HashMap::new();
        for user in users {
            if let Some(previous) = map.insert(user.username.clone(), user) {
                warn!(username = %previous.username, "Duplicate username in directory, keeping last");
            }
        }
        Self { users: map }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserLookup for FileDirectory {
    async fn find_user_by_username(
        &self,
        name: &str,
    ) -> Result<Option<LocalUser>, DirectoryError> {
        let user = self.users.get(name).cloned();
        debug!(username = %name, found = user.is_some(), "Directory lookup");
        Ok(user)
    }
}

#[cfg(test)]
pub(crate) fn user(id: &str, username: &str, email: &str, state: UserState) -> LocalUser {
    LocalUser {
        id: id.into(),
        username: username.into(),
        email: email.into(),
        state,
    }
}

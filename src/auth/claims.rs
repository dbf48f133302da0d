//! Mapping of provider claims onto local accounts.
//!
//! All checks fail closed: anything unexpected is logged and treated as a
//! rejection, never propagated to the caller.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::directory::{LocalUser, UserLookup};

/// Derive the local username from an email claim.
///
/// `"Jane.Doe@Example.com"` becomes `"jane_doe"`.
pub fn normalize_username(email: &str) -> String {
    email
        .to_lowercase()
        .replace('.', "_")
        .split('@')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Check that the email's domain is on the allowlist.
///
/// Guest accounts can exist in the tenant with foreign domains; they must not
/// get a local session even though the provider authenticated them.
pub fn validate_domain(email: &str, allowed_domains: &HashSet<String>) -> bool {
    let mut parts = email.split('@');
    let domain = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(domain), None) if !domain.trim().is_empty() => domain.trim().to_lowercase(),
        _ => {
            warn!(email = %email, "Improper email, no extractable domain");
            return false;
        }
    };

    if allowed_domains.contains(&domain) {
        true
    } else {
        warn!(email = %email, domain = %domain, "Improper email domain");
        false
    }
}

/// Resolve the local account for a validated email.
///
/// Succeeds only for an active user whose stored email matches `email`
/// case-insensitively. Matching the username alone is not enough: a user on
/// another domain can normalize to the same name.
pub async fn validate_local_account(
    email: &str,
    username: &str,
    lookup: &dyn UserLookup,
) -> Option<LocalUser> {
    let user = match lookup.find_user_by_username(username).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(username = %username, "Invalid user, not found");
            return None;
        }
        Err(e) => {
            warn!(username = %username, error = %e, "Invalid user, lookup failed");
            return None;
        }
    };

    if !user.is_active() {
        warn!(username = %username, state = ?user.state, "Invalid user, not active");
        return None;
    }

    if user.email.to_lowercase() != email.to_lowercase() {
        warn!(username = %username, "Invalid user, email mismatch");
        return None;
    }

    debug!(username = %username, user_id = %user.id, "Local account resolved");
    Some(user)
}

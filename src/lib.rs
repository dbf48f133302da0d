//! Azure AD sign-in bridge.
//!
//! Delegates sign-in to Azure AD with the OAuth2 authorization-code flow,
//! maps the returned `preferred_username` onto an existing local account and
//! issues a local session for it.

#![deny(clippy::all)]

pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod secure;
pub mod server;
pub mod session;

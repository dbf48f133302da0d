//! Azure AD sign-in.
//!
//! Provides the OAuth2 authorization-code client, claim validation against
//! the local user directory, and the sign-in/sign-out orchestration.

pub mod claims;
pub mod flow;
pub mod oauth;

pub use flow::{CallbackQuery, LoginFlow, LoginSuccess, LogoutCoordinator};
pub use oauth::{AzureAdClient, IdentityProvider, TokenResult};

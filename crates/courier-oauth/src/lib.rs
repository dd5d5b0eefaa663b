//! # courier-oauth
//!
//! `OAuth2` credential refresh for messaging provider connections.
//!
//! Connections are created elsewhere (the consent/redirect flow is not part
//! of this crate); what remains here is keeping their access tokens alive.
//!
//! ## Features
//!
//! - **Refresh-token grant**: standard `grant_type=refresh_token` exchange
//! - **Token management**: expiry tracking with a configurable safety window
//! - **Provider configurations**: token endpoints for Google, Microsoft and Slack
//!
//! ## Token Refresh
//!
//! ```ignore
//! use courier_oauth::{OAuthClient, Provider};
//!
//! let client = OAuthClient::new("client_id", Provider::google()?)
//!     .with_client_secret("secret");
//!
//! let token = client.refresh_token("stored_refresh_token").await?;
//! println!("expires at {:?}", token.expires_at);
//! ```
//!
//! ## Provider Support
//!
//! - **Google** - Gmail connections
//! - **Microsoft** - Outlook and Teams connections
//! - **Slack** - Slack workspaces with token rotation enabled
//! - **Custom** - any `OAuth2` token endpoint

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod client;
mod error;
pub mod provider;
pub mod token;

pub use client::OAuthClient;
pub use error::{Error, Result};
pub use provider::Provider;
pub use token::Token;

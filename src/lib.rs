//! Embeddable identity and authentication for axum applications.
//!
//! The crate owns the flows — registration, email verification, password
//! and link login with optional TOTP/recovery-code second factor, refresh
//! and access tokens, password reset, staged email updates, and account
//! settings — while the host owns identity storage and mail delivery
//! through the [`provider::IdentityProvider`] and [`email::EmailSender`]
//! traits.
//!
//! ```no_run
//! use authgate::{AuthConfig, AuthGate, Collaborators, handlers};
//! use std::sync::Arc;
//!
//! # fn provider() -> Arc<dyn authgate::IdentityProvider> { unimplemented!() }
//! # fn run() -> anyhow::Result<()> {
//! let config = AuthConfig::new("Demo App", "https://demo.example.com", b"signing-secret");
//! let gate = Arc::new(AuthGate::new(config, provider(), Collaborators::default())?);
//! let app = axum::Router::new().merge(handlers::router(gate));
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod email;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod password;
pub mod provider;
pub mod token;
pub mod totp;

pub use config::{AccountField, AuthConfig, Rate, RateLimits, Timeouts};
pub use email::{ActionEmail, EmailPart, EmailSender, LogEmailSender};
pub use error::{ApiError, ErrorResponse};
pub use gate::{Auth, AuthGate, Collaborators};
pub use provider::{
    AccessTokenProvider, ClientInfo, IdentityError, IdentityProvider, IdentityRecord,
    RefreshTokenProvider,
};
pub use token::{TokenAction, TokenCodec, TokenError};

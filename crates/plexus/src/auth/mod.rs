//! Session authentication.
//!
//! The [`SessionAuthenticator`] is the only code that understands the auth
//! cookie. Everything downstream sees an [`Identity`].

mod authenticator;
mod claims;
mod config;
mod error;

pub use authenticator::{Identity, SessionAuthenticator, token_from_cookie_header};
pub use claims::Claims;
pub use config::{AuthConfig, ConfigValidationError};
pub use error::{AuthError, SessionRejection};

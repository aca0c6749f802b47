//! Cookie to identity.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use tracing::{debug, warn};

use plexus_protocol::models::User;

use super::{AuthConfig, AuthError, Claims, SessionRejection};
use crate::store::UserStore;

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(User),
    Anonymous,
}

impl Identity {
    pub fn user(&self) -> Option<&User> {
        match self {
            Identity::User(user) => Some(user),
            Identity::Anonymous => None,
        }
    }

    pub fn into_user(self) -> Option<User> {
        match self {
            Identity::User(user) => Some(user),
            Identity::Anonymous => None,
        }
    }
}

/// Extract a cookie value from a `Cookie` header.
pub fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Maps a session cookie to a user. Shared by HTTP and WebSocket paths.
#[derive(Clone)]
pub struct SessionAuthenticator {
    config: Arc<AuthConfig>,
    decoding_key: Option<DecodingKey>,
    users: Arc<dyn UserStore>,
}

impl SessionAuthenticator {
    /// Resolves `env:VAR_NAME` syntax in jwt_secret at construction time.
    pub fn new(mut config: AuthConfig, users: Arc<dyn UserStore>) -> Self {
        if let Ok(Some(resolved)) = config.resolve_jwt_secret() {
            config.jwt_secret = Some(resolved);
        }
        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|secret| DecodingKey::from_secret(secret.as_bytes()));
        Self {
            config: Arc::new(config),
            decoding_key,
            users,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            debug!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    /// Resolve a `Cookie` header. No session cookie means anonymous.
    pub async fn authenticate(&self, cookie_header: Option<&str>, ip: &str) -> Result<Identity, AuthError> {
        let Some(token) = cookie_header
            .and_then(|header| token_from_cookie_header(header, &self.config.cookie_name))
            .filter(|token| !token.is_empty())
        else {
            return Ok(Identity::Anonymous);
        };

        let claims = self.validate_token(token)?;
        let user_id = claims
            .user_id()
            .ok_or_else(|| AuthError::InvalidToken(format!("bad subject {:?}", claims.sub)))?;

        match self.users.get_user(user_id).await {
            Ok(Some(user)) => {
                debug!(user_id, ip, "session authenticated");
                Ok(Identity::User(user))
            }
            Ok(None) => Err(AuthError::UserNotFound),
            Err(err) => {
                warn!(user_id, error = %err, "user lookup failed during authentication");
                Err(AuthError::Internal(err.to_string()))
            }
        }
    }

    /// Authenticate an upgrade request on `path`. A bad credential on a public
    /// path degrades to anonymous; elsewhere it is rejected with a logout marker.
    pub async fn authenticate_request(
        &self,
        cookie_header: Option<&str>,
        path: &str,
        ip: &str,
    ) -> Result<Identity, SessionRejection> {
        match self.authenticate(cookie_header, ip).await {
            Ok(identity) => Ok(identity),
            Err(err) if err.is_credential_error() && self.config.is_public_path(path) => {
                debug!(path, ip, error = %err, "bad credential on public path, continuing anonymously");
                Ok(Identity::Anonymous)
            }
            Err(err) => {
                warn!(path, ip, error = %err, "rejecting session");
                Err(SessionRejection {
                    error: err,
                    cookie_name: self.config.cookie_name.clone(),
                })
            }
        }
    }
}

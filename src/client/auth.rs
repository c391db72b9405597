//! Credential checks
//!
//! Clients obtain a signed token with `login` and present it with `auth`.
//! Tokens are HS256 JWTs signed with the configured secret. Authentication
//! only flips the connection's flag; it never touches existing subscriptions.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::config::AuthSettings;
use crate::utils::error::AuthError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone)]
pub struct Authenticator {
    secret: String,
    username: String,
    password: String,
    token_ttl_secs: i64,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("username", &self.username)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            secret: settings.jwt_secret.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            token_ttl_secs: settings.token_ttl_secs as i64,
        }
    }

    /// Check a username/password pair and issue a token for it.
    pub fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        if username != self.username || password != self.password {
            return Err(AuthError::InvalidCredentials);
        }
        self.issue(username)
    }

    pub fn issue(&self, subject: &str) -> Result<String, AuthError> {
        let claims = Claims {
            sub: subject.to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::seconds(self.token_ttl_secs)).timestamp()
                as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;
        Ok(token)
    }

    /// Validate a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(data.claims)
    }
}

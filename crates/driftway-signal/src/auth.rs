//! Connection authentication
//!
//! A connection is only admitted once its bearer token resolves to a user and
//! the user's groups are known. Both lookups sit behind traits so deployments
//! can plug in their own user store.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use driftway_core::{Config, GroupId, SignalError, UserId, UserIdentity};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no token presented")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Missing and invalid tokens refuse the connection as a policy violation;
/// an unreachable user store is a server-side failure
impl From<AuthError> for SignalError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unavailable(reason) => SignalError::ServiceUnavailable(reason),
            other => SignalError::AuthenticationRejected(other.to_string()),
        }
    }
}

/// Resolves a bearer token to the user it was issued for
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

/// Resolves a user to every group it belongs to, directly or transitively
#[async_trait]
pub trait GroupResolver: Send + Sync {
    async fn groups_for(&self, user: &UserIdentity) -> Result<HashSet<GroupId>, AuthError>;
}

/// Token claims
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_super_admin: bool,
    /// Expiry, seconds since the Unix epoch
    pub exp: u64,
}

impl Claims {
    /// Claims for `user` expiring `ttl` from now
    pub fn for_user(user: &UserIdentity, ttl: Duration) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Self {
            id: user.user_id,
            username: user.username.clone(),
            is_admin: user.is_admin,
            is_super_admin: user.is_super_admin,
            exp: (now + ttl).as_secs(),
        }
    }
}

impl From<Claims> for UserIdentity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.id,
            username: claims.username,
            is_admin: claims.is_admin,
            is_super_admin: claims.is_super_admin,
        }
    }
}

/// Validates HS256 tokens signed with a shared secret
pub struct JwtIdentityResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve(&self, token: &str) -> Result<UserIdentity, AuthError> {
        jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims.into())
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

/// Sign `claims` with `secret` (HS256)
pub fn sign_token(claims: &Claims, secret: &str) -> Result<String, AuthError> {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

/// Group memberships from the `[groups]` table of the config file
#[derive(Clone, Debug, Default)]
pub struct StaticGroupResolver {
    config: Config,
}

impl StaticGroupResolver {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl GroupResolver for StaticGroupResolver {
    async fn groups_for(&self, user: &UserIdentity) -> Result<HashSet<GroupId>, AuthError> {
        Ok(self.config.groups_for(user.user_id))
    }
}

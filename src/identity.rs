//! Linked identities and token refresh.
//!
//! An identity holds the OAuth tokens for one user on one provider. The
//! polling layer refreshes expired access tokens through an
//! [`IdentityProvider`] and persists the exchanged tokens so the next poll
//! reuses them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{IdentityId, UserId};

/// OAuth credentials linking a user to a provider account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub user_id: UserId,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Whether the access token is expired or about to expire.
    ///
    /// A small skew window avoids sending a token that dies in flight.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => expiry <= now + Duration::seconds(30),
            None => false,
        }
    }
}

/// Result of a refresh-token exchange with a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenExchange {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no refresh token on identity")]
    NoRefreshToken,
    #[error("provider rejected refresh: {0}")]
    Rejected(String),
    #[error("token endpoint unreachable: {0}")]
    Unreachable(String),
}

/// Provider-specific token refresh, keyed by provider name.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn refresh(&self, identity: &Identity) -> Result<TokenExchange, IdentityError>;
}

//! Credentials for the chat socket handshake

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::ChannelError;

/// Resolves a short-lived access token, e.g. from a backend that exchanges
/// the API key and secret.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> Result<String, ChannelError>;
}

/// A token that never changes
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn get_token(&self) -> Result<String, ChannelError> {
        Ok(self.0.clone())
    }
}

#[derive(Clone)]
pub enum Credentials {
    ApiKey(String),
    AccessToken(Arc<dyn TokenProvider>),
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Credentials::ApiKey(key.into())
    }

    pub fn access_token(token: impl Into<String>) -> Self {
        Credentials::AccessToken(Arc::new(StaticToken::new(token)))
    }

    /// Query parameter carrying the credential
    pub async fn query_pair(&self) -> Result<(&'static str, String), ChannelError> {
        match self {
            Credentials::ApiKey(key) => Ok(("api_key", key.clone())),
            Credentials::AccessToken(provider) => {
                let token = provider
                    .get_token()
                    .await
                    .map_err(|e| ChannelError::Connection(format!("failed to resolve access token: {}", e)))?;
                Ok(("access_token", token))
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credentials::AccessToken(_) => f.write_str("AccessToken(<provider>)"),
        }
    }
}

use async_trait::async_trait;

use crate::error::CatalogError;

/// Supplies access tokens to remote clients.
///
/// Implementations refresh expired tokens themselves and fail with
/// [`CatalogError::AuthRequired`] when interactive re-authentication is needed.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn valid_token(&self) -> Result<String, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn valid_token(&self) -> Result<String, CatalogError> {
        if self.0.is_empty() {
            return Err(CatalogError::AuthRequired("empty access token".into()));
        }
        Ok(self.0.clone())
    }
}

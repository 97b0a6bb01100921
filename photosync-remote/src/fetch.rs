use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use url::Url;

use crate::auth::TokenSource;
use crate::catalog::ByteStream;
use crate::error::CatalogError;

/// Streams item bytes from an opaque download locator URL.
///
/// Catalog implementations delegate `fetch_bytes` here so every catalog
/// reports locator failures with the same classification.
#[derive(Clone)]
pub struct LocatorFetcher {
    http: Client,
    tokens: Option<Arc<dyn TokenSource>>,
}

impl LocatorFetcher {
    pub fn new() -> Self {
        Self::with_http(Client::new(), None)
    }

    pub fn with_token_source(tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_http(Client::new(), Some(tokens))
    }

    pub fn with_http(http: Client, tokens: Option<Arc<dyn TokenSource>>) -> Self {
        Self { http, tokens }
    }

    pub async fn fetch(&self, locator: &str) -> Result<ByteStream, CatalogError> {
        let url = Url::parse(locator)?;
        let mut request = self.http.get(url);
        if let Some(tokens) = &self.tokens {
            request = request.bearer_auth(tokens.valid_token().await?);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Http { status, body });
        }
        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(CatalogError::from)),
        ))
    }
}

impl Default for LocatorFetcher {
    fn default() -> Self {
        Self::new()
    }
}

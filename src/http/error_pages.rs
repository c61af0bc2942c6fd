//! Cache of custom error-page bodies keyed by status code.
//!
//! Configured as URL → status codes; bodies and headers are fetched when the
//! configuration is applied and cached. Fetch failures leave the affected
//! codes unset, so the original responses pass through unmodified.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http::header::{HeaderMap, CONNECTION, CONTENT_LENGTH, DATE, TRANSFER_ENCODING};

/// A fetched page: the headers and body to substitute into a response.
#[derive(Debug, Clone)]
pub struct ErrorPage {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Status-code-indexed cache of fetched error pages.
#[derive(Clone)]
pub struct ErrorResponse {
    client: reqwest::Client,
    pages: Arc<DashMap<u16, Arc<ErrorPage>>>,
}

impl ErrorResponse {
    pub fn new() -> ErrorResponse {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("error page http client");

        ErrorResponse {
            client,
            pages: Arc::new(DashMap::new()),
        }
    }

    /// Replace the cached pages with the configured set. Fetches run in
    /// background tasks so configuration updates never block on remote URLs.
    pub fn update(&self, pages: &BTreeMap<String, Vec<u16>>) {
        self.pages.clear();

        for (url, codes) in pages {
            if codes.is_empty() {
                continue;
            }

            let client = self.client.clone();
            let cache = self.pages.clone();
            let url = url.clone();
            let codes = codes.clone();

            tokio::spawn(async move {
                match fetch(&client, &url).await {
                    Ok(page) => {
                        tracing::debug!(url = %url, codes = ?codes, "cached error page");
                        let page = Arc::new(page);
                        for code in codes {
                            cache.insert(code, page.clone());
                        }
                    }
                    Err(err) => {
                        tracing::warn!(url = %url, error = %err, "fetching error page");
                    }
                }
            });
        }
    }

    pub fn get(&self, code: u16) -> Option<Arc<ErrorPage>> {
        self.pages.get(&code).map(|entry| entry.value().clone())
    }
}

impl Default for ErrorResponse {
    fn default() -> Self {
        Self::new()
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> reqwest::Result<ErrorPage> {
    let resp = client.get(url).send().await?.error_for_status()?;

    let mut headers = resp.headers().clone();
    for name in [CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, DATE] {
        headers.remove(&name);
    }

    let body = resp.bytes().await?;
    Ok(ErrorPage { headers, body })
}

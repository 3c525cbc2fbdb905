//! Cache-aware, paginated HTTP plumbing for the game server's API.
//!
//! One `reqwest::Client` per process. Every call takes a deadline and a
//! cancellation signal; both unwind before anything is written, so a fetch
//! either lands whole or not at all. Pagination follows the `X-Pages` header,
//! remaining pages fetched concurrently; one failed page fails the fetch.

use crate::error::{CoreError, CoreResult};
use crate::esi::status::FetchStatusTracker;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_BASE_URL: &str = "https://esi.evetech.net/latest";
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Cancellation + deadline for one logical call (all pages included).
#[derive(Clone)]
pub struct CallOptions {
    pub deadline: Duration,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            cancel: None,
        }
    }
}

impl CallOptions {
    async fn cancelled(&self) {
        match self.cancel.clone() {
            Some(mut rx) => {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        // Sender dropped: never cancels.
                        std::future::pending::<()>().await;
                    }
                }
            }
            None => std::future::pending().await,
        }
    }
}

/// Headers the pricing and store layers care about.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    /// Server cache expiry from the `expires` header, ms since epoch.
    pub expires_at: Option<i64>,
    pub pages: u32,
    pub response_size: usize,
}

pub struct EsiTransport {
    http: reqwest::Client,
    base_url: String,
    pub status: Arc<FetchStatusTracker>,
}

impl EsiTransport {
    pub fn build(user_agent: &str) -> CoreResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(user_agent.to_string())
            .build()
            .map_err(|e| CoreError::Network(format!("failed to build HTTP client: {e}")))
    }

    pub fn new(http: reqwest::Client, base_url: String, status: Arc<FetchStatusTracker>) -> Self {
        Self {
            http,
            base_url,
            status,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET one page as JSON. `datasource=tranquility` is always appended.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
        opts: &CallOptions,
    ) -> CoreResult<(T, ResponseMeta)> {
        let fut = self.get_json_inner(path, query, bearer);
        tokio::select! {
            biased;
            _ = opts.cancelled() => Err(CoreError::Cancelled),
            result = tokio::time::timeout(opts.deadline, fut) => {
                result.map_err(|_| CoreError::Deadline)?
            }
        }
    }

    async fn get_json_inner<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> CoreResult<(T, ResponseMeta)> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .get(&url)
            .query(&[("datasource", "tranquility")])
            .query(query);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let meta = ResponseMeta {
            expires_at: parse_expires(response.headers()),
            pages: parse_pages(response.headers()),
            response_size: 0,
        };
        let body = response.bytes().await?;
        let meta = ResponseMeta {
            response_size: body.len(),
            ..meta
        };
        let value = serde_json::from_slice(&body)
            .map_err(|e| CoreError::Deserialize(format!("{path}: {e}")))?;
        Ok((value, meta))
    }

    /// GET every page of a paginated array endpoint, in page order. The
    /// result is buffered in memory; callers persist only after full success.
    pub async fn get_paginated<T: DeserializeOwned + Send>(
        &self,
        path: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
        opts: &CallOptions,
    ) -> CoreResult<(Vec<T>, ResponseMeta)> {
        let mut first_query = query.to_vec();
        first_query.push(("page", "1".to_string()));
        let (mut items, mut meta): (Vec<T>, ResponseMeta) =
            self.get_json(path, &first_query, bearer, opts).await?;

        if meta.pages > 1 {
            let futures = (2..=meta.pages).map(|page| {
                let mut page_query = query.to_vec();
                page_query.push(("page", page.to_string()));
                async move {
                    self.get_json::<Vec<T>>(path, &page_query, bearer, opts)
                        .await
                }
            });
            for result in join_all(futures).await {
                let (page_items, page_meta) = result?;
                meta.response_size += page_meta.response_size;
                items.extend(page_items);
            }
        }
        Ok((items, meta))
    }
}

fn parse_expires(headers: &reqwest::header::HeaderMap) -> Option<i64> {
    headers
        .get("expires")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
        .map(|dt| dt.timestamp_millis())
}

fn parse_pages(headers: &reqwest::header::HeaderMap) -> u32 {
    headers
        .get("x-pages")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn expires_header_parses_rfc2822() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "expires",
            HeaderValue::from_static("Sat, 01 Aug 2026 12:00:00 GMT"),
        );
        let ms = parse_expires(&headers).unwrap();
        assert_eq!(ms, 1_785_585_600_000);
        assert_eq!(parse_expires(&HeaderMap::new()), None);
    }

    #[test]
    fn pages_header_defaults_to_one() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_pages(&headers), 1);
        headers.insert("x-pages", HeaderValue::from_static("7"));
        assert_eq!(parse_pages(&headers), 7);
    }

    #[tokio::test]
    async fn cancel_signal_wins() {
        let status = Arc::new(FetchStatusTracker::new());
        let transport = EsiTransport::new(
            EsiTransport::build("test").unwrap(),
            // Unroutable address: the request would hang until timeout.
            "http://192.0.2.1:9".to_string(),
            status,
        );
        let (tx, rx) = watch::channel(false);
        let opts = CallOptions {
            deadline: Duration::from_secs(30),
            cancel: Some(rx),
        };
        tx.send(true).unwrap();
        let err = transport
            .get_json::<serde_json::Value>("/ping", &[], None, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use reqwest::{Client, Url, header};
use tracing::{debug, warn};

use crate::config::ProxyConfig;

use super::retry::{RetryOptions, backoff_sleep, retry_options, should_retry_status};

/// Why a forwarded chat call (or probe) failed.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Upstream responded, but with a non-2xx status.
    #[error("upstream returned HTTP {status}")]
    Http { status: u16, body: Bytes },
    /// No usable response: timeout, connect failure, or the body was cut off.
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    /// The request could not be constructed; nothing was sent.
    #[error("failed to build upstream request: {0}")]
    Request(String),
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    target: Arc<UpstreamTarget>,
}

struct UpstreamTarget {
    base_url: Url,
    chat_path: String,
    status_path: String,
    auth_token: Option<String>,
    probe_timeout: Duration,
    retry: RetryOptions,
}

impl UpstreamClient {
    pub fn new(cfg: &ProxyConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.upstream.base_url)
            .with_context(|| format!("invalid upstream base_url: {}", cfg.upstream.base_url))?;
        let client = Client::builder()
            .timeout(cfg.timeouts.request())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            target: Arc::new(UpstreamTarget {
                base_url,
                chat_path: cfg.upstream.chat_path.clone(),
                status_path: cfg.upstream.status_path.clone(),
                auth_token: cfg.upstream.auth.resolve_auth_token(),
                probe_timeout: cfg.timeouts.probe(),
                retry: retry_options(&cfg.retry),
            }),
        })
    }

    pub fn has_auth_token(&self) -> bool {
        self.target.auth_token.is_some()
    }

    fn join_url(&self, path: &str) -> Result<Url, UpstreamError> {
        self.target
            .base_url
            .join(path)
            .map_err(|e| UpstreamError::Request(e.to_string()))
    }

    /// Forwards a chat-completion body upstream and returns the response
    /// body verbatim on any 2xx.
    ///
    /// Transport errors and retryable statuses are retried with backoff up
    /// to the configured attempt budget; callers only see the final
    /// outcome.
    pub async fn forward_chat(&self, body: Bytes) -> Result<Bytes, UpstreamError> {
        let url = self.join_url(&self.target.chat_path)?;
        let opt = &self.target.retry;
        let mut attempt_index = 0u32;
        loop {
            debug!("POST {url} ({} bytes)", body.len());
            let mut req = self
                .client
                .post(url.clone())
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.clone());
            if let Some(token) = self.target.auth_token.as_deref() {
                req = req.bearer_auth(token);
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let resp_body = match resp.bytes().await {
                        Ok(b) => b,
                        Err(e) => return Err(UpstreamError::Unreachable(e.to_string())),
                    };
                    if status.is_success() {
                        return Ok(resp_body);
                    }
                    if attempt_index + 1 < opt.max_attempts
                        && should_retry_status(opt, status.as_u16())
                    {
                        warn!(
                            "upstream returned HTTP {status}, retrying (attempt {}/{})",
                            attempt_index + 1,
                            opt.max_attempts
                        );
                        backoff_sleep(opt, attempt_index).await;
                        attempt_index += 1;
                        continue;
                    }
                    return Err(UpstreamError::Http {
                        status: status.as_u16(),
                        body: resp_body,
                    });
                }
                Err(err) => {
                    if err.is_builder() {
                        return Err(UpstreamError::Request(err.to_string()));
                    }
                    if attempt_index + 1 < opt.max_attempts {
                        warn!(
                            "upstream transport error ({err}), retrying (attempt {}/{})",
                            attempt_index + 1,
                            opt.max_attempts
                        );
                        backoff_sleep(opt, attempt_index).await;
                        attempt_index += 1;
                        continue;
                    }
                    return Err(UpstreamError::Unreachable(err.to_string()));
                }
            }
        }
    }

    /// Lightweight reachability probe against the upstream status endpoint.
    /// Success means a 2xx within the probe timeout; never retried.
    pub async fn probe(&self) -> Result<u16, UpstreamError> {
        let url = self.join_url(&self.target.status_path)?;
        let mut req = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .timeout(self.target.probe_timeout);
        if let Some(token) = self.target.auth_token.as_deref() {
            req = req.bearer_auth(token);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => Ok(resp.status().as_u16()),
            Ok(resp) => Err(UpstreamError::Http {
                status: resp.status().as_u16(),
                body: Bytes::new(),
            }),
            Err(err) if err.is_builder() => Err(UpstreamError::Request(err.to_string())),
            Err(err) => Err(UpstreamError::Unreachable(err.to_string())),
        }
    }
}

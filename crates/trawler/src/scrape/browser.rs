//! HTTP client for the headless browser microservice.
//!
//! The service renders a page and replies with either of two shapes,
//! depending on its generation: `{content, pageStatusCode, pageError}` or
//! `{html, status, error}`. Both are accepted.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use super::ScrapeError;
use crate::config::Settings;

/// Ceiling on a single render request, before any explicit wait.
const REQUEST_CEILING: Duration = Duration::from_secs(60);
/// Transient transport errors are retried this many times, 1s apart.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_GAP: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BrowserReply {
    Modern {
        content: String,
        #[serde(rename = "pageStatusCode")]
        page_status_code: Option<u16>,
        #[serde(rename = "pageError")]
        page_error: Option<String>,
    },
    Legacy {
        html: String,
        status: Option<u16>,
        error: Option<String>,
    },
}

/// A rendered page, normalized across reply shapes.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub content: String,
    pub status_code: Option<u16>,
    pub page_error: Option<String>,
}

impl From<BrowserReply> for FetchedPage {
    fn from(reply: BrowserReply) -> Self {
        match reply {
            BrowserReply::Modern {
                content,
                page_status_code,
                page_error,
            } => FetchedPage {
                content,
                status_code: page_status_code,
                page_error,
            },
            BrowserReply::Legacy {
                html,
                status,
                error,
            } => FetchedPage {
                content: html,
                status_code: status,
                page_error: error,
            },
        }
    }
}

pub struct BrowserClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserClient {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: settings.browser_url.clone(),
            token: settings.browser_token.clone(),
        }
    }

    /// Render one page. Retries transient transport errors; a reply that
    /// parses is final even when it carries a page error.
    pub async fn fetch_page(
        &self,
        url: &str,
        wait_after_load_ms: u64,
        headers: Option<&serde_json::Value>,
    ) -> Result<FetchedPage, ScrapeError> {
        let body = json!({
            "url": url,
            "wait_after_load": wait_after_load_ms,
            "headers": headers.cloned().unwrap_or(json!({})),
        });
        let timeout = REQUEST_CEILING + Duration::from_millis(wait_after_load_ms);

        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let mut request = self
                .http
                .post(&self.base_url)
                .timeout(timeout)
                .json(&body);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let detail = response.text().await.unwrap_or_default();
                        return Err(ScrapeError::Transport(format!(
                            "browser service returned {status}: {detail}"
                        )));
                    }
                    let reply: BrowserReply = response.json().await.map_err(|e| {
                        ScrapeError::Transport(format!("unrecognized browser reply: {e}"))
                    })?;
                    return Ok(reply.into());
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(url, attempt, error = %last_error, "browser fetch failed");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_GAP).await;
                    }
                }
            }
        }
        Err(ScrapeError::Transport(format!(
            "browser fetch failed after {MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }
}

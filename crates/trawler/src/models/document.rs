//! Scraped documents and per-page options.

use serde::{Deserialize, Serialize};

/// Options controlling what a page fetch returns.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PageOptions {
    /// Keep the raw HTML on the returned documents.
    #[serde(default)]
    pub include_raw_html: bool,
    /// Keep the markdown rendition (produced outside the core).
    #[serde(default = "default_true")]
    pub include_markdown: bool,
    /// Extra milliseconds the browser should wait after load.
    #[serde(default)]
    pub wait_after_load_ms: u64,
    /// Extra request headers forwarded to the browser service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// Metadata attached to every scraped document. `sourceURL` is the wire
/// name clients key on.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    #[serde(rename = "sourceURL")]
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_error: Option<String>,
}

/// One scraped page. Internal fields (`index`, `provider`) exist only
/// between pipeline stages and are stripped before results are stored.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_html: Option<String>,
    pub metadata: DocumentMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Document {
    /// Strip pipeline-internal fields and apply page options.
    pub fn normalized(mut self, options: &PageOptions) -> Self {
        self.index = None;
        self.provider = None;
        if !options.include_raw_html {
            self.raw_html = None;
        }
        if !options.include_markdown {
            self.markdown = None;
        }
        self
    }
}

/// The outcome of one scrape job: the fixed outer shape stored as the
/// job result and handed to crawl fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScrapeOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub docs: Vec<Document>,
}

impl ScrapeOutcome {
    pub fn ok(docs: Vec<Document>) -> Self {
        Self {
            success: true,
            message: None,
            docs,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            docs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_strips_internals() {
        let doc = Document {
            url: Some("https://example.com".to_string()),
            raw_html: Some("<html></html>".to_string()),
            markdown: Some("# hi".to_string()),
            index: Some(3),
            provider: Some("browser".to_string()),
            ..Default::default()
        };
        let out = doc.normalized(&PageOptions::default());
        assert!(out.index.is_none());
        assert!(out.provider.is_none());
        assert!(out.raw_html.is_none(), "raw html dropped unless requested");
        assert!(out.markdown.is_some(), "markdown kept by default");
    }

    #[test]
    fn metadata_uses_source_url_wire_name() {
        let meta = DocumentMetadata {
            source_url: "https://example.com".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("sourceURL").is_some());
    }
}

//! Link extraction from fetched pages.

use scraper::{Html, Selector};
use url::Url;

use crate::models::CrawlerOptions;

/// Pulls candidate links out of a page. The default implementation parses
/// HTML; alternates (sitemap-driven, API-driven) plug in here.
pub trait LinkExtractor: Send + Sync {
    fn extract(&self, base_url: &str, html: &str) -> Vec<String>;
}

/// `a[href]` extraction resolved against the page URL. Fragments are
/// dropped and only http(s) targets are kept; order is preserved with
/// duplicates removed.
pub struct HtmlLinkExtractor;

impl LinkExtractor for HtmlLinkExtractor {
    fn extract(&self, base_url: &str, html: &str) -> Vec<String> {
        let Ok(base) = Url::parse(base_url) else {
            return Vec::new();
        };
        let Ok(selector) = Selector::parse("a[href]") else {
            return Vec::new();
        };

        let document = Html::parse_document(html);
        let mut seen = std::collections::HashSet::new();
        let mut links = Vec::new();
        for element in document.select(&selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let Ok(mut resolved) = base.join(href) else {
                continue;
            };
            resolved.set_fragment(None);
            if !matches!(resolved.scheme(), "http" | "https") {
                continue;
            }
            let link = resolved.to_string();
            if seen.insert(link.clone()) {
                links.push(link);
            }
        }
        links
    }
}

/// Apply crawl options to candidate links: origin scoping plus the
/// include/exclude path fragments.
pub fn filter_links(origin_url: &str, options: &CrawlerOptions, links: Vec<String>) -> Vec<String> {
    let origin_host = Url::parse(origin_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));

    links
        .into_iter()
        .filter(|link| {
            let Ok(parsed) = Url::parse(link) else {
                return false;
            };
            if !options.allow_external_links {
                match (&origin_host, parsed.host_str()) {
                    (Some(origin), Some(host)) if origin == host => {}
                    _ => return false,
                }
            }
            let path = parsed.path();
            if !options.include_paths.is_empty()
                && !options.include_paths.iter().any(|p| path.contains(p.as_str()))
            {
                return false;
            }
            if options.exclude_paths.iter().any(|p| path.contains(p.as_str())) {
                return false;
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"
        <html><body>
          <a href="/about">About</a>
          <a href="https://a.example/about">About again</a>
          <a href="https://other.example/away">External</a>
          <a href="/docs/guide#section">Guide</a>
          <a href="mailto:hi@a.example">Mail</a>
        </body></html>
    "##;

    #[test]
    fn extracts_resolved_deduped_http_links() {
        let links = HtmlLinkExtractor.extract("https://a.example/", PAGE);
        assert_eq!(
            links,
            vec![
                "https://a.example/about",
                "https://other.example/away",
                "https://a.example/docs/guide",
            ]
        );
    }

    #[test]
    fn same_origin_filter_is_the_default() {
        let links = HtmlLinkExtractor.extract("https://a.example/", PAGE);
        let filtered = filter_links("https://a.example/", &CrawlerOptions::default(), links);
        assert_eq!(
            filtered,
            vec!["https://a.example/about", "https://a.example/docs/guide"]
        );
    }

    #[test]
    fn path_fragments_shape_the_frontier() {
        let links = vec![
            "https://a.example/docs/intro".to_string(),
            "https://a.example/blog/post".to_string(),
            "https://a.example/docs/private/key".to_string(),
        ];
        let options = CrawlerOptions {
            include_paths: vec!["/docs".to_string()],
            exclude_paths: vec!["private".to_string()],
            ..Default::default()
        };
        let filtered = filter_links("https://a.example/", &options, links);
        assert_eq!(filtered, vec!["https://a.example/docs/intro"]);
    }
}

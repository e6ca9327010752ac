use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{redirect, Client, StatusCode};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::crawler::task::PageMeta;

/// Identifying user agent sent with every request.
pub const BOT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; EvolvimusBot/1.0; +https://evolvimus.com/bot)";

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// Retries after the first attempt, with exponential backoff.
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Table text is truncated to this many characters in the markdown summary.
const TABLE_SNIPPET_LEN: usize = 100;

/// Tags whose subtrees are excluded from text extraction.
const STRIPPED_TAGS: [&str; 5] = ["script", "style", "noscript", "iframe", "svg"];

/// Transport-level fetch failure, after retries are exhausted.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempts: {source}")]
    Transport {
        url: String,
        attempts: u32,
        source: reqwest::Error,
    },

    #[error("{url} kept returning server error {status} after {attempts} attempts")]
    ServerStatus {
        url: String,
        status: StatusCode,
        attempts: u32,
    },

    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

/// Everything extracted from one fetched page.
#[derive(Debug, Clone)]
pub struct PageData {
    /// Final URL the content was fetched from
    pub url: String,

    /// HTTP status of the response (anything below 500; 404/403 are data)
    pub status: StatusCode,

    pub meta: PageMeta,

    /// Flattened pseudo-markdown rendering of the block-level content
    pub markdown: String,

    /// Links on the same hostname as the page, in document order
    pub internal_links: Vec<String>,

    /// Links to other hostnames, in document order
    pub external_links: Vec<String>,

    /// Links found inside `<nav>` regions
    pub nav_links: Vec<String>,

    /// Links found inside `<footer>` regions
    pub footer_links: Vec<String>,

    /// Wall-clock fetch duration in milliseconds
    pub duration_ms: u64,
}

/// HTTP fetch and markup extraction pipeline.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client })
    }

    /// Fetch and extract a page. Returns `None` on any transport or parse
    /// failure; callers treat that as "page unavailable" and move on.
    pub async fn fetch_page(&self, url: &str) -> Option<PageData> {
        match self.try_fetch(url).await {
            Ok(page) => Some(page),
            Err(err) => {
                warn!(url, error = %err, "Fetch failed");
                None
            }
        }
    }

    async fn try_fetch(&self, url: &str) -> Result<PageData, FetchError> {
        let base = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        let start = std::time::Instant::now();
        let response = self.get_with_retry(url).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                attempts: 1,
                source,
            })?;
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(url, %status, duration_ms, "Fetched page");
        Ok(extract_page(&base, status, &body, duration_ms))
    }

    /// GET with up to `MAX_RETRIES` retries and exponential backoff.
    ///
    /// Network errors, timeouts and 5xx responses are retried; any response
    /// below 500 (including 404/403) is returned to the caller as data.
    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send().await {
                Ok(response) if response.status().as_u16() < 500 => return Ok(response),
                Ok(response) => {
                    if attempt > MAX_RETRIES {
                        return Err(FetchError::ServerStatus {
                            url: url.to_string(),
                            status: response.status(),
                            attempts: attempt,
                        });
                    }
                    debug!(url, status = %response.status(), attempt, "Server error, retrying");
                }
                Err(source) => {
                    let transient =
                        source.is_timeout() || source.is_connect() || source.is_request();
                    if !transient || attempt > MAX_RETRIES {
                        return Err(FetchError::Transport {
                            url: url.to_string(),
                            attempts: attempt,
                            source,
                        });
                    }
                    debug!(url, attempt, "Request error, retrying");
                }
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector must be valid")
}

/// Extract metadata, pseudo-markdown content and classified link sets from
/// a page body. Pure function over the markup, separated from transport so
/// it can be tested without a server.
pub(crate) fn extract_page(base: &Url, status: StatusCode, body: &str, duration_ms: u64) -> PageData {
    let doc = Html::parse_document(body);

    let meta = extract_meta(&doc);
    let markdown = extract_markdown(&doc);

    let mut internal_links = Vec::new();
    let mut external_links = Vec::new();
    let mut seen = HashSet::new();

    for anchor in doc.select(&selector("a")) {
        let Some(resolved) = resolve_link(anchor, base) else {
            continue;
        };
        if !seen.insert(resolved.to_string()) {
            continue;
        }
        if resolved.host_str() == base.host_str() {
            internal_links.push(resolved.to_string());
        } else {
            external_links.push(resolved.to_string());
        }
    }

    let nav_links = region_links(&doc, base, "nav a");
    let footer_links = region_links(&doc, base, "footer a");

    PageData {
        url: base.to_string(),
        status,
        meta,
        markdown,
        internal_links,
        external_links,
        nav_links,
        footer_links,
        duration_ms,
    }
}

fn extract_meta(doc: &Html) -> PageMeta {
    let text_of = |css: &str| -> String {
        doc.select(&selector(css))
            .next()
            .map(|el| element_text(el))
            .unwrap_or_default()
    };
    let attr_of = |css: &str| -> Option<String> {
        doc.select(&selector(css))
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(|v| v.trim().to_string())
    };

    PageMeta {
        title: text_of("title"),
        description: attr_of(r#"meta[name="description"]"#).unwrap_or_default(),
        keywords: attr_of(r#"meta[name="keywords"]"#).unwrap_or_default(),
        og_title: attr_of(r#"meta[property="og:title"]"#),
        og_image: attr_of(r#"meta[property="og:image"]"#),
    }
}

/// Walk block-level content elements in document order and render a flat
/// pseudo-markdown string: h1-h3 become level-1 markers, h4-h6 level-2,
/// paragraphs plain lines, list items dash lines, tables a truncated
/// inline summary. Empty elements are skipped.
fn extract_markdown(doc: &Html) -> String {
    let block_sel = selector("body h1, body h2, body h3, body h4, body h5, body h6, body p, body ul, body ol, body table");
    let li_sel = selector("li");

    let mut out = String::new();
    for el in doc.select(&block_sel) {
        let tag = el.value().name();
        match tag {
            "h1" | "h2" | "h3" => {
                let text = element_text(el);
                if !text.is_empty() {
                    out.push_str(&format!("\n\n# {text}"));
                }
            }
            "h4" | "h5" | "h6" => {
                let text = element_text(el);
                if !text.is_empty() {
                    out.push_str(&format!("\n## {text}"));
                }
            }
            "p" => {
                let text = element_text(el);
                if !text.is_empty() {
                    out.push_str(&format!("\n{text}"));
                }
            }
            "ul" | "ol" => {
                for li in el.select(&li_sel) {
                    let text = element_text(li);
                    if !text.is_empty() {
                        out.push_str(&format!("\n - {text}"));
                    }
                }
            }
            "table" => {
                let text = element_text(el);
                if !text.is_empty() {
                    let snippet: String = text.chars().take(TABLE_SNIPPET_LEN).collect();
                    out.push_str(&format!("\n[Table Data: {snippet}...]"));
                }
            }
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Collect all descendant text of an element, skipping non-content subtrees
/// (script, style, embeds, inline vector graphics), whitespace-collapsed.
fn element_text(el: ElementRef) -> String {
    let mut raw = String::new();
    collect_text(el, &mut raw);
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(el: ElementRef, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(child_el) = ElementRef::wrap(child) {
            if !STRIPPED_TAGS.contains(&child_el.value().name()) {
                collect_text(child_el, out);
            }
        }
    }
}

/// Resolve an anchor to an absolute URL relative to the page, excluding
/// mailto:, tel: and same-page fragment links.
fn resolve_link(anchor: ElementRef, base: &Url) -> Option<Url> {
    let href = anchor.value().attr("href")?;
    if href.starts_with("mailto:") || href.starts_with("tel:") || href.starts_with('#') {
        return None;
    }
    base.join(href).ok()
}

fn region_links(doc: &Html, base: &Url, css: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut seen = HashSet::new();
    for anchor in doc.select(&selector(css)) {
        if let Some(resolved) = resolve_link(anchor, base) {
            let url = resolved.to_string();
            if seen.insert(url.clone()) {
                links.push(url);
            }
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE: &str = r##"
        <html>
          <head>
            <title>  Stadt Coburg  </title>
            <meta name="description" content="Offizielle Seite">
            <meta name="keywords" content="coburg, stadt">
            <meta property="og:title" content="Coburg">
            <script>var tracking = true;</script>
          </head>
          <body>
            <nav>
              <a href="/rathaus">Rathaus</a>
              <a href="/tourismus">Tourismus</a>
            </nav>
            <h1>Willkommen in Coburg</h1>
            <p>Die Vestestadt <script>inline()</script> im Herzen Frankens.</p>
            <h4>Aktuelles</h4>
            <ul><li>Stadtrat tagt</li><li></li><li>Sommerfest</li></ul>
            <table><tr><td>Montag</td><td>geschlossen</td></tr></table>
            <p></p>
            <a href="/impressum">Impressum</a>
            <a href="https://theater-coburg.de/">Landestheater</a>
            <a href="mailto:info@coburg.de">Mail</a>
            <a href="tel:+499561890">Telefon</a>
            <a href="#top">Nach oben</a>
            <footer>
              <a href="/datenschutz">Datenschutz</a>
              <a href="/kontakt">Kontakt</a>
            </footer>
          </body>
        </html>"##;

    fn sample_page() -> PageData {
        let base = Url::parse("https://www.coburg.de/").unwrap();
        extract_page(&base, StatusCode::OK, SAMPLE, 12)
    }

    #[test]
    fn extracts_metadata() {
        let page = sample_page();
        assert_eq!(page.meta.title, "Stadt Coburg");
        assert_eq!(page.meta.description, "Offizielle Seite");
        assert_eq!(page.meta.keywords, "coburg, stadt");
        assert_eq!(page.meta.og_title.as_deref(), Some("Coburg"));
        assert_eq!(page.meta.og_image, None);
    }

    #[test]
    fn renders_pseudo_markdown_in_document_order() {
        let page = sample_page();
        assert!(page.markdown.starts_with("# Willkommen in Coburg"));
        assert!(page.markdown.contains("\nDie Vestestadt im Herzen Frankens."));
        assert!(page.markdown.contains("\n## Aktuelles"));
        assert!(page.markdown.contains("\n - Stadtrat tagt"));
        assert!(page.markdown.contains("\n - Sommerfest"));
        assert!(page.markdown.contains("[Table Data: Montag geschlossen...]"));
        // Script content is stripped, empty elements skipped.
        assert!(!page.markdown.contains("inline()"));
        assert!(!page.markdown.contains(" - \n"));
    }

    #[test]
    fn partitions_links_and_collects_structural_sets() {
        let page = sample_page();
        assert!(page
            .internal_links
            .contains(&"https://www.coburg.de/impressum".to_string()));
        assert!(page
            .internal_links
            .contains(&"https://www.coburg.de/rathaus".to_string()));
        assert_eq!(page.external_links, vec!["https://theater-coburg.de/"]);
        assert_eq!(
            page.nav_links,
            vec![
                "https://www.coburg.de/rathaus",
                "https://www.coburg.de/tourismus"
            ]
        );
        assert_eq!(
            page.footer_links,
            vec![
                "https://www.coburg.de/datenschutz",
                "https://www.coburg.de/kontakt"
            ]
        );
    }

    #[test]
    fn skips_mailto_tel_and_fragment_links() {
        let page = sample_page();
        let all: Vec<&String> = page
            .internal_links
            .iter()
            .chain(page.external_links.iter())
            .collect();
        assert!(!all.iter().any(|l| l.contains("mailto")));
        assert!(!all.iter().any(|l| l.contains("tel:")));
        assert!(!all.iter().any(|l| l.ends_with("#top")));
    }

    #[tokio::test]
    async fn not_found_is_data_not_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("<html><body><p>404</p></body></html>"))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(BOT_USER_AGENT).unwrap();
        let page = fetcher
            .fetch_page(&format!("{}/missing", server.uri()))
            .await
            .expect("4xx responses are handled as data");
        assert_eq!(page.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(502))
            .expect(4) // initial attempt + 3 retries
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(BOT_USER_AGENT).unwrap();
        let page = fetcher.fetch_page(&format!("{}/broken", server.uri())).await;
        assert!(page.is_none());
    }

    #[tokio::test]
    async fn recovers_after_transient_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><head><title>ok</title></head><body></body></html>"),
            )
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(BOT_USER_AGENT).unwrap();
        let page = fetcher
            .fetch_page(&format!("{}/flaky", server.uri()))
            .await
            .expect("retry should recover");
        assert_eq!(page.meta.title, "ok");
    }
}

//! Allow-listed page fetching for the `web_fetch` tool.

use crate::error::Result;
use crate::http::HttpClient;
use reqwest::redirect;
use scraper::{Html, Node};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Returned verbatim when a URL falls outside the allow-list.
pub const DOMAIN_NOT_ALLOWED: &str = "Error: domain not allowed";

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "svg"];

const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Raw bytes read per fetch, beyond the multiple of `max_fetch_chars`, to leave room for markup.
const BODY_HEADROOM_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct DomainAllowList {
    domains: Arc<Vec<String>>,
}

impl DomainAllowList {
    pub fn new<S: AsRef<str>>(domains: &[S]) -> Self {
        let domains = domains
            .iter()
            .map(|d| {
                d.as_ref()
                    .trim()
                    .trim_start_matches("*.")
                    .trim_start_matches('.')
                    .trim_end_matches('.')
                    .to_ascii_lowercase()
            })
            .filter(|d| !d.is_empty())
            .collect();
        Self {
            domains: Arc::new(domains),
        }
    }

    /// A host matches an entry when it equals it or is a subdomain of it.
    pub fn allows_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }

    pub fn allows(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
            && url.username().is_empty()
            && url.host_str().is_some_and(|h| self.allows_host(h))
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }
}

#[derive(Clone)]
pub struct WebFetcher {
    http: HttpClient,
    allow: DomainAllowList,
    max_chars: usize,
}

impl WebFetcher {
    pub fn new(allow: DomainAllowList, max_chars: usize, timeout: Duration) -> Result<Self> {
        let redirect_allow = allow.clone();
        // Redirects must stay on the allow-list too; a stopped redirect surfaces as a 3xx error.
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= 5 || !redirect_allow.allows(attempt.url()) {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });
        let http = HttpClient::with_redirect_policy(
            concat!("agent-lab/", env!("CARGO_PKG_VERSION")),
            timeout,
            policy,
        )?
        .with_retries(0);
        Ok(Self {
            http,
            allow,
            max_chars,
        })
    }

    pub fn allow_list(&self) -> &DomainAllowList {
        &self.allow
    }

    /// Fetch `raw_url` and return `(text, is_error)`.
    pub async fn fetch(&self, raw_url: &str) -> (String, bool) {
        let url = match Url::parse(raw_url.trim()) {
            Ok(u) => u,
            Err(e) => return (format!("Error: invalid URL '{raw_url}': {e}"), true),
        };
        if !self.allow.allows(&url) {
            debug!(url = %url, "web_fetch refused");
            return (DOMAIN_NOT_ALLOWED.to_string(), true);
        }

        debug!(url = %url, "web_fetch");
        let cap = self
            .max_chars
            .saturating_mul(4)
            .saturating_add(BODY_HEADROOM_BYTES);
        match self.http.get_capped(url.as_str(), cap).await {
            Ok(body) => {
                let text = if is_html(body.content_type.as_deref(), &body.text) {
                    html_to_text(&body.text)
                } else {
                    collapse_whitespace(&body.text)
                };
                let mut out = truncate_chars(&text, self.max_chars);
                if body.truncated && !out.ends_with(TRUNCATION_MARKER) {
                    out.push_str(TRUNCATION_MARKER);
                }
                (out, false)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "web_fetch failed");
                (format!("Error: fetch failed: {e}"), true)
            }
        }
    }
}

/// HTML by declared content type, or by markup when the type is missing or generic.
fn is_html(content_type: Option<&str>, body: &str) -> bool {
    match content_type {
        Some(ct) if ct.contains("html") => true,
        Some(ct) if ct.starts_with("text/plain") || ct.contains("json") => false,
        _ => body.trim_start().starts_with('<'),
    }
}

/// Visible text of an HTML document, without scripts or styles.
pub fn html_to_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::new();
    for node in doc.tree.nodes() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| match a.value() {
            Node::Element(e) => SKIPPED_ELEMENTS.contains(&e.name()),
            _ => false,
        });
        if !hidden {
            out.push_str(text);
            out.push(' ');
        }
    }
    collapse_whitespace(&out)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to `max` characters (not bytes), marking the cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((byte_idx, _)) => {
            let mut out = s[..byte_idx].to_string();
            out.push_str(TRUNCATION_MARKER);
            out
        }
    }
}

use crate::types::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

/// Capability for fetching source text from the web. The enricher treats any
/// error as a per-URL soft failure.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_body_bytes: usize,
    /// Minimum spacing between requests to the same host.
    pub min_host_interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: "pseo-generator/0.1".to_string(),
            timeout: Duration::from_secs(30),
            max_body_bytes: 2 * 1024 * 1024,
            min_host_interval: Duration::from_secs(1),
        }
    }
}

/// HTTP implementation of `SourceFetcher`: fetches a page, strips markup,
/// and returns normalized text.
pub struct HttpSourceFetcher {
    client: Client,
    config: FetcherConfig,
    rate_limiter: Arc<RwLock<HashMap<String, Instant>>>,
}

impl HttpSourceFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            config,
            rate_limiter: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn apply_rate_limit(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url)?;
        let host = parsed.host_str().unwrap_or("").to_string();

        let now = Instant::now();
        let mut rate_limiter = self.rate_limiter.write().await;
        if let Some(last_request) = rate_limiter.get(&host) {
            let elapsed = now.duration_since(*last_request);
            if elapsed < self.config.min_host_interval {
                let wait = self.config.min_host_interval - elapsed;
                debug!("Rate limiting {}: waiting {:?}", host, wait);
                tokio::time::sleep(wait).await;
            }
        }
        rate_limiter.insert(host, Instant::now());
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        debug!("Fetching source text from: {}", url);
        self.apply_rate_limit(url).await?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Fetch {
                url: url.to_string(),
                reason: format!(
                    "HTTP {}: {}",
                    status,
                    status.canonical_reason().unwrap_or("Unknown")
                ),
            });
        }

        let mut body = response.text().await?;
        if body.len() > self.config.max_body_bytes {
            warn!(
                "Truncating oversized body from {} ({} bytes)",
                url,
                body.len()
            );
            let mut end = self.config.max_body_bytes;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }

        Ok(extract_text(&body))
    }
}

/// Best-effort markup stripping: drops tags plus script/style contents and
/// collapses runs of whitespace. Not a real HTML parser; the enrichment text
/// only feeds a prompt.
pub fn extract_text(html: &str) -> String {
    fn starts_with_ci(bytes: &[u8], needle: &str) -> bool {
        let needle = needle.as_bytes();
        bytes.len() >= needle.len() && bytes[..needle.len()].eq_ignore_ascii_case(needle)
    }

    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len() / 2);
    let mut chars = html.char_indices();
    let mut skip_until: Option<&str> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(close_tag) = skip_until {
            if c == '<' && starts_with_ci(&bytes[i..], close_tag) {
                skip_until = None;
                // Fall through to consume the closing tag below.
            } else {
                continue;
            }
        }
        if c == '<' {
            if starts_with_ci(&bytes[i..], "<script") {
                skip_until = Some("</script");
            } else if starts_with_ci(&bytes[i..], "<style") {
                skip_until = Some("</style");
            }
            // Consume up to and including the closing '>'.
            for (_, t) in chars.by_ref() {
                if t == '>' {
                    break;
                }
            }
            out.push(' ');
        } else {
            out.push(c);
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_collapses_whitespace() {
        let html = "<html><body><h1>Acme   Agency</h1>\n<p>SEO services\nsince 2015.</p></body></html>";
        assert_eq!(extract_text(html), "Acme Agency SEO services since 2015.");
    }

    #[test]
    fn drops_script_and_style_contents() {
        let html = "<p>Visible</p><script>var hidden = 1;</script><style>.x{}</style><p>Also visible</p>";
        assert_eq!(extract_text(html), "Visible Also visible");
    }
}

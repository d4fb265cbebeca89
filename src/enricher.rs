use crate::fetcher::SourceFetcher;
use crate::types::{AgencyRecord, EnrichedRecord, FactSnippet, PipelineError, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct EnricherConfig {
    /// Snippets longer than this are truncated before prompting.
    pub max_snippet_chars: usize,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            max_snippet_chars: 4000,
        }
    }
}

/// Augments a record with scraped facts. A failed fetch for one URL is
/// dropped and enrichment proceeds; only when every configured fetch fails
/// does the record itself fail.
pub struct FactEnricher {
    fetcher: Arc<dyn SourceFetcher>,
    config: EnricherConfig,
}

impl FactEnricher {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, config: EnricherConfig) -> Self {
        Self { fetcher, config }
    }

    pub async fn enrich(&self, record: AgencyRecord) -> Result<EnrichedRecord> {
        if record.source_urls.is_empty() {
            debug!("Record {} has no sources, passing through", record.record_id);
            return Ok(EnrichedRecord {
                record,
                snippets: Vec::new(),
            });
        }

        let mut snippets = Vec::new();
        let mut last_error = None;
        for url in &record.source_urls {
            match self.fetcher.fetch(url).await {
                Ok(text) => {
                    let text = normalize_snippet(&text, self.config.max_snippet_chars);
                    if text.is_empty() {
                        debug!("Empty source text from {}, skipping", url);
                        continue;
                    }
                    snippets.push(FactSnippet {
                        source_url: url.clone(),
                        text,
                        fetched_at: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Fetch failed for record {} url {}: {}",
                        record.record_id, url, e
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        if snippets.is_empty() {
            return Err(PipelineError::EnrichmentFailed {
                record_id: record.record_id,
                reason: last_error.unwrap_or_else(|| "all sources returned no text".to_string()),
            });
        }

        debug!(
            "Enriched record {} with {} of {} sources",
            record.record_id,
            snippets.len(),
            record.source_urls.len()
        );
        Ok(EnrichedRecord { record, snippets })
    }
}

fn normalize_snippet(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    collapsed.chars().take(max_chars).collect()
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One agency's identity and known facts, the unit of pipeline processing.
///
/// Facts live in a `BTreeMap` so that prompt rendering iterates keys in a
/// stable order regardless of dataset row order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgencyRecord {
    pub record_id: String,
    pub name: String,
    pub locale: Option<String>,
    pub category: Option<String>,
    pub facts: BTreeMap<String, String>,
    /// URLs the enricher may fetch for additional facts. Empty means the
    /// record passes through enrichment unchanged.
    pub source_urls: Vec<String>,
}

impl AgencyRecord {
    pub fn new(record_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            name: name.into(),
            locale: None,
            category: None,
            facts: BTreeMap::new(),
            source_urls: Vec::new(),
        }
    }
}

/// A piece of scraped source text attached to a record during enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactSnippet {
    pub source_url: String,
    pub text: String,
    pub fetched_at: DateTime<Utc>,
}

/// An `AgencyRecord` plus whatever enrichment succeeded for it. Scoped to a
/// single run; never persisted.
#[derive(Debug, Clone)]
pub struct EnrichedRecord {
    pub record: AgencyRecord,
    pub snippets: Vec<FactSnippet>,
}

/// The type of a single generated-content field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldType {
    ShortText,
    LongText,
    TextList,
    Enumerated(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: false,
        }
    }
}

/// The structured contract a generated response must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSchema {
    pub version: String,
    pub fields: Vec<FieldSpec>,
}

impl ContentSchema {
    /// Schema for a standard agency service page, shaped after the section
    /// structure of the original hand-written pages.
    pub fn agency_page_v1() -> Self {
        Self {
            version: "agency-page-v1".to_string(),
            fields: vec![
                FieldSpec::required("headline", FieldType::ShortText),
                FieldSpec::required("hero_description", FieldType::LongText),
                FieldSpec::required("call_to_action", FieldType::ShortText),
                FieldSpec::required("about", FieldType::LongText),
                FieldSpec::required("services", FieldType::TextList),
                FieldSpec::required("differentiators", FieldType::TextList),
                FieldSpec::required("closing", FieldType::LongText),
                FieldSpec::required(
                    "tone",
                    FieldType::Enumerated(vec![
                        "confident".to_string(),
                        "friendly".to_string(),
                        "technical".to_string(),
                    ]),
                ),
            ],
        }
    }
}

/// A rendered prompt plus the schema its response must satisfy. Rendering is
/// a pure function of the enriched record and template version, so two
/// identical inputs yield byte-identical text and the same hash.
#[derive(Debug, Clone)]
pub struct PromptSpec {
    pub text: String,
    pub system_prompt: String,
    pub prompt_hash: String,
    pub template_version: String,
    pub schema: ContentSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Accepted,
    SchemaInvalid,
    ProviderError,
    Timeout,
}

/// One provider call, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationAttempt {
    pub provider: String,
    pub model: String,
    pub prompt_hash: String,
    pub raw_response: Option<String>,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
}

/// A single generated value; lists for list fields, text for everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

/// The validated, schema-conformant content for one record. Superseded, not
/// mutated, when a record is regenerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentArtifact {
    pub record_id: String,
    pub schema_version: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub generated_at: DateTime<Utc>,
    pub prompt_hash: String,
    pub provider: String,
    pub model: String,
}

/// Terminal state for one record in a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordStatus {
    Succeeded,
    SkippedCached,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub record_id: String,
    pub status: RecordStatus,
    pub attempts: Vec<GenerationAttempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub reason: String,
}

/// Aggregate result of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub succeeded: usize,
    pub skipped_cached: usize,
    pub failed: usize,
    pub failures: Vec<RecordFailure>,
    pub provider_calls: usize,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.skipped_cached + self.failed
    }
}

/// Run-level configuration, passed explicitly so runs stay reproducible.
/// Transport knobs (retries, timeout, backoff) belong to `GatewayConfig`;
/// this struct only carries what the orchestrator itself reads.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub force_regenerate: bool,
    /// Regeneration rounds the orchestrator grants after a schema-invalid
    /// response. Independent of the gateway's transport retries.
    pub max_validation_retries: u32,
    pub worker_concurrency: usize,
    /// When set, a search-capable provider is queried for background text
    /// before page generation.
    pub knowledge_backbone: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            force_regenerate: false,
            max_validation_retries: 2,
            worker_concurrency: 4,
            knowledge_backbone: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("record source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("enrichment failed for record {record_id}: {reason}")]
    EnrichmentFailed { record_id: String, reason: String },

    #[error("generation failed for record {record_id}: {reason}")]
    GenerationFailed { record_id: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

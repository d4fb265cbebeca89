use crate::enricher::FactEnricher;
use crate::gateway::LlmGateway;
use crate::prompt::PromptBuilder;
use crate::record_source::RecordSource;
use crate::store::ContentStore;
use crate::types::{
    AgencyRecord, AttemptOutcome, GenerationAttempt, PipelineConfig, RecordFailure,
    RecordOutcome, RecordStatus, Result, RunReport,
};
use crate::validator::{ArtifactContext, ResponseValidator, ValidationOutcome};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Clonable handle that asks a running pipeline to stop dispatching records.
/// In-flight records finish their current stage chain; records that have not
/// started are reported as failed with a cancellation reason.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Drives records through enrich -> prompt -> generate -> validate -> store,
/// consulting the content store first for skip-if-fresh. One record's
/// failure never aborts the run.
pub struct PipelineOrchestrator {
    enricher: Arc<FactEnricher>,
    prompt_builder: Arc<PromptBuilder>,
    gateway: Arc<LlmGateway>,
    /// Gateway for knowledge-backbone queries; typically wired to a
    /// search-capable provider. Falls back to the page gateway when absent.
    backbone_gateway: Option<Arc<LlmGateway>>,
    validator: ResponseValidator,
    store: Arc<dyn ContentStore>,
    config: PipelineConfig,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl PipelineOrchestrator {
    pub fn new(
        enricher: Arc<FactEnricher>,
        prompt_builder: Arc<PromptBuilder>,
        gateway: Arc<LlmGateway>,
        store: Arc<dyn ContentStore>,
        config: PipelineConfig,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            enricher,
            prompt_builder,
            gateway,
            backbone_gateway: None,
            validator: ResponseValidator,
            store,
            config,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn with_backbone_gateway(mut self, gateway: Arc<LlmGateway>) -> Self {
        self.backbone_gateway = Some(gateway);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Runs the whole pipeline over the source and aggregates a report. Only
    /// an unavailable source aborts the run; everything else degrades to
    /// per-record failures.
    pub async fn run(&self, source: &dyn RecordSource) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let records = source.records()?;
        info!(
            "Run {} starting over {} records from {} (providers: {:?})",
            run_id,
            records.len(),
            source.source_name(),
            self.gateway.provider_names()
        );

        let concurrency = self.config.worker_concurrency.max(1);
        let outcomes: Vec<RecordOutcome> = stream::iter(records)
            .map(|record| self.process_record(record))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = RunReport {
            run_id,
            succeeded: 0,
            skipped_cached: 0,
            failed: 0,
            failures: Vec::new(),
            provider_calls: 0,
        };
        for outcome in outcomes {
            report.provider_calls += outcome.attempts.len();
            match outcome.status {
                RecordStatus::Succeeded => report.succeeded += 1,
                RecordStatus::SkippedCached => report.skipped_cached += 1,
                RecordStatus::Failed { reason } => {
                    report.failed += 1;
                    report.failures.push(RecordFailure {
                        record_id: outcome.record_id,
                        reason,
                    });
                }
            }
        }

        info!(
            "Run {} finished: {} succeeded, {} skipped (cached), {} failed, {} provider calls",
            run_id, report.succeeded, report.skipped_cached, report.failed, report.provider_calls
        );
        for failure in &report.failures {
            warn!("Record {} failed: {}", failure.record_id, failure.reason);
        }
        Ok(report)
    }

    async fn process_record(&self, record: AgencyRecord) -> RecordOutcome {
        let record_id = record.record_id.clone();
        if self.cancelled() {
            return failed(record_id, "run cancelled before processing", Vec::new());
        }

        // Pending -> SkippedCached happens before enrichment: the freshness
        // key is derived from the record, template version, and schema only,
        // so a cached record costs no fetches and no provider calls.
        let cache_hash = self.prompt_builder.cache_hash(&record);
        if !self.config.force_regenerate {
            match self.store.has_fresh(&record_id, &cache_hash).await {
                Ok(true) => {
                    debug!("Record {} is fresh in cache, skipping", record_id);
                    return RecordOutcome {
                        record_id,
                        status: RecordStatus::SkippedCached,
                        attempts: Vec::new(),
                    };
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "Freshness check failed for record {}: {}; regenerating",
                    record_id, e
                ),
            }
        }

        // Enriching
        let enriched = match self.enricher.enrich(record).await {
            Ok(enriched) => enriched,
            Err(e) => return failed(record_id, &e.to_string(), Vec::new()),
        };

        let base_spec = self.prompt_builder.build(&enriched);
        let mut attempts: Vec<GenerationAttempt> = Vec::new();

        // Optional knowledge-backbone pass; its failure only costs the
        // background section.
        let background = if self.config.knowledge_backbone {
            let prompt = self.prompt_builder.backbone_prompt(&enriched.record);
            let result = self
                .backbone_gateway
                .as_ref()
                .unwrap_or(&self.gateway)
                .generate_text(&base_spec.system_prompt, &prompt, &cache_hash)
                .await;
            attempts.extend(result.attempts);
            match result.completion {
                Some(completion) => Some(completion.text),
                None => {
                    warn!(
                        "Knowledge backbone unavailable for record {}, continuing without it",
                        record_id
                    );
                    None
                }
            }
        } else {
            None
        };

        let spec = match background.as_deref() {
            Some(text) => self
                .prompt_builder
                .build_with_background(&enriched, Some(text)),
            None => base_spec,
        };

        // Generating <-> Validating loop, bounded separately from the
        // gateway's transport retries.
        for round in 0..=self.config.max_validation_retries {
            if self.cancelled() {
                return failed(record_id, "run cancelled", attempts);
            }

            let result = self.gateway.generate(&spec).await;
            let failure_reason = result.failure_reason();
            attempts.extend(result.attempts);
            let completion = match result.completion {
                Some(completion) => completion,
                None => {
                    return failed(
                        record_id,
                        &format!("generation failed: {failure_reason}"),
                        attempts,
                    )
                }
            };

            let ctx = ArtifactContext {
                record_id: record_id.clone(),
                prompt_hash: cache_hash.clone(),
                provider: completion.provider,
                model: completion.model,
            };
            match self.validator.validate(&completion.text, &spec.schema, &ctx) {
                ValidationOutcome::Valid(artifact) => {
                    if let Err(e) = self.store.put(&artifact).await {
                        return failed(record_id, &format!("store write failed: {e}"), attempts);
                    }
                    debug!("Record {} succeeded after {} round(s)", record_id, round + 1);
                    return RecordOutcome {
                        record_id,
                        status: RecordStatus::Succeeded,
                        attempts,
                    };
                }
                ValidationOutcome::Invalid(failure) => {
                    if let Some(last) = attempts.last_mut() {
                        last.outcome = AttemptOutcome::SchemaInvalid;
                    }
                    warn!(
                        "Record {} response rejected (round {}): {}",
                        record_id,
                        round + 1,
                        failure.summary()
                    );
                    if round == self.config.max_validation_retries {
                        return failed(
                            record_id,
                            &format!(
                                "validation failed after {} attempt(s): {}",
                                round + 1,
                                failure.summary()
                            ),
                            attempts,
                        );
                    }
                }
            }
        }

        // The loop always returns from its final round.
        failed(record_id, "validation loop exhausted", attempts)
    }
}

fn failed(record_id: String, reason: &str, attempts: Vec<GenerationAttempt>) -> RecordOutcome {
    RecordOutcome {
        record_id,
        status: RecordStatus::Failed {
            reason: reason.to_string(),
        },
        attempts,
    }
}

/// Builder that wires the pipeline's collaborators together.
pub struct PipelineBuilder {
    enricher: Option<Arc<FactEnricher>>,
    prompt_builder: Option<Arc<PromptBuilder>>,
    gateway: Option<Arc<LlmGateway>>,
    backbone_gateway: Option<Arc<LlmGateway>>,
    store: Option<Arc<dyn ContentStore>>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            enricher: None,
            prompt_builder: None,
            gateway: None,
            backbone_gateway: None,
            store: None,
            config: PipelineConfig::default(),
        }
    }

    pub fn enricher(mut self, enricher: Arc<FactEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn prompt_builder(mut self, prompt_builder: Arc<PromptBuilder>) -> Self {
        self.prompt_builder = Some(prompt_builder);
        self
    }

    pub fn gateway(mut self, gateway: Arc<LlmGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Separate gateway for knowledge-backbone queries, usually backed by a
    /// search-capable provider.
    pub fn backbone_gateway(mut self, gateway: Arc<LlmGateway>) -> Self {
        self.backbone_gateway = Some(gateway);
        self
    }

    pub fn store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<PipelineOrchestrator> {
        let missing = |part: &str| {
            crate::types::PipelineError::General(format!("pipeline builder missing {part}"))
        };
        let mut orchestrator = PipelineOrchestrator::new(
            self.enricher.ok_or_else(|| missing("enricher"))?,
            self.prompt_builder.ok_or_else(|| missing("prompt builder"))?,
            self.gateway.ok_or_else(|| missing("gateway"))?,
            self.store.ok_or_else(|| missing("store"))?,
            self.config,
        );
        if let Some(gateway) = self.backbone_gateway {
            orchestrator = orchestrator.with_backbone_gateway(gateway);
        }
        Ok(orchestrator)
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

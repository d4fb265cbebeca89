use async_trait::async_trait;
use pseo_generator::{
    AgencyRecord, ContentArtifact, ContentSchema, ContentStore, EnricherConfig, FactEnricher,
    FieldSpec, FieldType, GatewayConfig, InMemoryRecordSource, LlmGateway, MemoryStore,
    MockProvider, MockReply, PipelineBuilder, PipelineConfig, PipelineError, PipelineOrchestrator,
    PromptBuilder, Result, SourceFetcher,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

/// Serves canned text for known URLs and fails everything else, counting
/// every fetch it sees.
struct MapFetcher {
    pages: HashMap<String, String>,
    calls: AtomicUsize,
}

impl MapFetcher {
    fn new(pages: HashMap<String, String>) -> Self {
        Self {
            pages,
            calls: AtomicUsize::new(0),
        }
    }

    fn empty() -> Self {
        Self::new(HashMap::new())
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for MapFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| PipelineError::Fetch {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            })
    }
}

/// Store wrapper that rejects writes for one record id.
struct FailingPutStore {
    inner: MemoryStore,
    reject_id: String,
}

#[async_trait]
impl ContentStore for FailingPutStore {
    async fn get(&self, record_id: &str, prompt_hash: &str) -> Result<Option<ContentArtifact>> {
        self.inner.get(record_id, prompt_hash).await
    }

    async fn put(&self, artifact: &ContentArtifact) -> Result<()> {
        if artifact.record_id == self.reject_id {
            return Err(PipelineError::Store("disk full".to_string()));
        }
        self.inner.put(artifact).await
    }

    async fn has_fresh(&self, record_id: &str, prompt_hash: &str) -> Result<bool> {
        self.inner.has_fresh(record_id, prompt_hash).await
    }
}

fn test_schema() -> ContentSchema {
    ContentSchema {
        version: "test-v1".to_string(),
        fields: vec![
            FieldSpec::required("headline", FieldType::ShortText),
            FieldSpec::required("services", FieldType::TextList),
            FieldSpec::required(
                "tone",
                FieldType::Enumerated(vec!["confident".to_string(), "friendly".to_string()]),
            ),
        ],
    }
}

const VALID_BODY: &str =
    r#"{"headline": "Acme grows agencies", "services": ["SEO", "CRO"], "tone": "confident"}"#;
const MALFORMED_BODY: &str = "Sure! Here is the page you asked for.";

fn config(max_validation_retries: u32) -> PipelineConfig {
    PipelineConfig {
        max_validation_retries,
        // Sequential processing keeps scripted mock replies deterministic.
        worker_concurrency: 1,
        ..PipelineConfig::default()
    }
}

// No transport retries so scripted replies map 1:1 onto provider calls.
fn fast_gateway_config() -> GatewayConfig {
    GatewayConfig {
        max_retries: 0,
        request_timeout: Duration::from_secs(5),
        retry_initial_delay: Duration::from_millis(1),
        max_tokens: 100,
    }
}

fn orchestrator(
    provider: Arc<MockProvider>,
    fetcher: Arc<dyn SourceFetcher>,
    store: Arc<dyn ContentStore>,
    config: PipelineConfig,
) -> PipelineOrchestrator {
    let gateway = Arc::new(LlmGateway::new(vec![provider], fast_gateway_config()));
    PipelineBuilder::new()
        .enricher(Arc::new(FactEnricher::new(fetcher, EnricherConfig::default())))
        .prompt_builder(Arc::new(PromptBuilder::new(test_schema())))
        .gateway(gateway)
        .store(store)
        .config(config)
        .build()
        .expect("pipeline builder")
}

#[tokio::test]
async fn valid_and_malformed_records_split_the_report() {
    init_tracing();

    // a1 gets a conformant response on the first attempt; a2 gets prose on
    // every regeneration round.
    let provider = Arc::new(
        MockProvider::new("mock")
            .with_reply(MockReply::Text(VALID_BODY.to_string()))
            .with_reply(MockReply::Text(MALFORMED_BODY.to_string())),
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = orchestrator(
        provider.clone(),
        Arc::new(MapFetcher::empty()),
        store.clone(),
        config(2),
    );

    let source = InMemoryRecordSource::new(vec![
        AgencyRecord::new("a1", "Acme Agency"),
        AgencyRecord::new("a2", "Zenith Co"),
    ]);
    let report = pipeline.run(&source).await.expect("run completes");

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped_cached, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].record_id, "a2");
    assert!(report.failures[0].reason.contains("validation failed"));

    // a1: 1 call; a2: max_validation_retries + 1 = 3 calls.
    assert_eq!(provider.call_count(), 4);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn rerun_skips_fresh_records_without_provider_calls() {
    init_tracing();

    let provider = Arc::new(
        MockProvider::new("mock").with_reply(MockReply::Text(VALID_BODY.to_string())),
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = orchestrator(
        provider.clone(),
        Arc::new(MapFetcher::empty()),
        store.clone(),
        config(2),
    );
    let source = InMemoryRecordSource::new(vec![AgencyRecord::new("a1", "Acme Agency")]);

    let first = pipeline.run(&source).await.expect("first run");
    assert_eq!(first.succeeded, 1);
    let calls_after_first = provider.call_count();

    let second = pipeline.run(&source).await.expect("second run");
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped_cached, 1);
    assert_eq!(second.failed, 0);
    assert_eq!(
        provider.call_count(),
        calls_after_first,
        "skip-if-fresh must not touch the provider"
    );
}

#[tokio::test]
async fn fresh_records_skip_enrichment_entirely() {
    init_tracing();

    let mut pages = HashMap::new();
    pages.insert(
        "https://acme.example/about".to_string(),
        "Acme builds marketing sites.".to_string(),
    );
    let mut record = AgencyRecord::new("a1", "Acme Agency");
    record.source_urls = vec!["https://acme.example/about".to_string()];
    let source = InMemoryRecordSource::new(vec![record]);
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    let provider = Arc::new(
        MockProvider::new("mock").with_reply(MockReply::Text(VALID_BODY.to_string())),
    );
    let pipeline = orchestrator(
        provider.clone(),
        Arc::new(MapFetcher::new(pages)),
        store.clone(),
        config(2),
    );
    let first = pipeline.run(&source).await.expect("first run");
    assert_eq!(first.succeeded, 1);

    // Second run: the source site is now down. A fresh record must be
    // skipped before any fetch happens, so the dead fetcher is never hit.
    let dead_fetcher = Arc::new(MapFetcher::empty());
    let rerun_provider = Arc::new(MockProvider::new("mock"));
    let rerun = orchestrator(
        rerun_provider.clone(),
        dead_fetcher.clone(),
        store.clone(),
        config(2),
    );
    let second = rerun.run(&source).await.expect("second run");

    assert_eq!(second.skipped_cached, 1);
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.failed, 0);
    assert_eq!(dead_fetcher.call_count(), 0, "cached records must not fetch");
    assert_eq!(rerun_provider.call_count(), 0);
}

#[tokio::test]
async fn force_regenerate_bypasses_the_cache() {
    init_tracing();

    let provider = Arc::new(
        MockProvider::new("mock").with_reply(MockReply::Text(VALID_BODY.to_string())),
    );
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let source = InMemoryRecordSource::new(vec![AgencyRecord::new("a1", "Acme Agency")]);

    let pipeline = orchestrator(
        provider.clone(),
        Arc::new(MapFetcher::empty()),
        store.clone(),
        config(2),
    );
    pipeline.run(&source).await.expect("first run");
    assert_eq!(provider.call_count(), 1);

    let forced = orchestrator(
        provider.clone(),
        Arc::new(MapFetcher::empty()),
        store.clone(),
        PipelineConfig {
            force_regenerate: true,
            ..config(2)
        },
    );
    let report = forced.run(&source).await.expect("forced run");

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped_cached, 0);
    assert_eq!(provider.call_count(), 2, "forced run must regenerate");
}

#[tokio::test]
async fn backbone_queries_go_to_the_backbone_gateway() {
    init_tracing();

    let page_provider = Arc::new(
        MockProvider::new("page").with_reply(MockReply::Text(VALID_BODY.to_string())),
    );
    let search_provider = Arc::new(
        MockProvider::new("search")
            .with_reply(MockReply::Text("The SEO market keeps growing.".to_string())),
    );
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    let pipeline = PipelineBuilder::new()
        .enricher(Arc::new(FactEnricher::new(
            Arc::new(MapFetcher::empty()),
            EnricherConfig::default(),
        )))
        .prompt_builder(Arc::new(PromptBuilder::new(test_schema())))
        .gateway(Arc::new(LlmGateway::new(
            vec![page_provider.clone()],
            fast_gateway_config(),
        )))
        .backbone_gateway(Arc::new(LlmGateway::new(
            vec![search_provider.clone()],
            fast_gateway_config(),
        )))
        .store(store.clone())
        .config(PipelineConfig {
            knowledge_backbone: true,
            worker_concurrency: 1,
            ..PipelineConfig::default()
        })
        .build()
        .expect("pipeline builder");

    let source = InMemoryRecordSource::new(vec![AgencyRecord::new("a1", "Acme Agency")]);
    let report = pipeline.run(&source).await.expect("run completes");

    assert_eq!(report.succeeded, 1);
    assert_eq!(search_provider.call_count(), 1, "one backbone query per record");
    assert_eq!(page_provider.call_count(), 1, "page generation stays on its own gateway");

    // The backbone answer feeds the page prompt; the query itself never
    // reaches the page provider.
    let page_prompts = page_provider.prompts();
    assert!(page_prompts[0].contains("Background on the topic"));
    assert!(page_prompts[0].contains("The SEO market keeps growing."));
    assert!(search_provider.prompts()[0].contains("Acme Agency"));
}

#[tokio::test]
async fn enrichment_failures_stay_isolated_per_record() {
    init_tracing();

    let mut pages = HashMap::new();
    pages.insert(
        "https://acme.example/about".to_string(),
        "Acme builds marketing sites.".to_string(),
    );
    let fetcher = Arc::new(MapFetcher::new(pages));

    let provider = Arc::new(
        MockProvider::new("mock").with_reply(MockReply::Text(VALID_BODY.to_string())),
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = orchestrator(provider.clone(), fetcher, store.clone(), config(2));

    let mut enrichable = AgencyRecord::new("a1", "Acme Agency");
    enrichable.source_urls = vec!["https://acme.example/about".to_string()];
    let mut unreachable = AgencyRecord::new("a2", "Zenith Co");
    unreachable.source_urls = vec!["https://zenith.example/down".to_string()];
    let plain = AgencyRecord::new("a3", "Nadir Ltd");

    let source = InMemoryRecordSource::new(vec![enrichable, unreachable, plain]);
    let report = pipeline.run(&source).await.expect("run completes");

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].record_id, "a2");
    assert!(report.failures[0].reason.contains("enrichment failed"));
}

#[tokio::test]
async fn validation_retries_are_bounded() {
    init_tracing();

    let provider = Arc::new(
        MockProvider::new("mock").with_reply(MockReply::Text(MALFORMED_BODY.to_string())),
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = orchestrator(
        provider.clone(),
        Arc::new(MapFetcher::empty()),
        store.clone(),
        config(1),
    );

    let source = InMemoryRecordSource::new(vec![AgencyRecord::new("a1", "Acme Agency")]);
    let report = pipeline.run(&source).await.expect("run completes");

    assert_eq!(report.failed, 1);
    assert_eq!(
        provider.call_count(),
        2,
        "max_validation_retries + 1 generation rounds"
    );
    assert!(store.is_empty().await, "no artifact may be stored on failure");
}

#[tokio::test]
async fn generation_failure_after_retries_fails_the_record() {
    init_tracing();

    let provider = Arc::new(
        MockProvider::new("mock").with_reply(MockReply::Transient("rate limited".to_string())),
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = orchestrator(
        provider.clone(),
        Arc::new(MapFetcher::empty()),
        store.clone(),
        config(2),
    );

    let source = InMemoryRecordSource::new(vec![AgencyRecord::new("a1", "Acme Agency")]);
    let report = pipeline.run(&source).await.expect("run completes");

    assert_eq!(report.failed, 1);
    assert!(report.failures[0].reason.contains("generation failed"));
    // max_retries = 0, so a single transport attempt ends the record.
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn store_write_failure_is_a_per_record_failure() {
    init_tracing();

    let provider = Arc::new(
        MockProvider::new("mock").with_reply(MockReply::Text(VALID_BODY.to_string())),
    );
    let store = Arc::new(FailingPutStore {
        inner: MemoryStore::new(),
        reject_id: "a1".to_string(),
    });
    let pipeline = orchestrator(
        provider.clone(),
        Arc::new(MapFetcher::empty()),
        store,
        config(2),
    );

    let source = InMemoryRecordSource::new(vec![
        AgencyRecord::new("a1", "Acme Agency"),
        AgencyRecord::new("a2", "Zenith Co"),
    ]);
    let report = pipeline.run(&source).await.expect("run completes");

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].record_id, "a1");
    assert!(report.failures[0].reason.contains("store write failed"));
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_reports_failures() {
    init_tracing();

    let provider = Arc::new(MockProvider::new("mock"));
    let store = Arc::new(MemoryStore::new());
    let pipeline = orchestrator(
        provider.clone(),
        Arc::new(MapFetcher::empty()),
        store.clone(),
        config(2),
    );
    pipeline.cancel_handle().cancel();

    let source = InMemoryRecordSource::new(vec![
        AgencyRecord::new("a1", "Acme Agency"),
        AgencyRecord::new("a2", "Zenith Co"),
    ]);
    let report = pipeline.run(&source).await.expect("run completes");

    assert_eq!(report.failed, 2);
    assert_eq!(report.succeeded, 0);
    assert_eq!(provider.call_count(), 0);
    assert!(report.failures.iter().all(|f| f.reason.contains("cancelled")));
    assert!(store.is_empty().await, "cancelled records must never be cached");
}

#[tokio::test]
async fn unavailable_source_aborts_the_run() {
    init_tracing();

    let provider = Arc::new(MockProvider::new("mock"));
    let pipeline = orchestrator(
        provider,
        Arc::new(MapFetcher::empty()),
        Arc::new(MemoryStore::new()),
        config(2),
    );

    let source = pseo_generator::JsonlRecordSource::new("/nonexistent/agencies.jsonl");
    match pipeline.run(&source).await {
        Err(PipelineError::SourceUnavailable(_)) => {}
        other => panic!("expected SourceUnavailable, got {other:?}"),
    }
}

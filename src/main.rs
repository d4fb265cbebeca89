use anyhow::{bail, Context};
use clap::Parser;
use pseo_generator::{
    AnthropicProvider, ContentSchema, EnricherConfig, FactEnricher, FetcherConfig, GatewayConfig,
    HttpSourceFetcher, JsonFileStore, JsonlRecordSource, LlmGateway, LlmProvider,
    PerplexityProvider, PipelineBuilder, PipelineConfig, PromptBuilder,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Regenerates programmatic agency-page content from a JSONL dataset.
#[derive(Parser, Debug)]
#[command(name = "pseo-generator", version)]
struct Args {
    /// JSON-lines dataset, one agency record per line.
    #[arg(long)]
    input: PathBuf,

    /// Directory that receives one JSON artifact per record.
    #[arg(long, default_value = "output")]
    output: PathBuf,

    /// Regenerate even when a fresh artifact exists.
    #[arg(long)]
    force: bool,

    /// Bounded outbound-call concurrency.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Transport retries per provider.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Regeneration rounds after a schema-invalid response.
    #[arg(long, default_value_t = 2)]
    max_validation_retries: u32,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 60)]
    request_timeout_secs: u64,

    /// Query a search-capable provider for background text before generating.
    #[arg(long)]
    knowledge_backbone: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();
    if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
        let model = env::var("ANTHROPIC_MODEL")
            .unwrap_or_else(|_| "claude-3-7-sonnet-20250219".to_string());
        providers.push(Arc::new(
            AnthropicProvider::new(key, model).context("building anthropic provider")?,
        ));
    }
    let mut perplexity: Option<Arc<dyn LlmProvider>> = None;
    if let Ok(key) = env::var("PERPLEXITY_API_KEY") {
        let model = env::var("PERPLEXITY_MODEL").unwrap_or_else(|_| "sonar-pro".to_string());
        let provider: Arc<dyn LlmProvider> = Arc::new(
            PerplexityProvider::new(key, model).context("building perplexity provider")?,
        );
        perplexity = Some(provider.clone());
        providers.push(provider);
    }
    if providers.is_empty() {
        bail!("no provider configured; set ANTHROPIC_API_KEY and/or PERPLEXITY_API_KEY");
    }

    let gateway_config = GatewayConfig {
        max_retries: args.max_retries,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        ..GatewayConfig::default()
    };
    let gateway = Arc::new(LlmGateway::new(providers, gateway_config.clone()));

    // Backbone queries need web search, so they go straight to Perplexity
    // rather than through the page-generation provider chain.
    let backbone_gateway = match &perplexity {
        Some(provider) if args.knowledge_backbone => Some(Arc::new(LlmGateway::new(
            vec![provider.clone()],
            gateway_config,
        ))),
        _ => None,
    };
    if args.knowledge_backbone && backbone_gateway.is_none() {
        info!("PERPLEXITY_API_KEY not set; backbone queries will use the page providers");
    }

    let fetcher = Arc::new(HttpSourceFetcher::new(FetcherConfig::default())?);
    let enricher = Arc::new(FactEnricher::new(fetcher, EnricherConfig::default()));
    let prompt_builder = Arc::new(PromptBuilder::new(ContentSchema::agency_page_v1()));
    let store = Arc::new(JsonFileStore::open(&args.output).await?);

    let mut builder = PipelineBuilder::new()
        .enricher(enricher)
        .prompt_builder(prompt_builder)
        .gateway(gateway)
        .store(store)
        .config(PipelineConfig {
            force_regenerate: args.force,
            max_validation_retries: args.max_validation_retries,
            worker_concurrency: args.concurrency,
            knowledge_backbone: args.knowledge_backbone,
        });
    if let Some(backbone) = backbone_gateway {
        builder = builder.backbone_gateway(backbone);
    }
    let orchestrator = builder.build()?;

    let source = JsonlRecordSource::new(&args.input);
    let report = orchestrator.run(&source).await?;

    info!(
        "Done: {} succeeded, {} skipped, {} failed out of {} records",
        report.succeeded,
        report.skipped_cached,
        report.failed,
        report.total()
    );
    if report.failed > 0 {
        for failure in &report.failures {
            info!("  failed {}: {}", failure.record_id, failure.reason);
        }
        std::process::exit(1);
    }
    Ok(())
}

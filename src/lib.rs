pub mod enricher;
pub mod fetcher;
pub mod gateway;
pub mod pipeline;
pub mod prompt;
pub mod providers;
pub mod record_source;
pub mod store;
pub mod types;
pub mod validator;

pub use enricher::{EnricherConfig, FactEnricher};
pub use fetcher::{FetcherConfig, HttpSourceFetcher, SourceFetcher};
pub use gateway::{GatewayConfig, GatewayResult, LlmGateway, RawCompletion};
pub use pipeline::{CancelHandle, PipelineBuilder, PipelineOrchestrator};
pub use prompt::{PromptBuilder, TEMPLATE_VERSION_V1};
pub use providers::{
    AnthropicProvider, CompletionRequest, LlmProvider, MockProvider, MockReply,
    PerplexityProvider, ProviderError,
};
pub use record_source::{ColumnMapping, InMemoryRecordSource, JsonlRecordSource, RecordSource};
pub use store::{ContentStore, JsonFileStore, MemoryStore};
pub use types::*;
pub use validator::{ArtifactContext, ResponseValidator, ValidationFailure, ValidationOutcome};

use crate::providers::{CompletionRequest, LlmProvider, ProviderError};
use crate::types::{AttemptOutcome, GenerationAttempt, PromptSpec};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Transport retries per provider; each provider sees at most
    /// `max_retries + 1` calls per invocation.
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub retry_initial_delay: Duration,
    pub max_tokens: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout: Duration::from_secs(60),
            retry_initial_delay: Duration::from_secs(2),
            max_tokens: 6000,
        }
    }
}

/// A completed generation: the accepted raw text plus where it came from.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub text: String,
    pub provider: String,
    pub model: String,
}

/// Result of one gateway invocation: the full attempt history, and the
/// accepted completion if any attempt succeeded.
#[derive(Debug)]
pub struct GatewayResult {
    pub attempts: Vec<GenerationAttempt>,
    pub completion: Option<RawCompletion>,
}

impl GatewayResult {
    /// Human-readable reason for a failed invocation, from the last attempt.
    pub fn failure_reason(&self) -> String {
        match self.attempts.last() {
            Some(attempt) => attempt
                .error
                .clone()
                .unwrap_or_else(|| format!("{:?}", attempt.outcome)),
            None => "no providers configured".to_string(),
        }
    }
}

/// Invokes providers in priority order with retry, backoff, timeout, and
/// fallback. Transient errors retry on the same provider; exhausted retries
/// fail over to the next provider; fatal errors stop everything immediately.
pub struct LlmGateway {
    providers: Vec<Arc<dyn LlmProvider>>,
    config: GatewayConfig,
}

impl LlmGateway {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, config: GatewayConfig) -> Self {
        Self { providers, config }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.provider_name()).collect()
    }

    pub async fn generate(&self, spec: &PromptSpec) -> GatewayResult {
        self.generate_text(&spec.system_prompt, &spec.text, &spec.prompt_hash)
            .await
    }

    /// Raw entry point, also used for knowledge-backbone queries that carry
    /// their own prompt text.
    pub async fn generate_text(
        &self,
        system_prompt: &str,
        prompt: &str,
        prompt_hash: &str,
    ) -> GatewayResult {
        let request = CompletionRequest {
            system_prompt: system_prompt.to_string(),
            prompt: prompt.to_string(),
            max_tokens: self.config.max_tokens,
        };

        let mut attempts: Vec<GenerationAttempt> = Vec::new();

        for provider in &self.providers {
            let name = provider.provider_name();
            let model = provider.model();
            let mut backoff = ExponentialBackoff {
                initial_interval: self.config.retry_initial_delay,
                max_interval: self.config.retry_initial_delay * 32,
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            };

            for retry in 0..=self.config.max_retries {
                let attempt_number = attempts.len() as u32 + 1;
                let start = Instant::now();
                let call = provider.complete(&request);
                let (outcome, timed_out) =
                    match tokio::time::timeout(self.config.request_timeout, call).await {
                        Ok(result) => (result, false),
                        Err(_) => (
                            Err(ProviderError::Transient(format!(
                                "request timed out after {:?}",
                                self.config.request_timeout
                            ))),
                            true,
                        ),
                    };
                let latency_ms = start.elapsed().as_millis() as u64;

                match outcome {
                    Ok(text) => {
                        debug!(
                            "Provider {} accepted on attempt {} ({}ms)",
                            name, attempt_number, latency_ms
                        );
                        attempts.push(GenerationAttempt {
                            provider: name.clone(),
                            model: model.clone(),
                            prompt_hash: prompt_hash.to_string(),
                            raw_response: Some(text.clone()),
                            error: None,
                            latency_ms,
                            attempt_number,
                            outcome: AttemptOutcome::Accepted,
                        });
                        return GatewayResult {
                            attempts,
                            completion: Some(RawCompletion {
                                text,
                                provider: name,
                                model,
                            }),
                        };
                    }
                    Err(e) => {
                        let fatal = e.is_fatal();
                        attempts.push(GenerationAttempt {
                            provider: name.clone(),
                            model: model.clone(),
                            prompt_hash: prompt_hash.to_string(),
                            raw_response: None,
                            error: Some(e.to_string()),
                            latency_ms,
                            attempt_number,
                            outcome: if timed_out {
                                AttemptOutcome::Timeout
                            } else {
                                AttemptOutcome::ProviderError
                            },
                        });

                        if fatal {
                            warn!("Provider {} returned fatal error: {}", name, e);
                            return GatewayResult {
                                attempts,
                                completion: None,
                            };
                        }

                        if retry < self.config.max_retries {
                            if let Some(delay) = backoff.next_backoff() {
                                warn!(
                                    "Provider {} attempt {} failed ({}), retrying in {:?}",
                                    name, retry + 1, e, delay
                                );
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                        }
                    }
                }
            }

            warn!(
                "Provider {} exhausted {} attempts, falling back",
                name,
                self.config.max_retries + 1
            );
        }

        GatewayResult {
            attempts,
            completion: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockProvider, MockReply};
    use crate::types::ContentSchema;

    fn spec() -> PromptSpec {
        PromptSpec {
            text: "prompt".to_string(),
            system_prompt: "system".to_string(),
            prompt_hash: "hash".to_string(),
            template_version: "v1".to_string(),
            schema: ContentSchema::agency_page_v1(),
        }
    }

    fn fast_config(max_retries: u32) -> GatewayConfig {
        GatewayConfig {
            max_retries,
            request_timeout: Duration::from_secs(5),
            retry_initial_delay: Duration::from_millis(1),
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn transient_errors_retry_then_succeed() {
        let provider = Arc::new(
            MockProvider::new("primary")
                .with_reply(MockReply::Transient("rate limited".to_string()))
                .with_reply(MockReply::Text("ok".to_string())),
        );
        let gateway = LlmGateway::new(vec![provider.clone()], fast_config(2));

        let result = gateway.generate(&spec()).await;

        assert_eq!(provider.call_count(), 2);
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.completion.as_ref().map(|c| c.text.as_str()), Some("ok"));
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::ProviderError);
        assert_eq!(result.attempts[1].outcome, AttemptOutcome::Accepted);
    }

    #[tokio::test]
    async fn retry_bound_is_max_retries_plus_one_per_provider() {
        let primary = Arc::new(
            MockProvider::new("primary")
                .with_reply(MockReply::Transient("boom".to_string())),
        );
        let secondary = Arc::new(
            MockProvider::new("secondary")
                .with_reply(MockReply::Transient("boom".to_string())),
        );
        let gateway =
            LlmGateway::new(vec![primary.clone(), secondary.clone()], fast_config(2));

        let result = gateway.generate(&spec()).await;

        assert!(result.completion.is_none());
        assert_eq!(primary.call_count(), 3, "max_retries + 1 on the primary");
        assert_eq!(secondary.call_count(), 3, "max_retries + 1 on the fallback");
        assert_eq!(result.attempts.len(), 6);
    }

    #[tokio::test]
    async fn fallback_provider_rescues_the_call() {
        let primary = Arc::new(
            MockProvider::new("primary")
                .with_reply(MockReply::Transient("down".to_string())),
        );
        let secondary = Arc::new(
            MockProvider::new("secondary").with_reply(MockReply::Text("rescued".to_string())),
        );
        let gateway =
            LlmGateway::new(vec![primary.clone(), secondary.clone()], fast_config(0));

        let result = gateway.generate(&spec()).await;

        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 1);
        assert_eq!(
            result.completion.map(|c| c.provider),
            Some("secondary".to_string())
        );
    }

    #[tokio::test]
    async fn slow_provider_times_out_and_is_retried() {
        let provider = Arc::new(
            MockProvider::new("slow")
                .with_delay(Duration::from_millis(200))
                .with_reply(MockReply::Text("too late".to_string())),
        );
        let config = GatewayConfig {
            max_retries: 1,
            request_timeout: Duration::from_millis(20),
            retry_initial_delay: Duration::from_millis(1),
            max_tokens: 100,
        };
        let gateway = LlmGateway::new(vec![provider.clone()], config);

        let result = gateway.generate(&spec()).await;

        assert!(result.completion.is_none());
        assert_eq!(provider.call_count(), 2, "timeouts are transient, so they retry");
        assert_eq!(result.attempts.len(), 2);
        for attempt in &result.attempts {
            assert_eq!(attempt.outcome, AttemptOutcome::Timeout);
        }
        assert!(result.failure_reason().contains("timed out"));
    }

    #[tokio::test]
    async fn fatal_errors_skip_retries_and_fallback() {
        let primary = Arc::new(
            MockProvider::new("primary")
                .with_reply(MockReply::Fatal("bad api key".to_string())),
        );
        let secondary = Arc::new(MockProvider::new("secondary"));
        let gateway =
            LlmGateway::new(vec![primary.clone(), secondary.clone()], fast_config(3));

        let result = gateway.generate(&spec()).await;

        assert!(result.completion.is_none());
        assert_eq!(primary.call_count(), 1, "fatal error must not retry");
        assert_eq!(secondary.call_count(), 0, "fatal error must not fall back");
        assert!(result.failure_reason().contains("bad api key"));
    }
}

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Provider failures split into the two classes the gateway cares about:
/// transient errors are retried with backoff, fatal errors are surfaced
/// immediately without retry or fallback.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Fatal(_))
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub max_tokens: u32,
}

/// One LLM backend: takes a prompt, returns raw text. Providers are
/// swappable behind this trait so orchestration never touches SDK shapes.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_name(&self) -> String;

    fn model(&self) -> String;

    async fn complete(&self, request: &CompletionRequest)
        -> std::result::Result<String, ProviderError>;
}

fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let summary = format!("HTTP {}: {}", status, body.chars().take(300).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Transient(summary)
    } else {
        // 400/401/403 and friends: retrying the same request cannot help.
        ProviderError::Fatal(summary)
    }
}

fn classify_transport(e: reqwest::Error) -> ProviderError {
    ProviderError::Transient(format!("transport: {e}"))
}

fn build_client(timeout: Duration) -> std::result::Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Fatal(format!("client build: {e}")))
}

/// Claude messages-API provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String) -> std::result::Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(Duration::from_secs(120))?,
            api_key,
            model,
            base_url: "https://api.anthropic.com".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_name(&self) -> String {
        "anthropic".to_string()
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "system": request.system_prompt,
            "messages": [{"role": "user", "content": request.prompt}],
        });

        debug!("Calling anthropic model {}", self.model);
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Transient(format!("malformed response body: {e}")))?;
        value["content"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::Transient("response missing content[0].text".to_string())
            })
    }
}

/// Perplexity provider, OpenAI-compatible chat completions surface. Useful as
/// the search-capable backend for knowledge-backbone queries.
pub struct PerplexityProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl PerplexityProvider {
    pub fn new(api_key: String, model: String) -> std::result::Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(Duration::from_secs(120))?,
            api_key,
            model,
            base_url: "https://api.perplexity.ai".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl LlmProvider for PerplexityProvider {
    fn provider_name(&self) -> String {
        "perplexity".to_string()
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.prompt},
            ],
        });

        debug!("Calling perplexity model {}", self.model);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Transient(format!("malformed response body: {e}")))?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::Transient("response missing choices[0].message.content".to_string())
            })
    }
}

/// Scripted reply for `MockProvider`.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Transient(String),
    Fatal(String),
}

/// Scriptable provider for tests: replies are consumed in order; when the
/// script is exhausted the last reply repeats. Records every prompt it was
/// asked to complete.
pub struct MockProvider {
    name: String,
    model: String,
    replies: Mutex<VecDeque<MockReply>>,
    last: Mutex<Option<MockReply>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            model: "mock-model".to_string(),
            replies: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_reply(self, reply: MockReply) -> Self {
        self.push_reply(reply);
        self
    }

    /// Sleep this long before every reply, to exercise timeout handling.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().expect("mock lock").push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("mock lock").clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn provider_name(&self) -> String {
        self.name.clone()
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("mock lock")
            .push(request.prompt.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut replies = self.replies.lock().expect("mock lock");
            match replies.pop_front() {
                Some(reply) => {
                    *self.last.lock().expect("mock lock") = Some(reply.clone());
                    reply
                }
                None => self
                    .last
                    .lock()
                    .expect("mock lock")
                    .clone()
                    .unwrap_or(MockReply::Fatal("mock script exhausted".to_string())),
            }
        };

        match reply {
            MockReply::Text(text) => Ok(text),
            MockReply::Transient(msg) => Err(ProviderError::Transient(msg)),
            MockReply::Fatal(msg) => Err(ProviderError::Fatal(msg)),
        }
    }
}

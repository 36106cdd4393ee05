//! Provider call adapter.
//!
//! A uniform call contract over heterogeneous LLM providers. The production
//! implementation speaks the OpenAI-compatible chat-completions dialect via
//! reqwest and normalizes upstream failures into the crate error taxonomy;
//! the mock implementation scripts responses for tests without touching the
//! network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BarrageError, Result};

/// Routing and deadline information for one provider call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub provider: String,
    pub model: String,
    pub timeout: Duration,
}

/// Token accounting reported by the provider, when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Normalized response from a provider call.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub latency: Duration,
    pub token_usage: Option<TokenUsage>,
    pub metadata: Option<serde_json::Value>,
}

/// Uniform call contract over external LLM providers.
///
/// Implementations enforce their own transport timeout and classify
/// failures: 429-equivalents as rate limits, 5xx/network/timeout as
/// transient, anything else as a provider rejection.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn call(&self, prompt: &str, opts: &CallOptions) -> Result<ProviderResponse>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Where to reach one provider, and with what credentials.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key: String,
}

/// OpenAI-compatible HTTP client over a set of configured providers.
#[derive(Debug)]
pub struct HttpProviderClient {
    client: reqwest::Client,
    endpoints: HashMap<String, ProviderEndpoint>,
}

impl HttpProviderClient {
    /// Create a client. Credentials are validated here, once per provider,
    /// so a misconfigured provider fails at startup rather than on every
    /// call.
    pub fn new(endpoints: HashMap<String, ProviderEndpoint>) -> Result<Self> {
        for (provider, endpoint) in &endpoints {
            if endpoint.base_url.is_empty() {
                return Err(BarrageError::Configuration {
                    provider: provider.clone(),
                    message: "missing base URL".to_string(),
                });
            }
            if endpoint.api_key.is_empty() {
                return Err(BarrageError::Configuration {
                    provider: provider.clone(),
                    message: "missing API key".to_string(),
                });
            }
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoints,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    #[tracing::instrument(skip(self, prompt), fields(provider = %opts.provider, model = %opts.model))]
    async fn call(&self, prompt: &str, opts: &CallOptions) -> Result<ProviderResponse> {
        let endpoint =
            self.endpoints
                .get(&opts.provider)
                .ok_or_else(|| BarrageError::Configuration {
                    provider: opts.provider.clone(),
                    message: "no endpoint configured".to_string(),
                })?;

        let url = format!(
            "{}/v1/chat/completions",
            endpoint.base_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": opts.model,
            "messages": [ChatMessage { role: "user", content: prompt }],
        });

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .timeout(opts.timeout)
            .header("Authorization", format!("Bearer {}", endpoint.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|error| classify_transport_error(&opts.provider, &error))?;

        let status = response.status().as_u16();
        let payload = response
            .text()
            .await
            .map_err(|error| classify_transport_error(&opts.provider, &error))?;
        let latency = started.elapsed();

        match status {
            200..=299 => {
                let completion: ChatCompletion =
                    serde_json::from_str(&payload).map_err(|error| BarrageError::Provider {
                        provider: opts.provider.clone(),
                        message: format!("unparseable completion body: {error}"),
                    })?;
                let text = completion
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
                    .unwrap_or_default();

                tracing::debug!(
                    status,
                    latency = %humantime::format_duration(latency),
                    "provider call completed"
                );

                Ok(ProviderResponse {
                    text,
                    latency,
                    token_usage: completion.usage.map(|usage| TokenUsage {
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        total_tokens: usage.total_tokens,
                    }),
                    metadata: Some(serde_json::json!({
                        "id": completion.id,
                        "model": completion.model,
                    })),
                })
            }
            429 => Err(BarrageError::RateLimited {
                provider: opts.provider.clone(),
            }),
            408 | 500..=599 => Err(BarrageError::TransientProvider {
                provider: opts.provider.clone(),
                message: format!("upstream returned {status}"),
            }),
            _ => Err(BarrageError::Provider {
                provider: opts.provider.clone(),
                message: format!("upstream returned {status}: {}", truncate(&payload, 200)),
            }),
        }
    }
}

fn classify_transport_error(provider: &str, error: &reqwest::Error) -> BarrageError {
    let kind = if error.is_timeout() {
        "timed out"
    } else if error.is_connect() {
        "connection failed"
    } else {
        "transport error"
    };
    BarrageError::TransientProvider {
        provider: provider.to_string(),
        message: format!("{kind}: {error}"),
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

// ============================================================================
// Test/mock implementation
// ============================================================================

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Record of a call made against the mock client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub prompt: String,
    pub provider: String,
    pub model: String,
}

/// Scripted provider client for tests.
///
/// Scripted responses are keyed by `"provider/model"` and consumed in FIFO
/// order; when a queue runs dry the mock synthesizes a success unless the
/// provider was marked as always failing. Every call is recorded, and an
/// in-flight high-water mark is kept for concurrency assertions.
#[derive(Clone, Default)]
pub struct MockProviderClient {
    responses: Arc<Mutex<HashMap<String, Vec<Result<ProviderResponse>>>>>,
    failing: Arc<Mutex<HashMap<String, BarrageError>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted response for `provider`/`model`.
    pub fn add_response(&self, provider: &str, model: &str, response: Result<ProviderResponse>) {
        self.responses
            .lock()
            .entry(format!("{provider}/{model}"))
            .or_default()
            .push(response);
    }

    /// Make every unscripted call against `provider` fail with a transient
    /// error.
    pub fn always_fail(&self, provider: &str) {
        self.failing.lock().insert(
            provider.to_string(),
            BarrageError::TransientProvider {
                provider: provider.to_string(),
                message: "scripted failure".to_string(),
            },
        );
    }

    /// Make every unscripted call against `provider` report a rate limit.
    pub fn always_rate_limit(&self, provider: &str) {
        self.failing.lock().insert(
            provider.to_string(),
            BarrageError::RateLimited {
                provider: provider.to_string(),
            },
        );
    }

    /// Inject latency before each response.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls made against a single provider.
    pub fn call_count_for(&self, provider: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.provider == provider)
            .count()
    }

    /// Highest number of simultaneously in-flight calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// A canned successful response.
    pub fn ok_response(text: &str) -> ProviderResponse {
        ProviderResponse {
            text: text.to_string(),
            latency: Duration::from_millis(5),
            token_usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            }),
            metadata: None,
        }
    }

    fn clone_error(error: &BarrageError) -> BarrageError {
        match error {
            BarrageError::RateLimited { provider } => BarrageError::RateLimited {
                provider: provider.clone(),
            },
            BarrageError::TransientProvider { provider, message } => {
                BarrageError::TransientProvider {
                    provider: provider.clone(),
                    message: message.clone(),
                }
            }
            other => BarrageError::Other(anyhow::anyhow!("scripted failure: {other}")),
        }
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn call(&self, prompt: &str, opts: &CallOptions) -> Result<ProviderResponse> {
        self.calls.lock().push(MockCall {
            prompt: prompt.to_string(),
            provider: opts.provider.clone(),
            model: opts.model.clone(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = scopeguard::guard((), |_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let key = format!("{}/{}", opts.provider, opts.model);
        let scripted = {
            let mut responses = self.responses.lock();
            match responses.get_mut(&key) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };
        if let Some(response) = scripted {
            return response;
        }

        if let Some(error) = self.failing.lock().get(&opts.provider) {
            return Err(Self::clone_error(error));
        }

        Ok(Self::ok_response("mock response"))
    }
}

//! Provider adapters.
//!
//! Everything behind [`ModelInvoker`] is an opaque `invoke(model, prompt)`
//! call; the orchestration core treats every error the same way. Adapters:
//!
//! | Adapter               | Purpose                                         |
//! |-----------------------|-------------------------------------------------|
//! | `OpenAiCompatInvoker` | `POST {base_url}/chat/completions`              |
//! | `OfflineInvoker`      | deterministic text for dry runs and tests       |
//! | `ThrottledInvoker`    | holds a pool permit for the duration of a call  |
//! | `ModelRouter`         | maps a model name to its provider's invoker     |

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use wordsmith_coordination::{PoolRegistry, RateLimitedPool};

use crate::config::AgentsConfig;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("API key not configured for {0}")]
    MissingApiKey(String),

    #[error("no route for model {0}")]
    UnknownModel(String),

    #[error("simulated failure for {0}")]
    Offline(String),
}

impl ProviderError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Chat prompt sent to a text model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, model: &str, prompt: &Prompt) -> Result<String, ProviderError>;
}

/// Turns an image prompt into a reference (URL or id) for the rendered image.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

// ── HTTP ────────────────────────────────────────────────────────────────

/// Chat-completions client for any OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatInvoker {
    client: reqwest::Client,
    provider: String,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatInvoker {
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            provider: provider.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingApiKey(self.provider.clone()))?;

        let response = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ModelInvoker for OpenAiCompatInvoker {
    async fn invoke(&self, model: &str, prompt: &Prompt) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user}
            ],
            "temperature": 0.2
        });
        let json = self.post_json("chat/completions", &body).await?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Parse("missing choices[0].message.content".into()))
    }
}

/// `POST {base_url}/images/generations`, returning the first image URL.
#[derive(Debug, Clone)]
pub struct OpenAiImageGenerator {
    http: OpenAiCompatInvoker,
    model: String,
}

impl OpenAiImageGenerator {
    pub fn new(http: OpenAiCompatInvoker, model: impl Into<String>) -> Self {
        Self {
            http,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ImageGenerator for OpenAiImageGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "n": 1,
            "size": "1024x1024"
        });
        let json = self.http.post_json("images/generations", &body).await?;
        json["data"][0]["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Parse("missing data[0].url".into()))
    }
}

// ── Offline ─────────────────────────────────────────────────────────────

/// Deterministic stand-in for real providers.
///
/// Every model answers with the same text for the same prompt unless an
/// override or failure is configured for it, so dry runs agree by default.
#[derive(Debug, Clone, Default)]
pub struct OfflineInvoker {
    failing: HashSet<String>,
    overrides: HashMap<String, String>,
}

impl OfflineInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `model` fail every call.
    pub fn failing(mut self, model: impl Into<String>) -> Self {
        self.failing.insert(model.into());
        self
    }

    /// Make `model` always answer `text`.
    pub fn answering(mut self, model: impl Into<String>, text: impl Into<String>) -> Self {
        self.overrides.insert(model.into(), text.into());
        self
    }
}

#[async_trait]
impl ModelInvoker for OfflineInvoker {
    async fn invoke(&self, model: &str, prompt: &Prompt) -> Result<String, ProviderError> {
        if self.failing.contains(model) {
            return Err(ProviderError::Offline(model.to_string()));
        }
        if let Some(text) = self.overrides.get(model) {
            return Ok(text.clone());
        }
        Ok(format!("offline: {}", prompt.user))
    }
}

#[async_trait]
impl ImageGenerator for OfflineInvoker {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        if self.failing.contains("image") {
            return Err(ProviderError::Offline("image".into()));
        }
        let slug: String = prompt
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
            .take(40)
            .collect::<String>()
            .trim()
            .replace(' ', "-")
            .to_lowercase();
        Ok(format!("offline://images/{slug}"))
    }
}

// ── Throttling and routing ──────────────────────────────────────────────

/// Wraps an invoker so every call holds a permit from `pool`.
pub struct ThrottledInvoker {
    inner: Arc<dyn ModelInvoker>,
    pool: Arc<RateLimitedPool>,
}

impl ThrottledInvoker {
    pub fn new(inner: Arc<dyn ModelInvoker>, pool: Arc<RateLimitedPool>) -> Self {
        Self { inner, pool }
    }
}

#[async_trait]
impl ModelInvoker for ThrottledInvoker {
    async fn invoke(&self, model: &str, prompt: &Prompt) -> Result<String, ProviderError> {
        let permit = self.pool.acquire().await;
        debug!(pool = %self.pool.name(), model, "Permit granted");
        let result = self.inner.invoke(model, prompt).await;
        permit.release();
        result
    }
}

struct Route {
    provider: String,
    invoker: Arc<dyn ModelInvoker>,
}

/// Routes model names to the invoker of the provider that serves them.
#[derive(Default)]
pub struct ModelRouter {
    routes: HashMap<String, Route>,
}

impl ModelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(
        &mut self,
        model: impl Into<String>,
        provider: impl Into<String>,
        invoker: Arc<dyn ModelInvoker>,
    ) {
        self.routes.insert(
            model.into(),
            Route {
                provider: provider.into(),
                invoker,
            },
        );
    }

    pub fn provider_of(&self, model: &str) -> Option<&str> {
        self.routes.get(model).map(|r| r.provider.as_str())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Build routes for every configured model.
    ///
    /// Each provider gets one base invoker (HTTP, or `offline` when given),
    /// wrapped in a [`ThrottledInvoker`] when the registry has a pool for it.
    pub fn from_config(
        config: &AgentsConfig,
        pools: &PoolRegistry,
        offline: Option<Arc<dyn ModelInvoker>>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let mut per_provider: HashMap<String, Arc<dyn ModelInvoker>> = HashMap::new();
        let mut router = Self::new();

        for spec in config.models.all() {
            let invoker = match per_provider.get(&spec.provider) {
                Some(invoker) => Arc::clone(invoker),
                None => {
                    let endpoint = config.endpoint(&spec.provider).with_context(|| {
                        format!("No endpoint configured for provider {}", spec.provider)
                    })?;
                    let base: Arc<dyn ModelInvoker> = match &offline {
                        Some(offline) => Arc::clone(offline),
                        None => Arc::new(OpenAiCompatInvoker::new(
                            &endpoint.provider,
                            &endpoint.base_url,
                            endpoint.api_key(),
                            timeout,
                        )?),
                    };
                    let invoker: Arc<dyn ModelInvoker> = match pools.get(&spec.provider) {
                        Some(pool) => Arc::new(ThrottledInvoker::new(base, pool)),
                        None => base,
                    };
                    per_provider.insert(spec.provider.clone(), Arc::clone(&invoker));
                    invoker
                }
            };
            router.route(spec.name.clone(), spec.provider.clone(), invoker);
        }

        info!(
            models = router.len(),
            providers = per_provider.len(),
            offline = offline.is_some(),
            "Model routes ready"
        );
        Ok(router)
    }
}

#[async_trait]
impl ModelInvoker for ModelRouter {
    async fn invoke(&self, model: &str, prompt: &Prompt) -> Result<String, ProviderError> {
        let route = self
            .routes
            .get(model)
            .ok_or_else(|| ProviderError::UnknownModel(model.to_string()))?;
        route.invoker.invoke(model, prompt).await
    }
}

/// Check if an endpoint is reachable (`GET {base_url}/models`).
pub async fn check_endpoint(base_url: &str, api_key: Option<&str>) -> bool {
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let mut request = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5));
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    match request.send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use wordsmith_coordination::{EngineConfig, ModelDescriptor};

/// OpenAI-compatible HTTP endpoint for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Provider key; must match a quota in `engine.providers`.
    pub provider: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl ProviderEndpoint {
    fn new(provider: &str, base_url: &str, api_key_env: &str) -> Self {
        Self {
            provider: provider.into(),
            base_url: base_url.into(),
            api_key_env: api_key_env.into(),
        }
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

/// A model as named in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model id sent to the provider; also the consensus model name.
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub primary: bool,
}

impl ModelSpec {
    fn new(name: &str, provider: &str, primary: bool) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            primary,
        }
    }

    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            name: self.name.clone(),
            is_primary: self.primary,
        }
    }
}

/// Models consulted for each card stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationModels {
    pub definition: Vec<ModelSpec>,
    pub example: Vec<ModelSpec>,
    pub image_prompt: Vec<ModelSpec>,
    /// Provider whose pool throttles image generation.
    #[serde(default = "default_image_provider")]
    pub image_provider: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
}

fn default_image_provider() -> String {
    "openai".to_string()
}

fn default_image_model() -> String {
    "dall-e-3".to_string()
}

impl Default for OperationModels {
    fn default() -> Self {
        Self {
            // No primary: definitions go by majority.
            definition: vec![
                ModelSpec::new("gpt-4o-mini", "openai", false),
                ModelSpec::new("claude-3-5-haiku-latest", "anthropic", false),
                ModelSpec::new("gemini-2.0-flash", "google", false),
            ],
            example: vec![
                ModelSpec::new("gpt-4o-mini", "openai", true),
                ModelSpec::new("claude-3-5-haiku-latest", "anthropic", false),
            ],
            image_prompt: vec![
                ModelSpec::new("gpt-4o-mini", "openai", true),
                ModelSpec::new("gemini-2.0-flash", "google", false),
            ],
            image_provider: default_image_provider(),
            image_model: default_image_model(),
        }
    }
}

impl OperationModels {
    pub fn descriptors(specs: &[ModelSpec]) -> Vec<ModelDescriptor> {
        specs.iter().map(ModelSpec::descriptor).collect()
    }

    /// Every configured spec across all stages.
    pub fn all(&self) -> impl Iterator<Item = &ModelSpec> {
        self.definition
            .iter()
            .chain(&self.example)
            .chain(&self.image_prompt)
    }
}

/// Agents configuration: engine quotas plus endpoints and model lists.
///
/// Precedence matches [`EngineConfig`]: `WORDSMITH_*` environment variables
/// over the TOML file over defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<ProviderEndpoint>,
    #[serde(default)]
    pub models: OperationModels,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_endpoints() -> Vec<ProviderEndpoint> {
    vec![
        ProviderEndpoint::new("openai", "https://api.openai.com/v1", "OPENAI_API_KEY"),
        ProviderEndpoint::new("anthropic", "https://api.anthropic.com/v1", "ANTHROPIC_API_KEY"),
        ProviderEndpoint::new(
            "google",
            "https://generativelanguage.googleapis.com/v1beta/openai",
            "GEMINI_API_KEY",
        ),
    ]
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            endpoints: default_endpoints(),
            models: OperationModels::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl AgentsConfig {
    /// Load from `path` (or defaults), apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse agents config")
    }

    /// `WORDSMITH_<PROVIDER>_URL` replaces that provider's base URL.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.engine.apply_overrides(&lookup);
        for endpoint in &mut self.endpoints {
            let key = format!("WORDSMITH_{}_URL", endpoint.provider.to_uppercase());
            if let Some(url) = lookup(&key) {
                endpoint.base_url = url;
            }
        }
    }

    pub fn endpoint(&self, provider: &str) -> Option<&ProviderEndpoint> {
        self.endpoints.iter().find(|e| e.provider == provider)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        for (stage, specs) in [
            ("definition", &self.models.definition),
            ("example", &self.models.example),
            ("image_prompt", &self.models.image_prompt),
        ] {
            if specs.is_empty() {
                bail!("no models configured for {stage}");
            }
            if specs.iter().filter(|s| s.primary).count() > 1 {
                bail!("more than one primary model configured for {stage}");
            }
        }
        if self.endpoint(&self.models.image_provider).is_none() {
            bail!("unknown image provider {}", self.models.image_provider);
        }
        for spec in self.models.all() {
            if self.endpoint(&spec.provider).is_none() {
                bail!(
                    "model {} references unknown provider {}",
                    spec.name,
                    spec.provider
                );
            }
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        AgentsConfig::default().validate().unwrap();
    }

    #[test]
    fn definition_has_no_primary_by_default() {
        let models = OperationModels::default();
        assert!(models.definition.iter().all(|m| !m.primary));
        assert!(models.example[0].primary);
    }

    #[test]
    fn parses_partial_toml() {
        let raw = r#"
            request_timeout_secs = 15

            [engine.batch]
            max_concurrency = 6

            [models]
            definition = [
                { name = "local-a", provider = "openai" },
                { name = "local-b", provider = "openai" },
            ]
            example = [{ name = "local-a", provider = "openai", primary = true }]
            image_prompt = [{ name = "local-a", provider = "openai", primary = true }]
        "#;
        let cfg = AgentsConfig::from_toml_str(raw).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.engine.batch.max_concurrency, 6);
        assert_eq!(cfg.models.definition.len(), 2);
        assert_eq!(cfg.models.image_provider, "openai");
        assert_eq!(cfg.endpoints.len(), 3);
    }

    #[test]
    fn unknown_provider_rejected() {
        let mut cfg = AgentsConfig::default();
        cfg.models.example.push(ModelSpec::new("x", "nowhere", false));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn two_primaries_rejected() {
        let mut cfg = AgentsConfig::default();
        cfg.models.example[1].primary = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn url_override_applies() {
        let vars: HashMap<&str, &str> =
            [("WORDSMITH_OPENAI_URL", "http://localhost:8080/v1")].into_iter().collect();
        let mut cfg = AgentsConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(
            cfg.endpoint("openai").unwrap().base_url,
            "http://localhost:8080/v1"
        );
    }
}

//! Static routing configuration: provider profiles, the task type
//! capability map and per-domain overrides.
//!
//! Defaults are produced by exhaustive matches over [`TaskType`] and
//! [`Domain`], so adding a variant to either enum fails to compile until the
//! routing tables cover it. Configuration loaded from YAML is checked by
//! [`RoutingConfig::validate`] before the orchestrator accepts it.

use crate::{CircuitBreakerConfig, ConfigError, ProviderId};
use anyhow::Context;
use dispatch_core::{RetryPolicy, TaskType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Request/response dialect spoken by a provider's HTTP API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// `POST {base}/chat/completions`
    OpenAiChat,
    /// `POST {base}/messages`
    AnthropicMessages,
}

impl WireFormat {
    pub fn path(&self) -> &'static str {
        match self {
            WireFormat::OpenAiChat => "/chat/completions",
            WireFormat::AnthropicMessages => "/messages",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub wire_format: WireFormat,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    /// Per-call retry of transient failures before the orchestrator moves on
    pub retry: RetryPolicy,
}

impl ProviderEndpoint {
    fn new(base_url: &str, wire_format: WireFormat, api_key_env: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            wire_format,
            api_key_env: api_key_env.to_string(),
            request_timeout_secs: 60,
            retry: RetryPolicy {
                base_delay_ms: 500,
                max_delay_ms: 8_000,
                max_retries: 3,
                jitter: 0.2,
                retry_timeouts: true,
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.wire_format.path())
    }
}

/// Cost and latency hints for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub name: String,
    /// USD per 1K input tokens
    pub input_price_per_1k: f64,
    /// USD per 1K output tokens
    pub output_price_per_1k: f64,
    #[serde(default)]
    pub avg_latency_ms: Option<u64>,
}

impl ModelProfile {
    fn new(name: &str, input: f64, output: f64, latency_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            input_price_per_1k: input,
            output_price_per_1k: output,
            avg_latency_ms: Some(latency_ms),
        }
    }

    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_price_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_price_per_1k
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider: ProviderId,
    pub endpoint: ProviderEndpoint,
    pub models: Vec<ModelProfile>,
    /// Task types this provider is fit to serve
    pub capabilities: Vec<TaskType>,
}

impl ProviderProfile {
    pub fn model(&self, name: &str) -> Option<&ModelProfile> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn supports(&self, task_type: TaskType) -> bool {
        self.capabilities.contains(&task_type)
    }
}

/// A concrete (provider, model) routing target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: ProviderId,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: ProviderId, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Business domain a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    ThreeD,
    Marketing,
    MachineLearning,
    General,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Domain::ThreeD,
        Domain::Marketing,
        Domain::MachineLearning,
        Domain::General,
    ];

    /// Used when no pattern matches
    pub const DEFAULT: Domain = Domain::General;

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::ThreeD => "three_d",
            Domain::Marketing => "marketing",
            Domain::MachineLearning => "machine_learning",
            Domain::General => "general",
        }
    }

    /// Domain a task type belongs to when the caller gives no hint
    pub fn of(task_type: TaskType) -> Domain {
        match task_type {
            TaskType::Generate3d => Domain::ThreeD,
            TaskType::MarketingCampaign => Domain::Marketing,
            TaskType::MlTraining | TaskType::MlPrediction => Domain::MachineLearning,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub domain: Domain,
    pub primary: ModelRef,
    pub fallback: ModelRef,
    /// Regexes matched against request context, in order
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Ordered candidates for one task type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRoute {
    pub candidates: Vec<ModelRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub providers: Vec<ProviderProfile>,
    pub capabilities: BTreeMap<TaskType, TaskRoute>,
    /// Detection order is list order
    pub domains: Vec<DomainConfig>,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            providers: ProviderId::ALL.into_iter().map(default_provider).collect(),
            capabilities: TaskType::ALL
                .into_iter()
                .map(|t| (t, default_route(t)))
                .collect(),
            domains: Domain::ALL.into_iter().map(default_domain).collect(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

fn default_provider(provider: ProviderId) -> ProviderProfile {
    use TaskType::*;

    let (endpoint, models, capabilities) = match provider {
        ProviderId::Anthropic => (
            ProviderEndpoint::new(
                "https://api.anthropic.com/v1",
                WireFormat::AnthropicMessages,
                "ANTHROPIC_API_KEY",
            ),
            vec![
                ModelProfile::new("claude-sonnet-4-20250514", 0.003, 0.015, 2_500),
                ModelProfile::new("claude-3-5-haiku-20241022", 0.0008, 0.004, 1_200),
            ],
            vec![Generate3d, MarketingCampaign],
        ),
        ProviderId::OpenAi => (
            ProviderEndpoint::new("https://api.openai.com/v1", WireFormat::OpenAiChat, "OPENAI_API_KEY"),
            vec![
                ModelProfile::new("gpt-4o", 0.0025, 0.01, 2_000),
                ModelProfile::new("gpt-4o-mini", 0.00015, 0.0006, 1_000),
            ],
            TaskType::ALL.to_vec(),
        ),
        ProviderId::Google => (
            ProviderEndpoint::new(
                "https://generativelanguage.googleapis.com/v1beta/openai",
                WireFormat::OpenAiChat,
                "GOOGLE_API_KEY",
            ),
            vec![ModelProfile::new("gemini-2.0-flash", 0.000075, 0.0003, 800)],
            vec![Generate3d, MarketingCampaign],
        ),
        ProviderId::Mistral => (
            ProviderEndpoint::new("https://api.mistral.ai/v1", WireFormat::OpenAiChat, "MISTRAL_API_KEY"),
            vec![ModelProfile::new("mistral-small-latest", 0.001, 0.003, 1_000)],
            vec![MarketingCampaign],
        ),
        ProviderId::Groq => (
            ProviderEndpoint::new("https://api.groq.com/openai/v1", WireFormat::OpenAiChat, "GROQ_API_KEY"),
            vec![ModelProfile::new("llama-3.3-70b-versatile", 0.00059, 0.00079, 400)],
            vec![MlTraining, MlPrediction],
        ),
        ProviderId::Cohere => (
            ProviderEndpoint::new(
                "https://api.cohere.ai/compatibility/v1",
                WireFormat::OpenAiChat,
                "COHERE_API_KEY",
            ),
            vec![ModelProfile::new("command-r-08-2024", 0.0005, 0.0015, 1_500)],
            vec![MarketingCampaign],
        ),
        ProviderId::DeepSeek => (
            ProviderEndpoint::new("https://api.deepseek.com/v1", WireFormat::OpenAiChat, "DEEPSEEK_API_KEY"),
            vec![ModelProfile::new("deepseek-chat", 0.00014, 0.00028, 2_000)],
            vec![MlTraining, MlPrediction],
        ),
    };

    ProviderProfile {
        provider,
        endpoint,
        models,
        capabilities,
    }
}

fn default_route(task_type: TaskType) -> TaskRoute {
    let candidates = match task_type {
        TaskType::Generate3d => vec![
            ModelRef::new(ProviderId::Anthropic, "claude-sonnet-4-20250514"),
            ModelRef::new(ProviderId::OpenAi, "gpt-4o"),
            ModelRef::new(ProviderId::Google, "gemini-2.0-flash"),
        ],
        TaskType::MarketingCampaign => vec![
            ModelRef::new(ProviderId::Anthropic, "claude-sonnet-4-20250514"),
            ModelRef::new(ProviderId::OpenAi, "gpt-4o-mini"),
            ModelRef::new(ProviderId::Mistral, "mistral-small-latest"),
        ],
        TaskType::MlTraining => vec![
            ModelRef::new(ProviderId::DeepSeek, "deepseek-chat"),
            ModelRef::new(ProviderId::OpenAi, "gpt-4o-mini"),
            ModelRef::new(ProviderId::Groq, "llama-3.3-70b-versatile"),
        ],
        TaskType::MlPrediction => vec![
            ModelRef::new(ProviderId::Groq, "llama-3.3-70b-versatile"),
            ModelRef::new(ProviderId::DeepSeek, "deepseek-chat"),
            ModelRef::new(ProviderId::OpenAi, "gpt-4o-mini"),
        ],
    };
    TaskRoute { candidates }
}

fn default_domain(domain: Domain) -> DomainConfig {
    let (primary, fallback, patterns): (ModelRef, ModelRef, &[&str]) = match domain {
        Domain::ThreeD => (
            ModelRef::new(ProviderId::Anthropic, "claude-sonnet-4-20250514"),
            ModelRef::new(ProviderId::OpenAi, "gpt-4o"),
            &[
                r"(?i)\b3d\b",
                r"(?i)\b(mesh|texture|render|garment|glb|gltf|usdz)\b",
            ],
        ),
        Domain::Marketing => (
            ModelRef::new(ProviderId::Anthropic, "claude-sonnet-4-20250514"),
            ModelRef::new(ProviderId::OpenAi, "gpt-4o-mini"),
            &[r"(?i)\b(marketing|campaign|newsletter|seo|social media|audience|email)\b"],
        ),
        Domain::MachineLearning => (
            ModelRef::new(ProviderId::DeepSeek, "deepseek-chat"),
            ModelRef::new(ProviderId::OpenAi, "gpt-4o-mini"),
            &[r"(?i)\b(training|prediction|dataset|epochs?|inference|classifier)\b"],
        ),
        Domain::General => (
            ModelRef::new(ProviderId::OpenAi, "gpt-4o-mini"),
            ModelRef::new(ProviderId::Anthropic, "claude-sonnet-4-20250514"),
            &[],
        ),
    };

    DomainConfig {
        domain,
        primary,
        fallback,
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
    }
}

impl RoutingConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read routing config {}", path.display()))?;
        let config: RoutingConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse routing config {}", path.display()))?;
        Ok(config)
    }

    pub fn provider(&self, provider: ProviderId) -> Option<&ProviderProfile> {
        self.providers.iter().find(|p| p.provider == provider)
    }

    pub fn model_profile(&self, target: &ModelRef) -> Option<&ModelProfile> {
        self.provider(target.provider)?.model(&target.model)
    }

    pub fn domain(&self, domain: Domain) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.domain == domain)
    }

    pub fn route(&self, task_type: TaskType) -> Option<&TaskRoute> {
        self.capabilities.get(&task_type)
    }

    /// Cross-check every reference between providers, task routes and
    /// domains. All problems are reported at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        let mut seen = HashSet::new();
        for profile in &self.providers {
            if !seen.insert(profile.provider) {
                issues.push(format!("provider {} is listed more than once", profile.provider));
            }
            if profile.models.is_empty() {
                issues.push(format!("provider {} lists no models", profile.provider));
            }
        }

        for task_type in TaskType::ALL {
            let Some(route) = self.route(task_type) else {
                issues.push(format!("task type {} has no route", task_type));
                continue;
            };
            if route.candidates.is_empty() {
                issues.push(format!("task type {} has no candidates", task_type));
            }
            for target in &route.candidates {
                self.check_target(target, &format!("route for {}", task_type), &mut issues);
                if let Some(profile) = self.provider(target.provider) {
                    if !profile.supports(task_type) {
                        issues.push(format!(
                            "route for {} uses {} which does not list that capability",
                            task_type, target.provider
                        ));
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        for config in &self.domains {
            if !seen.insert(config.domain) {
                issues.push(format!("domain {} is configured more than once", config.domain));
            }
            let context = format!("domain {}", config.domain);
            for target in [&config.primary, &config.fallback] {
                self.check_target(target, &context, &mut issues);
                // The domain's own task types must be servable by its targets
                if let Some(profile) = self.provider(target.provider) {
                    for task_type in TaskType::ALL.into_iter().filter(|t| Domain::of(*t) == config.domain) {
                        if !profile.supports(task_type) {
                            issues.push(format!(
                                "{} routes to {} which cannot serve {}",
                                context, target.provider, task_type
                            ));
                        }
                    }
                }
            }
            for pattern in &config.patterns {
                if let Err(e) = Regex::new(pattern) {
                    issues.push(format!("{} pattern {:?} does not compile: {}", context, pattern, e));
                }
            }
        }
        for domain in Domain::ALL {
            if self.domain(domain).is_none() {
                issues.push(format!("domain {} has no configuration", domain));
            }
        }

        if self.circuit_breaker.buckets == 0 || self.circuit_breaker.window_ms == 0 {
            issues.push("circuit breaker window must be non-empty".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { issues })
        }
    }

    fn check_target(&self, target: &ModelRef, context: &str, issues: &mut Vec<String>) {
        match self.provider(target.provider) {
            None => issues.push(format!("{} references unknown provider {}", context, target.provider)),
            Some(profile) if profile.model(&target.model).is_none() => issues.push(format!(
                "{} references model {} not offered by {}",
                context, target.model, target.provider
            )),
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        RoutingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_every_task_type_has_candidates() {
        let config = RoutingConfig::default();
        for task_type in TaskType::ALL {
            assert!(!config.route(task_type).unwrap().candidates.is_empty());
        }
    }

    #[test]
    fn test_unknown_model_reported() {
        let mut config = RoutingConfig::default();
        config
            .capabilities
            .get_mut(&TaskType::MlTraining)
            .unwrap()
            .candidates
            .push(ModelRef::new(ProviderId::Groq, "no-such-model"));

        let err = config.validate().unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert!(err.issues[0].contains("no-such-model"));
    }

    #[test]
    fn test_missing_provider_and_domain_reported_together() {
        let mut config = RoutingConfig::default();
        config.providers.retain(|p| p.provider != ProviderId::Mistral);
        config.domains.retain(|d| d.domain != Domain::General);

        let err = config.validate().unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("unknown provider mistral")));
        assert!(err.issues.iter().any(|i| i.contains("domain general has no configuration")));
    }

    #[test]
    fn test_capability_mismatch_reported() {
        let mut config = RoutingConfig::default();
        config
            .capabilities
            .get_mut(&TaskType::Generate3d)
            .unwrap()
            .candidates
            .push(ModelRef::new(ProviderId::Groq, "llama-3.3-70b-versatile"));

        let err = config.validate().unwrap_err();
        assert!(err.issues[0].contains("does not list that capability"));
    }

    #[test]
    fn test_bad_pattern_reported() {
        let mut config = RoutingConfig::default();
        config.domains[0].patterns.push("(unclosed".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip_keeps_config_valid() {
        let yaml = serde_yaml::to_string(&RoutingConfig::default()).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("routing.yaml");
        std::fs::write(&path, yaml).unwrap();

        let loaded = RoutingConfig::from_file(&path).unwrap();
        assert_eq!(loaded.capabilities, RoutingConfig::default().capabilities);
        assert_eq!(loaded.domains, RoutingConfig::default().domains);
        loaded.validate().unwrap();
    }

    #[test]
    fn test_cost_estimate() {
        let config = RoutingConfig::default();
        let profile = config
            .model_profile(&ModelRef::new(ProviderId::Anthropic, "claude-sonnet-4-20250514"))
            .unwrap();
        let cost = profile.estimate_cost(1000, 2000);
        assert!((cost - (0.003 + 0.030)).abs() < 1e-9);
    }
}

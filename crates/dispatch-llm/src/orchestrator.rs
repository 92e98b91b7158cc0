use crate::{
    ChunkStream, CircuitBreaker, CompletionOptions, DomainHint, DomainRouter, FailedAttempt,
    HttpProviderClient, Message, ModelRef, OrchestrationError, ProviderClient, ProviderId,
    ProviderStatus, Response, RoutingConfig, TokenUsage,
};
use dispatch_core::TaskType;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Routes completions across providers with ordered failover.
///
/// Candidate order comes from the task type's route; a domain hint puts that
/// domain's primary and fallback in front. Providers with an open circuit are
/// skipped, and every failure advances to the next candidate.
pub struct LlmOrchestrator {
    config: RoutingConfig,
    router: DomainRouter,
    clients: HashMap<ProviderId, Arc<dyn ProviderClient>>,
    breaker: CircuitBreaker,
}

impl LlmOrchestrator {
    /// Validate `config` and take the given clients
    pub fn new(
        config: RoutingConfig,
        clients: HashMap<ProviderId, Arc<dyn ProviderClient>>,
    ) -> Result<Self, OrchestrationError> {
        config.validate()?;
        let router = DomainRouter::new(&config)?;
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());

        Ok(Self {
            config,
            router,
            clients,
            breaker,
        })
    }

    /// Build HTTP clients for every configured provider
    pub fn from_config(config: RoutingConfig) -> Result<Self, OrchestrationError> {
        let clients = config
            .providers
            .iter()
            .map(|profile| {
                let client: Arc<dyn ProviderClient> =
                    Arc::new(HttpProviderClient::new(profile.provider, profile.endpoint.clone()));
                (profile.provider, client)
            })
            .collect();
        Self::new(config, clients)
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn router(&self) -> &DomainRouter {
        &self.router
    }

    /// Ordered, de-duplicated candidates for a request
    pub fn plan(&self, task_type: TaskType, hint: Option<&DomainHint>) -> Vec<ModelRef> {
        let mut plan: Vec<ModelRef> = Vec::new();

        if let Some(hint) = hint {
            let domain = self.router.resolve(hint);
            let domain_config = self.router.get_domain_config(domain);
            debug!(task_type = %task_type, domain = %domain, "Domain hint applied");
            plan.push(domain_config.primary.clone());
            plan.push(domain_config.fallback.clone());
        }
        if let Some(route) = self.config.route(task_type) {
            plan.extend(route.candidates.iter().cloned());
        }

        let mut seen = std::collections::HashSet::new();
        plan.retain(|target| seen.insert(target.clone()));
        plan
    }

    pub fn estimate_cost(&self, target: &ModelRef, usage: TokenUsage) -> Option<f64> {
        self.config
            .model_profile(target)
            .map(|profile| profile.estimate_cost(usage.input_tokens, usage.output_tokens))
    }

    pub async fn complete(
        &self,
        messages: &[Message],
        task_type: TaskType,
        hint: Option<&DomainHint>,
        options: &CompletionOptions,
    ) -> Result<Response, OrchestrationError> {
        let plan = self.plan(task_type, hint);
        if plan.is_empty() {
            return Err(OrchestrationError::NoCandidates(task_type));
        }

        let mut attempts = Vec::new();
        for target in plan {
            let Some(client) = self.usable_client(&target, &mut attempts) else {
                continue;
            };

            match client.complete(messages, &target.model, options).await {
                Ok(mut response) => {
                    self.breaker.record_success(target.provider);
                    response.estimated_cost_usd = self.estimate_cost(&target, response.token_usage);
                    info!(
                        task_type = %task_type,
                        target = %target,
                        fallbacks = attempts.len(),
                        latency_ms = response.latency.as_millis() as u64,
                        "Completion routed"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    if e.is_transient() {
                        self.breaker.record_failure(target.provider);
                    } else {
                        self.breaker.release_trial(target.provider);
                    }
                    warn!(task_type = %task_type, target = %target, error = %e, "Candidate failed, trying next");
                    attempts.push(FailedAttempt::Failed {
                        model: target.model.clone(),
                        error: e,
                    });
                }
            }
        }

        Err(OrchestrationError::Exhausted { task_type, attempts })
    }

    /// Open a stream on the first candidate that accepts the request.
    /// Failover happens only before the first chunk.
    pub async fn stream(
        &self,
        messages: &[Message],
        task_type: TaskType,
        hint: Option<&DomainHint>,
        options: &CompletionOptions,
    ) -> Result<(ModelRef, ChunkStream), OrchestrationError> {
        let plan = self.plan(task_type, hint);
        if plan.is_empty() {
            return Err(OrchestrationError::NoCandidates(task_type));
        }

        let mut attempts = Vec::new();
        for target in plan {
            let Some(client) = self.usable_client(&target, &mut attempts) else {
                continue;
            };

            match client.stream(messages, &target.model, options).await {
                Ok(stream) => {
                    self.breaker.record_success(target.provider);
                    info!(task_type = %task_type, target = %target, "Stream opened");
                    return Ok((target, stream));
                }
                Err(e) => {
                    if e.is_transient() {
                        self.breaker.record_failure(target.provider);
                    } else {
                        self.breaker.release_trial(target.provider);
                    }
                    warn!(task_type = %task_type, target = %target, error = %e, "Stream open failed, trying next");
                    attempts.push(FailedAttempt::Failed {
                        model: target.model.clone(),
                        error: e,
                    });
                }
            }
        }

        Err(OrchestrationError::Exhausted { task_type, attempts })
    }

    fn usable_client(
        &self,
        target: &ModelRef,
        attempts: &mut Vec<FailedAttempt>,
    ) -> Option<&Arc<dyn ProviderClient>> {
        let Some(client) = self.clients.get(&target.provider) else {
            attempts.push(FailedAttempt::Unconfigured {
                provider: target.provider,
                model: target.model.clone(),
            });
            return None;
        };
        // Checked last: in half-open state this takes the single trial slot
        if !self.breaker.allows(target.provider) {
            debug!(target = %target, "Circuit open, skipping");
            attempts.push(FailedAttempt::Skipped {
                provider: target.provider,
                model: target.model.clone(),
            });
            return None;
        }
        Some(client)
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.breaker.status()
    }
}

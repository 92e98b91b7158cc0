use crate::{HandlerError, TaskContext, TaskHandler};
use async_trait::async_trait;
use dispatch_core::{
    CampaignType, MarketingCampaignInput, MlPredictionInput, MlTrainingInput, Task, TaskType,
    ThreeDGenerationInput,
};
use dispatch_llm::{CompletionOptions, Domain, DomainHint, LlmOrchestrator, Message};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Generic handler that turns a task payload into a prompt and routes it
/// through the orchestrator for the task's type.
///
/// A payload `domain` field (one of the domain names) forces the domain;
/// otherwise a `tag` field is matched against the domain patterns.
pub struct LlmTaskHandler {
    orchestrator: Arc<LlmOrchestrator>,
    options: CompletionOptions,
}

impl LlmTaskHandler {
    pub fn new(orchestrator: Arc<LlmOrchestrator>) -> Self {
        Self {
            orchestrator,
            options: CompletionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }
}

fn parse<T: DeserializeOwned>(task: &Task) -> Result<T, HandlerError> {
    serde_json::from_value(task.payload.clone())
        .map_err(|e| HandlerError::validation(format!("invalid {} payload: {}", task.task_type, e)))
}

fn domain_hint(payload: &Value) -> Option<DomainHint> {
    if let Some(domain) = payload.get("domain") {
        if let Ok(domain) = serde_json::from_value::<Domain>(domain.clone()) {
            return Some(DomainHint::Domain(domain));
        }
    }
    payload
        .get("tag")
        .and_then(Value::as_str)
        .map(|tag| DomainHint::Context(tag.to_string()))
}

/// System and user prompts for the task
fn render_prompt(task: &Task) -> Result<Vec<Message>, HandlerError> {
    let messages = match task.task_type {
        TaskType::Generate3d => {
            let input: ThreeDGenerationInput = parse(task)?;
            let mut user = format!(
                "Design a {} {} for the {} collection: {}",
                input.style, input.garment_type, input.collection, input.prompt
            );
            if let Some(name) = &input.product_name {
                user.push_str(&format!("\nProduct name: {}", name));
            }
            if let Some(url) = &input.image_url {
                user.push_str(&format!("\nReference image: {}", url));
            }
            vec![
                Message::system(
                    "You write precise 3D generation briefs: geometry, materials, colors and lighting.",
                ),
                Message::user(user),
            ]
        }
        TaskType::MarketingCampaign => {
            let input: MarketingCampaignInput = parse(task)?;
            let channel = match input.campaign_type {
                CampaignType::Email => "email",
                CampaignType::Social => "social media",
                CampaignType::Seo => "SEO",
            };
            vec![
                Message::system("You are a marketing copywriter. Reply with ready-to-send copy."),
                Message::user(format!(
                    "Write {} copy for campaign {} reaching {} recipients. Brief: {}",
                    channel,
                    input.campaign_id,
                    input.recipients.len(),
                    Value::Object(input.content)
                )),
            ]
        }
        TaskType::MlTraining => {
            let input: MlTrainingInput = parse(task)?;
            vec![
                Message::system("You plan machine learning training runs. Reply with a JSON training plan."),
                Message::user(format!(
                    "Model {} on {} for {} epochs with hyperparameters {}",
                    input.model_id,
                    input.training_data_path,
                    input.epochs,
                    Value::Object(input.hyperparameters)
                )),
            ]
        }
        TaskType::MlPrediction => {
            let input: MlPredictionInput = parse(task)?;
            vec![
                Message::system("You act as the named model. Reply with JSON predictions only."),
                Message::user(format!("Model {} input: {}", input.model_id, input.input_data)),
            ]
        }
    };
    Ok(messages)
}

#[async_trait]
impl TaskHandler for LlmTaskHandler {
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<Value, HandlerError> {
        ctx.checkpoint()?;
        let messages = render_prompt(task)?;
        let hint = domain_hint(&task.payload);
        debug!(task_id = %task.id, hint = ?hint, "Rendered prompt");

        ctx.checkpoint()?;
        let response = self
            .orchestrator
            .complete(&messages, task.task_type, hint.as_ref(), &self.options)
            .await?;

        ctx.checkpoint()?;
        Ok(json!({
            "content": response.content,
            "provider": response.provider,
            "model": response.model,
            "token_usage": response.token_usage,
            "tool_calls": response.tool_calls,
            "latency_ms": response.latency.as_millis() as u64,
            "estimated_cost_usd": response.estimated_cost_usd,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::Priority;

    fn task(task_type: TaskType, payload: Value) -> Task {
        Task::new(task_type, payload, Priority::normal()).unwrap()
    }

    #[test]
    fn test_render_3d_prompt_uses_defaults() {
        let messages = render_prompt(&task(TaskType::Generate3d, json!({ "prompt": "rose gold hoodie" }))).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("realistic tee for the SIGNATURE collection"));
        assert!(messages[1].content.contains("rose gold hoodie"));
    }

    #[test]
    fn test_render_campaign_prompt() {
        let t = task(
            TaskType::MarketingCampaign,
            json!({
                "campaign_id": "spring-24",
                "campaign_type": "email",
                "recipients": ["a@example.com", "b@example.com"],
                "content": { "subject": "Spring drop" }
            }),
        );
        let messages = render_prompt(&t).unwrap();
        assert!(messages[1].content.contains("email copy for campaign spring-24 reaching 2 recipients"));
    }

    #[test]
    fn test_domain_hint_from_payload() {
        assert_eq!(
            domain_hint(&json!({ "domain": "marketing" })),
            Some(DomainHint::Domain(Domain::Marketing))
        );
        assert_eq!(
            domain_hint(&json!({ "tag": "assets/hoodie.glb" })),
            Some(DomainHint::Context("assets/hoodie.glb".to_string()))
        );
        assert_eq!(domain_hint(&json!({ "domain": "astrology" })), None);
        assert_eq!(domain_hint(&json!({})), None);
    }
}

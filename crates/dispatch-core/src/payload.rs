//! Per-type payload schemas checked at enqueue time.
//!
//! Unknown fields are tolerated so producers can attach routing hints
//! (`domain`, `tag`) next to the typed fields.

use crate::{TaskType, ValidationError, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreeDGenerationInput {
    /// Text description of the model to generate
    pub prompt: String,
    /// Optional reference image for image-to-3D
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_garment_type")]
    pub garment_type: String,
}

fn default_style() -> String {
    "realistic".to_string()
}

fn default_collection() -> String {
    "SIGNATURE".to_string()
}

fn default_garment_type() -> String {
    "tee".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignType {
    Email,
    Social,
    Seo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketingCampaignInput {
    pub campaign_id: String,
    pub campaign_type: CampaignType,
    /// Recipient emails or user ids
    pub recipients: Vec<String>,
    /// Subject, body, and other channel-specific content
    pub content: Map<String, Value>,
    #[serde(default)]
    pub schedule_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlTrainingInput {
    pub model_id: String,
    pub training_data_path: String,
    #[serde(default)]
    pub hyperparameters: Map<String, Value>,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_epochs() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlPredictionInput {
    pub model_id: String,
    /// A single record or a batch of records
    pub input_data: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn parse<T: DeserializeOwned>(task_type: TaskType, payload: &Value) -> Result<T, ValidationError> {
    if !payload.is_object() {
        return Err(ValidationError::payload(task_type, "payload must be a JSON object"));
    }

    let size = payload.to_string().len();
    if size > MAX_PAYLOAD_SIZE {
        return Err(ValidationError::PayloadTooLarge {
            max: MAX_PAYLOAD_SIZE,
            actual: size,
        });
    }

    T::deserialize(payload).map_err(|e| ValidationError::payload(task_type, e.to_string()))
}

fn require_non_empty(task_type: TaskType, field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::payload(task_type, format!("`{}` must not be empty", field)));
    }
    Ok(())
}

pub(crate) fn validate_generate_3d(payload: &Value) -> Result<(), ValidationError> {
    let input: ThreeDGenerationInput = parse(TaskType::Generate3d, payload)?;
    require_non_empty(TaskType::Generate3d, "prompt", &input.prompt)
}

pub(crate) fn validate_marketing_campaign(payload: &Value) -> Result<(), ValidationError> {
    let task_type = TaskType::MarketingCampaign;
    let input: MarketingCampaignInput = parse(task_type, payload)?;
    require_non_empty(task_type, "campaign_id", &input.campaign_id)?;
    if input.recipients.is_empty() {
        return Err(ValidationError::payload(task_type, "`recipients` must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_ml_training(payload: &Value) -> Result<(), ValidationError> {
    let task_type = TaskType::MlTraining;
    let input: MlTrainingInput = parse(task_type, payload)?;
    require_non_empty(task_type, "model_id", &input.model_id)?;
    require_non_empty(task_type, "training_data_path", &input.training_data_path)?;
    if input.epochs == 0 {
        return Err(ValidationError::payload(task_type, "`epochs` must be at least 1"));
    }
    Ok(())
}

pub(crate) fn validate_ml_prediction(payload: &Value) -> Result<(), ValidationError> {
    let task_type = TaskType::MlPrediction;
    let input: MlPredictionInput = parse(task_type, payload)?;
    require_non_empty(task_type, "model_id", &input.model_id)?;
    match &input.input_data {
        Value::Object(_) => Ok(()),
        Value::Array(items) if items.iter().all(Value::is_object) => Ok(()),
        _ => Err(ValidationError::payload(
            task_type,
            "`input_data` must be an object or an array of objects",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_3d_payload_is_accepted() {
        let payload = json!({ "prompt": "rose gold hoodie" });
        assert!(TaskType::Generate3d.validate_payload(&payload).is_ok());

        let input: ThreeDGenerationInput = serde_json::from_value(payload).unwrap();
        assert_eq!(input.style, "realistic");
        assert_eq!(input.collection, "SIGNATURE");
    }

    #[test]
    fn test_blank_prompt_is_rejected() {
        let err = TaskType::Generate3d
            .validate_payload(&json!({ "prompt": "   " }))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPayload { task_type: TaskType::Generate3d, .. }));
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        assert!(TaskType::MlPrediction.validate_payload(&json!([1, 2, 3])).is_err());
        assert!(TaskType::Generate3d.validate_payload(&json!("prompt")).is_err());
    }

    #[test]
    fn test_campaign_requires_known_type_and_recipients() {
        let valid = json!({
            "campaign_id": "spring-drop",
            "campaign_type": "email",
            "recipients": ["a@example.com"],
            "content": { "subject": "New arrivals" },
        });
        assert!(TaskType::MarketingCampaign.validate_payload(&valid).is_ok());

        let mut unknown_channel = valid.clone();
        unknown_channel["campaign_type"] = json!("fax");
        assert!(TaskType::MarketingCampaign.validate_payload(&unknown_channel).is_err());

        let mut no_recipients = valid;
        no_recipients["recipients"] = json!([]);
        assert!(TaskType::MarketingCampaign.validate_payload(&no_recipients).is_err());
    }

    #[test]
    fn test_training_rejects_zero_epochs() {
        let payload = json!({
            "model_id": "trend_predictor",
            "training_data_path": "s3://datasets/trends.parquet",
            "epochs": 0,
        });
        assert!(TaskType::MlTraining.validate_payload(&payload).is_err());
    }

    #[test]
    fn test_prediction_accepts_batches_of_records() {
        let payload = json!({
            "model_id": "sentiment_analyzer",
            "input_data": [{ "text": "love it" }, { "text": "meh" }],
        });
        assert!(TaskType::MlPrediction.validate_payload(&payload).is_ok());

        let scalar = json!({ "model_id": "sentiment_analyzer", "input_data": 42 });
        assert!(TaskType::MlPrediction.validate_payload(&scalar).is_err());
    }

    #[test]
    fn test_routing_hints_are_tolerated() {
        let payload = json!({ "prompt": "bomber jacket", "domain": "three_d", "tag": "assets/glb" });
        assert!(TaskType::Generate3d.validate_payload(&payload).is_ok());
    }
}

use crate::payload;
use crate::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Closed set of task types the dispatcher knows how to route and execute.
///
/// Every per-type table in the workspace (payload schemas, timeout budgets,
/// capability map defaults, handler registration checks) matches on this enum
/// exhaustively, so a new variant has to be wired through all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskType {
    /// 3D asset generation from a text prompt or reference image
    #[serde(rename = "generate_3d")]
    Generate3d,
    /// Email / social / SEO campaign dispatch
    #[serde(rename = "marketing_campaign")]
    MarketingCampaign,
    /// ML model training run
    #[serde(rename = "ml_training")]
    MlTraining,
    /// ML model inference
    #[serde(rename = "ml_prediction")]
    MlPrediction,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Generate3d,
        TaskType::MarketingCampaign,
        TaskType::MlTraining,
        TaskType::MlPrediction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Generate3d => "generate_3d",
            TaskType::MarketingCampaign => "marketing_campaign",
            TaskType::MlTraining => "ml_training",
            TaskType::MlPrediction => "ml_prediction",
        }
    }

    /// Stable one-byte code used as the prefix of the per-type priority index
    pub fn code(&self) -> u8 {
        match self {
            TaskType::Generate3d => 1,
            TaskType::MarketingCampaign => 2,
            TaskType::MlTraining => 3,
            TaskType::MlPrediction => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TaskType::Generate3d),
            2 => Some(TaskType::MarketingCampaign),
            3 => Some(TaskType::MlTraining),
            4 => Some(TaskType::MlPrediction),
            _ => None,
        }
    }

    /// Default execution budget. Generation and training get far more room
    /// than prediction.
    pub fn default_timeout(&self) -> Duration {
        match self {
            TaskType::Generate3d => Duration::from_secs(600),
            TaskType::MarketingCampaign => Duration::from_secs(300),
            TaskType::MlTraining => Duration::from_secs(1800),
            TaskType::MlPrediction => Duration::from_secs(60),
        }
    }

    /// Validate a payload against the schema bound to this task type
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<(), ValidationError> {
        match self {
            TaskType::Generate3d => payload::validate_generate_3d(payload),
            TaskType::MarketingCampaign => payload::validate_marketing_campaign(payload),
            TaskType::MlTraining => payload::validate_ml_training(payload),
            TaskType::MlPrediction => payload::validate_ml_prediction(payload),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownTaskType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip_is_stable() {
        for task_type in TaskType::ALL {
            assert_eq!(task_type.as_str().parse::<TaskType>().unwrap(), task_type);
            assert_eq!(TaskType::from_code(task_type.code()), Some(task_type));
        }
        assert!("render_video".parse::<TaskType>().is_err());
        assert_eq!(TaskType::from_code(0), None);
    }

    #[test]
    fn test_serde_uses_snake_case_names() {
        let json = serde_json::to_string(&TaskType::Generate3d).unwrap();
        assert_eq!(json, "\"generate_3d\"");
        let parsed: TaskType = serde_json::from_str("\"ml_prediction\"").unwrap();
        assert_eq!(parsed, TaskType::MlPrediction);
    }

    #[test]
    fn test_generation_budget_exceeds_prediction_budget() {
        assert!(TaskType::Generate3d.default_timeout() > TaskType::MlPrediction.default_timeout());
        assert!(TaskType::MlTraining.default_timeout() > TaskType::MlPrediction.default_timeout());
    }
}

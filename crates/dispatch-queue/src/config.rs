use dispatch_core::{RetryPolicy, DEAD_LETTER_TTL_SECS, DEFAULT_MAX_RETRIES};
use dispatch_persistence::TaskStoreConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub data_dir: PathBuf,
    /// Retry budget for tasks enqueued without an explicit one
    pub default_max_retries: u32,
    /// Task-level backoff between attempts
    pub retry: RetryPolicy,
    pub result_ttl_secs: i64,
    pub dead_letter_ttl_secs: i64,
    /// How long a claim stays valid without a report from its worker
    pub lease_secs: i64,
    /// Upper bound on a blocked dequeue or get_result between store checks
    pub poll_interval_ms: u64,
    pub maintenance_interval_secs: u64,
    /// Index entries examined per claim attempt
    pub claim_scan_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            data_dir: PathBuf::from("./data"),
            default_max_retries: DEFAULT_MAX_RETRIES,
            retry: RetryPolicy::default(),
            result_ttl_secs: 24 * 60 * 60,
            dead_letter_ttl_secs: DEAD_LETTER_TTL_SECS,
            lease_secs: 1800 + 300,
            poll_interval_ms: 500,
            maintenance_interval_secs: 10,
            claim_scan_limit: 32,
        }
    }
}

impl QueueConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: QueueConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn to_task_store_config(&self) -> TaskStoreConfig {
        TaskStoreConfig {
            data_dir: self.data_dir.clone(),
            result_ttl_secs: self.result_ttl_secs,
            dead_letter_ttl_secs: self.dead_letter_ttl_secs,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
data_dir: /var/lib/dispatch
lease_secs: 60
retry:
  base_delay_ms: 250
"#;
        let config: QueueConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/dispatch"));
        assert_eq!(config.lease_secs, 60);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, RetryPolicy::default().max_delay_ms);
        assert_eq!(config.default_max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_default_lease_outlives_longest_budget() {
        let config = QueueConfig::default();
        let longest = dispatch_core::TaskType::ALL
            .iter()
            .map(|t| t.default_timeout())
            .max()
            .unwrap();
        assert!(config.lease().to_std().unwrap() > longest);
    }
}

use dispatch_core::{RetryPolicy, TaskType};
use dispatch_queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: Option<String>,
    pub concurrency: usize,
    /// Types this process claims; empty means all
    pub task_types: Vec<TaskType>,
    /// Upper bound of one `dequeue` wait
    pub poll_timeout_ms: u64,
    pub graceful_shutdown_timeout_secs: u64,
    /// Per-type handler budget overrides, in seconds
    pub timeouts: BTreeMap<TaskType, u64>,
    /// Backoff while the queue backend is unreachable
    pub backend_retry: RetryPolicy,
    /// Run lease reclaim and TTL purge in this process
    pub run_maintenance: bool,
    pub log_level: String,
    pub log_json: bool,
    /// Serve `/metrics` and `/health` on this port
    pub metrics_port: Option<u16>,
    /// YAML routing config; built-in defaults when absent
    pub routing_config: Option<String>,
    pub queue: QueueConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_id: None,
            concurrency: 4,
            task_types: Vec::new(),
            poll_timeout_ms: 5_000,
            graceful_shutdown_timeout_secs: 60,
            timeouts: BTreeMap::new(),
            backend_retry: RetryPolicy {
                base_delay_ms: 500,
                max_delay_ms: 30_000,
                max_retries: u32::MAX,
                jitter: 0.2,
                retry_timeouts: true,
            },
            run_maintenance: true,
            log_level: "info".to_string(),
            log_json: false,
            metrics_port: None,
            routing_config: None,
            queue: QueueConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        if self.task_types.is_empty() {
            TaskType::ALL.to_vec()
        } else {
            self.task_types.clone()
        }
    }

    /// Handler budget for `task_type`: the override if set, else the type default
    pub fn timeout_for(&self, task_type: TaskType) -> Duration {
        self.timeouts
            .get(&task_type)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| task_type.default_timeout())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }

    pub fn generate_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let pid = std::process::id();
        let random = uuid::Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &random[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_override_and_default() {
        let mut config = WorkerConfig::default();
        config.timeouts.insert(TaskType::MlPrediction, 5);

        assert_eq!(config.timeout_for(TaskType::MlPrediction), Duration::from_secs(5));
        assert_eq!(
            config.timeout_for(TaskType::Generate3d),
            TaskType::Generate3d.default_timeout()
        );
    }

    #[test]
    fn test_empty_task_types_means_all() {
        let config = WorkerConfig::default();
        assert_eq!(config.task_types().len(), TaskType::ALL.len());
    }

    #[test]
    fn test_worker_id() {
        let mut config = WorkerConfig::default();
        let generated = config.generate_worker_id();
        assert!(generated.contains(&std::process::id().to_string()));

        config.worker_id = Some("gpu-box-1".to_string());
        assert_eq!(config.generate_worker_id(), "gpu-box-1");
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = "concurrency: 8\ntask_types: [generate_3d]\ntimeouts:\n  generate_3d: 900\n";
        let config: WorkerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.task_types(), vec![TaskType::Generate3d]);
        assert_eq!(config.timeout_for(TaskType::Generate3d), Duration::from_secs(900));
        assert_eq!(config.poll_timeout_ms, 5_000);
    }
}

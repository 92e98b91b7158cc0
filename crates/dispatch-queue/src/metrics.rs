use dispatch_core::{ErrorKind, TaskType};
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Prometheus metrics for the task queue
pub struct QueueMetrics {
    pub registry: Registry,

    pub tasks_total: CounterVec,
    pub tasks_processing: IntGauge,
    pub queue_depth: IntGaugeVec,
    pub task_processing_duration: HistogramVec,
    pub dead_letter_total: CounterVec,
}

impl QueueMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_total = CounterVec::new(
            Opts::new("dispatch_tasks_total", "Task transitions by status and type"),
            &["status", "task_type"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let tasks_processing = IntGauge::new(
            "dispatch_tasks_processing",
            "Number of tasks currently claimed by a worker",
        )?;
        registry.register(Box::new(tasks_processing.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("dispatch_queue_depth", "Pending and retrying tasks by type"),
            &["task_type"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let task_processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_task_processing_duration_seconds",
                "Time from claim to completion in seconds",
            ),
            &["task_type"],
        )?;
        registry.register(Box::new(task_processing_duration.clone()))?;

        let dead_letter_total = CounterVec::new(
            Opts::new("dispatch_dead_letter_total", "Tasks moved to the dead letter queue"),
            &["task_type", "error_kind"],
        )?;
        registry.register(Box::new(dead_letter_total.clone()))?;

        Ok(QueueMetrics {
            registry,
            tasks_total,
            tasks_processing,
            queue_depth,
            task_processing_duration,
            dead_letter_total,
        })
    }

    pub fn inc_tasks_total(&self, status: &str, task_type: TaskType) {
        self.tasks_total
            .with_label_values(&[status, task_type.as_str()])
            .inc();
    }

    pub fn observe_processing_duration(&self, task_type: TaskType, duration_secs: f64) {
        self.task_processing_duration
            .with_label_values(&[task_type.as_str()])
            .observe(duration_secs);
    }

    pub fn inc_dead_letter(&self, task_type: TaskType, error_kind: ErrorKind) {
        self.dead_letter_total
            .with_label_values(&[task_type.as_str(), error_kind.as_str()])
            .inc();
    }

    pub fn set_queue_depth(&self, task_type: TaskType, depth: i64) {
        self.queue_depth
            .with_label_values(&[task_type.as_str()])
            .set(depth);
    }

    /// Text exposition format for a scrape endpoint
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_labelled_series() {
        let metrics = QueueMetrics::new().unwrap();
        metrics.inc_tasks_total("completed", TaskType::Generate3d);
        metrics.inc_dead_letter(TaskType::MlPrediction, ErrorKind::Timeout);
        metrics.set_queue_depth(TaskType::MarketingCampaign, 4);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"dispatch_tasks_total{status="completed",task_type="generate_3d"} 1"#));
        assert!(text.contains(r#"dispatch_dead_letter_total{error_kind="timeout",task_type="ml_prediction"} 1"#));
        assert!(text.contains(r#"dispatch_queue_depth{task_type="marketing_campaign"} 4"#));
    }
}

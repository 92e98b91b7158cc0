use crate::{HandlerError, TaskContext};
use async_trait::async_trait;
use dispatch_core::{Task, TaskType};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Business logic for one task type.
///
/// Handlers should call [`TaskContext::checkpoint`] between discrete steps so
/// cancellation and shutdown take effect without interrupting an outbound
/// call. Returned errors must carry their classification.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<Value, HandlerError>;
}

/// Handlers by task type. Built once at startup, then shared read-only.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: TaskHandler + 'static>(&mut self, task_type: TaskType, handler: H) -> &mut Self {
        self.handlers.insert(task_type, Arc::new(handler));
        self
    }

    /// Register one shared handler for several types
    pub fn register_shared(&mut self, task_types: &[TaskType], handler: Arc<dyn TaskHandler>) -> &mut Self {
        for task_type in task_types {
            self.handlers.insert(*task_type, handler.clone());
        }
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn has_handler(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Types with no registered handler
    pub fn missing_types(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| !self.has_handler(*t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Static(Value);

    #[async_trait]
    impl TaskHandler for Static {
        async fn handle(&self, _task: &Task, _ctx: &TaskContext) -> Result<Value, HandlerError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::Generate3d, Static(Value::Null));

        assert!(registry.has_handler(TaskType::Generate3d));
        assert!(!registry.has_handler(TaskType::MlTraining));
        assert!(registry.get(TaskType::Generate3d).is_some());
        assert_eq!(registry.task_types(), vec![TaskType::Generate3d]);
        assert_eq!(registry.missing_types().len(), 3);
    }

    #[test]
    fn test_shared_registration() {
        let mut registry = HandlerRegistry::new();
        registry.register_shared(&TaskType::ALL, Arc::new(Static(Value::Null)));
        assert!(registry.missing_types().is_empty());
    }
}

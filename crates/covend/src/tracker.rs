//! Task source seam.
//!
//! The scheduler pulls candidate work through this trait; the daemon ships
//! a store-backed source (tasks arrive via the API), and deployments with
//! an external tracker implement the same seam.

use coven_core::{Task, TaskStatus};
use std::sync::Arc;

use crate::storage::{Storage, StorageError};

/// Where claimable tasks come from.
#[async_trait::async_trait]
pub trait TaskSource: Send + Sync {
    /// Tasks currently eligible for claiming, best first.
    async fn poll(&self) -> Result<Vec<Task>, StorageError>;
}

/// Serves open tasks straight from the store.
#[derive(Debug)]
pub struct StoreTaskSource {
    storage: Arc<Storage>,
}

impl StoreTaskSource {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl TaskSource for StoreTaskSource {
    async fn poll(&self) -> Result<Vec<Task>, StorageError> {
        self.storage.list_tasks(Some(TaskStatus::Open)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coven_core::TaskType;
    use tempfile::TempDir;

    fn test_task(id: &str, priority: i64) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            priority,
            task_type: TaskType::Task,
            status: TaskStatus::Open,
            labels: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn polls_open_tasks_by_priority() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);

        storage.create_task(&test_task("low", 9)).await.unwrap();
        storage.create_task(&test_task("high", 1)).await.unwrap();
        let mut claimed = test_task("busy", 0);
        claimed.status = TaskStatus::InProgress;
        storage.import_task(&claimed).await.unwrap();

        let source = StoreTaskSource::new(Arc::clone(&storage));
        let tasks = source.poll().await.unwrap();
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
    }
}

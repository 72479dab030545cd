// 存储模块：任务表的持久化读写，所有操作按 owner 标识隔离。

mod sqlite;

use crate::config::StorageConfig;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

pub use sqlite::SqliteTaskStore;

/// 与数据表列宽一致。
pub const MAX_CONTENT_CHARS: usize = 100;
pub const MAX_OWNER_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: i64,
    pub owner_id: String,
    pub content: String,
    pub complete: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum TaskError {
    Validation(String),
    NotFound(i64),
    Forbidden(i64),
    Storage(anyhow::Error),
}

impl TaskError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Storage(_) => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "{message}"),
            Self::NotFound(id) => write!(f, "task {id} not found"),
            Self::Forbidden(id) => write!(f, "task {id} belongs to another owner"),
            Self::Storage(err) => write!(f, "storage failure: {err:#}"),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<rusqlite::Error> for TaskError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.into())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(value: anyhow::Error) -> Self {
        Self::Storage(value)
    }
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// 任务存储接口；实现需保证单条记录的写入是原子的。
pub trait TaskStore: Send + Sync {
    fn ensure_initialized(&self) -> TaskResult<()>;

    fn create(&self, owner_id: &str, content: &str) -> TaskResult<TaskRecord>;
    /// 按创建时间升序返回，无分页。
    fn list_by_owner(&self, owner_id: &str) -> TaskResult<Vec<TaskRecord>>;
    fn get(&self, id: i64) -> TaskResult<TaskRecord>;
    fn get_owned(&self, id: i64, owner_id: &str) -> TaskResult<TaskRecord>;
    fn update_content(&self, id: i64, owner_id: &str, content: &str) -> TaskResult<TaskRecord>;
    fn delete(&self, id: i64, owner_id: &str) -> TaskResult<()>;
}

/// 去除首尾空白并校验长度，返回可直接落库的内容。
pub fn normalize_content(content: &str) -> TaskResult<String> {
    let cleaned = content.trim();
    if cleaned.is_empty() {
        return Err(TaskError::Validation(
            "Task content cannot be empty.".to_string(),
        ));
    }
    if cleaned.chars().count() > MAX_CONTENT_CHARS {
        return Err(TaskError::Validation(format!(
            "Task content cannot exceed {MAX_CONTENT_CHARS} characters."
        )));
    }
    Ok(cleaned.to_string())
}

pub(crate) fn validate_owner(owner_id: &str) -> TaskResult<()> {
    if owner_id.is_empty() {
        return Err(TaskError::Validation("Owner id is required.".to_string()));
    }
    if owner_id.chars().count() > MAX_OWNER_CHARS {
        return Err(TaskError::Validation(format!(
            "Owner id cannot exceed {MAX_OWNER_CHARS} characters."
        )));
    }
    Ok(())
}

pub fn build_task_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn TaskStore>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(SqliteTaskStore::new(
            config.db_path.trim().to_string(),
        ))),
        other => Err(anyhow!("未知存储后端: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_content_trims_and_rejects_blank() {
        assert_eq!(normalize_content("  buy milk \n").unwrap(), "buy milk");
        assert!(matches!(
            normalize_content("   "),
            Err(TaskError::Validation(_))
        ));
        assert!(matches!(normalize_content(""), Err(TaskError::Validation(_))));
    }

    #[test]
    fn normalize_content_counts_characters_not_bytes() {
        let exact = "茶".repeat(MAX_CONTENT_CHARS);
        assert_eq!(normalize_content(&exact).unwrap(), exact);
        let too_long = "a".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            normalize_content(&too_long),
            Err(TaskError::Validation(_))
        ));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let config = StorageConfig {
            backend: "postgres".to_string(),
            db_path: String::new(),
        };
        assert!(build_task_store(&config).is_err());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(TaskError::NotFound(1).code(), "NOT_FOUND");
        assert_eq!(TaskError::Forbidden(1).code(), "FORBIDDEN");
        assert_eq!(
            TaskError::Validation("x".to_string()).code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            TaskError::Storage(anyhow!("disk full")).code(),
            "INTERNAL_ERROR"
        );
    }
}

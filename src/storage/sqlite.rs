// SQLite 任务存储：表结构兼容旧版 my_task，更新/删除在 IMMEDIATE 事务内完成归属校验。
use crate::storage::{
    normalize_content, validate_owner, TaskError, TaskRecord, TaskResult, TaskStore,
};
use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const CREATED_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const TASK_COLUMNS: &str = "id, user_id, content, complete, created";

pub struct SqliteTaskStore {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteTaskStore {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/database.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("创建数据库目录失败: {}", parent.display())
                })?;
            }
        }
        Ok(())
    }

    fn open(&self) -> TaskResult<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn format_created(value: &DateTime<Utc>) -> String {
        value.naive_utc().format(CREATED_FORMAT).to_string()
    }

    fn parse_created(value: Option<String>) -> DateTime<Utc> {
        value
            .as_deref()
            .and_then(|text| NaiveDateTime::parse_from_str(text.trim(), CREATED_PARSE_FORMAT).ok())
            .map(|naive| naive.and_utc())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    fn map_task_row(row: &Row<'_>) -> rusqlite::Result<StoredTask> {
        Ok(StoredTask {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            content: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            complete: row.get::<_, Option<i64>>(3)?.unwrap_or(0) != 0,
            created: row.get(4)?,
        })
    }

    fn load(conn: &Connection, id: i64) -> TaskResult<Option<StoredTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM my_task WHERE id = ?");
        let row = conn
            .query_row(&sql, params![id], Self::map_task_row)
            .optional()?;
        Ok(row)
    }

    fn load_owned(conn: &Connection, id: i64, owner_id: &str) -> TaskResult<StoredTask> {
        let stored = Self::load(conn, id)?.ok_or(TaskError::NotFound(id))?;
        if !stored.is_owned_by(owner_id) {
            return Err(TaskError::Forbidden(id));
        }
        Ok(stored)
    }
}

/// 旧库中的列允许为 NULL，这里保留原始形态，NULL owner 不匹配任何身份。
struct StoredTask {
    id: i64,
    owner_id: Option<String>,
    content: String,
    complete: bool,
    created: Option<String>,
}

impl StoredTask {
    fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id.as_deref() == Some(owner_id)
    }

    fn into_record(self) -> TaskRecord {
        TaskRecord {
            id: self.id,
            owner_id: self.owner_id.unwrap_or_default(),
            content: self.content,
            complete: self.complete,
            created_at: SqliteTaskStore::parse_created(self.created),
        }
    }
}

impl TaskStore for SqliteTaskStore {
    fn ensure_initialized(&self) -> TaskResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS my_task (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id VARCHAR(100),
              content VARCHAR(100),
              complete INTEGER DEFAULT 0,
              created DATETIME
            );
            CREATE INDEX IF NOT EXISTS idx_my_task_user_created
              ON my_task (user_id, created);
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn create(&self, owner_id: &str, content: &str) -> TaskResult<TaskRecord> {
        validate_owner(owner_id)?;
        let content = normalize_content(content)?;
        self.ensure_initialized()?;
        let conn = self.open()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO my_task (user_id, content, complete, created) VALUES (?, ?, 0, ?)",
            params![owner_id, content, Self::format_created(&created_at)],
        )?;
        let id = conn.last_insert_rowid();
        // 与落库精度保持一致，读回时比较结果才稳定。
        let created_at = Self::parse_created(Some(Self::format_created(&created_at)));
        Ok(TaskRecord {
            id,
            owner_id: owner_id.to_string(),
            content,
            complete: false,
            created_at,
        })
    }

    fn list_by_owner(&self, owner_id: &str) -> TaskResult<Vec<TaskRecord>> {
        self.ensure_initialized()?;
        if owner_id.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM my_task WHERE user_id = ? ORDER BY created ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner_id], Self::map_task_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_record());
        }
        Ok(tasks)
    }

    fn get(&self, id: i64) -> TaskResult<TaskRecord> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        Self::load(&conn, id)?
            .map(StoredTask::into_record)
            .ok_or(TaskError::NotFound(id))
    }

    fn get_owned(&self, id: i64, owner_id: &str) -> TaskResult<TaskRecord> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        Ok(Self::load_owned(&conn, id, owner_id)?.into_record())
    }

    fn update_content(&self, id: i64, owner_id: &str, content: &str) -> TaskResult<TaskRecord> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut stored = Self::load_owned(&tx, id, owner_id)?;
        let content = normalize_content(content)?;
        tx.execute(
            "UPDATE my_task SET content = ? WHERE id = ?",
            params![content, id],
        )?;
        tx.commit()?;
        stored.content = content;
        Ok(stored.into_record())
    }

    fn delete(&self, id: i64, owner_id: &str) -> TaskResult<()> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::load_owned(&tx, id, owner_id)?;
        tx.execute("DELETE FROM my_task WHERE id = ?", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_timestamps_round_trip_at_microsecond_precision() {
        let value = "2024-03-05 07:08:09.123456".to_string();
        let parsed = SqliteTaskStore::parse_created(Some(value.clone()));
        assert_eq!(SqliteTaskStore::format_created(&parsed), value);
    }

    #[test]
    fn created_without_fraction_still_parses() {
        let parsed = SqliteTaskStore::parse_created(Some("2024-03-05 07:08:09".to_string()));
        assert_eq!(
            SqliteTaskStore::format_created(&parsed),
            "2024-03-05 07:08:09.000000"
        );
    }

    #[test]
    fn missing_created_falls_back_to_epoch() {
        assert_eq!(
            SqliteTaskStore::parse_created(None),
            DateTime::<Utc>::UNIX_EPOCH
        );
        assert_eq!(
            SqliteTaskStore::parse_created(Some("garbage".to_string())),
            DateTime::<Utc>::UNIX_EPOCH
        );
    }
}

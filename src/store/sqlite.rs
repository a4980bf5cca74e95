//! SQLite 任务存储
//!
//! 单文件数据库，WAL 模式 + busy_timeout，允许 dispatcher 与看门狗两个进程同时打开。
//! 所有调用经 `spawn_blocking` 执行；认领是单条条件 UPDATE，
//! 其余变更在 `BEGIN IMMEDIATE` 事务内完成读取、纯转换、写回。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{ClaimResult, FatalIssue, PipelineMarker, ReclaimedTask, TaskStore};
use crate::core::StoreError;
use crate::task::{
    now_ms, Applied, Decision, NewTask, Resolution, Task, TaskFilter, TaskStatus, TaskType,
};

const TASK_COLUMNS: &str = "id, task_type, direction, context, status, attempt_count, max_attempts, \
     last_failure_category, retry_reflections, claimed_by, next_attempt_at, cancelled, output, \
     created_at, updated_at";

const MARKER_KEY: &str = "pipeline_marker";
const FATAL_KEY: &str = "fatal_issue";

/// SQLite 任务存储
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// 打开（必要时创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                direction TEXT NOT NULL,
                context TEXT,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                last_failure_category TEXT,
                retry_reflections TEXT NOT NULL DEFAULT '[]',
                claimed_by TEXT,
                next_attempt_at INTEGER,
                cancelled INTEGER NOT NULL DEFAULT 0,
                output TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_updated ON tasks(updated_at);
            CREATE TABLE IF NOT EXISTS pipeline_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// 锁住连接后执行；互斥锁中毒时连接本身仍可用
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError>,
    {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// 在阻塞线程池上执行一次数据库调用
    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// 在 IMMEDIATE 事务内读取单个任务、执行转换并写回
    async fn mutate<F, R>(&self, id: &str, f: F) -> Result<(R, Task), StoreError>
    where
        F: FnOnce(&mut Task) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let id = id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut task = load_task(&tx, &id)?;
            let result = f(&mut task)?;
            save_task(&tx, &task)?;
            tx.commit()?;
            Ok((result, task))
        })
        .await
    }

    async fn put_meta<T: serde::Serialize>(&self, key: &'static str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO pipeline_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, json, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_meta<T>(&self, key: &'static str) -> Result<Option<T>, StoreError>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        self.blocking(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM pipeline_meta WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_json_column<T: serde::de::DeserializeOwned>(raw: &str, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let context: Option<String> = row.get(3)?;
    let category: Option<String> = row.get(7)?;
    let reflections: String = row.get(8)?;
    Ok(Task {
        id: row.get(0)?,
        task_type: parse_column(row, 1)?,
        direction: row.get(2)?,
        context: context.map(|c| parse_json_column(&c, 3)).transpose()?,
        status: parse_column(row, 4)?,
        attempt_count: row.get(5)?,
        max_attempts: row.get(6)?,
        last_failure_category: category
            .map(|c| c.parse().map_err(|e| conversion_error(7, e)))
            .transpose()?,
        retry_reflections: parse_json_column(&reflections, 8)?,
        claimed_by: row.get(9)?,
        next_attempt_at: row.get(10)?,
        cancelled: row.get(11)?,
        output: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn load_task(conn: &Connection, id: &str) -> Result<Task, StoreError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        row_to_task,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(id.to_string()),
        other => StoreError::Sqlite(other),
    })
}

fn query_tasks(conn: &Connection, sql: &str, values: Vec<Value>) -> Result<Vec<Task>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(values))?;
    let mut tasks = Vec::new();
    while let Some(row) = rows.next()? {
        tasks.push(row_to_task(row)?);
    }
    Ok(tasks)
}

fn insert_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            task.id,
            task.task_type.as_str(),
            task.direction,
            task.context.as_ref().map(|c| c.to_string()),
            task.status.as_str(),
            task.attempt_count,
            task.max_attempts,
            task.last_failure_category.map(|c| c.as_str()),
            serde_json::to_string(&task.retry_reflections)?,
            task.claimed_by,
            task.next_attempt_at,
            task.cancelled,
            task.output,
            task.created_at,
            task.updated_at,
        ],
    )?;
    Ok(())
}

/// 写回可变字段（id / task_type / direction / context / created_at 不可变）
fn save_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    let rows = conn.execute(
        "UPDATE tasks SET status = ?1, attempt_count = ?2, max_attempts = ?3, \
         last_failure_category = ?4, retry_reflections = ?5, claimed_by = ?6, \
         next_attempt_at = ?7, cancelled = ?8, output = ?9, updated_at = ?10 WHERE id = ?11",
        params![
            task.status.as_str(),
            task.attempt_count,
            task.max_attempts,
            task.last_failure_category.map(|c| c.as_str()),
            serde_json::to_string(&task.retry_reflections)?,
            task.claimed_by,
            task.next_attempt_at,
            task.cancelled,
            task.output,
            task.updated_at,
            task.id,
        ],
    )?;
    if rows == 0 {
        return Err(StoreError::NotFound(task.id.clone()));
    }
    Ok(())
}

/// 对一批状态为 `status` 且 updated_at 早于 cutoff 的任务逐个执行转换
fn sweep<R>(
    conn: &mut Connection,
    statuses: &[TaskStatus],
    cutoff: i64,
    mut apply: impl FnMut(&mut Task) -> Result<R, StoreError>,
) -> Result<Vec<(String, R)>, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let placeholders = vec!["?"; statuses.len()].join(", ");
    let mut values: Vec<Value> = statuses
        .iter()
        .map(|s| Value::Text(s.as_str().to_string()))
        .collect();
    values.push(Value::Integer(cutoff));
    let stale = query_tasks(
        &tx,
        &format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ({placeholders}) AND updated_at < ? \
             ORDER BY created_at ASC, rowid ASC"
        ),
        values,
    )?;

    let mut results = Vec::with_capacity(stale.len());
    for mut task in stale {
        let result = apply(&mut task)?;
        save_task(&tx, &task)?;
        results.push((task.id, result));
    }
    tx.commit()?;
    Ok(results)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, new: NewTask, max_attempts: u32) -> Result<Task, StoreError> {
        let task = Task::new(new, max_attempts, now_ms());
        let record = task.clone();
        self.blocking(move |conn| insert_task(conn, &record)).await?;
        Ok(task)
    }

    async fn get(&self, id: &str) -> Result<Task, StoreError> {
        let id = id.to_string();
        self.blocking(move |conn| load_task(conn, &id)).await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1");
        let mut values = Vec::new();
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(task_type) = filter.task_type {
            sql.push_str(" AND task_type = ?");
            values.push(Value::Text(task_type.as_str().to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?");
        values.push(Value::Integer(filter.page_size() as i64));
        values.push(Value::Integer(filter.offset as i64));
        self.blocking(move |conn| query_tasks(conn, &sql, values)).await
    }

    async fn snapshot(&self) -> Result<Vec<Task>, StoreError> {
        self.blocking(|conn| {
            query_tasks(
                conn,
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, rowid ASC"),
                Vec::new(),
            )
        })
        .await
    }

    async fn claimable(&self, types: &[TaskType], limit: usize) -> Result<Vec<Task>, StoreError> {
        let mut sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' AND cancelled = 0 \
             AND (next_attempt_at IS NULL OR next_attempt_at <= ?)"
        );
        let mut values = vec![Value::Integer(now_ms())];
        if !types.is_empty() {
            let placeholders = vec!["?"; types.len()].join(", ");
            sql.push_str(&format!(" AND task_type IN ({placeholders})"));
            values.extend(types.iter().map(|t| Value::Text(t.as_str().to_string())));
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC LIMIT ?");
        values.push(Value::Integer(limit as i64));
        self.blocking(move |conn| query_tasks(conn, &sql, values)).await
    }

    async fn claim(&self, id: &str, worker_id: &str) -> Result<ClaimResult, StoreError> {
        let id = id.to_string();
        let worker_id = worker_id.to_string();
        self.blocking(move |conn| {
            let now = now_ms();
            let rows = conn.execute(
                "UPDATE tasks SET status = 'claimed', claimed_by = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'pending' AND cancelled = 0 \
                 AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)",
                params![worker_id, now, id],
            )?;
            // 不存在时 load_task 返回 NotFound
            let task = load_task(conn, &id)?;
            if rows == 1 {
                Ok(ClaimResult::Claimed(task))
            } else {
                Ok(ClaimResult::AlreadyClaimed)
            }
        })
        .await
    }

    async fn start(&self, id: &str, worker_id: &str) -> Result<Task, StoreError> {
        let worker_id = worker_id.to_string();
        let (_, task) = self
            .mutate(id, move |t| Ok(t.start(&worker_id, now_ms())?))
            .await?;
        Ok(task)
    }

    async fn touch(&self, id: &str, worker_id: &str) -> Result<(), StoreError> {
        let worker_id = worker_id.to_string();
        self.mutate(id, move |t| Ok(t.touch(&worker_id, now_ms())?))
            .await?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        id: &str,
        attempt: u32,
        decision: &Decision,
    ) -> Result<(Applied, Task), StoreError> {
        let decision = decision.clone();
        self.mutate(id, move |t| Ok(t.apply_decision(attempt, &decision, now_ms())))
            .await
    }

    async fn resolve(
        &self,
        id: &str,
        resolution: Resolution,
        output: Option<String>,
    ) -> Result<Task, StoreError> {
        let (_, task) = self
            .mutate(id, move |t| Ok(t.resolve(resolution, output, now_ms())?))
            .await?;
        Ok(task)
    }

    async fn reopen(&self, id: &str) -> Result<Task, StoreError> {
        let (_, task) = self.mutate(id, |t| Ok(t.reopen(now_ms())?)).await?;
        Ok(task)
    }

    async fn cancel(&self, id: &str) -> Result<Task, StoreError> {
        let (_, task) = self.mutate(id, |t| Ok(t.cancel(now_ms())?)).await?;
        Ok(task)
    }

    async fn reclaim_stale(&self, cutoff: i64) -> Result<Vec<ReclaimedTask>, StoreError> {
        let swept = self
            .blocking(move |conn| {
                let now = now_ms();
                sweep(
                    conn,
                    &[TaskStatus::Claimed, TaskStatus::Running],
                    cutoff,
                    |t| Ok(t.reclaim(now)?),
                )
            })
            .await?;
        Ok(swept
            .into_iter()
            .map(|(id, outcome)| ReclaimedTask { id, outcome })
            .collect())
    }

    async fn expire_decisions(&self, cutoff: i64) -> Result<Vec<String>, StoreError> {
        let swept = self
            .blocking(move |conn| {
                let now = now_ms();
                sweep(conn, &[TaskStatus::NeedsDecision], cutoff, |t| {
                    Ok(t.expire_decision(now)?)
                })
            })
            .await?;
        Ok(swept.into_iter().map(|(id, _)| id).collect())
    }

    async fn write_marker(&self, marker: &PipelineMarker) -> Result<(), StoreError> {
        self.put_meta(MARKER_KEY, marker).await
    }

    async fn read_marker(&self) -> Result<Option<PipelineMarker>, StoreError> {
        self.get_meta(MARKER_KEY).await
    }

    async fn heartbeat_marker(&self, now: i64) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let raw: Option<String> = tx
                .query_row(
                    "SELECT value FROM pipeline_meta WHERE key = ?1",
                    params![MARKER_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(json) = raw {
                let mut marker: PipelineMarker = serde_json::from_str(&json)?;
                marker.heartbeat_at = now;
                tx.execute(
                    "UPDATE pipeline_meta SET value = ?1, updated_at = ?2 WHERE key = ?3",
                    params![serde_json::to_string(&marker)?, now, MARKER_KEY],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn record_fatal(&self, issue: &FatalIssue) -> Result<(), StoreError> {
        self.put_meta(FATAL_KEY, issue).await
    }

    async fn fatal_issue(&self) -> Result<Option<FatalIssue>, StoreError> {
        self.get_meta(FATAL_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FailureCategory, Reclaimed, RetryReflection};

    fn open_temp() -> (tempfile::TempDir, SqliteTaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::open(dir.path().join("nested/hive.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_task_survives_reopen() {
        let (dir, store) = open_temp();
        let created = store
            .create(
                NewTask::new(TaskType::Review, "review pr")
                    .with_context(serde_json::json!({"pr": 17})),
                2,
            )
            .await
            .unwrap();
        store.claim(&created.id, "w1").await.unwrap();
        store.start(&created.id, "w1").await.unwrap();
        let decision = Decision::Fail {
            reflection: RetryReflection {
                attempt_number: 1,
                failure_category: FailureCategory::EnvOrSecrets,
                blind_spot: "b".into(),
                next_action: "n".into(),
                failure_excerpt: "missing token".into(),
                timestamp: 3,
            },
        };
        store.record_outcome(&created.id, 1, &decision).await.unwrap();
        drop(store);

        let reopened = SqliteTaskStore::open(dir.path().join("nested/hive.db")).unwrap();
        let task = reopened.get(&created.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.context, Some(serde_json::json!({"pr": 17})));
        assert_eq!(task.last_failure_category, Some(FailureCategory::EnvOrSecrets));
        assert_eq!(task.retry_reflections.len(), 1);
        assert!(task.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_across_connections() {
        let (dir, first) = open_temp();
        let second = SqliteTaskStore::open(dir.path().join("nested/hive.db")).unwrap();
        let task = first.create(NewTask::new(TaskType::Impl, "x"), 3).await.unwrap();

        let (a, b) = tokio::join!(first.claim(&task.id, "w1"), second.claim(&task.id, "w2"));
        let wins = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(|r| matches!(r, ClaimResult::Claimed(_)))
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_claim_missing_task() {
        let (_dir, store) = open_temp();
        assert!(matches!(
            store.claim("task_nope", "w1").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweeps_respect_cutoff() {
        let (_dir, store) = open_temp();
        let task = store.create(NewTask::new(TaskType::Impl, "x"), 1).await.unwrap();
        store.claim(&task.id, "w1").await.unwrap();
        store.start(&task.id, "w1").await.unwrap();

        assert!(store.reclaim_stale(0).await.unwrap().is_empty());
        let reclaimed = store.reclaim_stale(now_ms() + 1).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].outcome, Reclaimed::Requeued);

        // 宽限尝试用尽后再次回收直接失败
        store.claim(&task.id, "w2").await.unwrap();
        store.start(&task.id, "w2").await.unwrap();
        let reclaimed = store.reclaim_stale(now_ms() + 1).await.unwrap();
        assert_eq!(reclaimed[0].outcome, Reclaimed::Abandoned);
        let task = store.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 2);
    }
}

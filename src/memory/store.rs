//! 任务状态库（SQLite）
//!
//! 每个任务 / 会话一行，状态整体以 JSON 文本保存。写入流程：读整行 → 内存合并 → 写整行。
//! 合并策略见 [`shallow_merge`]：映射类型只合并一层，其余（包括所有序列）整体替换，
//! 因此 plan / steps / tool_calls / feedback 必须由调用方先读后追加再整体提交。
//!
//! 不提供锁或乐观并发校验：同一 task_id 的并发写入后写者整体覆盖冲突键，
//! 调用方需保证单任务单写者。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::core::AgentError;
use crate::memory::Message;
use crate::workflow::{TaskId, TaskState, TaskStatus, TaskSummary};

/// 浅合并：delta 的每个顶层键，若原值与新值都是映射，则取两者的并集（delta 子键优先，仅一层）；
/// 否则整体替换。
pub fn shallow_merge(stored: &mut Map<String, Value>, delta: Map<String, Value>) {
    for (key, value) in delta {
        match value {
            Value::Object(incoming) => match stored.get_mut(&key) {
                Some(Value::Object(existing)) => existing.extend(incoming),
                _ => {
                    stored.insert(key, Value::Object(incoming));
                }
            },
            other => {
                stored.insert(key, other);
            }
        }
    }
}

/// 为缺少时间戳的记录补写时间：task.created_at、execution.steps[*]、tool_calls[*]
fn stamp_timestamps(doc: &mut Map<String, Value>, now: &str) {
    if let Some(Value::Object(task)) = doc.get_mut("task") {
        if task.get("created_at").map_or(true, Value::is_null) {
            task.insert("created_at".into(), json!(now));
        }
    }

    let stamp_all = |records: Option<&mut Value>| {
        if let Some(Value::Array(items)) = records {
            for item in items.iter_mut() {
                if let Value::Object(record) = item {
                    if record.get("timestamp").map_or(true, Value::is_null) {
                        record.insert("timestamp".into(), json!(now));
                    }
                }
            }
        }
    };

    stamp_all(
        doc.get_mut("execution")
            .and_then(|e| e.as_object_mut())
            .and_then(|e| e.get_mut("steps")),
    );
    stamp_all(doc.get_mut("tool_calls"));
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// SQLite 状态库：tasks 与 conversations 两张表
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        tracing::debug!(path = %path.display(), "state store opened");
        Ok(store)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, AgentError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<(), AgentError> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                touched INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_touched ON tasks(touched DESC);
            CREATE TABLE IF NOT EXISTS conversations (
                session_id TEXT PRIMARY KEY,
                history TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AgentError> {
        self.conn.lock().map_err(|_| {
            AgentError::StorageIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                "state store connection lock poisoned",
            ))
        })
    }

    fn read_document(
        conn: &Connection,
        task_id: &str,
    ) -> Result<Option<Map<String, Value>>, AgentError> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => match serde_json::from_str(&text)? {
                Value::Object(map) => Ok(Some(map)),
                _ => Ok(Some(Map::new())),
            },
            None => Ok(None),
        }
    }

    fn write_document(
        conn: &Connection,
        task_id: &str,
        doc: &Map<String, Value>,
        now: &str,
    ) -> Result<(), AgentError> {
        let text = serde_json::to_string(doc)?;
        conn.execute(
            "INSERT INTO tasks (task_id, state, created_at, updated_at, touched)
             VALUES (?1, ?2, ?3, ?3, (SELECT COALESCE(MAX(touched), 0) + 1 FROM tasks))
             ON CONFLICT(task_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at,
                touched = excluded.touched",
            params![task_id, text, now],
        )?;
        Ok(())
    }

    /// 新建任务并返回生成的 id；id 写入 task.id，创建时间写入 task.created_at
    pub fn create_task(&self, initial: Map<String, Value>) -> Result<TaskId, AgentError> {
        let task_id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let mut doc = initial;
        match doc.get_mut("task") {
            Some(Value::Object(task)) => {
                task.insert("id".into(), json!(task_id));
            }
            _ => {
                doc.insert("task".into(), json!({ "id": task_id }));
            }
        }
        stamp_timestamps(&mut doc, &now);

        let conn = self.lock()?;
        Self::write_document(&conn, &task_id, &doc, &now)?;
        tracing::debug!(task_id = %task_id, "task created");
        Ok(task_id)
    }

    /// 原始文档；未知任务返回空映射而非错误
    pub fn get_state(&self, task_id: &str) -> Result<Map<String, Value>, AgentError> {
        let conn = self.lock()?;
        Ok(Self::read_document(&conn, task_id)?.unwrap_or_default())
    }

    /// 反序列化后的 TaskState 副本；未知任务得到默认（空）状态
    pub fn load(&self, task_id: &str) -> Result<TaskState, AgentError> {
        Ok(TaskState::from_document(self.get_state(task_id)?)?)
    }

    /// 与 load 相同，但未知任务返回 TaskNotFound
    pub fn load_existing(&self, task_id: &str) -> Result<TaskState, AgentError> {
        let doc = {
            let conn = self.lock()?;
            Self::read_document(&conn, task_id)?
        };
        match doc {
            Some(doc) => Ok(TaskState::from_document(doc)?),
            None => Err(AgentError::TaskNotFound(task_id.to_string())),
        }
    }

    pub fn task_exists(&self, task_id: &str) -> Result<bool, AgentError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// 读整行 → 浅合并 delta → 补时间戳 → 写整行
    pub fn update_state(&self, task_id: &str, delta: Map<String, Value>) -> Result<(), AgentError> {
        let now = now_rfc3339();
        let conn = self.lock()?;
        let mut doc = Self::read_document(&conn, task_id)?.unwrap_or_default();
        shallow_merge(&mut doc, delta);
        stamp_timestamps(&mut doc, &now);
        Self::write_document(&conn, task_id, &doc, &now)
    }

    /// 最近更新的任务在前
    pub fn list_tasks(&self, limit: usize) -> Result<Vec<TaskSummary>, AgentError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, state, created_at, updated_at FROM tasks
             ORDER BY touched DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (task_id, state, created_at, updated_at) = row?;
            let doc: Value = serde_json::from_str(&state)?;
            let task = doc.get("task");
            let description = task
                .and_then(|t| t.get("description"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let status = task
                .and_then(|t| t.get("status"))
                .and_then(|s| serde_json::from_value::<TaskStatus>(s.clone()).ok())
                .unwrap_or_default();
            summaries.push(TaskSummary {
                task_id,
                description,
                status,
                created_at,
                updated_at,
            });
        }
        Ok(summaries)
    }

    pub fn delete_task(&self, task_id: &str) -> Result<bool, AgentError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])?;
        Ok(deleted > 0)
    }

    /// 会话历史；未知会话返回空
    pub fn get_conversation(&self, session_id: &str) -> Result<Vec<Message>, AgentError> {
        let conn = self.lock()?;
        Self::read_conversation(&conn, session_id)
    }

    fn read_conversation(conn: &Connection, session_id: &str) -> Result<Vec<Message>, AgentError> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT history FROM conversations WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(text) = raw else {
            return Ok(Vec::new());
        };
        let doc: Value = serde_json::from_str(&text)?;
        match doc.get("messages") {
            Some(messages) => Ok(serde_json::from_value(messages.clone())?),
            None => Ok(Vec::new()),
        }
    }

    /// 追加一轮对话（会话只增不改）
    pub fn append_turn(&self, session_id: &str, turn: Message) -> Result<(), AgentError> {
        let now = now_rfc3339();
        let conn = self.lock()?;
        let mut messages = Self::read_conversation(&conn, session_id)?;
        messages.push(turn);
        let history = serde_json::to_string(&json!({ "messages": messages }))?;
        conn.execute(
            "INSERT INTO conversations (session_id, history, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                history = excluded.history,
                updated_at = excluded.updated_at",
            params![session_id, history, now],
        )?;
        Ok(())
    }
}

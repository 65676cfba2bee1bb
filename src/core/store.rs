use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::info;

/// A task record as stored in the primary database.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub user_id: i64,
    pub message: String,
    pub task_type: String,
    pub status: String,
    pub result: String,
    pub error: String,
    pub created_at: String,
    pub completed_at: String,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

/// One "lesson learned" from a completed project task.
#[derive(Debug, Clone)]
pub struct ProjectMemoryRecord {
    pub project: String,
    pub outcome: String,
    pub lesson: String,
}

/// Lifetime token usage totals.
#[derive(Debug, Clone, Default)]
pub struct UsageSummary {
    pub total_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
}

/// Per-model usage row for cost breakdowns.
#[derive(Debug, Clone)]
pub struct ModelUsage {
    pub model: String,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
}

/// Primary persistence store.
///
/// A single SQLite connection in WAL mode behind a mutex. All methods are
/// synchronous: the pipeline runs in blocking workers, and the async side
/// only performs short point queries, so a blocking mutex is the simplest
/// correct sharing model.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                task_type TEXT DEFAULT '',
                status TEXT DEFAULT 'pending',
                result TEXT DEFAULT '',
                error TEXT DEFAULT '',
                token_usage TEXT DEFAULT '{}',
                created_at TEXT NOT NULL,
                completed_at TEXT DEFAULT ''
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_user_created
             ON tasks (user_id, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                task_id TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversation_context (
                user_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, key)
            )",
            [],
        )?;

        // Timestamp is a numeric epoch (REAL), never an ISO string: the
        // budget cutoff comparisons depend on it.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                thinking_tokens INTEGER NOT NULL DEFAULT 0,
                timestamp REAL NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS project_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                outcome TEXT NOT NULL,
                lesson TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        info!("Store initialised at {} (WAL mode)", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Throwaway store for tests. The backing directory is intentionally
    /// leaked so SQLite's WAL sidecar files outlive this constructor.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let store = Self::open(&dir.path().join("test.db"))?;
        std::mem::forget(dir);
        Ok(store)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn create_task(&self, task_id: &str, user_id: i64, message: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, user_id, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, user_id, message, now],
        )?;
        Ok(())
    }

    pub fn update_task_status(&self, task_id: &str, status: &str, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        match error {
            Some(err) => conn.execute(
                "UPDATE tasks SET status = ?1, error = ?2 WHERE id = ?3",
                params![status, err, task_id],
            )?,
            None => conn.execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2",
                params![status, task_id],
            )?,
        };
        Ok(())
    }

    pub fn complete_task(
        &self,
        task_id: &str,
        status: &str,
        task_type: &str,
        result: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET status = ?1, task_type = ?2, result = ?3, completed_at = ?4
             WHERE id = ?5",
            params![status, task_type, result, now, task_id],
        )?;
        Ok(())
    }

    pub fn list_tasks(&self, user_id: i64, limit: usize) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, message, task_type, status, result, error, created_at, completed_at
             FROM tasks WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok(TaskRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                message: row.get(2)?,
                task_type: row.get(3)?,
                status: row.get(4)?,
                result: row.get(5)?,
                error: row.get(6)?,
                created_at: row.get(7)?,
                completed_at: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Recent (task_type) pairs for follow-up mining, newest first.
    pub fn recent_task_types(&self, user_id: i64, limit: usize) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT task_type, created_at FROM tasks
             WHERE user_id = ?1 AND task_type != '' ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Mark tasks left in `running`/`pending` by a previous process as crashed.
    pub fn recover_stale_tasks(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE tasks SET status = 'crashed', error = 'Process terminated before completion'
             WHERE status IN ('running', 'pending')",
            [],
        )?;
        if n > 0 {
            info!("Recovered {n} stale task(s) from previous crash");
        }
        Ok(n)
    }

    // ── Conversation history & context ───────────────────────────────

    pub fn add_history(&self, user_id: i64, role: &str, content: &str, task_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let truncated: String = content.chars().take(5000).collect();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversation_history (user_id, role, content, task_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, role, truncated, task_id, now],
        )?;
        Ok(())
    }

    pub fn recent_history(&self, user_id: i64, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT role, content FROM conversation_history
             WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok(HistoryEntry {
                role: row.get(0)?,
                content: row.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.reverse();
        Ok(out)
    }

    /// Format recent history for injection into planner prompts.
    pub fn build_conversation_context(&self, user_id: i64, limit: usize) -> Result<String> {
        let history = self.recent_history(user_id, limit)?;
        if history.is_empty() {
            return Ok(String::new());
        }
        let lines: Vec<String> = history
            .iter()
            .map(|m| {
                let label = if m.role == "user" { "User" } else { "Agent" };
                let content: String = m.content.chars().take(500).collect();
                format!("{label}: {content}")
            })
            .collect();
        Ok(lines.join("\n"))
    }

    pub fn set_context(&self, user_id: i64, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversation_context (user_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value,
                 updated_at = excluded.updated_at",
            params![user_id, key, value, now],
        )?;
        Ok(())
    }

    pub fn get_all_context(&self, user_id: i64) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM conversation_context WHERE user_id = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn clear_context(&self, user_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM conversation_context WHERE user_id = ?1",
            params![user_id],
        )?;
        conn.execute(
            "DELETE FROM conversation_history WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    // ── API usage ledger ──────────────────────────────────────────────

    pub fn record_usage(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        thinking_tokens: u64,
    ) -> Result<()> {
        let ts = Utc::now().timestamp_millis() as f64 / 1000.0;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO api_usage (model, input_tokens, output_tokens, thinking_tokens, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![model, input_tokens, output_tokens, thinking_tokens, ts],
        )?;
        Ok(())
    }

    pub fn usage_summary(&self) -> Result<UsageSummary> {
        let conn = self.conn.lock().unwrap();
        let row = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(thinking_tokens), 0) FROM api_usage",
            [],
            |row| {
                Ok(UsageSummary {
                    total_calls: row.get::<_, i64>(0)? as u64,
                    input_tokens: row.get::<_, i64>(1)? as u64,
                    output_tokens: row.get::<_, i64>(2)? as u64,
                    thinking_tokens: row.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        Ok(row)
    }

    /// Per-model usage for calls with `timestamp > cutoff` (epoch seconds).
    /// Pass 0.0 for lifetime totals.
    pub fn usage_by_model_since(&self, cutoff: f64) -> Result<Vec<ModelUsage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT model, COUNT(*), SUM(input_tokens), SUM(output_tokens), SUM(thinking_tokens)
             FROM api_usage WHERE timestamp > ?1 GROUP BY model",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok(ModelUsage {
                model: row.get(0)?,
                calls: row.get::<_, i64>(1)? as u64,
                input_tokens: row.get::<_, i64>(2)? as u64,
                output_tokens: row.get::<_, i64>(3)? as u64,
                thinking_tokens: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Project memory ───────────────────────────────────────────────

    pub fn add_project_memory(&self, project: &str, outcome: &str, lesson: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let bounded: String = lesson.chars().take(300).collect();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO project_memory (project, outcome, lesson, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![project, outcome, bounded, now],
        )?;
        Ok(())
    }

    pub fn project_memory(&self, project: &str, limit: usize) -> Result<Vec<ProjectMemoryRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT project, outcome, lesson FROM project_memory
             WHERE project = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project, limit as i64], |row| {
            Ok(ProjectMemoryRecord {
                project: row.get(0)?,
                outcome: row.get(1)?,
                lesson: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Retention ─────────────────────────────────────────────────────

    /// Prune old conversation history (ISO-string cutoff) and old usage
    /// records (numeric epoch cutoff, the same type as the stored column).
    pub fn prune_old_data(&self, history_days: i64, usage_days: i64) -> Result<(usize, usize)> {
        let history_cutoff = (Utc::now() - chrono::Duration::days(history_days)).to_rfc3339();
        let usage_cutoff = Utc::now().timestamp() as f64 - (usage_days as f64) * 86_400.0;

        let conn = self.conn.lock().unwrap();
        let history_deleted = conn.execute(
            "DELETE FROM conversation_history WHERE created_at < ?1",
            params![history_cutoff],
        )?;
        let usage_deleted = conn.execute(
            "DELETE FROM api_usage WHERE timestamp < ?1",
            params![usage_cutoff],
        )?;
        if history_deleted > 0 || usage_deleted > 0 {
            info!(
                "Storage cleanup: pruned {history_deleted} history records (>{history_days}d), \
                 {usage_deleted} usage records (>{usage_days}d)"
            );
        }
        Ok((history_deleted, usage_deleted))
    }
}

/// Remove output and upload files older than `max_age_days`.
pub fn cleanup_workspace_files(dirs: &[&Path], max_age_days: u64) -> usize {
    let cutoff = std::time::SystemTime::now()
        .checked_sub(std::time::Duration::from_secs(max_age_days * 86_400));
    let Some(cutoff) = cutoff else { return 0 };
    let mut removed = 0;

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if let Ok(modified) = meta.modified() {
                if modified < cutoff && std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    if removed > 0 {
        info!("Workspace cleanup: removed {removed} files older than {max_age_days} days");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_lifecycle_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.create_task("t1", 42, "do the thing").unwrap();
        store.update_task_status("t1", "running", None).unwrap();
        store.complete_task("t1", "completed", "code", "done").unwrap();

        let tasks = store.list_tasks(42, 10).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, "completed");
        assert_eq!(tasks[0].task_type, "code");
        assert!(!tasks[0].completed_at.is_empty());
    }

    #[test]
    fn stale_tasks_are_marked_crashed_on_recovery() {
        let store = Store::open_in_memory().unwrap();
        store.create_task("t1", 1, "a").unwrap();
        store.update_task_status("t1", "running", None).unwrap();
        store.create_task("t2", 1, "b").unwrap();
        store.complete_task("t2", "completed", "code", "ok").unwrap();

        let recovered = store.recover_stale_tasks().unwrap();
        assert_eq!(recovered, 1);

        let tasks = store.list_tasks(1, 10).unwrap();
        let t1 = tasks.iter().find(|t| t.id == "t1").unwrap();
        assert_eq!(t1.status, "crashed");
        let t2 = tasks.iter().find(|t| t.id == "t2").unwrap();
        assert_eq!(t2.status, "completed");
    }

    #[test]
    fn conversation_context_is_formatted_and_bounded() {
        let store = Store::open_in_memory().unwrap();
        store.add_history(7, "user", "hello", "t1").unwrap();
        store.add_history(7, "assistant", "hi there", "t1").unwrap();

        let ctx = store.build_conversation_context(7, 6).unwrap();
        assert!(ctx.contains("User: hello"));
        assert!(ctx.contains("Agent: hi there"));

        store.clear_context(7).unwrap();
        assert!(store.build_conversation_context(7, 6).unwrap().is_empty());
    }

    #[test]
    fn usage_ledger_sums_thinking_tokens() {
        let store = Store::open_in_memory().unwrap();
        store.record_usage("claude-sonnet-4-6", 100, 50, 0).unwrap();
        store.record_usage("claude-opus-4-6", 200, 80, 30).unwrap();

        let summary = store.usage_summary().unwrap();
        assert_eq!(summary.total_calls, 2);
        assert_eq!(summary.input_tokens, 300);
        assert_eq!(summary.output_tokens, 130);
        assert_eq!(summary.thinking_tokens, 30);
    }

    #[test]
    fn daily_pruning_keeps_same_day_usage_records() {
        // Regression guard: the cutoff comparison must use the numeric
        // epoch type of the stored column, so a prune with a 1-day window
        // never deletes records written today.
        let store = Store::open_in_memory().unwrap();
        store.record_usage("claude-sonnet-4-6", 10, 5, 0).unwrap();

        let (_, usage_deleted) = store.prune_old_data(30, 1).unwrap();
        assert_eq!(usage_deleted, 0);
        assert_eq!(store.usage_summary().unwrap().total_calls, 1);
    }

    #[test]
    fn project_memory_is_bounded_and_scoped() {
        let store = Store::open_in_memory().unwrap();
        let long_lesson = "x".repeat(1000);
        store
            .add_project_memory("scraper", "failure", &long_lesson)
            .unwrap();
        store
            .add_project_memory("reports", "success", "use venv python")
            .unwrap();

        let lessons = store.project_memory("scraper", 5).unwrap();
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].lesson.chars().count(), 300);
    }

    #[test]
    fn usage_by_model_since_filters_by_epoch_cutoff() {
        let store = Store::open_in_memory().unwrap();
        store.record_usage("claude-sonnet-4-6", 10, 5, 0).unwrap();

        let future = Utc::now().timestamp() as f64 + 3600.0;
        assert!(store.usage_by_model_since(future).unwrap().is_empty());
        assert_eq!(store.usage_by_model_since(0.0).unwrap().len(), 1);
    }
}

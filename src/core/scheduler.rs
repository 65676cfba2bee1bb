use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

/// A persisted recurring task.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: String,
    pub interval_minutes: u64,
    pub chat_id: i64,
    pub user_id: i64,
    pub message: String,
}

/// Job store in its own database file: the primary store sees frequent
/// short writes from pipelines, and sharing a file would contend locks.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                interval_minutes INTEGER NOT NULL,
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn add(&self, job: &ScheduledJob) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO jobs (id, interval_minutes, chat_id, user_id, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id,
                job.interval_minutes as i64,
                job.chat_id,
                job.user_id,
                job.message,
                now
            ],
        )?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, interval_minutes, chat_id, user_id, message FROM jobs ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ScheduledJob {
                id: row.get(0)?,
                interval_minutes: row.get::<_, i64>(1)? as u64,
                chat_id: row.get(2)?,
                user_id: row.get(3)?,
                message: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Remove by id prefix (the chat shows truncated ids). Returns the
    /// full id of the removed job.
    pub fn remove_by_prefix(&self, prefix: &str) -> Result<Option<String>> {
        let jobs = self.list()?;
        let Some(job) = jobs.iter().find(|j| j.id.starts_with(prefix)) else {
            return Ok(None);
        };
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![job.id])?;
        Ok(Some(job.id.clone()))
    }
}

/// What the scheduler does when a job fires. The chat adapter supplies
/// this so the scheduler stays platform-agnostic.
pub type JobRunner =
    Arc<dyn Fn(ScheduledJob) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Recurring-job scheduler over the persistent store.
pub struct Scheduler {
    inner: JobScheduler,
    store: Arc<JobStore>,
    runner: JobRunner,
    registered: tokio::sync::Mutex<std::collections::HashMap<String, uuid::Uuid>>,
}

impl Scheduler {
    pub async fn start(store: Arc<JobStore>, runner: JobRunner) -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .map_err(|e| anyhow::anyhow!("scheduler init: {e}"))?;
        inner
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("scheduler start: {e}"))?;
        let scheduler = Self {
            inner,
            store,
            runner,
            registered: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        };

        // Jobs persisted by previous runs resume automatically.
        let persisted = scheduler.store.list()?;
        let count = persisted.len();
        for job in persisted {
            scheduler.register(job).await?;
        }
        info!("Scheduler started ({count} persisted jobs loaded)");
        Ok(scheduler)
    }

    async fn register(&self, job: ScheduledJob) -> Result<()> {
        let runner = Arc::clone(&self.runner);
        let job_for_closure = job.clone();
        let interval = std::time::Duration::from_secs(job.interval_minutes * 60);

        let cron_job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let runner = Arc::clone(&runner);
            let job = job_for_closure.clone();
            Box::pin(async move {
                runner(job).await;
            })
        })
        .map_err(|e| anyhow::anyhow!("job create: {e}"))?;

        let scheduler_uuid = self
            .inner
            .add(cron_job)
            .await
            .map_err(|e| anyhow::anyhow!("job add: {e}"))?;
        self.registered
            .lock()
            .await
            .insert(job.id.clone(), scheduler_uuid);
        info!(
            "Registered job {}: every {}m",
            &job.id[..job.id.len().min(8)],
            job.interval_minutes
        );
        Ok(())
    }

    /// Persist and activate a new interval job.
    pub async fn add_job(&self, job: ScheduledJob) -> Result<()> {
        self.store.add(&job)?;
        self.register(job).await
    }

    pub fn list_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.store.list()
    }

    /// Remove a job by id prefix, both from the store and the live
    /// scheduler. Returns the removed id.
    pub async fn remove_job(&self, prefix: &str) -> Result<Option<String>> {
        let Some(id) = self.store.remove_by_prefix(prefix)? else {
            return Ok(None);
        };
        if let Some(scheduler_uuid) = self.registered.lock().await.remove(&id) {
            if let Err(e) = self.inner.remove(&scheduler_uuid).await {
                warn!("Failed to deregister job {id}: {e}");
            }
        }
        info!("Removed job: {id}");
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> JobStore {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = JobStore::open(tmp.path()).unwrap();
        // Keep the backing file from being deleted when `tmp` would
        // otherwise drop at the end of this function.
        std::mem::forget(tmp);
        store
    }

    fn job(id: &str, minutes: u64) -> ScheduledJob {
        ScheduledJob {
            id: id.to_string(),
            interval_minutes: minutes,
            chat_id: 100,
            user_id: 42,
            message: "run the scraper".to_string(),
        }
    }

    #[test]
    fn jobs_persist_and_list_in_creation_order() {
        let store = store();
        store.add(&job("aaaa-1111", 360)).unwrap();
        store.add(&job("bbbb-2222", 60)).unwrap();

        let jobs = store.list().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "aaaa-1111");
        assert_eq!(jobs[0].interval_minutes, 360);
        assert_eq!(jobs[1].message, "run the scraper");
    }

    #[test]
    fn remove_by_prefix_matches_and_deletes() {
        let store = store();
        store.add(&job("aaaa-1111", 60)).unwrap();
        store.add(&job("bbbb-2222", 60)).unwrap();

        let removed = store.remove_by_prefix("aaaa").unwrap();
        assert_eq!(removed.as_deref(), Some("aaaa-1111"));
        assert_eq!(store.list().unwrap().len(), 1);

        assert_eq!(store.remove_by_prefix("zzzz").unwrap(), None);
    }

    #[test]
    fn duplicate_job_id_replaces_instead_of_erroring() {
        let store = store();
        store.add(&job("aaaa-1111", 60)).unwrap();
        store.add(&job("aaaa-1111", 120)).unwrap();

        let jobs = store.list().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].interval_minutes, 120);
    }
}

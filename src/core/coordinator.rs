use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use tokio::task::AbortHandle;
use tracing::info;

use crate::config::Config;
use crate::core::guards::{GuardRejection, ResourceGuards};
use crate::core::llm::Gateway;
use crate::core::pipeline::{self, state::PipelineState, PipelineCtx};
use crate::core::projects::ProjectRegistry;
use crate::core::sandbox::live;
use crate::core::store::Store;

/// Minimum prefix length accepted by the debug-sidecar lookup; the bot
/// prints 8-char task ids, so anything shorter is a typo.
pub const DEBUG_PREFIX_MIN: usize = 8;

#[derive(Default)]
struct UserState {
    pending_files: Vec<PathBuf>,
    running: HashMap<String, AbortHandle>,
}

/// Entry point the chat front-end calls for every task.
///
/// Owns admission (guards), task records, the worker handoff, live status
/// snapshots, and per-user pending-file bookkeeping. The chat adapter
/// stays a thin translation layer on top.
pub struct Coordinator {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub guards: Arc<ResourceGuards>,
    pub projects: Arc<ProjectRegistry>,
    pub gateway: Arc<Gateway>,
    users: Mutex<HashMap<i64, UserState>>,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        projects: Arc<ProjectRegistry>,
        gateway: Arc<Gateway>,
    ) -> Self {
        let guards = Arc::new(ResourceGuards::new(
            config.max_concurrent_tasks,
            config.ram_threshold_percent,
        ));
        Self {
            config,
            store,
            guards,
            projects,
            gateway,
            users: Mutex::new(HashMap::new()),
        }
    }

    fn ctx(&self) -> PipelineCtx {
        PipelineCtx {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            gateway: Arc::clone(&self.gateway),
            projects: Arc::clone(&self.projects),
        }
    }

    // ── Pending uploads ──────────────────────────────────────────────

    pub fn add_pending_file(&self, user_id: i64, path: PathBuf) {
        let mut users = self.users.lock().unwrap();
        users.entry(user_id).or_default().pending_files.push(path);
    }

    /// Snapshot the files the next task will consume, without clearing
    /// them: files uploaded while a task runs belong to the next task.
    pub fn snapshot_pending_files(&self, user_id: i64) -> Vec<PathBuf> {
        let users = self.users.lock().unwrap();
        users
            .get(&user_id)
            .map(|u| u.pending_files.clone())
            .unwrap_or_default()
    }

    /// Clear only the files a finished task actually consumed.
    pub fn clear_consumed_files(&self, user_id: i64, consumed: &[PathBuf]) {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.get_mut(&user_id) {
            user.pending_files.retain(|f| !consumed.contains(f));
        }
    }

    // ── Task lifecycle ───────────────────────────────────────────────

    /// Admission guards for an interactive task.
    pub fn admit(&self, user_id: i64) -> Result<(), GuardRejection> {
        self.guards.admit(user_id)
    }

    /// Admission for a scheduler-originated task (no cooldown).
    pub fn admit_scheduled(&self) -> Result<(), GuardRejection> {
        self.guards.admit_scheduled()
    }

    pub fn track(&self, user_id: i64, task_id: &str, handle: AbortHandle) {
        let mut users = self.users.lock().unwrap();
        users
            .entry(user_id)
            .or_default()
            .running
            .insert(task_id.to_string(), handle);
    }

    pub fn untrack(&self, user_id: i64, task_id: &str) {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.get_mut(&user_id) {
            user.running.remove(task_id);
        }
    }

    pub fn running_tasks(&self, user_id: i64) -> Vec<String> {
        let users = self.users.lock().unwrap();
        users
            .get(&user_id)
            .map(|u| u.running.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Abort every in-flight task for a user. Completion of already
    /// spawned child processes is best-effort. Record updates and guard
    /// release happen in the owning handler when it observes the abort,
    /// so nothing is double-counted.
    pub fn cancel_all(&self, user_id: i64) -> usize {
        let handles: Vec<(String, AbortHandle)> = {
            let users = self.users.lock().unwrap();
            match users.get(&user_id) {
                Some(user) => user
                    .running
                    .iter()
                    .map(|(id, h)| (id.clone(), h.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };
        for (task_id, handle) in &handles {
            handle.abort();
            info!("Cancel requested for task {task_id}");
        }
        handles.len()
    }

    /// Run the full pipeline for one task inside a blocking worker, with
    /// the long overall timeout. The caller has already passed admission.
    pub async fn run_pipeline(
        self: &Arc<Self>,
        task_id: String,
        user_id: i64,
        message: String,
        files: Vec<PathBuf>,
    ) -> Result<PipelineState, PipelineFailure> {
        self.store
            .update_task_status(&task_id, "running", None)
            .map_err(|e| PipelineFailure::Internal(e.to_string()))?;

        let conversation_context = self
            .store
            .build_conversation_context(user_id, 6)
            .unwrap_or_default();

        let ctx = self.ctx();
        let tid = task_id.clone();
        let msg = message.clone();
        let worker = tokio::task::spawn_blocking(move || {
            pipeline::run_task(&ctx, tid, user_id, msg, files, conversation_context)
        });

        let timeout = Duration::from_secs(self.config.long_timeout);
        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(Ok(state))) => Ok(state),
            Ok(Ok(Err(e))) => Err(PipelineFailure::Failed(e.to_string())),
            Ok(Err(join_err)) => {
                if join_err.is_cancelled() {
                    Err(PipelineFailure::Cancelled)
                } else {
                    Err(PipelineFailure::Internal(join_err.to_string()))
                }
            }
            Err(_) => {
                pipeline::clear_stage(&task_id);
                live::clear(&task_id);
                Err(PipelineFailure::TimedOut(self.config.long_timeout))
            }
        }
    }

    // ── Live status ──────────────────────────────────────────────────

    /// Current (stage label + live stdout tail) view for a task, or None
    /// when no stage is active yet. The caller hash-gates edits on this.
    pub fn status_snapshot(&self, task_id: &str) -> Option<String> {
        let stage = pipeline::get_stage(task_id);
        if stage.is_empty() {
            return None;
        }
        let mut label = pipeline::stage_label(&stage).to_string();
        if stage == "executing" {
            let tail = live::tail(task_id, 3);
            if !tail.is_empty() {
                let joined = tail.join("\n");
                let capped: String = joined
                    .chars()
                    .rev()
                    .take(200)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                label.push_str(&format!("\n\nLatest output:\n{capped}"));
            }
        }
        label.push_str(&format!(" (task {})", &task_id[..task_id.len().min(8)]));
        Some(label)
    }

    // ── Debug sidecar lookup ─────────────────────────────────────────

    /// Find a task's debug sidecar by id prefix.
    pub fn find_sidecar(&self, prefix: &str) -> Option<PathBuf> {
        if prefix.len() < DEBUG_PREFIX_MIN {
            return None;
        }
        let entries = std::fs::read_dir(&self.config.outputs_dir).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(prefix) && name.ends_with(".debug.json") {
                return Some(entry.path());
            }
        }
        None
    }
}

/// How a pipeline run can end without a state.
#[derive(Debug)]
pub enum PipelineFailure {
    TimedOut(u64),
    Cancelled,
    Failed(String),
    Internal(String),
}

// ── Chain parsing ────────────────────────────────────────────────────

/// Split a strict-AND chain command into steps. `{output}` in a step is
/// later substituted with the previous step's artifact paths.
pub fn parse_chain(raw: &str) -> Vec<String> {
    raw.split("->")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Substitute `{output}` with the previous step's artifact paths.
pub fn substitute_output(step: &str, previous_artifacts: &[PathBuf]) -> String {
    if previous_artifacts.is_empty() {
        return step.replace("{output}", "").trim().to_string();
    }
    let paths: Vec<String> = previous_artifacts
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    step.replace("{output}", &paths.join(", "))
}

// ── Error sanitisation ───────────────────────────────────────────────

/// Sanitise an error message before it reaches the chat: strip absolute
/// paths down to filenames and redact anything that looks like a key or
/// token fragment, while keeping the wording intact.
pub fn sanitize_error(error: &str) -> String {
    let mut msg: String = error.chars().take(500).collect();

    let path_re = Regex::new(r"/[\w/.\-]+/([^/\s]+)").expect("static pattern");
    msg = path_re.replace_all(&msg, "$1").to_string();

    let secret_re = Regex::new(r"(?i)(sk-|api[-_]key|token)[^\s,]{8,}").expect("static pattern");
    msg = secret_re.replace_all(&msg, "[REDACTED]").to_string();

    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_splits_on_arrow_and_trims() {
        let steps = parse_chain("write numbers.txt with 1..100 -> read {output} and sum -> ");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0], "write numbers.txt with 1..100");
        assert_eq!(steps[1], "read {output} and sum");
    }

    #[test]
    fn chain_with_one_step_is_not_a_chain() {
        assert_eq!(parse_chain("just one thing").len(), 1);
        assert!(parse_chain("").is_empty());
    }

    #[test]
    fn output_token_is_replaced_with_artifact_paths() {
        let artifacts = vec![PathBuf::from("/ws/outputs/numbers.txt")];
        assert_eq!(
            substitute_output("read {output} and assert sum == 5050", &artifacts),
            "read /ws/outputs/numbers.txt and assert sum == 5050"
        );
    }

    #[test]
    fn output_token_without_artifacts_is_dropped() {
        assert_eq!(substitute_output("analyse {output}", &[]), "analyse");
    }

    #[test]
    fn error_sanitisation_strips_paths_and_secrets() {
        let raw = "failed to read /home/operator/secrets/conf.yaml: token=sk-abcdefghijklmnop expired";
        let clean = sanitize_error(raw);
        assert!(!clean.contains("/home/operator"));
        assert!(clean.contains("conf.yaml"));
        assert!(!clean.contains("sk-abcdefghijklmnop"));
        assert!(clean.contains("[REDACTED]"));
    }

    #[test]
    fn error_sanitisation_preserves_wording() {
        let clean = sanitize_error("Execution failed: assertion error in step 3");
        assert_eq!(clean, "Execution failed: assertion error in step 3");
    }

    #[test]
    fn pending_file_snapshot_is_scoped_to_the_consuming_task() {
        let config = Arc::new(crate::config::Config::from_env());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gateway = Arc::new(Gateway::new(Arc::clone(&config), Arc::clone(&store)));
        let projects = Arc::new(ProjectRegistry::default());
        let coordinator = Coordinator::new(config, store, projects, gateway);

        coordinator.add_pending_file(1, PathBuf::from("/u/a.csv"));
        coordinator.add_pending_file(1, PathBuf::from("/u/b.csv"));
        let consumed = coordinator.snapshot_pending_files(1);
        assert_eq!(consumed.len(), 2);

        // A file uploaded while the task runs must survive the clear.
        coordinator.add_pending_file(1, PathBuf::from("/u/late.csv"));
        coordinator.clear_consumed_files(1, &consumed);
        assert_eq!(
            coordinator.snapshot_pending_files(1),
            vec![PathBuf::from("/u/late.csv")]
        );
    }

    #[test]
    fn sidecar_lookup_requires_a_minimum_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::from_env();
        config.outputs_dir = dir.path().to_path_buf();
        std::fs::write(dir.path().join("abcd1234-x.debug.json"), "{}").unwrap();

        let config = Arc::new(config);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gateway = Arc::new(Gateway::new(Arc::clone(&config), Arc::clone(&store)));
        let coordinator = Coordinator::new(
            config,
            store,
            Arc::new(ProjectRegistry::default()),
            gateway,
        );

        assert!(coordinator.find_sidecar("abcd").is_none());
        assert!(coordinator.find_sidecar("abcd1234").is_some());
        assert!(coordinator.find_sidecar("zzzz9999").is_none());
    }
}

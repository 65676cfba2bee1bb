use std::path::PathBuf;

use serde::Serialize;

use crate::core::projects::Project;

/// Closed set of task categories. Behaviour tables (planner prompts,
/// audit criteria) are keyed on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskType {
    Project,
    Frontend,
    UiDesign,
    Automation,
    Data,
    File,
    #[default]
    Code,
}

/// Fallback scan order when the classifier's JSON cannot be parsed.
/// Specific types come first; the generic "code" catches everything else.
pub const FALLBACK_ORDER: &[TaskType] = &[
    TaskType::Project,
    TaskType::Frontend,
    TaskType::UiDesign,
    TaskType::Automation,
    TaskType::Data,
    TaskType::File,
    TaskType::Code,
];

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Project => "project",
            TaskType::Frontend => "frontend",
            TaskType::UiDesign => "ui_design",
            TaskType::Automation => "automation",
            TaskType::Data => "data",
            TaskType::File => "file",
            TaskType::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Option<TaskType> {
        match s {
            "project" => Some(TaskType::Project),
            "frontend" => Some(TaskType::Frontend),
            "ui_design" => Some(TaskType::UiDesign),
            "automation" => Some(TaskType::Automation),
            "data" => Some(TaskType::Data),
            "file" => Some(TaskType::File),
            "code" => Some(TaskType::Code),
            _ => None,
        }
    }

    /// Types whose deliverable is generated code executed in the sandbox.
    pub fn is_code_producing(&self) -> bool {
        matches!(
            self,
            TaskType::Code | TaskType::Data | TaskType::File | TaskType::Automation
        )
    }
}

/// Per-node wall-clock timing, collected for the debug sidecar.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub name: String,
    pub duration_ms: u64,
}

/// Audit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    Pass,
    #[default]
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
        }
    }
}

/// Shared state threaded through the pipeline. Created by the
/// coordinator, mutated only by nodes, discarded after delivery.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    // Input
    pub task_id: String,
    pub user_id: i64,
    pub message: String,
    pub files: Vec<PathBuf>,

    // Classification
    pub task_type: TaskType,
    pub project: Option<Project>,

    // Planning
    pub plan: String,

    // Execution
    pub code: String,
    pub execution_result: String,
    pub execution_timed_out: bool,

    // Audit
    pub audit_verdict: Option<Verdict>,
    pub audit_feedback: String,

    // Control
    pub retry_count: u32,

    // Parameter extraction (project tasks)
    pub extracted_params: Vec<(String, String)>,

    // Working directory chosen by the executor
    pub working_dir: String,

    // Conversation memory, injected before the pipeline runs
    pub conversation_context: String,

    // Auto-install tracking
    pub auto_installed_packages: Vec<String>,

    // Per-node timing for the debug sidecar
    pub stage_timings: Vec<StageTiming>,

    // Output
    pub final_response: String,
    pub artifacts: Vec<PathBuf>,
}

impl PipelineState {
    pub fn new(
        task_id: String,
        user_id: i64,
        message: String,
        files: Vec<PathBuf>,
        conversation_context: String,
    ) -> Self {
        Self {
            task_id,
            user_id,
            message,
            files,
            conversation_context,
            ..Default::default()
        }
    }

    /// The verdict the outside world sees; fail until audit has run.
    pub fn verdict(&self) -> Verdict {
        self.audit_verdict.unwrap_or(Verdict::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_string_roundtrip() {
        for tt in FALLBACK_ORDER {
            assert_eq!(TaskType::parse(tt.as_str()), Some(*tt));
        }
        assert_eq!(TaskType::parse("banana"), None);
    }

    #[test]
    fn fallback_order_has_specific_types_first_and_code_last() {
        assert_eq!(FALLBACK_ORDER.first(), Some(&TaskType::Project));
        assert_eq!(FALLBACK_ORDER.last(), Some(&TaskType::Code));
        assert_eq!(FALLBACK_ORDER.len(), 7);
    }

    #[test]
    fn code_producing_types() {
        assert!(TaskType::Code.is_code_producing());
        assert!(TaskType::Data.is_code_producing());
        assert!(TaskType::Automation.is_code_producing());
        assert!(!TaskType::Project.is_code_producing());
        assert!(!TaskType::UiDesign.is_code_producing());
        assert!(!TaskType::Frontend.is_code_producing());
    }

    #[test]
    fn verdict_defaults_to_fail_before_audit() {
        let state = PipelineState::default();
        assert_eq!(state.verdict(), Verdict::Fail);
    }
}

use anyhow::Result;
use tracing::{info, warn};

use crate::core::llm::{CallRequest, Complexity, Purpose};

use super::state::{PipelineState, TaskType, FALLBACK_ORDER};
use super::PipelineCtx;

const SYSTEM: &str = r#"You are a task classifier for an AI agent system. Given a user message (and optionally attached file info), classify the task into exactly one category.

Categories:
- "project": The task matches an existing registered project (see list below). Use this when the user wants to run, invoke, or interact with a known project.
- "code": Writing NEW code, building apps, scripts, websites, APIs, fixing bugs
- "data": Data analysis, processing CSVs/Excel, generating charts, summarizing data
- "file": File conversion, transformation, reformatting, merging, splitting
- "automation": Web scraping, scheduled reports, monitoring, repetitive workflows
- "ui_design": Visual design tasks - mockups, landing pages, dashboard designs, website layouts, UI/UX prototypes
- "frontend": Full-stack frontend engineering - production React apps, complex interactive dashboards, multi-component web applications, SPA builds

{projects_summary}

Respond with ONLY a JSON object: {"task_type": "<category>", "reason": "<one sentence>"}"#;

/// Keyword fallback when the model's JSON cannot be parsed. Scans in
/// FALLBACK_ORDER so specific types win over the generic "code".
pub fn fallback_scan(response: &str) -> TaskType {
    let lower = response.to_lowercase();
    for tt in FALLBACK_ORDER {
        if lower.contains(tt.as_str()) {
            return *tt;
        }
    }
    TaskType::Code
}

/// Parse the classifier's JSON verdict.
pub fn parse_verdict(response: &str) -> Option<TaskType> {
    let parsed: serde_json::Value = serde_json::from_str(response.trim()).ok()?;
    parsed
        .get("task_type")
        .and_then(|v| v.as_str())
        .and_then(TaskType::parse)
}

/// Assign a task type, checking registered-project triggers first.
///
/// The trigger fast path makes no model call at all. When the slow path
/// says "project" without a trigger match, the type is demoted to "code"
/// since an unmatched project classification would fail every retry.
pub fn classify(ctx: &PipelineCtx, state: &mut PipelineState) -> Result<()> {
    if let Some(project) = ctx.projects.match_message(&state.message) {
        info!(
            "Classified task {} as project: {}",
            state.task_id, project.name
        );
        state.task_type = TaskType::Project;
        state.project = Some(project.clone());
        return Ok(());
    }

    let system = SYSTEM.replace("{projects_summary}", &ctx.projects.summary());

    let mut prompt = format!("User message: {}", state.message);
    if !state.files.is_empty() {
        prompt.push_str("\n\nAttached files:");
        for f in &state.files {
            prompt.push_str(&format!("\n- {}", f.display()));
        }
    }

    let response = ctx.gateway.call(
        CallRequest::new(Purpose::Classify, &prompt, &system)
            .complexity(Complexity::Low)
            .max_tokens(200),
    )?;

    let mut task_type = parse_verdict(&response).unwrap_or_else(|| fallback_scan(&response));

    if task_type == TaskType::Project {
        // The model saw the project list, but no trigger agrees.
        warn!("Model classified as project but no trigger match, falling back to code");
        task_type = TaskType::Code;
    }

    state.task_type = task_type;
    info!(
        "Classified task {} as: {}",
        state.task_id,
        task_type.as_str()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_json_verdict_parses() {
        let response = r#"{"task_type": "data", "reason": "CSV analysis"}"#;
        assert_eq!(parse_verdict(response), Some(TaskType::Data));
    }

    #[test]
    fn unknown_category_in_json_is_rejected() {
        assert_eq!(parse_verdict(r#"{"task_type": "cooking"}"#), None);
        assert_eq!(parse_verdict("not json at all"), None);
    }

    #[test]
    fn fallback_scan_prefers_specific_types() {
        // Mentions both "frontend" and "code": frontend is earlier in the
        // fallback order.
        let t = fallback_scan("This looks like frontend code work");
        assert_eq!(t, TaskType::Frontend);
    }

    #[test]
    fn fallback_scan_defaults_to_code() {
        assert_eq!(fallback_scan("no category words here"), TaskType::Code);
    }

    #[test]
    fn fallback_scan_finds_ui_design() {
        assert_eq!(
            fallback_scan("I think ui_design fits best"),
            TaskType::UiDesign
        );
    }

    #[test]
    fn trigger_match_classifies_without_a_model_call() {
        use std::sync::Arc;

        use crate::core::llm::Gateway;
        use crate::core::projects::{Project, ProjectRegistry};
        use crate::core::store::Store;

        let config = Arc::new(crate::config::Config::from_env());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gateway = Arc::new(Gateway::new(Arc::clone(&config), Arc::clone(&store)));
        let projects = Arc::new(ProjectRegistry::from_projects(vec![Project {
            name: "job-scraper".to_string(),
            path: "/home/op/scraper".to_string(),
            triggers: vec!["job scraper".to_string()],
            ..Default::default()
        }]));
        let ctx = crate::core::pipeline::PipelineCtx {
            config,
            store,
            gateway,
            projects,
        };

        let mut state = PipelineState::default();
        state.task_id = "t-trigger".to_string();
        state.message = "run the job scraper for rust roles".to_string();

        // No network is reachable in tests: classify succeeding at all
        // proves the fast path skipped the gateway.
        classify(&ctx, &mut state).unwrap();
        assert_eq!(state.task_type, TaskType::Project);
        assert_eq!(state.project.as_ref().unwrap().name, "job-scraper");
    }
}

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::core::llm::{CallRequest, Purpose};

use super::state::{PipelineState, TaskType, Verdict};
use super::PipelineCtx;

/// Window within which a follow-up task counts as a sequence.
const FOLLOW_UP_WINDOW_MINS: i64 = 30;

const SUMMARY_SYSTEM: &str = r#"You are formatting a task result for delivery via Telegram chat.
You receive the original request, the execution output, and context.
Write a polished, structured response.

Formatting rules:
- Start with a clear 1-sentence summary of what was accomplished
- Use sections with headers where helpful (just CAPS or bold-style text)
- Use bullet points for lists
- For code tasks: describe what the code does and key results. Do NOT paste the full source code - it will be attached as a file
- For data/analysis tasks: highlight key findings, numbers, patterns, and insights
- For project tasks: summarize what ran and the meaningful output
- If assertions passed, mention briefly (e.g. "All 5 validation checks passed")
- If there were retries, briefly note what was corrected
- Mention attached files at the end if any
- Keep response under 1800 characters (Telegram limit)
- Be informative, concise, and professional
- Use plain text only (no markdown links, no HTML tags)
- Do NOT include raw tracebacks, stderr, or full code listings
- NEVER claim the task succeeded when the status says it failed"#;

/// Debug sidecar written beside the task's outputs after every run.
#[derive(Debug, Serialize)]
pub struct DebugSidecar {
    pub task_id: String,
    pub message: String,
    pub task_type: String,
    pub stages: Vec<super::state::StageTiming>,
    pub total_duration_ms: u64,
    pub verdict: String,
    pub retry_count: u32,
}

/// Strip the operator's absolute home prefix from a user-visible string.
pub fn sanitize_home(text: &str, home: &Path) -> String {
    let home_str = home.to_string_lossy();
    if home_str.is_empty() || home_str == "/" {
        return text.to_string();
    }
    text.replace(home_str.as_ref(), "~")
}

/// Pull the meaningful stdout section out of a formatted execution result.
pub fn extract_output(execution_result: &str) -> String {
    if execution_result.is_empty() {
        return "(no output)".to_string();
    }
    if let Some((_, rest)) = execution_result.split_once("Output:") {
        let mut output = rest;
        for separator in ["Stderr:", "Traceback:", "Files created:"] {
            if let Some((head, _)) = output.split_once(separator) {
                output = head;
            }
        }
        let trimmed = output.trim();
        return if trimmed.is_empty() {
            "(no output)".to_string()
        } else {
            trimmed.to_string()
        };
    }
    execution_result.chars().take(2000).collect()
}

/// Brief structural description of generated code, without the code.
pub fn describe_code(code: &str) -> String {
    let lines: Vec<&str> = code.trim().lines().collect();
    let mut libs: Vec<String> = lines
        .iter()
        .filter_map(|l| {
            let t = l.trim();
            if let Some(rest) = t.strip_prefix("import ") {
                rest.split_whitespace().next().map(|m| m.split('.').next().unwrap_or(m).to_string())
            } else if let Some(rest) = t.strip_prefix("from ") {
                rest.split_whitespace().next().map(|m| m.split('.').next().unwrap_or(m).to_string())
            } else {
                None
            }
        })
        .collect();
    libs.sort();
    libs.dedup();

    let asserts = lines.iter().filter(|l| l.contains("assert ")).count();
    let functions = lines.iter().filter(|l| l.trim().starts_with("def ")).count();

    let mut parts = Vec::new();
    if !libs.is_empty() {
        let shown: Vec<&str> = libs.iter().take(8).map(|s| s.as_str()).collect();
        parts.push(format!("Uses: {}", shown.join(", ")));
    }
    parts.push(format!("{} lines", lines.len()));
    if functions > 0 {
        parts.push(format!("{functions} functions defined"));
    }
    if asserts > 0 {
        parts.push(format!("{asserts} assertions"));
    }
    parts.join(" | ")
}

/// Mine recent task history for a repeated follow-up pattern: if the same
/// next-type has followed the current type at least twice within a short
/// window, suggest it.
pub fn mine_follow_up(
    history: &[(String, String)], // (task_type, created_at) newest first
    current_type: &str,
) -> Option<String> {
    let mut ordered: Vec<(&str, DateTime<Utc>)> = history
        .iter()
        .filter_map(|(t, created)| {
            DateTime::parse_from_rfc3339(created)
                .ok()
                .map(|dt| (t.as_str(), dt.with_timezone(&Utc)))
        })
        .collect();
    ordered.reverse(); // oldest first

    let mut counts: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    for pair in ordered.windows(2) {
        let (prev_type, prev_at) = pair[0];
        let (next_type, next_at) = pair[1];
        if prev_type == current_type
            && next_type != current_type
            && (next_at - prev_at).num_minutes() <= FOLLOW_UP_WINDOW_MINS
        {
            *counts.entry(next_type).or_insert(0) += 1;
        }
    }

    counts
        .into_iter()
        .filter(|(_, n)| *n >= 2)
        .max_by_key(|(_, n)| *n)
        .map(|(t, _)| t.to_string())
}

/// Fallback formatting when the summary model call fails.
fn fallback_response(state: &PipelineState, artifacts: &[PathBuf]) -> String {
    let mut parts = Vec::new();

    if state.verdict() == Verdict::Pass {
        if state.task_type == TaskType::Project {
            let name = state
                .project
                .as_ref()
                .map(|p| p.name.as_str())
                .unwrap_or("Unknown");
            parts.push(format!("Project '{name}' executed successfully."));
        } else {
            parts.push("Task completed successfully.".to_string());
        }
    } else {
        parts.push(format!(
            "Task failed (after {} retries).",
            state.retry_count
        ));
        if !state.audit_feedback.is_empty() {
            let feedback: String = state.audit_feedback.chars().take(300).collect();
            parts.push(format!("Reason: {feedback}"));
        }
    }

    let output = extract_output(&state.execution_result);
    if output != "(no output)" {
        let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() > 15 {
            parts.push(format!("Key output:\n{}", lines[lines.len() - 15..].join("\n")));
        } else {
            parts.push(output);
        }
    }

    let names: Vec<&str> = artifacts
        .iter()
        .filter(|p| p.exists())
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
        .collect();
    if !names.is_empty() {
        parts.push(format!("\nAttached: {}", names.join(", ")));
    }

    parts.join("\n\n")
}

/// Save the generated code itself as an attachable artifact.
fn save_code_artifact(state: &PipelineState, outputs_dir: &Path) -> Option<PathBuf> {
    if state.code.trim().is_empty() {
        return None;
    }
    let words: String = state
        .message
        .chars()
        .map(|c| if c.is_alphanumeric() || c == ' ' { c } else { ' ' })
        .collect();
    let stem: String = words
        .split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase();
    let stem = if stem.is_empty() { "script".to_string() } else { stem };

    let filename = format!(
        "{stem}_{}.py",
        &uuid::Uuid::new_v4().simple().to_string()[..6]
    );
    let path = outputs_dir.join(filename);
    match std::fs::write(&path, &state.code) {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("Failed to save code artifact: {e}");
            None
        }
    }
}

/// Compose the user-visible response, persist the project lesson, and
/// write the debug sidecar.
pub fn deliver(ctx: &PipelineCtx, state: &mut PipelineState) -> Result<()> {
    let verdict = state.verdict();

    // Artifacts are only delivered on a passing verdict.
    let mut artifacts: Vec<PathBuf> = if verdict == Verdict::Pass {
        state.artifacts.clone()
    } else {
        Vec::new()
    };

    if verdict == Verdict::Pass && state.task_type.is_code_producing() && !state.code.is_empty() {
        if let Some(code_file) = save_code_artifact(state, &ctx.config.outputs_dir) {
            if !artifacts.contains(&code_file) {
                artifacts.push(code_file);
            }
        }
    }

    let execution_output = extract_output(&state.execution_result);
    let output_excerpt: String = execution_output.chars().take(3000).collect();

    let param_info = if state.task_type == TaskType::Project && !state.extracted_params.is_empty() {
        format!("\nParameters used: {:?}", state.extracted_params)
    } else {
        String::new()
    };
    let retry_note = if state.retry_count > 0 && verdict == Verdict::Pass {
        let feedback: String = state.audit_feedback.chars().take(300).collect();
        format!("Retry note: {feedback}")
    } else {
        String::new()
    };
    let code_info = if state.code.is_empty() {
        String::new()
    } else {
        format!("Code description: {}", describe_code(&state.code))
    };
    let file_names: Vec<&str> = artifacts
        .iter()
        .filter(|p| p.exists())
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
        .collect();

    let status = if verdict == Verdict::Pass {
        "Completed successfully".to_string()
    } else {
        format!("FAILED (after {} retries)", state.retry_count)
    };

    let prompt = format!(
        "Original request: {}\n\nTask type: {}\nStatus: {status}\n{retry_note}\n{param_info}\n\nExecution output (stdout):\n{output_excerpt}\n\n{code_info}\n\nFiles generated: {}",
        state.message,
        state.task_type.as_str(),
        if file_names.is_empty() {
            "None".to_string()
        } else {
            file_names.join(", ")
        }
    );

    let mut summary = match ctx.gateway.call(
        CallRequest::new(Purpose::General, &prompt, SUMMARY_SYSTEM)
            .max_tokens(800)
            .temperature(0.3),
    ) {
        Ok(text) => {
            if text.chars().count() > 3800 {
                let head: String = text.chars().take(3800).collect();
                format!("{head}...")
            } else {
                text
            }
        }
        Err(e) => {
            warn!("Summary generation failed, using fallback: {e}");
            fallback_response(state, &artifacts)
        }
    };

    // Append the file list if the summary didn't mention it.
    if !file_names.is_empty() && !file_names.iter().any(|name| summary.contains(name)) {
        summary.push_str(&format!("\n\nAttached: {}", file_names.join(", ")));
    }

    // Project memory: one bounded lesson per project run.
    if let Some(project) = &state.project {
        let (outcome, lesson) = if verdict == Verdict::Pass {
            let detail = if state.auto_installed_packages.is_empty() {
                "ran clean".to_string()
            } else {
                format!(
                    "needed auto-install of {}",
                    state.auto_installed_packages.join(", ")
                )
            };
            (
                "success",
                format!("{} completed in {} retries; {detail}", project.name, state.retry_count),
            )
        } else {
            let feedback_line = state
                .audit_feedback
                .lines()
                .next()
                .unwrap_or("unknown failure")
                .to_string();
            ("failure", feedback_line)
        };
        if let Err(e) = ctx.store.add_project_memory(&project.name, outcome, &lesson) {
            warn!("Failed to record project memory: {e}");
        }
    }

    // Temporal-sequence mining: suggest the habitual next step.
    if let Ok(history) = ctx.store.recent_task_types(state.user_id, 20) {
        if let Some(next) = mine_follow_up(&history, state.task_type.as_str()) {
            summary.push_str(&format!(
                "\n\nYou often follow this with a {next} task - send it over if you want that next."
            ));
        }
    }

    let total_duration_ms: u64 = state.stage_timings.iter().map(|s| s.duration_ms).sum();
    let sanitized_message: String = sanitize_home(&state.message, &ctx.config.host_home)
        .chars()
        .take(300)
        .collect();
    let sidecar = DebugSidecar {
        task_id: state.task_id.clone(),
        message: sanitized_message,
        task_type: state.task_type.as_str().to_string(),
        stages: state.stage_timings.clone(),
        total_duration_ms,
        verdict: verdict.as_str().to_string(),
        retry_count: state.retry_count,
    };
    let sidecar_path = ctx
        .config
        .outputs_dir
        .join(format!("{}.debug.json", state.task_id));
    match serde_json::to_string_pretty(&sidecar) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&sidecar_path, json) {
                warn!("Failed to write debug sidecar: {e}");
            }
        }
        Err(e) => warn!("Failed to serialise debug sidecar: {e}"),
    }

    info!(
        "Delivery prepared for task {} ({} chars, {} artifacts)",
        state.task_id,
        summary.len(),
        artifacts.len()
    );

    state.final_response = summary;
    state.artifacts = artifacts;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_prefix_is_sanitized() {
        let home = Path::new("/home/operator");
        assert_eq!(
            sanitize_home("see /home/operator/workspace/out.csv", home),
            "see ~/workspace/out.csv"
        );
        assert_eq!(sanitize_home("no paths here", home), "no paths here");
    }

    #[test]
    fn output_extraction_pulls_the_stdout_section() {
        let result = "Execution: SUCCESS (exit code 0)\nOutput:\nrows: 100\nsum: 5050\nFiles created: out.csv";
        assert_eq!(extract_output(result), "rows: 100\nsum: 5050");
    }

    #[test]
    fn output_extraction_handles_missing_sections() {
        assert_eq!(extract_output(""), "(no output)");
        let result = "Execution: FAILED (exit code 1)\nOutput:\n\nStderr:\nboom";
        assert_eq!(extract_output(result), "(no output)");
    }

    #[test]
    fn code_description_summarises_without_source() {
        let code = "import pandas as pd\nfrom pathlib import Path\n\ndef main():\n    df = pd.DataFrame()\n    assert len(df) == 0\n\nmain()";
        let desc = describe_code(code);
        assert!(desc.contains("Uses: pandas, pathlib") || desc.contains("Uses: pathlib, pandas"));
        assert!(desc.contains("1 functions defined"));
        assert!(desc.contains("1 assertions"));
        assert!(!desc.contains("DataFrame"));
    }

    #[test]
    fn follow_up_mining_requires_two_occurrences() {
        fn at(mins: i64) -> String {
            (Utc::now() - chrono::Duration::minutes(mins)).to_rfc3339()
        }
        // Newest first, as the store returns them:
        // data→file happened twice within the window.
        let history = vec![
            ("file".to_string(), at(1)),
            ("data".to_string(), at(2)),
            ("file".to_string(), at(10)),
            ("data".to_string(), at(12)),
            ("code".to_string(), at(50)),
        ];
        assert_eq!(mine_follow_up(&history, "data").as_deref(), Some("file"));
        // Only one occurrence of code→data.
        assert_eq!(mine_follow_up(&history, "code"), None);
    }

    #[test]
    fn follow_up_mining_ignores_out_of_window_pairs() {
        fn at(mins: i64) -> String {
            (Utc::now() - chrono::Duration::minutes(mins)).to_rfc3339()
        }
        let history = vec![
            ("file".to_string(), at(1)),
            ("data".to_string(), at(120)), // 2h gap
            ("file".to_string(), at(240)),
            ("data".to_string(), at(360)),
        ];
        assert_eq!(mine_follow_up(&history, "data"), None);
    }

    #[test]
    fn fallback_response_never_claims_success_on_failure() {
        let mut state = PipelineState::default();
        state.audit_verdict = Some(Verdict::Fail);
        state.retry_count = 3;
        state.audit_feedback = "assertion failed: sum mismatch".to_string();

        let text = fallback_response(&state, &[]);
        assert!(text.contains("failed"));
        assert!(!text.to_lowercase().contains("completed successfully"));
        assert!(text.contains("assertion failed"));
    }

    #[test]
    fn fallback_response_names_the_project_on_success() {
        let mut state = PipelineState::default();
        state.audit_verdict = Some(Verdict::Pass);
        state.task_type = TaskType::Project;
        state.project = Some(crate::core::projects::Project {
            name: "scraper".to_string(),
            ..Default::default()
        });
        let text = fallback_response(&state, &[]);
        assert!(text.contains("Project 'scraper' executed successfully."));
    }

    #[test]
    fn sidecar_serialises_to_the_documented_shape() {
        let sidecar = DebugSidecar {
            task_id: "abc123".to_string(),
            message: "do ~/things".to_string(),
            task_type: "code".to_string(),
            stages: vec![super::super::state::StageTiming {
                name: "classify".to_string(),
                duration_ms: 12,
            }],
            total_duration_ms: 12,
            verdict: "pass".to_string(),
            retry_count: 0,
        };
        let json = serde_json::to_value(&sidecar).unwrap();
        assert_eq!(json["task_id"], "abc123");
        assert_eq!(json["stages"][0]["name"], "classify");
        assert_eq!(json["stages"][0]["duration_ms"], 12);
        assert_eq!(json["total_duration_ms"], 12);
        assert_eq!(json["verdict"], "pass");
        assert_eq!(json["retry_count"], 0);
    }
}

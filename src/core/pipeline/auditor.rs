use anyhow::Result;
use tracing::{info, warn};

use crate::core::llm::{CallRequest, Purpose};

use super::state::{PipelineState, TaskType, Verdict};
use super::PipelineCtx;

const SYSTEM_BASE: &str = r#"You are a STRICT quality auditor for an AI agent system. You are a different model from the one that generated the code, providing adversarial review.

Review the original task, the plan, the generated code, and the execution result.

Respond with ONLY a JSON object:
{
    "verdict": "pass" or "fail",
    "feedback": "Specific explanation of what's wrong and exact fix needed (if fail), or brief confirmation of correctness (if pass)"
}

Be STRICT. Only pass if the output genuinely fulfills the task.

DO NOT FAIL for:
- Deprecation warnings in stderr (these are informational)
- pip install output in stderr (package installation messages)
- Missing "ALL ASSERTIONS PASSED" if the task is a project or shell invocation
- Minor formatting differences from the request
- Warnings that don't affect the actual output

ONLY FAIL for:
- Non-zero exit code WITH actual errors (not just warnings)
- Code that doesn't address the user's actual request
- Missing output files when files were expected
- Obvious logical errors in the output
- Tracebacks indicating crashes"#;

/// Task-type-specific evaluation criteria appended to the base prompt.
fn criteria(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Code => {
            r#"
Evaluate:
1. Does the code actually accomplish what was asked?
2. Did execution succeed (exit code 0)?
3. Did all assert statements pass? Look for "ALL ASSERTIONS PASSED" in output.
4. Are there tracebacks or errors in stderr?
5. Is the output complete, not truncated?

FAIL if: non-zero exit code, any assertion failed, traceback present, output doesn't match request, obvious logical errors."#
        }
        TaskType::Automation => {
            r#"
Evaluate:
1. Did the automation run successfully (exit code 0)?
2. Were the expected results produced (scraped data, report content, monitored values)?
3. Did all validation assertions pass? Look for "ALL ASSERTIONS PASSED".
4. Were there connection errors or timeouts against the target sites/APIs?
5. Is the output/report format what the user asked for?

FAIL if: non-zero exit code, no results produced, assertion failures, unhandled connection errors."#
        }
        TaskType::Data => {
            r#"
Evaluate:
1. Does the analysis correctly address the user's question?
2. Did execution succeed (exit code 0)?
3. Did all data validation assertions pass? Look for "ALL ASSERTIONS PASSED".
4. Were output files (charts, CSVs) generated?
5. Are there tracebacks or errors?

FAIL if: non-zero exit code, assertion failures, no output files when expected, traceback present."#
        }
        TaskType::Project => {
            r#"
Evaluate:
1. Did the project command execute successfully (exit code 0)?
2. Were the correct parameters extracted and used (check the command for proper client name, file paths)?
3. Did the command produce expected output files?
4. Is the stdout output meaningful (not empty or error-only)?
5. Were there any errors or warnings that indicate failure?

NOTE: Project commands do NOT use Python assert statements. Do NOT look for "ALL ASSERTIONS PASSED".
Instead, check: exit code 0, expected files created, meaningful output in stdout.

FAIL if: non-zero exit code, wrong parameters used, no output files when expected, error messages in output."#
        }
        TaskType::UiDesign => {
            r#"
Evaluate:
1. Was an HTML file generated?
2. Does the HTML contain proper structure (<!DOCTYPE html>, <html>, <head>, <body>)?
3. Does it include Tailwind CSS (CDN link present)?
4. Does the design address what the user asked for (correct layout, sections, content)?
5. Is it self-contained (no broken external dependencies)?

FAIL if: no HTML file generated, broken HTML structure, missing Tailwind CSS, doesn't match the requested design."#
        }
        TaskType::File => {
            r#"
Evaluate:
1. Were output files generated as expected?
2. Did execution succeed (exit code 0)?
3. Did file validation assertions pass?
4. Is the output in the correct format?

FAIL if: non-zero exit code, no output files, wrong format, assertion failures."#
        }
        TaskType::Frontend => {
            r#"
Evaluate:
1. Was an HTML file generated?
2. Does the HTML contain proper structure (<!DOCTYPE html>, <html>, <head>, <body>)?
3. Does it include Tailwind CSS (CDN link present)?
4. For React apps: are React, ReactDOM, and Babel CDN scripts included?
5. Does it implement the requested features (components, interactivity, data display)?
6. Is it self-contained (no broken external dependencies, all via CDN)?
7. Is it responsive (mobile-first breakpoints)?

FAIL if: no HTML file generated, broken HTML structure, missing Tailwind/React CDN, doesn't implement requested features."#
        }
    }
}

/// Infrastructure-failure signatures that retries cannot fix.
///
/// Deliberately conservative: "Permission denied" and "Connection refused"
/// are NOT in this set: they are frequently code-level errors (wrong
/// path, wrong port) that the audit-retry loop CAN fix.
const ENV_ERROR_SIGNATURES: &[(&str, &str)] = &[
    (
        "can't initialize sys standard streams",
        "Python stdin/stdout initialisation failed (daemon context)",
    ),
    ("Bad file descriptor", "Invalid file descriptor inherited from parent process"),
    ("No space left on device", "Disk full"),
    ("Name or service not known", "DNS resolution failed (no network access)"),
    (
        "Timed out after",
        "Execution timed out (increasing timeout or optimising the command may help)",
    ),
    (
        "timed out after",
        "Execution timed out (increasing timeout or optimising the command may help)",
    ),
    ("killed process group", "Process was killed due to timeout"),
];

/// Detect environment errors in an execution result. Returns a
/// human-readable description, or None if the failure looks like a code
/// issue suitable for the retry loop.
pub fn detect_environment_error(execution_result: &str) -> Option<&'static str> {
    if execution_result.is_empty() {
        return None;
    }
    ENV_ERROR_SIGNATURES
        .iter()
        .find(|(signature, _)| execution_result.contains(signature))
        .map(|(_, description)| *description)
}

/// Extract a JSON object containing "verdict" from text with extra
/// content, using balanced-brace matching so nested braces inside
/// feedback strings don't break parsing.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let bytes: Vec<char> = text.chars().collect();
    let mut depth = 0i32;
    let mut start: Option<usize> = None;

    for (i, ch) in bytes.iter().enumerate() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        let candidate: String = bytes[s..=i].iter().collect();
                        if candidate.contains("\"verdict\"") {
                            if let Ok(parsed) =
                                serde_json::from_str::<serde_json::Value>(&candidate)
                            {
                                if parsed.get("verdict").is_some() {
                                    return Some(parsed);
                                }
                            }
                        }
                        start = None;
                    }
                } else if depth < 0 {
                    // Stray closing brace: reset instead of poisoning the
                    // rest of the scan.
                    depth = 0;
                    start = None;
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the auditor's response into (verdict, feedback). A response that
/// yields no parseable verdict is a FAIL; ambiguity must never let bad
/// output through.
pub fn parse_audit_response(response: &str) -> (Verdict, String) {
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(response.trim()) {
        let verdict = match parsed.get("verdict").and_then(|v| v.as_str()) {
            Some("pass") => Verdict::Pass,
            _ => Verdict::Fail,
        };
        let feedback = parsed
            .get("feedback")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        return (verdict, feedback);
    }

    if let Some(parsed) = extract_json(response) {
        let verdict = match parsed.get("verdict").and_then(|v| v.as_str()) {
            Some("pass") => Verdict::Pass,
            _ => Verdict::Fail,
        };
        let feedback = parsed
            .get("feedback")
            .and_then(|v| v.as_str())
            .unwrap_or(response)
            .to_string();
        return (verdict, feedback);
    }

    let head: String = response.chars().take(50).collect();
    if head.to_lowercase().contains("pass") {
        return (Verdict::Pass, response.to_string());
    }

    let excerpt: String = response.chars().take(300).collect();
    (
        Verdict::Fail,
        format!("Audit response was unparseable: {excerpt}"),
    )
}

/// Review the execution output against the original task.
///
/// Always routed to the remote high-capability model, a different model
/// from the generator, so the same model never approves its own work.
pub fn audit(ctx: &PipelineCtx, state: &mut PipelineState) -> Result<()> {
    // Environment-error short-circuit: infrastructure failures are not
    // fixable by regenerating code, so skip straight to delivery.
    if let Some(description) = detect_environment_error(&state.execution_result) {
        warn!(
            "Environment error detected for task {}, skipping code-level retry: {description}",
            state.task_id
        );
        state.audit_verdict = Some(Verdict::Fail);
        state.audit_feedback = format!(
            "ENVIRONMENT ERROR (not a code issue, retrying will not help): {description}"
        );
        state.retry_count = ctx.config.max_retries;
        return Ok(());
    }

    let system = format!("{SYSTEM_BASE}\n{}", criteria(state.task_type));

    let plan_excerpt: String = state.plan.chars().take(3000).collect();
    let code_excerpt: String = state.code.chars().take(5000).collect();
    let result_excerpt: String = state.execution_result.chars().take(5000).collect();

    let mut prompt = format!(
        "Original task: {}\n\nTask type: {}\n\nPlan:\n{plan_excerpt}\n\nGenerated code:\n{code_excerpt}\n\nExecution result:\n{result_excerpt}",
        state.message,
        state.task_type.as_str(),
    );
    if state.task_type == TaskType::Project && !state.extracted_params.is_empty() {
        prompt.push_str(&format!(
            "\n\nExtracted parameters: {:?}",
            state.extracted_params
        ));
    }

    let response = ctx.gateway.call(
        CallRequest::new(Purpose::Audit, &prompt, &system)
            .max_tokens(800)
            .temperature(0.0),
    )?;

    let (verdict, feedback) = parse_audit_response(&response);

    // Any non-pass verdict (including unexpected values) consumes a retry,
    // so the loop always terminates.
    if verdict != Verdict::Pass {
        state.retry_count += 1;
    }

    info!(
        "Audit for task {}: {} (retry {}, type={})",
        state.task_id,
        verdict.as_str(),
        state.retry_count,
        state.task_type.as_str()
    );

    state.audit_verdict = Some(verdict);
    state.audit_feedback = feedback;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_json_verdict_parses() {
        let (verdict, feedback) =
            parse_audit_response(r#"{"verdict": "pass", "feedback": "looks correct"}"#);
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(feedback, "looks correct");
    }

    #[test]
    fn json_with_surrounding_prose_is_extracted() {
        let response = "Here is my review:\n{\"verdict\": \"fail\", \"feedback\": \"missing output file {chart.png}\"}\nThanks.";
        let (verdict, feedback) = parse_audit_response(response);
        assert_eq!(verdict, Verdict::Fail);
        assert!(feedback.contains("missing output file"));
    }

    #[test]
    fn nested_braces_in_feedback_do_not_break_extraction() {
        let response = r#"{"verdict": "fail", "feedback": "dict literal {a: {b: 1}} is wrong"}"#;
        let parsed = extract_json(response).unwrap();
        assert_eq!(parsed["verdict"], "fail");
    }

    #[test]
    fn stray_closing_brace_does_not_poison_the_scan() {
        let response = "} noise } {\"verdict\": \"pass\", \"feedback\": \"ok\"}";
        let parsed = extract_json(response).unwrap();
        assert_eq!(parsed["verdict"], "pass");
    }

    #[test]
    fn keyword_fallback_accepts_leading_pass() {
        let (verdict, _) = parse_audit_response("PASS - the output matches the request");
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn unparseable_response_defaults_to_fail() {
        let (verdict, feedback) = parse_audit_response("the model rambled with no verdict");
        assert_eq!(verdict, Verdict::Fail);
        assert!(feedback.contains("unparseable"));
    }

    #[test]
    fn unexpected_verdict_value_is_fail() {
        let (verdict, _) = parse_audit_response(r#"{"verdict": "partial", "feedback": "hmm"}"#);
        assert_eq!(verdict, Verdict::Fail);
    }

    #[test]
    fn every_task_type_gets_its_own_criteria() {
        let all = [
            TaskType::Code,
            TaskType::Automation,
            TaskType::Data,
            TaskType::File,
            TaskType::Project,
            TaskType::UiDesign,
            TaskType::Frontend,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                assert_ne!(criteria(*a), criteria(*b), "{a:?} and {b:?} share criteria");
            }
        }
        // Automation audits connection behaviour, not just code shape.
        assert!(criteria(TaskType::Automation).contains("connection errors"));
        assert!(!criteria(TaskType::Code).contains("connection errors"));
    }

    #[test]
    fn environment_errors_are_recognised() {
        for (text, expect) in [
            ("Execution: FAILED\nTimed out after 120s", true),
            ("Execution timed out after 120s", true),
            ("warning: killed process group 1234", true),
            ("OSError: No space left on device", true),
            ("OSError: Bad file descriptor", true),
            ("socket.gaierror: Name or service not known", true),
            ("can't initialize sys standard streams", true),
            ("ValueError: invalid literal", false),
            ("", false),
        ] {
            assert_eq!(
                detect_environment_error(text).is_some(),
                expect,
                "signature check failed for: {text}"
            );
        }
    }

    #[test]
    fn permission_and_connection_errors_stay_retryable() {
        // These are fixable by better code; adding them to the signature
        // set causes false positives that burn the retry budget.
        assert!(detect_environment_error("PermissionError: Permission denied").is_none());
        assert!(detect_environment_error("ConnectionRefusedError: Connection refused").is_none());
    }
}

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use tracing::{info, warn};

use crate::core::llm::{CallRequest, Purpose};
use crate::core::sandbox::exec::{run_code_with_auto_install, run_shell};
use crate::core::sandbox::{parse_import_error, ExecutionResult, Language};

use super::state::{PipelineState, TaskType};
use super::PipelineCtx;

/// Auto-install retry bounds: free-form code gets 2, registered project
/// scripts (whose dependency sets are known-good) get 5.
const CODE_INSTALL_RETRIES: u32 = 2;
const PROJECT_INSTALL_RETRIES: u32 = 5;

const CODE_GEN_SYSTEM: &str = r#"You are an expert programmer. Given a plan, write complete, working code.

Rules:
- Write ONLY the code, no explanations before or after
- Include all imports
- The code must be self-contained and runnable
- Save any output files to the current working directory
- Use descriptive filenames for any generated files
- For charts: save as PNG files using matplotlib with plt.savefig()
- Print a summary of what was created to stdout
- Include assert statements to verify your output is correct
- Print "ALL ASSERTIONS PASSED" if all checks succeed
- As the LAST line, print: ARTIFACTS: ["file1", "file2"] listing files you created
- Handle errors gracefully with try/except

SYSTEM ACCESS: You have full access. You can:
- pip install any library (import subprocess; subprocess.run(["pip3", "install", "package"]))
- Download files via requests, curl, wget
- Access the internet for APIs, web scraping, search
- Read/write files anywhere in the home directory
- Call Ollama at http://localhost:11434 for local AI inference
If a library isn't installed, install it as the first step of your script."#;

const ANALYSIS_SYSTEM: &str = r#"You are an expert data analyst. Given a plan and data file paths, write complete Python code.

Rules:
- Write ONLY the code, no explanations
- Use pandas for data processing
- Use matplotlib/seaborn for visualizations
- Save charts as PNG files in the current directory
- Print analysis results and summaries to stdout
- Include assert statements validating data at each step
- Print "ALL ASSERTIONS PASSED" after all validations
- As the LAST line, print: ARTIFACTS: ["file1", "file2"] listing files you created
- Handle missing data and encoding issues gracefully"#;

const SHELL_GEN_SYSTEM: &str = r#"You are an expert at writing shell scripts to orchestrate existing projects.

Given a plan that references existing project commands, write a bash script that:
- Activates the virtual environment if specified
- Changes to the correct working directory
- Runs the commands in the correct order with ALL parameters filled in
- Captures and prints output/results
- Handles errors (exit on first failure)

CRITICAL RULES:
1. All parameters like {file}, {client}, etc. MUST be replaced with actual values.
   Do NOT leave any {placeholder} syntax in the script.
2. Use ONLY the commands provided in "Commands with parameters filled in" below.
   Do NOT discover, guess, or invent other entry points or scripts in the project directory.
   Do NOT use ls, find, or grep to locate alternative scripts.
   The provided commands are the ONLY correct way to invoke this project.
3. Do NOT install packages or write new Python code.

Write ONLY the bash script. Start with #!/bin/bash and set -e."#;

const UI_DESIGN_EXEC_SYSTEM: &str = r#"You are an expert front-end developer creating production-quality UI designs.

Write a COMPLETE, self-contained HTML file. Rules:
- Single .html file with all CSS/JS inline or via CDN
- Use Tailwind CSS via CDN: <script src="https://cdn.tailwindcss.com"></script>
- Use Chart.js via CDN if charts/graphs are needed
- Responsive design (mobile-first)
- Professional color scheme and typography
- Include realistic placeholder content
- Add smooth transitions and hover effects
- Write ONLY the HTML code, nothing else
- The file must be self-contained and open directly in any browser"#;

const FRONTEND_EXEC_SYSTEM: &str = r#"You are an expert frontend engineer creating production-quality web applications.

Write a COMPLETE, self-contained HTML file with embedded React/JavaScript. Rules:
- Single .html file - ALL code inline or via CDN
- Use Tailwind CSS via CDN: <script src="https://cdn.tailwindcss.com"></script>
- For React apps: use babel-standalone CDN for in-browser JSX:
  <script src="https://unpkg.com/react@18/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@18/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/@babel/standalone/babel.min.js"></script>
  <script type="text/babel">// Your React code here</script>
- Use Chart.js CDN if charts/graphs are needed
- Responsive design (mobile-first, all breakpoints)
- Professional color scheme, typography, and spacing
- Include realistic placeholder data and content
- Add smooth transitions, hover effects, and micro-interactions
- Write ONLY the HTML code, nothing else
- The file must be self-contained and open directly in any browser"#;

/// Extract code from markdown fences. Returns the longest block found.
///
/// Line-based so backticks inside template literals or strings don't
/// prematurely close the block: a closing fence must be a line whose
/// stripped content is exactly ```.
pub fn strip_markdown_blocks(text: &str) -> String {
    let mut blocks: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut in_block = false;

    for line in text.lines() {
        let stripped = line.trim();
        if !in_block {
            if stripped.starts_with("```") {
                in_block = true;
                current.clear();
            }
        } else if stripped == "```" {
            blocks.push(current.join("\n"));
            in_block = false;
        } else {
            current.push(line);
        }
    }

    match blocks.into_iter().max_by_key(|b| b.len()) {
        Some(block) => block.trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// POSIX single-quote escaping for parameter values interpolated into
/// generated shell commands.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Estimate a timeout from task type and input size, clamped to the hard cap.
pub fn estimate_timeout(state: &PipelineState, base: u64, hard_cap: u64) -> u64 {
    let mut timeout = base;

    if state.task_type == TaskType::Data {
        for f in &state.files {
            if std::fs::metadata(f).map(|m| m.len() > 10_000_000).unwrap_or(false) {
                timeout = timeout.max(300);
            }
        }
    }
    if matches!(
        state.task_type,
        TaskType::Frontend | TaskType::UiDesign | TaskType::Automation
    ) {
        timeout = timeout.max(300);
    }

    timeout.min(hard_cap)
}

/// Choose the working directory: explicit state override, a home-relative
/// path mentioned in the plan or message, or the default outputs dir.
fn determine_working_dir(state: &PipelineState, home: &Path) -> Option<PathBuf> {
    if !state.working_dir.is_empty() {
        let wd = PathBuf::from(&state.working_dir);
        if wd.is_absolute() {
            return Some(wd);
        }
    }

    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| {
        Regex::new(r"(~/[\w/.\-]+|/home/\w+/[\w/.\-]+|/Users/\w+/[\w/.\-]+)").expect("static pattern")
    });

    for text in [&state.plan, &state.message] {
        if let Some(m) = regex.find(text) {
            let raw = m.as_str();
            let candidate = if let Some(rest) = raw.strip_prefix("~/") {
                home.join(rest)
            } else {
                PathBuf::from(raw)
            };
            // Only directories: paths with an extension are output files.
            if candidate.starts_with(home)
                && (candidate.extension().is_none() || candidate.is_dir())
            {
                return Some(candidate);
            }
        }
    }
    None
}

/// Render an ExecutionResult for the auditor and deliverer.
pub fn format_result(result: &ExecutionResult) -> String {
    let mut parts = vec![format!(
        "Execution: {} (exit code {})",
        if result.success { "SUCCESS" } else { "FAILED" },
        result.return_code
    )];
    if !result.stdout.is_empty() {
        parts.push(format!("Output:\n{}", result.stdout));
    }
    if !result.traceback.is_empty() {
        parts.push(format!("Traceback:\n{}", result.traceback));
    } else if !result.stderr.is_empty() {
        parts.push(format!("Stderr:\n{}", result.stderr));
    }
    if !result.files_created.is_empty() {
        let names: Vec<&str> = result
            .files_created
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        parts.push(format!("Files created: {}", names.join(", ")));
    }
    if result.timed_out {
        parts.push("WARNING: Execution timed out".to_string());
    }
    parts.join("\n")
}

/// Generate and execute code or shell commands according to the plan.
pub fn execute(ctx: &PipelineCtx, state: &mut PipelineState) -> Result<()> {
    match state.task_type {
        TaskType::Project => execute_project(ctx, state),
        TaskType::UiDesign => execute_html(ctx, state, UI_DESIGN_EXEC_SYSTEM, "design"),
        TaskType::Frontend => execute_html(ctx, state, FRONTEND_EXEC_SYSTEM, "app"),
        _ => execute_code(ctx, state),
    }
}

// ── Project path ─────────────────────────────────────────────────────

/// Use the model to extract `{placeholder}` values from the user message.
fn extract_params(ctx: &PipelineCtx, state: &PipelineState) -> Vec<(String, String)> {
    let Some(project) = &state.project else {
        return Vec::new();
    };
    let placeholders = project.placeholders();
    if placeholders.is_empty() {
        return Vec::new();
    }

    let files: Vec<String> = state.files.iter().map(|f| f.display().to_string()).collect();
    let prompt = format!(
        r#"Extract parameter values from the user's message for a project command.

Parameters needed: {}

User message: {}

Uploaded files: {}

Rules:
- For "file": use the exact uploaded file path if one exists
- For "client": extract the company/client name from the message
- For other parameters: extract from context if possible
- Return ONLY a JSON object with parameter names as keys

Respond with ONLY valid JSON, e.g.: {{"client": "Acme Corp", "file": "/path/to/file.xlsx"}}"#,
        placeholders.join(", "),
        state.message,
        if files.is_empty() {
            "None".to_string()
        } else {
            files.join(", ")
        }
    );

    let parsed = ctx
        .gateway
        .call(CallRequest::new(Purpose::General, &prompt, "").max_tokens(200))
        .ok()
        .and_then(|response| {
            let cleaned = strip_markdown_blocks(&response);
            serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(cleaned.trim()).ok()
        });

    match parsed {
        Some(map) => {
            let params: Vec<(String, String)> = map
                .into_iter()
                .map(|(k, v)| {
                    let value = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, value)
                })
                .collect();
            info!("Extracted parameters: {params:?}");
            params
        }
        None => {
            warn!("Failed to parse parameter extraction");
            // Fallback: auto-detect the file parameter from uploads.
            if placeholders.contains(&"file".to_string()) {
                if let Some(first) = state.files.first() {
                    return vec![("file".to_string(), first.display().to_string())];
                }
            }
            Vec::new()
        }
    }
}

/// Install project dependencies before the first execution attempt.
/// A failure is logged but not fatal; deps may already be present.
fn bootstrap_project_deps(
    ctx: &PipelineCtx,
    state: &PipelineState,
    project_path: &Path,
    venv: Option<&str>,
) -> Option<String> {
    let req_file = project_path.join("requirements.txt");
    if !req_file.exists() {
        return None;
    }
    let pip = match venv {
        Some(venv) => format!("{venv}/bin/pip"),
        None => "pip3".to_string(),
    };

    info!("Bootstrapping project dependencies from {}", req_file.display());
    let result = run_shell(
        &format!("{pip} install -r {} --quiet", req_file.display()),
        project_path,
        Some(120),
        venv,
        &[],
        &state.task_id,
        &ctx.config,
    );
    if !result.success {
        let head: String = result.stderr.chars().take(300).collect();
        warn!("Dependency bootstrap failed: {head}");
        let excerpt: String = result.stderr.chars().take(200).collect();
        return Some(format!("Failed to install dependencies: {excerpt}"));
    }
    None
}

fn fail_state(state: &mut PipelineState, reason: &str) {
    state.code = String::new();
    state.execution_result = format!("Execution: FAILED\nErrors:\n{reason}");
    state.artifacts = Vec::new();
}

fn execute_project(ctx: &PipelineCtx, state: &mut PipelineState) -> Result<()> {
    let Some(project) = state.project.clone() else {
        fail_state(state, "No project configuration found");
        return Ok(());
    };
    let project_path = PathBuf::from(&project.path);
    if project.path.is_empty() {
        fail_state(state, "Project path is not configured in the registry");
        return Ok(());
    }
    if !project_path.exists() {
        fail_state(
            state,
            &format!("Project directory not found: {}", project.path),
        );
        return Ok(());
    }

    let venv = project.venv.as_deref();

    if state.retry_count == 0 {
        if let Some(err) = bootstrap_project_deps(ctx, state, &project_path, venv) {
            // Keep going: the project may still run on pre-installed deps.
            warn!("Dependency bootstrap failed for {}: {err}", project.name);
        }
    }

    // Parameters before script generation, so the model sees filled commands.
    let params = extract_params(ctx, state);
    let filled_commands: Vec<(String, String)> = project
        .commands
        .iter()
        .map(|(name, cmd)| {
            let mut filled = cmd.clone();
            for (key, value) in &params {
                filled = filled.replace(&format!("{{{key}}}"), &shell_quote(value));
            }
            (name.clone(), filled)
        })
        .collect();

    let mut prompt = format!(
        "Plan:\n{}\n\nOriginal task: {}\n\nProject path: {}\nAvailable commands (raw templates): {:?}\nExtracted parameters: {:?}\nCommands with parameters filled in: {:?}\nVenv path: {}\n\nIMPORTANT: Use the filled-in commands above. Do NOT leave {{file}} or {{client}} as placeholders.",
        state.plan,
        state.message,
        project.path,
        project.commands,
        params,
        filled_commands,
        venv.unwrap_or("None"),
    );
    if !state.files.is_empty() {
        prompt.push_str("\n\nUploaded files (use these exact paths):");
        for f in &state.files {
            prompt.push_str(&format!("\n- {}", f.display()));
        }
    }
    if state.retry_count > 0 && !state.audit_feedback.is_empty() {
        prompt.push_str(&format!(
            "\n\n--- Previous attempt failed ---\n{}",
            state.audit_feedback
        ));
    }

    let code = ctx.gateway.call(
        CallRequest::new(Purpose::CodeGen, &prompt, SHELL_GEN_SYSTEM)
            .max_tokens(2000)
            .thinking(true),
    )?;
    let code = strip_markdown_blocks(&code);
    if code.trim().is_empty() {
        fail_state(state, "Shell script generation returned empty");
        state.extracted_params = params;
        return Ok(());
    }

    // Randomized heredoc delimiter so generated content cannot collide
    // with it and terminate the script early.
    let delimiter = format!(
        "FOREMAN_EOF_{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );
    let command = format!("bash -e /dev/stdin <<'{delimiter}'\n{code}\n{delimiter}");

    let mut result = run_shell(
        &command,
        &project_path,
        Some(project.timeout),
        venv,
        &[],
        &state.task_id,
        &ctx.config,
    );

    // Auto-install on ImportError, mirroring the free-form path.
    if !result.success {
        let error_text = if result.traceback.is_empty() {
            result.stderr.clone()
        } else {
            result.traceback.clone()
        };
        if let Some(missing) = parse_import_error(&error_text) {
            info!("Project missing module '{missing}', attempting auto-install");
            let pip = match venv {
                Some(venv) => format!("{venv}/bin/pip"),
                None => "pip3".to_string(),
            };
            let mut installed = 0;
            while installed < PROJECT_INSTALL_RETRIES {
                let install = run_shell(
                    &format!("{pip} install {missing}"),
                    &project_path,
                    Some(120),
                    venv,
                    &[],
                    &state.task_id,
                    &ctx.config,
                );
                if !install.success {
                    break;
                }
                state.auto_installed_packages.push(missing.clone());
                result = run_shell(
                    &command,
                    &project_path,
                    Some(project.timeout),
                    venv,
                    &[],
                    &state.task_id,
                    &ctx.config,
                );
                installed += 1;
                if result.success {
                    break;
                }
                let error_text = if result.traceback.is_empty() {
                    result.stderr.clone()
                } else {
                    result.traceback.clone()
                };
                match parse_import_error(&error_text) {
                    Some(next) => {
                        info!("Project still missing '{next}', continuing auto-install");
                    }
                    None => break,
                }
            }
        }
    }

    state.code = code;
    state.execution_result = format_result(&result);
    state.execution_timed_out = result.timed_out;
    state.artifacts = result.files_created;
    state.extracted_params = params;
    state.working_dir = project.path.clone();
    Ok(())
}

// ── Free-form code path ──────────────────────────────────────────────

fn execute_code(ctx: &PipelineCtx, state: &mut PipelineState) -> Result<()> {
    let system = if matches!(state.task_type, TaskType::Data | TaskType::File) {
        ANALYSIS_SYSTEM
    } else {
        CODE_GEN_SYSTEM
    };

    let mut prompt = format!("Plan:\n{}\n\nOriginal task: {}", state.plan, state.message);

    if !state.files.is_empty() {
        prompt.push_str("\n\nAvailable files (use these exact paths):");
        for fpath in &state.files {
            prompt.push_str(&format!("\n- {}", fpath.display()));
            if fpath.exists() {
                if crate::core::files::is_data_file(fpath) {
                    prompt.push_str(
                        "\n  (Data file - process locally with a script. DO NOT load into context)",
                    );
                } else if matches!(
                    fpath.extension().and_then(|e| e.to_str()),
                    Some("txt" | "py" | "js" | "md" | "html" | "css")
                ) {
                    let content = crate::core::files::get_file_content(fpath, 3000);
                    let preview: String = content.chars().take(1000).collect();
                    prompt.push_str(&format!("\n  Preview:\n{preview}"));
                }
            }
        }
    }

    if state.retry_count > 0 && !state.audit_feedback.is_empty() {
        prompt.push_str(&format!(
            "\n\n--- PREVIOUS CODE FAILED. Fix these issues ---\n{}",
            state.audit_feedback
        ));
        if !state.code.is_empty() {
            prompt.push_str(&format!("\n\n--- Previous code ---\n{}", state.code));
        }
    }

    let code = ctx.gateway.call(
        CallRequest::new(Purpose::CodeGen, &prompt, system)
            .max_tokens(8192)
            .thinking(true),
    )?;
    let code = strip_markdown_blocks(&code);
    if code.trim().is_empty() {
        fail_state(state, "Code generation returned empty output");
        return Ok(());
    }

    let timeout = estimate_timeout(
        state,
        ctx.config.execution_timeout,
        ctx.config.max_code_execution_timeout,
    );
    let working_dir = determine_working_dir(state, &ctx.config.host_home);

    let result = run_code_with_auto_install(
        &code,
        Language::Python,
        Some(timeout),
        working_dir.as_deref(),
        None,
        CODE_INSTALL_RETRIES,
        &state.task_id,
        &ctx.config,
    );

    state.code = code;
    state.execution_result = format_result(&result);
    state.execution_timed_out = result.timed_out;
    state.artifacts = result.files_created;
    state.auto_installed_packages = result.auto_installed;
    state.working_dir = working_dir
        .unwrap_or_else(|| ctx.config.outputs_dir.clone())
        .display()
        .to_string();
    Ok(())
}

// ── Direct HTML paths (ui_design / frontend) ─────────────────────────

fn execute_html(
    ctx: &PipelineCtx,
    state: &mut PipelineState,
    system: &str,
    default_stem: &str,
) -> Result<()> {
    let mut prompt = format!("Plan:\n{}\n\nOriginal task: {}", state.plan, state.message);

    if !state.files.is_empty() {
        prompt.push_str("\n\nReference files provided:");
        for fpath in &state.files {
            prompt.push_str(&format!("\n- {}", fpath.display()));
            if fpath.exists()
                && matches!(
                    fpath.extension().and_then(|e| e.to_str()),
                    Some("csv" | "txt" | "json" | "html" | "js" | "css")
                )
            {
                let content = crate::core::files::get_file_content(fpath, 3000);
                let preview: String = content.chars().take(1000).collect();
                prompt.push_str(&format!("\n  Content preview:\n{preview}"));
            }
        }
    }

    if state.retry_count > 0 && !state.audit_feedback.is_empty() {
        prompt.push_str(&format!(
            "\n\n--- PREVIOUS ATTEMPT FAILED ---\n{}",
            state.audit_feedback
        ));
        if !state.code.is_empty() {
            let previous: String = state.code.chars().take(5000).collect();
            prompt.push_str(&format!("\n\n--- Previous HTML ---\n{previous}"));
        }
    }

    let max_tokens = if state.task_type == TaskType::Frontend {
        16_000
    } else {
        8192
    };
    let code = ctx.gateway.call(
        CallRequest::new(Purpose::CodeGen, &prompt, system)
            .max_tokens(max_tokens)
            .thinking(true),
    )?;
    let code = strip_markdown_blocks(&code);
    if code.trim().is_empty() {
        fail_state(state, "HTML generation returned empty");
        return Ok(());
    }

    // Derive a readable filename from the message; the uuid suffix keeps
    // concurrent tasks from racing on the same name.
    let words: String = state
        .message
        .chars()
        .map(|c| if c.is_alphanumeric() || c == ' ' { c } else { ' ' })
        .collect();
    let base: String = words
        .split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase();
    let base = if base.is_empty() {
        default_stem.to_string()
    } else {
        base
    };
    let filename = format!(
        "{base}_{}.html",
        &uuid::Uuid::new_v4().simple().to_string()[..6]
    );
    let output_path = ctx.config.outputs_dir.join(&filename);

    std::fs::create_dir_all(&ctx.config.outputs_dir)?;
    std::fs::write(&output_path, &code)?;
    info!("HTML output saved: {} ({} bytes)", output_path.display(), code.len());

    state.execution_result = format!(
        "Execution: SUCCESS (exit code 0)\nOutput:\nHTML generated: {filename} ({} chars)\nFiles created: {filename}",
        code.len()
    );
    state.code = code;
    state.artifacts = vec![output_path];
    state.working_dir = ctx.config.outputs_dir.display().to_string();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_fences_are_stripped_to_the_longest_block() {
        let text = "Here is the code:\n```python\nprint('short')\n```\nand also\n```python\nimport os\nprint('this one is longer')\nprint('much longer')\n```\ndone";
        let code = strip_markdown_blocks(text);
        assert!(code.contains("much longer"));
        assert!(!code.contains("short"));
        assert!(!code.contains("```"));
    }

    #[test]
    fn unfenced_text_passes_through_trimmed() {
        assert_eq!(strip_markdown_blocks("  print(1)\n"), "print(1)");
    }

    #[test]
    fn backticks_inside_strings_do_not_close_the_block() {
        let text = "```js\nconst s = `template ``` inside`;\nconsole.log(s);\n```";
        let code = strip_markdown_blocks(text);
        assert!(code.contains("console.log"));
    }

    #[test]
    fn fenced_json_equals_raw_json_after_stripping() {
        let raw = r#"{"client": "Acme", "file": "/tmp/x.xlsx"}"#;
        let fenced = format!("```json\n{raw}\n```");
        assert_eq!(strip_markdown_blocks(&fenced), raw);
        assert_eq!(strip_markdown_blocks(raw), raw);
    }

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("Light & Wonder"), "'Light & Wonder'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        // A quoted value cannot break out of its quoting.
        let quoted = shell_quote("'; rm -rf ~; '");
        assert!(quoted.starts_with('\''));
        assert!(quoted.ends_with('\''));
    }

    #[test]
    fn timeout_estimation_respects_the_hard_cap() {
        let mut state = PipelineState::default();
        state.task_type = TaskType::Frontend;
        assert_eq!(estimate_timeout(&state, 120, 600), 300);
        assert_eq!(estimate_timeout(&state, 120, 200), 200);

        state.task_type = TaskType::Code;
        assert_eq!(estimate_timeout(&state, 120, 600), 120);
    }

    #[test]
    fn working_dir_honors_absolute_state_override() {
        let mut state = PipelineState::default();
        state.working_dir = "/home/op/projects/x".to_string();
        let wd = determine_working_dir(&state, Path::new("/home/op"));
        assert_eq!(wd, Some(PathBuf::from("/home/op/projects/x")));
    }

    #[test]
    fn working_dir_extracted_from_message_must_be_under_home() {
        let mut state = PipelineState::default();
        state.message = "put the results in ~/reports/2026".to_string();
        let wd = determine_working_dir(&state, Path::new("/home/op"));
        assert_eq!(wd, Some(PathBuf::from("/home/op/reports/2026")));

        let mut state = PipelineState::default();
        state.message = "write to /etc/cron.d please".to_string();
        assert_eq!(determine_working_dir(&state, Path::new("/home/op")), None);
    }

    #[test]
    fn file_like_paths_are_not_working_dirs() {
        let mut state = PipelineState::default();
        state.message = "save it as ~/reports/out.csv".to_string();
        assert_eq!(determine_working_dir(&state, Path::new("/home/op")), None);
    }

    #[test]
    fn format_result_prefers_traceback_over_stderr() {
        let result = ExecutionResult {
            success: false,
            stdout: "partial".to_string(),
            stderr: "noise\nTraceback (most recent call last):\nValueError".to_string(),
            traceback: "Traceback (most recent call last):\nValueError".to_string(),
            return_code: 1,
            ..Default::default()
        };
        let text = format_result(&result);
        assert!(text.contains("Execution: FAILED (exit code 1)"));
        assert!(text.contains("Traceback:"));
        assert!(!text.contains("Stderr:"));
    }

    #[test]
    fn format_result_lists_created_files_and_timeout() {
        let result = ExecutionResult {
            success: false,
            timed_out: true,
            files_created: vec![PathBuf::from("/x/chart.png")],
            return_code: -1,
            ..Default::default()
        };
        let text = format_result(&result);
        assert!(text.contains("Files created: chart.png"));
        assert!(text.contains("WARNING: Execution timed out"));
    }

    #[test]
    fn code_gen_prompts_require_artifact_declaration_and_sentinel() {
        assert!(CODE_GEN_SYSTEM.contains("ARTIFACTS: ["));
        assert!(CODE_GEN_SYSTEM.contains("ALL ASSERTIONS PASSED"));
        assert!(ANALYSIS_SYSTEM.contains("ARTIFACTS: ["));
        assert!(ANALYSIS_SYSTEM.contains("ALL ASSERTIONS PASSED"));
    }

    #[test]
    fn shell_gen_prompt_forbids_placeholder_leakage() {
        assert!(SHELL_GEN_SYSTEM.contains("Do NOT leave any {placeholder}"));
        assert!(SHELL_GEN_SYSTEM.contains("set -e"));
    }
}

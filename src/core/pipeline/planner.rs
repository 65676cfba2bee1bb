use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::core::files::{format_metadata_for_prompt, get_file_content, get_file_metadata, is_data_file};
use crate::core::llm::{CallRequest, Complexity, Purpose};

use super::state::{PipelineState, TaskType};
use super::PipelineCtx;

/// Char cap for the coding-standards excerpt injected into code prompts.
const CODING_STANDARDS_CAP: usize = 4000;

/// Per-file char cap when injecting project source files.
const PROJECT_FILE_CAP: usize = 4000;

/// Max project source files considered for content injection.
const PROJECT_FILE_LIMIT: usize = 40;

pub const TDD_INSTRUCTION: &str = r#"
CRITICAL: Write assert statements in your code to verify correctness.
- For data tasks: assert row counts, column names, value ranges after each operation
- For code tasks: include at least 2 assert statements validating output
- For file tasks: assert output files exist and are non-empty
- Print "ALL ASSERTIONS PASSED" at the end if everything succeeds
These assertions act as built-in tests. If any fail, the auditor will catch it."#;

pub const CAPABILITIES_BLOCK: &str = r#"
SYSTEM CAPABILITIES (you have full access):
- INTERNET: You have full internet access via requests, beautifulsoup4, duckduckgo-search
  - Scrape websites, call REST APIs, download files
- RUNTIME INSTALLS: You can pip install any library at runtime
  - subprocess.run(["pip3", "install", "package_name"], check=True)
  - Always install before importing if a library might not be present
- LOCAL AI MODELS (Ollama at http://localhost:11434):
  - Generate: requests.post("http://localhost:11434/api/generate", json={"model": "...", "prompt": "..."})
  - Use local models when instructed or for offline/private processing
- FILESYSTEM: Full read/write access to the entire home directory
- SHELL: Can run any bash command - git, npm, docker, etc.

OUTPUT DECLARATION (CRITICAL):
- As the LAST line of output, print the files you produced as:
  ARTIFACTS: ["file1.png", "file2.csv"]
- Use paths relative to the working directory. Print it exactly once.

BIG DATA RULES (CRITICAL for large datasets):
- If the user uploads or references a large dataset (thousands+ rows), NEVER load raw data into context
- Write a local script using pandas or duckdb to process the file locally
- Extract insights, compute statistics, and print ONLY the summary to stdout
- Always use openpyxl engine for Excel files: pd.read_excel(path, engine="openpyxl")
"#;

const PROJECT_SYSTEM: &str = r#"You are an expert at orchestrating existing software projects.

{project_context}

Your job is to create a plan that uses the project's EXISTING commands.
Do NOT write new code from scratch. Use the commands listed above.

PARAMETER EXTRACTION (CRITICAL):
The project commands use placeholder parameters like {file}, {client}, {keyword}, etc.
You MUST extract these values from the user's message and the uploaded file paths.
- If the user mentions a client/company name, that is the {client} parameter.
- If uploaded files are listed, use the EXACT file path as the {file} parameter.
- If you cannot determine a required parameter, state clearly what is missing.
"#;

const PROJECT_SYSTEM_TAIL: &str = r#"
Your plan must:
1. List the extracted parameters and their values
2. Identify which command(s) to run and in what order (with parameters filled in)
3. Specify any prerequisites (venv, env vars, running services)
4. Describe what output to expect

Output a clear numbered plan. Each step should specify the exact shell command to run with ALL parameters filled in."#;

const CODE_SYSTEM: &str = r#"You are an expert software architect and developer. Given a task, create a precise execution plan.

Your plan must include:
1. What language/framework to use
2. File structure (if multi-file)
3. Step-by-step implementation details
4. Expected output format
5. Assert statements to verify correctness
{tdd}
Be specific. Write the plan so a code generator can follow it exactly.
Output the plan in clear numbered steps."#;

const DATA_SYSTEM: &str = r#"You are a data analysis expert. Given a task and data file info, create a precise analysis plan.

Your plan must include:
1. What libraries to use (pandas, duckdb, matplotlib, etc.)
2. Data loading and cleaning steps
3. Analysis operations with specific column references
4. Output format (charts, tables, summary text)
5. Assert statements to verify data integrity at each step
{tdd}
Be specific about column names if file content is provided."#;

const FILE_SYSTEM: &str = r#"You are a file processing expert. Given a task, create a precise file transformation plan.

Your plan must include:
1. Input file format detection
2. Transformation steps
3. Output file format and naming
4. Assert statements verifying output file exists and has correct format
{tdd}"#;

const AUTOMATION_SYSTEM: &str = r#"You are an automation expert. Given a task, create a precise automation plan.

Your plan must include:
1. What to automate (scraping, API calls, etc.)
2. Required libraries (install with pip if needed)
3. Step-by-step process
4. Output/report format
5. Error handling and retry strategy
6. Assert statements validating results
{tdd}"#;

const UI_DESIGN_SYSTEM: &str = r#"You are an expert UI/UX designer and front-end developer.
Given a task, create a plan for generating a self-contained HTML file.

Your plan must include:
1. Layout structure (header, hero, sections, footer)
2. Visual design decisions (color scheme, typography, spacing)
3. Components to include (cards, charts, tables, navigation, forms)
4. Responsive design considerations (mobile-first breakpoints)
5. Technology: single HTML file using Tailwind CSS (CDN), Chart.js if charts needed, inline JavaScript
{tdd}
The output MUST be a single self-contained .html file that opens directly in a browser.
Use Tailwind CSS via CDN link, not npm. All styles and scripts inline.
Be specific about exact Tailwind classes and layout decisions."#;

const FRONTEND_SYSTEM: &str = r#"You are an expert frontend engineer creating production-quality web applications.

Given a task, create a detailed implementation plan.

Your plan must include:
1. Application architecture (components, data flow, state management)
2. Technology stack decision:
   - Simple one-page: single HTML + Tailwind CSS CDN + Chart.js
   - Complex interactive: React via CDN (babel-standalone) + Tailwind CDN in a single HTML
3. Component hierarchy and layout structure
4. Responsive design breakpoints (mobile-first)
5. Data handling (realistic placeholders, API mocking if needed)
6. Animations, transitions, and micro-interactions
7. Accessibility considerations
{tdd}
Output MUST be self-contained and openable directly in any browser.
For React: use babel-standalone CDN for JSX transformation in-browser.
Be specific about exact component structure and Tailwind classes."#;

/// Build the system prompt for a task type.
fn system_prompt(ctx: &PipelineCtx, state: &PipelineState) -> String {
    let base = match state.task_type {
        TaskType::Project => {
            let project_context = state
                .project
                .as_ref()
                .map(|p| p.context())
                .unwrap_or_else(|| "No project context available.".to_string());
            let mut system = PROJECT_SYSTEM.replace("{project_context}", &project_context);
            system.push_str(CAPABILITIES_BLOCK);
            system.push_str(PROJECT_SYSTEM_TAIL);
            return system;
        }
        TaskType::Frontend => FRONTEND_SYSTEM,
        TaskType::UiDesign => UI_DESIGN_SYSTEM,
        TaskType::Data => DATA_SYSTEM,
        TaskType::File => FILE_SYSTEM,
        TaskType::Automation => AUTOMATION_SYSTEM,
        TaskType::Code => CODE_SYSTEM,
    };
    let mut system = base.replace("{tdd}", TDD_INSTRUCTION);
    system.push_str(CAPABILITIES_BLOCK);

    // Code-producing types get the house coding standards, char-capped.
    if state.task_type.is_code_producing() {
        if let Ok(standards) = std::fs::read_to_string(&ctx.config.coding_standards_path) {
            let excerpt: String = standards.chars().take(CODING_STANDARDS_CAP).collect();
            system.push_str("\n\nCODING STANDARDS:\n");
            system.push_str(&excerpt);
        }
    }
    system
}

/// List source files of a project tree (names only, bounded).
fn project_source_files(path: &Path, limit: usize) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let p = entry.path();
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if p.is_dir() {
                if !name.starts_with('.') && name != "node_modules" && name != "venv" && name != "__pycache__" {
                    stack.push(p);
                }
            } else if matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("py" | "js" | "ts" | "sh" | "rs")
            ) {
                out.push(p);
                if out.len() > limit {
                    return out;
                }
            }
        }
    }
    out
}

/// For modest project trees, ask the model to pick 3-5 relevant files and
/// inject their content. On any parse trouble, fall back to the first few.
fn inject_project_files(ctx: &PipelineCtx, state: &PipelineState, prompt: &mut String) {
    let Some(project) = &state.project else { return };
    let sources = project_source_files(Path::new(&project.path), PROJECT_FILE_LIMIT);
    if sources.is_empty() || sources.len() > PROJECT_FILE_LIMIT {
        return;
    }

    let listing: Vec<String> = sources
        .iter()
        .map(|p| p.strip_prefix(&project.path).unwrap_or(p).display().to_string())
        .collect();
    let pick_prompt = format!(
        "Task: {}\n\nProject files:\n{}\n\nPick the 3-5 files most relevant to this task. \
         Respond with ONLY a JSON array of file paths from the list.",
        state.message,
        listing.join("\n")
    );
    let picked: Vec<String> = ctx
        .gateway
        .call(
            CallRequest::new(Purpose::Plan, &pick_prompt, "")
                .complexity(Complexity::Low)
                .max_tokens(200),
        )
        .ok()
        .and_then(|response| {
            serde_json::from_str::<Vec<String>>(
                crate::core::pipeline::executor::strip_markdown_blocks(&response).trim(),
            )
            .ok()
        })
        .unwrap_or_else(|| listing.iter().take(3).cloned().collect());

    for rel in picked.iter().take(5) {
        let full = Path::new(&project.path).join(rel);
        if !sources.contains(&full) {
            continue;
        }
        let content = get_file_content(&full, PROJECT_FILE_CAP);
        if !content.is_empty() {
            prompt.push_str(&format!("\n\n--- Project file: {rel} ---\n{content}"));
        }
    }
}

/// Create an execution plan for the classified task.
pub fn plan(ctx: &PipelineCtx, state: &mut PipelineState) -> Result<()> {
    let system = system_prompt(ctx, state);

    let mut prompt = format!("Task: {}", state.message);

    if !state.conversation_context.is_empty() {
        prompt.push_str(&format!(
            "\n\nCONVERSATION CONTEXT (recent history):\n{}",
            state.conversation_context
        ));
    }

    // Lessons learned from previous runs of this project.
    if let Some(project) = &state.project {
        if let Ok(lessons) = ctx.store.project_memory(&project.name, 5) {
            if !lessons.is_empty() {
                prompt.push_str("\n\nLESSONS LEARNED from previous runs of this project:");
                for lesson in &lessons {
                    prompt.push_str(&format!("\n- [{}] {}", lesson.outcome, lesson.lesson));
                }
            }
        }
        inject_project_files(ctx, state, &mut prompt);
    }

    // File context: metadata-only for big data files, content for the rest.
    for fpath in &state.files {
        if !fpath.exists() {
            continue;
        }
        if is_data_file(fpath) {
            let meta = get_file_metadata(fpath);
            if meta.row_count > ctx.config.big_data_row_threshold {
                prompt.push_str(&format!("\n\n{}", format_metadata_for_prompt(fpath)));
            } else {
                let content = get_file_content(fpath, 10_000);
                prompt.push_str(&format!(
                    "\n\n--- File: {} ({}, ~{} data rows) ---\n{content}",
                    meta.name, meta.size_human, meta.row_count
                ));
            }
        } else {
            let content = get_file_content(fpath, 10_000);
            prompt.push_str(&format!(
                "\n\n--- File: {} ---\n{content}",
                fpath.file_name().and_then(|n| n.to_str()).unwrap_or("?")
            ));
        }
    }

    // Retry: prepend what went wrong last time.
    if state.retry_count > 0 && !state.audit_feedback.is_empty() {
        prompt.push_str(&format!(
            "\n\n--- PREVIOUS ATTEMPT FAILED ---\n{}",
            state.audit_feedback
        ));
        if !state.execution_result.is_empty() {
            let excerpt: String = state.execution_result.chars().take(3000).collect();
            prompt.push_str(&format!("\n\nExecution output:\n{excerpt}"));
        }
        prompt.push_str("\nRevise the plan to fix these specific issues.");
    }

    // Deep reasoning only where it pays for itself.
    let use_thinking = matches!(
        state.task_type,
        TaskType::Frontend | TaskType::UiDesign | TaskType::Project
    );

    let response = ctx.gateway.call(
        CallRequest::new(Purpose::Plan, &prompt, &system)
            .max_tokens(3000)
            .thinking(use_thinking),
    )?;

    info!(
        "Plan created for task {} (type={}, {} chars, thinking={use_thinking})",
        state.task_id,
        state.task_type.as_str(),
        response.len()
    );
    state.plan = response;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::projects::Project;

    #[test]
    fn every_task_type_has_a_distinct_prompt_base() {
        let prompts = [
            CODE_SYSTEM,
            DATA_SYSTEM,
            FILE_SYSTEM,
            AUTOMATION_SYSTEM,
            UI_DESIGN_SYSTEM,
            FRONTEND_SYSTEM,
            PROJECT_SYSTEM,
        ];
        for (i, a) in prompts.iter().enumerate() {
            for b in prompts.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn capabilities_block_instructs_artifact_declaration() {
        assert!(CAPABILITIES_BLOCK.contains("ARTIFACTS: ["));
    }

    #[test]
    fn tdd_instruction_carries_the_success_sentinel() {
        assert!(TDD_INSTRUCTION.contains("ALL ASSERTIONS PASSED"));
    }

    #[test]
    fn project_prompt_embeds_project_context() {
        let project = Project {
            name: "scraper".to_string(),
            path: "/tmp/none".to_string(),
            description: "scrapes".to_string(),
            ..Default::default()
        };
        let context = project.context();
        let system = PROJECT_SYSTEM.replace("{project_context}", &context);
        assert!(system.contains("EXISTING PROJECT AVAILABLE: scraper"));
        assert!(system.contains("Do NOT write new code from scratch"));
    }

    #[test]
    fn source_file_listing_prunes_caches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print(1)").unwrap();
        std::fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        std::fs::write(dir.path().join("__pycache__/main.pyc"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join("venv/lib")).unwrap();
        std::fs::write(dir.path().join("venv/lib/pkg.py"), "x").unwrap();

        let files = project_source_files(dir.path(), 10);
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("main.py"));
    }
}

use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::Config;

use super::{
    check_code_safety, check_command_safety, collect_artifacts, docker, extract_traceback,
    filter_env, live, parse_import_error, validate_working_dir, ExecutionResult, Language,
    STDERR_CAP_BYTES, STDOUT_CAP_BYTES,
};

/// Raw process outcome before artifact detection.
pub(super) struct SpawnOutput {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub timed_out: bool,
}

/// Append a line to a byte-capped capture buffer.
fn push_capped(buffer: &Mutex<String>, line: &str, cap: usize) {
    let mut buf = buffer.lock().unwrap();
    if buf.len() < cap {
        let remaining = cap - buf.len();
        let mut chunk = line.to_string();
        chunk.push('\n');
        if chunk.len() > remaining {
            chunk.truncate(remaining);
        }
        buf.push_str(&chunk);
    }
}

/// Spawn `cmd` in a fresh process group and capture output line-by-line.
///
/// Each stdout line lands both in the capped capture and the task's live
/// ring. On timeout the whole process group is SIGKILLed (a lone kill of
/// the root leaves interpreter children running), plus `extra_kill` for
/// named containers. Stdin is always null; inheriting an invalid stdin in
/// a detached service breaks interpreters.
pub(super) fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    task_id: &str,
    extra_kill: Option<&str>,
) -> std::io::Result<SpawnOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let stdout_buf = Arc::new(Mutex::new(String::new()));
    let stderr_buf = Arc::new(Mutex::new(String::new()));

    let stdout_handle = child.stdout.take().map(|out| {
        let buf = Arc::clone(&stdout_buf);
        let task_id = task_id.to_string();
        std::thread::spawn(move || {
            for line in BufReader::new(out).lines().map_while(Result::ok) {
                push_capped(&buf, &line, STDOUT_CAP_BYTES);
                live::push_line(&task_id, &line);
            }
        })
    });
    let stderr_handle = child.stderr.take().map(|err| {
        let buf = Arc::clone(&stderr_buf);
        std::thread::spawn(move || {
            for line in BufReader::new(err).lines().map_while(Result::ok) {
                push_capped(&buf, &line, STDERR_CAP_BYTES);
            }
        })
    });

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    // Negative pid addresses the whole process group.
                    let _ = Command::new("kill")
                        .args(["-9", &format!("-{pid}")])
                        .output();
                    if let Some(name) = extra_kill {
                        docker::kill_container(name);
                    }
                    let _ = child.wait();
                    warn!(
                        "Execution timed out after {}s, killed process group {pid}",
                        timeout.as_secs()
                    );
                    break None;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    };

    if let Some(handle) = stdout_handle {
        let _ = handle.join();
    }
    if let Some(handle) = stderr_handle {
        let _ = handle.join();
    }

    let stdout = stdout_buf.lock().unwrap().clone();
    let stderr = stderr_buf.lock().unwrap().clone();
    let return_code = status.and_then(|s| s.code()).unwrap_or(-1);

    Ok(SpawnOutput {
        stdout,
        stderr,
        return_code,
        timed_out,
    })
}

/// Generated script written to disk for the duration of one execution.
pub(super) struct TempScript {
    pub path: PathBuf,
}

impl TempScript {
    pub fn write(working_dir: &Path, code: &str, suffix: &str) -> std::io::Result<Self> {
        let name = format!(".foreman_{}{}", &uuid::Uuid::new_v4().simple().to_string()[..12], suffix);
        let path = working_dir.join(name);
        std::fs::write(&path, code)?;
        Ok(Self { path })
    }
}

impl Drop for TempScript {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Execute generated code in a subprocess or, when enabled and available,
/// a disposable container.
pub fn run_code(
    code: &str,
    language: Language,
    timeout_secs: Option<u64>,
    working_dir: Option<&Path>,
    venv: Option<&str>,
    task_id: &str,
    config: &Config,
) -> ExecutionResult {
    let timeout = Duration::from_secs(timeout_secs.unwrap_or(config.execution_timeout));
    let working_dir = working_dir.unwrap_or(&config.outputs_dir).to_path_buf();

    // Container path: the container is the boundary, the code scan is not
    // applied. venv is ignored since the container ships its own interpreter.
    if config.docker_enabled && docker::available(config) {
        return docker::run_code_docker(code, language, timeout, &working_dir, task_id, config);
    }

    // Generated shell scripts face the tier-1 blocklist line by line;
    // Python goes through the tier-4 content scan instead.
    if language == Language::Bash {
        if let Some(reason) = check_command_safety(code) {
            warn!("Generated script blocked: {reason}");
            return ExecutionResult::refused(reason);
        }
    }
    if language == Language::Python {
        if let Some(reason) = check_code_safety(code) {
            warn!("Code content blocked: {reason}");
            return ExecutionResult::refused(reason);
        }
    }

    if let Some(reason) = validate_working_dir(&working_dir, &config.host_home) {
        return ExecutionResult::refused(reason);
    }
    if let Err(e) = std::fs::create_dir_all(&working_dir) {
        return ExecutionResult::refused(format!(
            "Cannot create working directory {}: {e}",
            working_dir.display()
        ));
    }

    let before = super::snapshot_mtimes(&working_dir);

    let script = match TempScript::write(&working_dir, code, language.suffix()) {
        Ok(s) => s,
        Err(e) => return ExecutionResult::refused(format!("Cannot write script: {e}")),
    };

    let argv = language.command(&script.path, venv);
    info!(
        "Executing {:?} code (timeout={}s, cwd={})",
        language,
        timeout.as_secs(),
        working_dir.display()
    );

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(&working_dir)
        .env_clear()
        .envs(filter_env());

    let output = match run_with_timeout(cmd, timeout, task_id, None) {
        Ok(out) => out,
        Err(e) => return ExecutionResult::refused(format!("Execution error: {e}")),
    };

    if output.timed_out {
        return ExecutionResult {
            success: false,
            stderr: format!("Execution timed out after {}s", timeout.as_secs()),
            timed_out: true,
            return_code: -1,
            ..Default::default()
        };
    }

    let files_created =
        collect_artifacts(&output.stdout, &working_dir, &before, Some(&script.path));
    let traceback = if output.return_code != 0 {
        extract_traceback(&output.stderr)
    } else {
        String::new()
    };

    ExecutionResult {
        success: output.return_code == 0,
        stdout: output.stdout,
        stderr: output.stderr,
        traceback,
        files_created,
        timed_out: false,
        return_code: output.return_code,
        auto_installed: Vec::new(),
    }
}

/// Execute code, auto-installing missing modules on import errors.
///
/// On an ImportError-style failure the missing module is parsed, mapped to
/// its pip name, installed, and the code re-run. In container mode the
/// install targets the shared pip-cache volume.
pub fn run_code_with_auto_install(
    code: &str,
    language: Language,
    timeout_secs: Option<u64>,
    working_dir: Option<&Path>,
    venv: Option<&str>,
    max_install_retries: u32,
    task_id: &str,
    config: &Config,
) -> ExecutionResult {
    let mut auto_installed: Vec<String> = Vec::new();
    let use_docker = config.docker_enabled && docker::available(config);
    let mut attempt = 0u32;

    loop {
        let mut result = run_code(code, language, timeout_secs, working_dir, venv, task_id, config);

        if result.success {
            if !auto_installed.is_empty() {
                result
                    .stdout
                    .push_str(&format!("\n[Auto-installed: {}]", auto_installed.join(", ")));
            }
            result.auto_installed = auto_installed;
            return result;
        }

        let error_text = if result.traceback.is_empty() {
            result.stderr.clone()
        } else {
            result.traceback.clone()
        };
        let missing = match parse_import_error(&error_text) {
            Some(missing) if attempt < max_install_retries => missing,
            _ => {
                result.auto_installed = auto_installed;
                return result;
            }
        };

        info!("Auto-installing missing module: {missing} (attempt {})", attempt + 1);

        let install_result = if use_docker {
            docker::pip_install(&missing, config)
        } else {
            let pip = match venv {
                Some(venv) => format!("{venv}/bin/pip"),
                None => "pip3".to_string(),
            };
            run_shell(
                &format!("{pip} install {missing}"),
                working_dir.unwrap_or(&config.outputs_dir),
                Some(120),
                venv,
                &[],
                task_id,
                config,
            )
        };

        if !install_result.success {
            let head: String = install_result.stderr.chars().take(200).collect();
            warn!("Auto-install failed for {missing}: {head}");
            result.auto_installed = auto_installed;
            return result;
        }

        auto_installed.push(missing);
        attempt += 1;
    }
}

/// Execute a shell command with full system access.
///
/// Tier-1 catastrophic commands are refused; everything else (curl, pip,
/// git, ssh) runs. The optional venv is activated first.
pub fn run_shell(
    command: &str,
    working_dir: &Path,
    timeout_secs: Option<u64>,
    venv: Option<&str>,
    env_vars: &[(String, String)],
    task_id: &str,
    config: &Config,
) -> ExecutionResult {
    let timeout = Duration::from_secs(timeout_secs.unwrap_or(config.execution_timeout));

    if !working_dir.exists() {
        if let Err(e) = std::fs::create_dir_all(working_dir) {
            return ExecutionResult::refused(format!(
                "Cannot create working directory {}: {e}",
                working_dir.display()
            ));
        }
        info!("Created working directory: {}", working_dir.display());
    }
    if let Some(reason) = validate_working_dir(working_dir, &config.host_home) {
        return ExecutionResult::refused(reason);
    }

    if let Some(reason) = check_command_safety(command) {
        let head: String = command.chars().take(200).collect();
        warn!("Command blocked: {head}");
        return ExecutionResult::refused(reason);
    }

    let mut parts: Vec<String> = Vec::new();
    if let Some(venv) = venv {
        let activate = Path::new(venv).join("bin").join("activate");
        if activate.exists() {
            parts.push(format!("source '{}'", activate.display()));
        } else {
            warn!("Venv activate not found: {}", activate.display());
        }
    }
    parts.push(command.to_string());
    let full_command = parts.join(" && ");

    let before = super::snapshot_mtimes(working_dir);

    let head: String = command.chars().take(200).collect();
    info!(
        "Shell exec: {head} (cwd={}, timeout={}s)",
        working_dir.display(),
        timeout.as_secs()
    );

    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(&full_command)
        .current_dir(working_dir)
        .env_clear()
        .envs(filter_env())
        .envs(env_vars.iter().cloned());

    let output = match run_with_timeout(cmd, timeout, task_id, None) {
        Ok(out) => out,
        Err(e) => return ExecutionResult::refused(format!("Shell execution error: {e}")),
    };

    if output.timed_out {
        return ExecutionResult {
            success: false,
            stderr: format!("Timed out after {}s", timeout.as_secs()),
            timed_out: true,
            return_code: -1,
            ..Default::default()
        };
    }

    let files_created = collect_artifacts(&output.stdout, working_dir, &before, None);
    let traceback = if output.return_code != 0 {
        extract_traceback(&output.stderr)
    } else {
        String::new()
    };

    ExecutionResult {
        success: output.return_code == 0,
        stdout: output.stdout,
        stderr: output.stderr,
        traceback,
        files_created,
        timed_out: false,
        return_code: output.return_code,
        auto_installed: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base: &Path) -> Config {
        let mut config = Config::from_env();
        config.docker_enabled = false;
        config.outputs_dir = base.join("outputs");
        config.host_home = base.to_path_buf();
        std::fs::create_dir_all(&config.outputs_dir).unwrap();
        config
    }

    #[test]
    fn shell_refuses_blocked_commands_without_running_them() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let canary = dir.path().join("outputs").join("canary.txt");
        std::fs::write(&canary, "here").unwrap();

        let result = run_shell(
            "rm -rf ~/Documents",
            &config.outputs_dir,
            Some(5),
            None,
            &[],
            "t-refuse",
            &config,
        );
        assert!(!result.success);
        assert!(result.stderr.starts_with("BLOCKED:"));
        assert!(canary.exists());
    }

    #[test]
    fn shell_runs_ordinary_commands_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let result = run_shell(
            "echo hello-from-shell",
            &config.outputs_dir,
            Some(10),
            None,
            &[],
            "t-echo",
            &config,
        );
        assert!(result.success);
        assert_eq!(result.return_code, 0);
        assert!(result.stdout.contains("hello-from-shell"));
    }

    #[test]
    fn shell_detects_created_artifacts_via_mtime_diff() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let result = run_shell(
            "printf 'a,b\\n1,2\\n' > data.csv",
            &config.outputs_dir,
            Some(10),
            None,
            &[],
            "t-artifact",
            &config,
        );
        assert!(result.success);
        assert_eq!(result.files_created, vec![config.outputs_dir.join("data.csv")]);
    }

    #[test]
    fn shell_declared_artifacts_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let result = run_shell(
            "printf 'x\\n' > keep.txt && printf 'y\\n' > noise.txt && echo 'ARTIFACTS: [\"keep.txt\"]'",
            &config.outputs_dir,
            Some(10),
            None,
            &[],
            "t-declared",
            &config,
        );
        assert!(result.success);
        assert_eq!(result.files_created, vec![config.outputs_dir.join("keep.txt")]);
    }

    #[test]
    fn timeout_kills_the_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let started = Instant::now();
        // The child spawns a grandchild; both must die with the group.
        let result = run_shell(
            "sleep 60 & sleep 60",
            &config.outputs_dir,
            Some(1),
            None,
            &[],
            "t-timeout",
            &config,
        );
        assert!(!result.success);
        assert!(result.timed_out);
        // Killed at ~1s, with a scheduling-quantum margin, never at 60s.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn working_dir_outside_home_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let result = run_shell("ls", Path::new("/etc"), Some(5), None, &[], "t-wd", &config);
        assert!(!result.success);
        assert!(result.stderr.contains("outside HOME"));
    }

    #[test]
    fn child_environment_omits_protected_variables() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        // The parent test process may or may not carry these; assert on
        // the child's view either way.
        std::env::set_var("FOREMAN_TEST_SECRET_TOKEN", "leak-me");
        let result = run_shell(
            "env | sort",
            &config.outputs_dir,
            Some(10),
            None,
            &[],
            "t-env",
            &config,
        );
        std::env::remove_var("FOREMAN_TEST_SECRET_TOKEN");

        assert!(result.success);
        assert!(!result.stdout.contains("FOREMAN_TEST_SECRET_TOKEN"));
        assert!(!result.stdout.contains("ANTHROPIC_API_KEY"));
        assert!(result.stdout.contains("PATH="));
    }

    #[test]
    fn run_code_executes_bash_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let result = run_code(
            "echo from-script\nexit 0\n",
            Language::Bash,
            Some(10),
            None,
            None,
            "t-code",
            &config,
        );
        assert!(result.success);
        assert!(result.stdout.contains("from-script"));
        // The temp script itself is cleaned up and never reported.
        assert!(result.files_created.is_empty());
    }

    #[test]
    fn run_code_blocks_dangerous_python_content() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let result = run_code(
            "import os\nos.system('ls')\n",
            Language::Python,
            Some(10),
            None,
            None,
            "t-scan",
            &config,
        );
        assert!(!result.success);
        assert!(result.stderr.contains("BLOCKED"));
    }

    #[test]
    fn failing_script_extracts_traceback_shape() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        // Emit a Python-style traceback from bash to avoid requiring a
        // python interpreter on the test host.
        let code = "echo 'Traceback (most recent call last):' >&2\necho '  File \"x.py\"' >&2\necho \"ValueError: boom\" >&2\nexit 1\n";
        let result = run_code(code, Language::Bash, Some(10), None, None, "t-tb", &config);
        assert!(!result.success);
        assert!(result.traceback.starts_with("Traceback"));
        assert!(result.traceback.contains("ValueError: boom"));
    }

    #[test]
    fn live_tail_reflects_recent_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let result = run_shell(
            "for i in 1 2 3 4 5; do echo line-$i; done",
            &config.outputs_dir,
            Some(10),
            None,
            &[],
            "t-live",
            &config,
        );
        assert!(result.success);
        let tail = live::tail("t-live", 3);
        assert_eq!(tail, vec!["line-3", "line-4", "line-5"]);
        live::clear("t-live");
    }

    #[test]
    fn stdout_capture_is_byte_capped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let result = run_shell(
            "yes 0123456789 | head -n 20000",
            &config.outputs_dir,
            Some(30),
            None,
            &[],
            "t-cap",
            &config,
        );
        assert!(result.stdout.len() <= STDOUT_CAP_BYTES);
        live::clear("t-cap");
    }
}

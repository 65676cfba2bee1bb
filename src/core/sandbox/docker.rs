use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::Config;

use super::exec::{run_with_timeout, TempScript};
use super::{collect_artifacts, extract_traceback, validate_working_dir, ExecutionResult, Language};

/// Availability verdict cache, refreshed every 60 s.
static DOCKER_STATUS: Mutex<Option<(bool, Instant)>> = Mutex::new(None);

/// Serializes container pip installs: concurrent installs into the shared
/// cache volume corrupt it.
static PIP_LOCK: Mutex<()> = Mutex::new(());

const AVAILABILITY_TTL: Duration = Duration::from_secs(60);

/// Is the Docker daemon running with the sandbox image present?
/// Result is cached; the control-socket check fast-fails without spawning
/// a subprocess when no daemon can be listening.
pub fn available(config: &Config) -> bool {
    {
        let cached = DOCKER_STATUS.lock().unwrap();
        if let Some((verdict, checked_at)) = *cached {
            if checked_at.elapsed() < AVAILABILITY_TTL {
                return verdict;
            }
        }
    }

    let verdict = probe(config);
    *DOCKER_STATUS.lock().unwrap() = Some((verdict, Instant::now()));
    verdict
}

fn probe(config: &Config) -> bool {
    // DOCKER_HOST means a remote daemon over TCP/SSH, so no local socket.
    if std::env::var("DOCKER_HOST").is_err() {
        let system_sock = Path::new("/var/run/docker.sock");
        let home_sock = config.host_home.join(".docker").join("run").join("docker.sock");
        if !system_sock.exists() && !home_sock.exists() {
            warn!("Docker socket not found. Falling back to subprocess execution.");
            return false;
        }
    }

    let info_ok = Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !info_ok {
        warn!("Docker daemon not running. Falling back to subprocess execution.");
        return false;
    }

    let image_ok = Command::new("docker")
        .args(["image", "inspect", &config.docker_image])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !image_ok {
        warn!(
            "Docker is running but '{}' image not found. Build the sandbox image first.",
            config.docker_image
        );
        return false;
    }

    true
}

/// Force-remove a named container (used on timeout).
pub fn kill_container(name: &str) {
    let _ = Command::new("docker").args(["kill", name]).output();
    let _ = Command::new("docker").args(["rm", "-f", name]).output();
}

/// Build the `docker run` argv. Pure for testability.
pub fn build_docker_args(
    container_name: &str,
    working_dir: &Path,
    script_path: &Path,
    language: Language,
    config: &Config,
) -> Vec<String> {
    let working = working_dir.to_string_lossy();
    let mut args: Vec<String> = vec![
        "run".into(),
        "--name".into(),
        container_name.into(),
        "--rm".into(),
        // Working directory mounted read-write at its host path so output
        // artifacts land where the host expects them.
        "-v".into(),
        format!("{working}:{working}"),
        // Uploads are inputs only.
        "-v".into(),
        format!("{}:{}:ro", config.uploads_dir.display(), config.uploads_dir.display()),
        // Persistent pip cache for auto-install.
        "-v".into(),
        format!("{}:/pip-cache", config.pip_cache_dir.display()),
        "-e".into(),
        "PIP_TARGET=/pip-cache".into(),
        "-e".into(),
        "PYTHONPATH=/pip-cache".into(),
        // Resource limits.
        "--memory".into(),
        config.docker_memory_limit.clone(),
        "--cpus".into(),
        config.docker_cpu_limit.clone(),
        "--pids-limit".into(),
        "256".into(),
        // Hardening.
        "--security-opt".into(),
        "no-new-privileges:true".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--network".into(),
        config.docker_network.clone(),
        "-w".into(),
        working.to_string(),
        config.docker_image.clone(),
    ];
    args.extend(language.command(script_path, None));
    args
}

/// Execute code inside a disposable container.
///
/// Only the working directory (rw) and uploads (ro) are visible; the rest
/// of the host filesystem, SSH keys and dotfiles are not mounted.
pub fn run_code_docker(
    code: &str,
    language: Language,
    timeout: Duration,
    working_dir: &Path,
    task_id: &str,
    config: &Config,
) -> ExecutionResult {
    // The working dir is mounted read-write, so it is validated even here.
    if let Some(reason) = validate_working_dir(working_dir, &config.host_home) {
        return ExecutionResult::refused(reason);
    }
    if let Err(e) = std::fs::create_dir_all(working_dir) {
        return ExecutionResult::refused(format!(
            "Cannot create working directory {}: {e}",
            working_dir.display()
        ));
    }

    let before = super::snapshot_mtimes(working_dir);

    let script = match TempScript::write(working_dir, code, language.suffix()) {
        Ok(s) => s,
        Err(e) => return ExecutionResult::refused(format!("Cannot write script: {e}")),
    };

    let container_name = format!(
        "foreman-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..12]
    );
    let args = build_docker_args(&container_name, working_dir, &script.path, language, config);

    info!(
        "Docker exec: {:?} code (timeout={}s, cwd={}, container={}, network={})",
        language,
        timeout.as_secs(),
        working_dir.display(),
        container_name,
        config.docker_network
    );

    let mut cmd = Command::new("docker");
    cmd.args(&args);

    let output = match run_with_timeout(cmd, timeout, task_id, Some(&container_name)) {
        Ok(out) => out,
        Err(e) => {
            kill_container(&container_name);
            return ExecutionResult::refused(format!("Docker execution error: {e}"));
        }
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
        collect_artifacts(&output.stdout, working_dir, &before, Some(&script.path));
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

/// Install a pip package into the shared cache volume.
pub fn pip_install(package: &str, config: &Config) -> ExecutionResult {
    let _guard = PIP_LOCK.lock().unwrap();

    let container_name = format!(
        "foreman-pip-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );
    let mut cmd = Command::new("docker");
    cmd.args([
        "run",
        "--name",
        &container_name,
        "--rm",
        "-v",
        &format!("{}:/pip-cache", config.pip_cache_dir.display()),
        "-e",
        "PIP_TARGET=/pip-cache",
        "--network",
        &config.docker_network,
        &config.docker_image,
        "pip",
        "install",
        package,
    ]);

    match run_with_timeout(cmd, Duration::from_secs(120), "pip-install", Some(&container_name)) {
        Ok(out) if out.timed_out => ExecutionResult {
            success: false,
            stderr: "pip install timed out".to_string(),
            timed_out: true,
            return_code: -1,
            ..Default::default()
        },
        Ok(out) => ExecutionResult {
            success: out.return_code == 0,
            stdout: out.stdout,
            stderr: out.stderr,
            return_code: out.return_code,
            ..Default::default()
        },
        Err(e) => {
            kill_container(&container_name);
            ExecutionResult::refused(format!("pip install error: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base: &Path) -> Config {
        let mut config = Config::from_env();
        config.docker_image = "foreman-sandbox".to_string();
        config.docker_memory_limit = "2g".to_string();
        config.docker_cpu_limit = "2".to_string();
        config.docker_network = "bridge".to_string();
        config.uploads_dir = base.join("uploads");
        config.pip_cache_dir = base.join(".pip-cache");
        config
    }

    #[test]
    fn docker_args_mount_working_dir_rw_and_uploads_ro() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let working = dir.path().join("outputs");
        let script = working.join(".foreman_abc.py");

        let args = build_docker_args("foreman-test", &working, &script, Language::Python, &config);

        let working_str = working.to_string_lossy().to_string();
        assert!(args.contains(&format!("{working_str}:{working_str}")));
        assert!(args
            .iter()
            .any(|a| a.ends_with(":ro") && a.contains("uploads")));
    }

    #[test]
    fn docker_args_include_hardening_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let working = dir.path().join("outputs");
        let script = working.join(".foreman_abc.py");

        let args = build_docker_args("foreman-test", &working, &script, Language::Python, &config);

        for expected in [
            "--memory",
            "--cpus",
            "--pids-limit",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges:true",
            "--network",
        ] {
            assert!(
                args.iter().any(|a| a == expected),
                "missing arg: {expected}"
            );
        }
    }

    #[test]
    fn docker_args_end_with_the_interpreter_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let working = dir.path().join("outputs");
        let script = working.join(".foreman_abc.sh");

        let args = build_docker_args("foreman-test", &working, &script, Language::Bash, &config);
        let tail: Vec<&str> = args.iter().rev().take(3).map(|s| s.as_str()).collect();
        assert_eq!(tail[2], "bash");
        assert_eq!(tail[1], "-e");
        assert!(tail[0].ends_with(".foreman_abc.sh"));
    }

    #[test]
    fn docker_run_refuses_working_dir_outside_home() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.host_home = dir.path().to_path_buf();

        let result = run_code_docker(
            "print('x')",
            Language::Python,
            Duration::from_secs(5),
            Path::new("/etc"),
            "t-docker-wd",
            &config,
        );
        assert!(!result.success);
        assert!(result.stderr.contains("outside HOME"));
    }
}

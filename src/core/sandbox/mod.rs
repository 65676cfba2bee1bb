pub mod docker;
pub mod exec;
pub mod live;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use regex::{Regex, RegexBuilder};
use tracing::{info, warn};

/// Hard caps on captured output.
pub const STDOUT_CAP_BYTES: usize = 50_000;
pub const STDERR_CAP_BYTES: usize = 20_000;

/// More artifacts than this from one execution means something leaked
/// (a venv tree, a package install); narrow to the extension whitelist.
pub const ARTIFACT_SANITY_LIMIT: usize = 20;

/// Interpreted language of a generated script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
    Bash,
}

impl Language {
    pub fn suffix(&self) -> &'static str {
        match self {
            Language::Python => ".py",
            Language::JavaScript => ".js",
            Language::Bash => ".sh",
        }
    }

    /// Interpreter argv for running `script`, honouring an optional venv.
    pub fn command(&self, script: &Path, venv: Option<&str>) -> Vec<String> {
        let script = script.to_string_lossy().to_string();
        match self {
            Language::Python => {
                let python = match venv {
                    Some(venv) => format!("{venv}/bin/python3"),
                    None => "python3".to_string(),
                };
                vec![python, "-u".to_string(), script]
            }
            Language::JavaScript => vec!["node".to_string(), script],
            Language::Bash => vec!["bash".to_string(), "-e".to_string(), script],
        }
    }
}

/// Outcome of one sandboxed execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub traceback: String,
    pub files_created: Vec<PathBuf>,
    pub timed_out: bool,
    pub return_code: i32,
    pub auto_installed: Vec<String>,
}

impl ExecutionResult {
    pub fn refused(reason: String) -> Self {
        Self {
            success: false,
            stderr: reason,
            return_code: -1,
            ..Default::default()
        }
    }
}

fn build_regexes(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .unwrap_or_else(|e| panic!("invalid safety pattern {p:?}: {e}"))
        })
        .collect()
}

// ── Tier 1: catastrophic, irreversible, always blocked ───────────────

const BLOCKED_PATTERNS: &[&str] = &[
    // rm -rf targeting home, root, or user directories. Handles short
    // flags (-rf), split flags (-r -f), and GNU long flags.
    r"\brm\s+(-{1,2}[\w-]+\s+)*\s*(/\s*$|~\s*$|~/\s*$|\$HOME)",
    r"\brm\s+(-{1,2}[\w-]+\s+)*/Users\b",
    r"\brm\s+(-{1,2}[\w-]+\s+)*/home\b",
    // rm targeting critical home subdirectories
    r"\brm\s+(-{1,2}[\w-]+\s+)*\s*~/?(Desktop|Documents|Downloads|Pictures|Music|Movies|Library|Applications)\b",
    // Filesystem destruction
    r"\bmkfs\b",
    r"\bdd\s+if=",
    r"\bdd\s+of=/dev/",
    r">\s*/dev/sd[a-z]",
    // Fork bomb variants
    r":\(\)\s*\{",
    r"\bfork\s*bomb\b",
    // System power
    r"\bshutdown\b",
    r"\breboot\b",
    r"\bhalt\b",
    r"\bpoweroff\b",
    // Privilege escalation
    r"\bsudo\b",
    // Pipe-to-shell (remote code execution via URL)
    r"\bcurl\b.*\|\s*\bsh\b",
    r"\bcurl\b.*\|\s*\bbash\b",
    r"\bwget\b.*\|\s*\bsh\b",
    r"\bwget\b.*\|\s*\bbash\b",
    r"\bcat\b.*\|\s*\bsh\b",
    r"\bcat\b.*\|\s*\bbash\b",
    // Recursive permission destruction
    r"\bchmod\s+(-[rR]\s+|--recursive\s+)?(777|a\+rwx)\s+[/~]",
    // Interpreter inline code execution (bypass via python -c, perl -e)
    r"\bpython3?\s+-[cE]\s",
    r"\bperl\s+-[eE]\s",
    r"\bruby\s+-[eE]\s",
    r"\bnode\s+-[eE]\s",
    // Destructive find operations
    r"\bfind\b.*\s-delete\b",
    r"\bfind\b.*-exec\s+rm\b",
    // Encoding bypass (base64 decode piped to shell)
    r"\bbase64\s.*\|\s*sh\b",
    r"\bbase64\s.*\|\s*bash\b",
    // Home directory relocation (~, ~/ or $HOME as source argument)
    r"\bmv\s+(-\w+\s+)*~(\s|$)",
    r"\bmv\s+(-\w+\s+)*~/(\s|$)",
    r"\bmv\s+(-\w+\s+)*\$HOME(\s|$)",
    // Write/append redirects to critical dotfiles
    r">>?\s*~/?\.(ssh|bashrc|bash_profile|zshrc|zprofile|profile|gitconfig|gnupg|npmrc|netrc)",
    // Symlink attacks on critical dotfiles
    r"\bln\s+.*~/?\.(ssh|bashrc|bash_profile|zshrc|zprofile|profile|gitconfig|gnupg)",
    // printf/echo piped to shell (like curl|sh but local)
    r"\bprintf\b.*\|\s*(sh|bash)\b",
    r"\becho\b.*\|\s*(sh|bash)\b",
    // eval with command substitution (obfuscation wrapper)
    r#"\beval\b\s+"?\$\("#,
    // bash/sh -c with embedded empty quotes (string splitting obfuscation)
    r#"\b(bash|sh)\s+-c\s+.*(?:'{2}|"{2})"#,
];

fn blocked_regexes() -> &'static Vec<Regex> {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| build_regexes(BLOCKED_PATTERNS))
}

// ── Tier 3: allowed but recorded for the audit trail ─────────────────

const LOGGED_PATTERNS: &[(&str, &str)] = &[
    (r"\brm\s", "file deletion"),
    (r"\bchmod\b|\bchown\b", "permission change"),
    (r"\bgit\s+push\b", "git push"),
    (r"\bsystemctl\b|\blaunchctl\b", "service management"),
    (r"\bcurl\b|\bwget\b", "network download"),
    (r"\bpip3?\s+install\b.*https?://", "pip install from URL"),
    (r"\bfind\b", "find command"),
    (r"\bln\b", "symlink operation"),
    (r"\bmv\b", "file move"),
    (r"\bpython3?\s+-c\b", "python inline execution"),
    (r"\beval\b", "eval command"),
    (r"\bprintf\b.*\|", "printf pipe"),
];

fn logged_regexes() -> &'static Vec<(Regex, &'static str)> {
    static RE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RE.get_or_init(|| {
        LOGGED_PATTERNS
            .iter()
            .map(|(p, label)| {
                (
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .unwrap_or_else(|e| panic!("invalid audit pattern {p:?}: {e}")),
                    *label,
                )
            })
            .collect()
    })
}

/// Check a shell command (or generated shell script) against the tier-1
/// blocklist. The matcher is line-aware so `$`-anchored patterns catch
/// payloads hidden inside heredocs and multi-line scripts. Returns the
/// refusal message, or None when the command may run.
pub fn check_command_safety(command: &str) -> Option<String> {
    for regex in blocked_regexes() {
        for line in command.lines() {
            if regex.is_match(line) {
                return Some(format!(
                    "BLOCKED: Catastrophic command pattern '{}'. Refusing to execute.",
                    regex.as_str()
                ));
            }
        }
    }
    // Tier-3 operations run, but leave a trace.
    for (regex, label) in logged_regexes() {
        if regex.is_match(command) {
            let head: String = command.chars().take(200).collect();
            info!("AUDIT: {label} command detected: {head}");
        }
    }
    None
}

// ── Tier 4: code-content scan (subprocess mode only) ─────────────────

const CODE_BLOCKED_PATTERNS: &[(&str, &str)] = &[
    // Reading SSH keys, GPG keys, cloud credentials
    (r#"['"]~/?\.(ssh|gnupg|aws|kube|docker)/"#, "credential directory access"),
    (r#"['"][^'"]*\.env['"]"#, ".env file access"),
    (r#"['"][^'"]*\.pem['"]"#, "PEM key file access"),
    (r#"['"][^'"]*id_rsa['"]"#, "SSH key access"),
    // os.system / shell=True; generated code should use plain subprocess.run()
    (r"\bos\.system\s*\(", "os.system call"),
    (r"subprocess\.\w+\s*\([^)]*shell\s*=\s*True", "subprocess with shell=True"),
    // Recursive delete of home or root
    (r#"shutil\.rmtree\s*\(\s*['"]?(/|~|Path\.home)"#, "recursive delete of home/root"),
    // Reverse shells: legitimate HTTP goes through requests/httpx
    (r"socket\..*connect\s*\(", "outbound socket connection"),
    // System credential files
    (r#"open\s*\(\s*['"]/etc/(passwd|shadow|sudoers)"#, "system file read"),
];

fn code_blocked_regexes() -> &'static Vec<(Regex, &'static str)> {
    static RE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RE.get_or_init(|| {
        CODE_BLOCKED_PATTERNS
            .iter()
            .map(|(p, label)| {
                (
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .unwrap_or_else(|e| panic!("invalid code pattern {p:?}: {e}")),
                    *label,
                )
            })
            .collect()
    })
}

/// Scan generated script content for dangerous operations. Applied only on
/// the subprocess path; in container mode the container is the boundary.
/// Not a security boundary against an adversary: the threat model is a
/// hallucinating model, not a malicious operator.
pub fn check_code_safety(code: &str) -> Option<String> {
    for (regex, label) in code_blocked_regexes() {
        if regex.is_match(code) {
            return Some(format!(
                "BLOCKED: Code contains {label}. Refusing to execute in subprocess mode."
            ));
        }
    }
    None
}

// ── Environment stripping ────────────────────────────────────────────

/// Build the child environment: parent env minus our own credentials and
/// minus any var whose name contains a protected substring.
pub fn filter_env() -> HashMap<String, String> {
    filter_env_from(std::env::vars())
}

pub fn filter_env_from(
    vars: impl Iterator<Item = (String, String)>,
) -> HashMap<String, String> {
    vars.filter(|(key, _)| {
        if crate::config::PROTECTED_ENV_KEYS.contains(&key.as_str()) {
            return false;
        }
        let upper = key.to_uppercase();
        !crate::config::PROTECTED_ENV_SUBSTRINGS
            .iter()
            .any(|sub| upper.contains(sub))
    })
    .collect()
}

/// Refuse to execute outside the operator's home.
pub fn validate_working_dir(working_dir: &Path, host_home: &Path) -> Option<String> {
    let resolved = working_dir
        .canonicalize()
        .unwrap_or_else(|_| working_dir.to_path_buf());
    let home = host_home
        .canonicalize()
        .unwrap_or_else(|_| host_home.to_path_buf());
    if resolved.starts_with(&home) {
        None
    } else {
        Some(format!(
            "BLOCKED: Working directory {} is outside HOME ({})",
            working_dir.display(),
            host_home.display()
        ))
    }
}

// ── Artifact detection ───────────────────────────────────────────────

/// Directory names never descended into during the artifact walk.
const PRUNED_DIRS: &[&str] = &[
    "__pycache__",
    ".git",
    "node_modules",
    "venv",
    ".venv",
    "site-packages",
    ".pip-cache",
    ".cache",
];

/// Extensions considered genuine outputs when narrowing an oversized set.
const OUTPUT_EXT_WHITELIST: &[&str] = &[
    "html", "pdf", "csv", "xlsx", "xls", "json", "xml", "png", "jpg", "jpeg", "gif", "svg",
    "txt", "md", "zip", "tar", "gz", "parquet",
];

/// Is this file a plausible output artifact (not cache or metadata)?
pub fn is_artifact_file(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    if name.ends_with(".pyc") || name.ends_with(".pyo") || name.ends_with(".tmp") {
        return false;
    }
    if name == ".DS_Store" {
        return false;
    }
    if name.ends_with(".dist-info") || name.contains(".egg-info") {
        return false;
    }
    // Anything under a pruned directory is package or cache spill.
    !path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| PRUNED_DIRS.contains(&s))
            .unwrap_or(false)
    })
}

/// Map path → mtime for every artifact-eligible file under `dir`, pruning
/// cache directories instead of walking them.
pub fn snapshot_mtimes(dir: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut out = HashMap::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let prune = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| PRUNED_DIRS.contains(&n))
                    .unwrap_or(false);
                if !prune {
                    stack.push(path);
                }
            } else if path.is_file() {
                if let Ok(meta) = entry.metadata() {
                    if let Ok(mtime) = meta.modified() {
                        out.insert(path, mtime);
                    }
                }
            }
        }
    }
    out
}

/// Files whose mtime is new or increased since `before`, excluding the
/// generated script itself and anything that fails the artifact filter.
pub fn diff_new_artifacts(
    dir: &Path,
    before: &HashMap<PathBuf, SystemTime>,
    script_path: Option<&Path>,
) -> Vec<PathBuf> {
    let after = snapshot_mtimes(dir);
    let mut out: Vec<PathBuf> = after
        .into_iter()
        .filter(|(path, mtime)| {
            if Some(path.as_path()) == script_path {
                return false;
            }
            if !is_artifact_file(path) {
                return false;
            }
            // Empty files are never artifacts.
            if std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true) {
                return false;
            }
            match before.get(path) {
                Some(prev) => mtime > prev,
                None => true,
            }
        })
        .map(|(path, _)| path)
        .collect();
    out.sort();
    out
}

/// First artifact source: a single stdout line declaring artifacts as a
/// JSON array (`ARTIFACTS: ["chart.png", "report.csv"]`). Names resolve
/// relative to the working directory; only existing non-empty files count.
pub fn parse_declared_artifacts(stdout: &str, working_dir: &Path) -> Vec<PathBuf> {
    for line in stdout.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("ARTIFACTS:") else {
            continue;
        };
        let Ok(names) = serde_json::from_str::<Vec<String>>(rest.trim()) else {
            continue;
        };
        return names
            .into_iter()
            .map(|name| {
                let p = PathBuf::from(&name);
                if p.is_absolute() {
                    p
                } else {
                    working_dir.join(p)
                }
            })
            .filter(|p| std::fs::metadata(p).map(|m| m.is_file() && m.len() > 0).unwrap_or(false))
            .collect();
    }
    Vec::new()
}

/// Narrow an implausibly large artifact set to known output extensions.
pub fn apply_sanity_filter(artifacts: Vec<PathBuf>) -> Vec<PathBuf> {
    if artifacts.len() <= ARTIFACT_SANITY_LIMIT {
        return artifacts;
    }
    let filtered: Vec<PathBuf> = artifacts
        .iter()
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| OUTPUT_EXT_WHITELIST.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if filtered.is_empty() {
        warn!(
            "Artifact sanity filter found no whitelisted outputs among {} files",
            artifacts.len()
        );
        return artifacts;
    }
    info!(
        "Artifacts filtered from {} to {} (output extensions only)",
        artifacts.len(),
        filtered.len()
    );
    filtered
}

/// Combined artifact detection: declared line first, mtime diff second,
/// sanity filter always.
pub fn collect_artifacts(
    stdout: &str,
    working_dir: &Path,
    before: &HashMap<PathBuf, SystemTime>,
    script_path: Option<&Path>,
) -> Vec<PathBuf> {
    let declared = parse_declared_artifacts(stdout, working_dir);
    let found = if declared.is_empty() {
        diff_new_artifacts(working_dir, before, script_path)
    } else {
        declared
    };
    apply_sanity_filter(found)
}

// ── Failure parsing ──────────────────────────────────────────────────

/// Import-name → pip-package mismatches.
const PIP_NAME_MAP: &[(&str, &str)] = &[
    ("PIL", "Pillow"),
    ("cv2", "opencv-python"),
    ("bs4", "beautifulsoup4"),
    ("yaml", "pyyaml"),
    ("sklearn", "scikit-learn"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("gi", "PyGObject"),
    ("attr", "attrs"),
    ("serial", "pyserial"),
    ("usb", "pyusb"),
    ("Bio", "biopython"),
];

/// Extract the missing module from an ImportError/ModuleNotFoundError and
/// translate it to the installable package name.
pub fn parse_import_error(error_text: &str) -> Option<String> {
    if error_text.is_empty() {
        return None;
    }
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| {
        Regex::new(r"(?:ModuleNotFoundError|ImportError): No module named '(\w+)'")
            .expect("static pattern")
    });
    let module = regex.captures(error_text)?.get(1)?.as_str();
    Some(
        PIP_NAME_MAP
            .iter()
            .find(|(import, _)| *import == module)
            .map(|(_, pip)| pip.to_string())
            .unwrap_or_else(|| module.to_string()),
    )
}

/// Extract the last traceback block from stderr (from the final
/// "Traceback" marker to the end), for the audit-retry feedback path.
pub fn extract_traceback(stderr: &str) -> String {
    if stderr.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let mut tb_start = None;
    for (i, line) in lines.iter().enumerate() {
        if line.contains("Traceback (most recent call last):") {
            tb_start = Some(i);
        }
    }
    match tb_start {
        Some(i) => lines[i..].join("\n"),
        None => String::new(),
    }
}

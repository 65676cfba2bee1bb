use std::path::PathBuf;

/// Runtime configuration, resolved once at startup from the environment.
///
/// Every knob has a default tuned for a single-operator deployment; the
/// only hard requirements are the two credentials and the operator
/// allow-list, which `validate()` enforces before the bot starts.
#[derive(Debug, Clone)]
pub struct Config {
    // Credentials
    pub anthropic_api_key: String,
    pub telegram_bot_token: String,
    pub allowed_user_ids: Vec<i64>,

    // Models
    pub default_model: String,
    pub complex_model: String,
    pub ollama_base_url: String,
    pub ollama_default_model: String,
    pub enable_thinking: bool,

    // Timeouts (seconds)
    pub execution_timeout: u64,
    pub max_code_execution_timeout: u64,
    pub long_timeout: u64,

    // Retry limits
    pub max_retries: u32,
    pub api_max_retries: u32,

    // File limits
    pub max_file_size_bytes: u64,

    // Budget (USD, 0 = unlimited)
    pub daily_budget_usd: f64,
    pub monthly_budget_usd: f64,

    // Resource guards
    pub max_concurrent_tasks: usize,
    pub ram_threshold_percent: u64,

    // Docker sandbox
    pub docker_enabled: bool,
    pub docker_image: String,
    pub docker_memory_limit: String,
    pub docker_cpu_limit: String,
    pub docker_network: String,

    // Data handling
    pub big_data_row_threshold: usize,

    // Workspace layout
    pub base_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub pip_cache_dir: PathBuf,
    pub db_path: PathBuf,
    pub scheduler_db_path: PathBuf,
    pub registry_path: PathBuf,
    pub coding_standards_path: PathBuf,

    /// Filesystem boundary: generated code may only run under this root.
    pub host_home: PathBuf,
}

/// Environment keys stripped from every child process (our own credentials).
pub const PROTECTED_ENV_KEYS: &[&str] = &["ANTHROPIC_API_KEY", "TELEGRAM_BOT_TOKEN"];

/// Any env var whose (uppercased) name contains one of these substrings is
/// stripped as well. Catches AWS_SECRET_ACCESS_KEY, GITHUB_TOKEN, etc.
pub const PROTECTED_ENV_SUBSTRINGS: &[&str] = &["KEY", "TOKEN", "SECRET", "PASSWORD", "CREDENTIAL"];

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

/// Parse a comma-separated operator id list, skipping malformed entries.
pub fn parse_user_ids(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let base_dir = std::env::var("FOREMAN_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".foreman")
            });
        let workspace_dir = base_dir.join("workspace");

        Self {
            anthropic_api_key: env_str("ANTHROPIC_API_KEY", ""),
            telegram_bot_token: env_str("TELEGRAM_BOT_TOKEN", ""),
            allowed_user_ids: parse_user_ids(&env_str("ALLOWED_USER_IDS", "")),

            default_model: env_str("DEFAULT_MODEL", "claude-sonnet-4-6"),
            complex_model: env_str("COMPLEX_MODEL", "claude-opus-4-6"),
            ollama_base_url: env_str("OLLAMA_BASE_URL", "http://localhost:11434"),
            ollama_default_model: env_str("OLLAMA_DEFAULT_MODEL", "llama3.1:8b"),
            enable_thinking: env_bool("ENABLE_THINKING", true),

            execution_timeout: env_u64("EXECUTION_TIMEOUT", 120),
            max_code_execution_timeout: env_u64("MAX_CODE_EXECUTION_TIMEOUT", 600),
            long_timeout: env_u64("LONG_TIMEOUT", 900),

            max_retries: env_u64("MAX_RETRIES", 3) as u32,
            api_max_retries: env_u64("API_MAX_RETRIES", 5) as u32,

            max_file_size_bytes: env_u64("MAX_FILE_SIZE_MB", 50) * 1024 * 1024,

            daily_budget_usd: env_f64("DAILY_BUDGET_USD", 0.0),
            monthly_budget_usd: env_f64("MONTHLY_BUDGET_USD", 0.0),

            max_concurrent_tasks: env_u64("MAX_CONCURRENT_TASKS", 3) as usize,
            ram_threshold_percent: env_u64("RAM_THRESHOLD_PERCENT", 90),

            docker_enabled: env_bool("DOCKER_ENABLED", false),
            docker_image: env_str("DOCKER_IMAGE", "foreman-sandbox"),
            docker_memory_limit: env_str("DOCKER_MEMORY_LIMIT", "2g"),
            docker_cpu_limit: env_str("DOCKER_CPU_LIMIT", "2"),
            docker_network: env_str("DOCKER_NETWORK", "bridge"),

            big_data_row_threshold: env_u64("BIG_DATA_ROW_THRESHOLD", 500) as usize,

            uploads_dir: workspace_dir.join("uploads"),
            outputs_dir: workspace_dir.join("outputs"),
            projects_dir: workspace_dir.join("projects"),
            pip_cache_dir: workspace_dir.join(".pip-cache"),
            db_path: base_dir.join("storage").join("foreman.db"),
            scheduler_db_path: base_dir.join("storage").join("scheduler.db"),
            registry_path: base_dir.join("projects.toml"),
            coding_standards_path: base_dir.join("coding_standards.txt"),
            host_home: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            workspace_dir,
            base_dir,
        }
    }

    /// Create the workspace directory tree.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [
            &self.uploads_dir,
            &self.outputs_dir,
            &self.projects_dir,
            &self.pip_cache_dir,
            &self.db_path.parent().map(PathBuf::from).unwrap_or_default(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Hard requirements for startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.anthropic_api_key.is_empty() {
            anyhow::bail!("ANTHROPIC_API_KEY not set");
        }
        if self.telegram_bot_token.is_empty() {
            anyhow::bail!("TELEGRAM_BOT_TOKEN not set");
        }
        if self.allowed_user_ids.is_empty() {
            anyhow::bail!("ALLOWED_USER_IDS not set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_user_ids_skips_malformed_entries() {
        assert_eq!(parse_user_ids("123, 456,abc, ,789"), vec![123, 456, 789]);
    }

    #[test]
    fn parse_user_ids_empty_input() {
        assert!(parse_user_ids("").is_empty());
    }

    #[test]
    fn protected_substrings_catch_common_credentials() {
        for name in [
            "AWS_SECRET_ACCESS_KEY",
            "GITHUB_TOKEN",
            "DATABASE_PASSWORD",
            "SERVICE_CREDENTIAL",
            "SOME_API_KEY",
        ] {
            assert!(
                PROTECTED_ENV_SUBSTRINGS
                    .iter()
                    .any(|sub| name.to_uppercase().contains(sub)),
                "expected {name} to be filtered"
            );
        }
    }

    #[test]
    fn innocuous_names_pass_the_substring_filter() {
        for name in ["PATH", "HOME", "SHELL", "LANG", "TERM"] {
            assert!(
                !PROTECTED_ENV_SUBSTRINGS
                    .iter()
                    .any(|sub| name.to_uppercase().contains(sub)),
                "expected {name} to pass"
            );
        }
    }
}

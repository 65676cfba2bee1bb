use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

/// One registered project from the human-edited registry file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Project {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub description: String,
    /// Named commands, possibly containing `{placeholder}` tokens.
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
    /// Optional isolated environment for the project's interpreter.
    #[serde(default)]
    pub venv: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub requires_file: bool,
    #[serde(default)]
    pub triggers: Vec<String>,
}

fn default_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize, Default)]
struct RegistryFile {
    #[serde(default)]
    projects: Vec<Project>,
}

/// The loaded project registry.
#[derive(Debug, Default)]
pub struct ProjectRegistry {
    projects: Vec<Project>,
}

impl ProjectRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Project registry not found at {}", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let parsed: RegistryFile = toml::from_str(&content)?;
        info!("Loaded {} projects from registry", parsed.projects.len());
        Ok(Self {
            projects: parsed.projects,
        })
    }

    pub fn from_projects(projects: Vec<Project>) -> Self {
        Self { projects }
    }

    pub fn all(&self) -> &[Project] {
        &self.projects
    }

    /// Find the project matching a message via trigger substrings.
    /// Case-insensitive; the longest matching trigger wins, so a specific
    /// project beats one with a generic trigger.
    pub fn match_message(&self, message: &str) -> Option<&Project> {
        let msg_lower = message.to_lowercase();
        let mut best: Option<&Project> = None;
        let mut best_score = 0usize;

        for project in &self.projects {
            let score = project
                .triggers
                .iter()
                .filter(|t| msg_lower.contains(&t.to_lowercase()))
                .map(|t| t.len())
                .max()
                .unwrap_or(0);
            if score > best_score {
                best_score = score;
                best = Some(project);
            }
        }

        if let Some(p) = best {
            info!("Matched project: {} (score={best_score})", p.name);
        }
        best
    }

    /// Brief one-line-per-project summary for the classifier prompt.
    pub fn summary(&self) -> String {
        if self.projects.is_empty() {
            return "No existing projects registered.".to_string();
        }
        let mut lines =
            vec!["REGISTERED PROJECTS (invoke these instead of writing new code):".to_string()];
        for p in &self.projects {
            let triggers: Vec<&str> = p.triggers.iter().take(3).map(|s| s.as_str()).collect();
            let first_desc = p.description.trim().lines().next().unwrap_or("");
            lines.push(format!(
                "  - {}: {} [triggers: {}]",
                p.name,
                first_desc,
                triggers.join(", ")
            ));
        }
        lines.join("\n")
    }
}

impl Project {
    /// Full project context for the planner prompt.
    pub fn context(&self) -> String {
        let mut lines = vec![
            format!("EXISTING PROJECT AVAILABLE: {}", self.name),
            format!("Path: {}", self.path),
            format!("Description: {}", self.description.trim()),
        ];
        if !self.commands.is_empty() {
            lines.push("Available commands:".to_string());
            for (name, cmd) in &self.commands {
                lines.push(format!("  - {name}: {cmd}"));
            }
        }
        if self.requires_file {
            lines.push("NOTE: This project requires a file upload to work.".to_string());
        }
        lines.push(format!("Timeout: {}s", self.timeout));
        lines.join("\n")
    }

    /// All `{placeholder}` names across the project's commands.
    pub fn placeholders(&self) -> Vec<String> {
        let regex = regex::Regex::new(r"\{(\w+)\}").expect("static pattern");
        let mut names: Vec<String> = self
            .commands
            .values()
            .flat_map(|cmd| {
                regex
                    .captures_iter(cmd)
                    .map(|c| c[1].to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProjectRegistry {
        let scraper = Project {
            name: "job-scraper".to_string(),
            path: "/home/op/projects/scraper".to_string(),
            description: "Scrapes job boards".to_string(),
            commands: BTreeMap::from([(
                "run".to_string(),
                "python3 scrape.py --keyword {keyword}".to_string(),
            )]),
            triggers: vec!["job scraper".to_string(), "scrape jobs".to_string()],
            timeout: 300,
            ..Default::default()
        };
        let reports = Project {
            name: "reports".to_string(),
            path: "/home/op/projects/reports".to_string(),
            commands: BTreeMap::from([(
                "generate".to_string(),
                "python3 report.py --client {client} --file {file}".to_string(),
            )]),
            triggers: vec!["report".to_string(), "weekly client report".to_string()],
            ..Default::default()
        };
        ProjectRegistry::from_projects(vec![scraper, reports])
    }

    #[test]
    fn trigger_matching_is_case_insensitive() {
        let reg = registry();
        let p = reg.match_message("Run the JOB SCRAPER for rust roles").unwrap();
        assert_eq!(p.name, "job-scraper");
    }

    #[test]
    fn longest_trigger_wins_on_overlap() {
        let reg = registry();
        // "report" (reports) vs "weekly client report" (reports) vs
        // "scrape jobs": the message matches both projects; the longer
        // trigger decides.
        let p = reg
            .match_message("send the weekly client report about the job scraper")
            .unwrap();
        assert_eq!(p.name, "reports");
    }

    #[test]
    fn no_trigger_match_returns_none() {
        let reg = registry();
        assert!(reg.match_message("write me a fibonacci function").is_none());
    }

    #[test]
    fn placeholders_are_collected_and_deduplicated() {
        let reg = registry();
        let p = reg.match_message("weekly client report").unwrap();
        assert_eq!(p.placeholders(), vec!["client", "file"]);
    }

    #[test]
    fn summary_lists_each_project_with_triggers() {
        let reg = registry();
        let summary = reg.summary();
        assert!(summary.contains("job-scraper"));
        assert!(summary.contains("reports"));
        assert!(summary.contains("triggers:"));
    }

    #[test]
    fn empty_registry_summary() {
        let reg = ProjectRegistry::default();
        assert_eq!(reg.summary(), "No existing projects registered.");
    }

    #[test]
    fn toml_registry_parses() {
        let raw = r#"
            [[projects]]
            name = "scraper"
            path = "/home/op/scraper"
            description = "Scrapes things"
            timeout = 120
            requires_file = false
            triggers = ["scrape"]

            [projects.commands]
            run = "python3 main.py --query {query}"
        "#;
        let parsed: RegistryFile = toml::from_str(raw).unwrap();
        assert_eq!(parsed.projects.len(), 1);
        let p = &parsed.projects[0];
        assert_eq!(p.name, "scraper");
        assert_eq!(p.timeout, 120);
        assert_eq!(p.placeholders(), vec!["query"]);
    }

    #[test]
    fn project_context_includes_commands_and_timeout() {
        let reg = registry();
        let p = reg.match_message("job scraper").unwrap();
        let ctx = p.context();
        assert!(ctx.contains("EXISTING PROJECT AVAILABLE: job-scraper"));
        assert!(ctx.contains("--keyword {keyword}"));
        assert!(ctx.contains("Timeout: 300s"));
    }
}

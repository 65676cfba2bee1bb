use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId};
use tracing::{error, info, warn};

use crate::core::budget;
use crate::core::coordinator::{
    parse_chain, sanitize_error, substitute_output, Coordinator, PipelineFailure,
};
use crate::core::files::save_upload;
use crate::core::guards;
use crate::core::pipeline::state::Verdict;
use crate::core::sandbox::exec::run_shell;
use crate::core::scheduler::{JobRunner, ScheduledJob, Scheduler};

/// Telegram's hard message length limit.
const MAX_MESSAGE_LENGTH: usize = 4096;

/// Seconds between status-message refreshes.
const STATUS_POLL_SECS: u64 = 3;

pub struct TelegramInterface {
    bot: Bot,
    coordinator: Arc<Coordinator>,
    scheduler: Arc<Scheduler>,
}

/// Chunk a long message at line boundaries below the platform limit,
/// hard-splitting single lines that exceed it.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split('\n') {
        let mut line = line;
        while line.len() > max_len {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            // Split on a char boundary at or below the limit.
            let mut cut = max_len;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            chunks.push(line[..cut].to_string());
            line = &line[cut..];
        }
        if current.len() + line.len() + 1 > max_len {
            chunks.push(std::mem::take(&mut current));
            current = line.to_string();
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

async fn send_long_message(bot: &Bot, chat_id: ChatId, text: &str) {
    let chunks = chunk_message(text, MAX_MESSAGE_LENGTH);
    let total = chunks.len();
    for (i, chunk) in chunks.into_iter().enumerate() {
        if chunk.is_empty() {
            continue;
        }
        if let Err(e) = bot.send_message(chat_id, &chunk).await {
            warn!("Failed to send message chunk {}/{total}: {e}", i + 1);
        }
        // Per-chunk throttle to stay under the platform rate limit.
        if i + 1 < total {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    }
}

/// Send artifacts one by one: dedupe, skip missing/empty/oversized files,
/// and isolate per-send failures so one broken file doesn't lose the rest.
async fn send_artifacts(
    bot: &Bot,
    chat_id: ChatId,
    artifacts: &[PathBuf],
    max_file_size: u64,
) -> usize {
    let mut seen = std::collections::HashSet::new();
    let mut sent = 0usize;
    for path in artifacts {
        if !seen.insert(path.clone()) {
            continue;
        }
        let Ok(meta) = std::fs::metadata(path) else {
            warn!("Artifact not found, skipping: {}", path.display());
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if meta.len() == 0 {
            warn!("Artifact is empty (0 bytes), skipping: {}", path.display());
            continue;
        }
        if meta.len() >= max_file_size {
            warn!(
                "Artifact too large ({} bytes), skipping: {}",
                meta.len(),
                path.display()
            );
            continue;
        }
        match bot.send_document(chat_id, InputFile::file(path.clone())).await {
            Ok(_) => sent += 1,
            Err(e) => warn!("Failed to send artifact {}: {e}", path.display()),
        }
    }
    sent
}

fn hash_of(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Wall-clock duration of a completed task in whole seconds.
fn task_duration(created_at: &str, completed_at: &str) -> Option<i64> {
    let start = chrono::DateTime::parse_from_rfc3339(created_at).ok()?;
    let end = chrono::DateTime::parse_from_rfc3339(completed_at).ok()?;
    Some((end - start).num_seconds().max(0))
}

impl TelegramInterface {
    pub fn new(bot: Bot, coordinator: Arc<Coordinator>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            bot,
            coordinator,
            scheduler,
        }
    }

    /// The job runner the scheduler fires: full pipeline plus delivery,
    /// with the RAM/concurrency guard but no cooldown.
    pub fn job_runner(bot: Bot, coordinator: Arc<Coordinator>) -> JobRunner {
        Arc::new(move |job: ScheduledJob| {
            let bot = bot.clone();
            let coordinator = Arc::clone(&coordinator);
            Box::pin(async move {
                run_scheduled_job(bot, coordinator, job).await;
            })
        })
    }

    pub async fn start(self) -> Result<()> {
        let commands = vec![
            teloxide::types::BotCommand::new("start", "Show help"),
            teloxide::types::BotCommand::new("status", "Current task status"),
            teloxide::types::BotCommand::new("history", "Recent tasks"),
            teloxide::types::BotCommand::new("usage", "API token usage"),
            teloxide::types::BotCommand::new("cost", "Estimated API costs"),
            teloxide::types::BotCommand::new("health", "System health check"),
            teloxide::types::BotCommand::new("exec", "Run a shell command"),
            teloxide::types::BotCommand::new("context", "View/clear conversation memory"),
            teloxide::types::BotCommand::new("cancel", "Cancel running tasks"),
            teloxide::types::BotCommand::new("projects", "List registered projects"),
            teloxide::types::BotCommand::new("schedule", "Schedule a recurring task"),
            teloxide::types::BotCommand::new("chain", "Run a strict-AND task chain"),
            teloxide::types::BotCommand::new("debug", "Show a task's debug sidecar"),
        ];
        if let Err(e) = self.bot.set_my_commands(commands).await {
            error!("Failed to set bot commands: {e}");
        }

        let coordinator = self.coordinator;
        let scheduler = self.scheduler;

        info!("Starting Telegram bot (polling mode)");
        teloxide::repl(self.bot, move |bot: Bot, msg: Message| {
            let coordinator = Arc::clone(&coordinator);
            let scheduler = Arc::clone(&scheduler);
            async move {
                if let Err(e) = handle_update(bot, msg, coordinator, scheduler).await {
                    error!("Update handler error: {e}");
                }
                Ok(())
            }
        })
        .await;
        Ok(())
    }
}

async fn handle_update(
    bot: Bot,
    msg: Message,
    coordinator: Arc<Coordinator>,
    scheduler: Arc<Scheduler>,
) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;
    let chat_id = msg.chat.id;

    if !coordinator.config.allowed_user_ids.contains(&user_id) {
        warn!("Unauthorized access attempt from user {user_id}");
        bot.send_message(chat_id, "Unauthorized. Your user ID is not in the allow list.")
            .await?;
        return Ok(());
    }

    // File uploads first: they queue for the next text instruction.
    if let Some(doc) = msg.document() {
        handle_document(&bot, &msg, &coordinator, user_id, doc.clone()).await?;
        return Ok(());
    }
    if let Some(photos) = msg.photo() {
        if let Some(photo) = photos.last() {
            handle_photo(&bot, &msg, &coordinator, user_id, photo.clone()).await?;
        }
        return Ok(());
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };
    let text = text.trim().to_string();

    if command_args(&text, "/start").is_some() {
        cmd_start(&bot, chat_id).await?;
    } else if command_args(&text, "/status").is_some() {
        cmd_status(&bot, chat_id, &coordinator, user_id).await?;
    } else if command_args(&text, "/history").is_some() {
        cmd_history(&bot, chat_id, &coordinator, user_id).await?;
    } else if command_args(&text, "/usage").is_some() {
        cmd_usage(&bot, chat_id, &coordinator).await?;
    } else if command_args(&text, "/cost").is_some() {
        cmd_cost(&bot, chat_id, &coordinator).await?;
    } else if command_args(&text, "/health").is_some() {
        cmd_health(&bot, chat_id, &coordinator).await?;
    } else if let Some(args) = command_args(&text, "/exec") {
        cmd_exec(&bot, chat_id, &coordinator, &args).await?;
    } else if let Some(args) = command_args(&text, "/context") {
        cmd_context(&bot, chat_id, &coordinator, user_id, &args).await?;
    } else if command_args(&text, "/cancel").is_some() {
        cmd_cancel(&bot, chat_id, &coordinator, user_id).await?;
    } else if command_args(&text, "/projects").is_some() {
        cmd_projects(&bot, chat_id, &coordinator).await?;
    } else if let Some(args) = command_args(&text, "/schedule") {
        cmd_schedule(&bot, chat_id, &scheduler, user_id, &args).await?;
    } else if let Some(args) = command_args(&text, "/chain") {
        cmd_chain(bot, chat_id, coordinator, user_id, args).await?;
    } else if let Some(args) = command_args(&text, "/debug") {
        cmd_debug(&bot, chat_id, &coordinator, &args).await?;
    } else if text.starts_with('/') {
        bot.send_message(chat_id, "Unknown command. Send /start for help.")
            .await?;
    } else {
        handle_task(bot, chat_id, coordinator, user_id, text).await?;
    }
    Ok(())
}

/// Extract arguments for a command, accepting `/cmd` and `/cmd@botname`.
fn command_args(text: &str, command: &str) -> Option<String> {
    let rest = text.strip_prefix(command)?;
    if rest.is_empty() {
        return Some(String::new());
    }
    if let Some(after_at) = rest.strip_prefix('@') {
        // "/cmd@botname args": drop the bot mention.
        return match after_at.split_once(char::is_whitespace) {
            Some((_, tail)) => Some(tail.trim().to_string()),
            None => Some(String::new()),
        };
    }
    if !rest.starts_with(char::is_whitespace) {
        return None; // "/statusfoo" is not "/status"
    }
    Some(rest.trim().to_string())
}

async fn cmd_start(bot: &Bot, chat_id: ChatId) -> Result<()> {
    bot.send_message(
        chat_id,
        "foreman is online.\n\n\
         Send me a task:\n\
         - Text prompts for code generation, data analysis, or automation\n\
         - Files (CSV, Excel, images) with instructions\n\
         - Invoke registered projects by their trigger phrases\n\
         - Build production frontends (React, Tailwind)\n\n\
         Commands:\n\
         /status - Current task status\n\
         /history - Recent tasks\n\
         /usage - API token usage\n\
         /cost - Estimated API costs\n\
         /health - System health check\n\
         /exec <cmd> - Run a shell command directly\n\
         /context - View/clear conversation memory\n\
         /cancel - Cancel running tasks\n\
         /projects - List registered projects\n\
         /schedule - Schedule a recurring task\n\
         /chain a -> b - Strict-AND task chain\n\
         /debug <task_id> - Show a task's debug sidecar",
    )
    .await?;
    Ok(())
}

async fn cmd_status(
    bot: &Bot,
    chat_id: ChatId,
    coordinator: &Arc<Coordinator>,
    user_id: i64,
) -> Result<()> {
    let running = coordinator.running_tasks(user_id);
    if running.is_empty() {
        bot.send_message(chat_id, "No active tasks.").await?;
        return Ok(());
    }
    let mut lines = vec!["Active tasks:".to_string()];
    for task_id in running {
        let stage = coordinator
            .status_snapshot(&task_id)
            .unwrap_or_else(|| "starting".to_string());
        let stage_line = stage.lines().next().unwrap_or("starting");
        lines.push(format!("Task {}: {stage_line}", &task_id[..task_id.len().min(8)]));
    }
    bot.send_message(chat_id, lines.join("\n")).await?;
    Ok(())
}

async fn cmd_history(
    bot: &Bot,
    chat_id: ChatId,
    coordinator: &Arc<Coordinator>,
    user_id: i64,
) -> Result<()> {
    let tasks = coordinator.store.list_tasks(user_id, 5).unwrap_or_default();
    if tasks.is_empty() {
        bot.send_message(chat_id, "No task history.").await?;
        return Ok(());
    }
    let lines: Vec<String> = tasks
        .iter()
        .map(|t| {
            let icon = match t.status.as_str() {
                "completed" => "done",
                "failed" | "crashed" => "err",
                "cancelled" => "stop",
                other => other,
            };
            let duration = task_duration(&t.created_at, &t.completed_at)
                .map(|secs| format!(" ({secs}s)"))
                .unwrap_or_default();
            let head: String = t.message.chars().take(60).collect();
            format!("[{icon}]{duration} {head}")
        })
        .collect();
    bot.send_message(chat_id, format!("Recent tasks:\n{}", lines.join("\n")))
        .await?;
    Ok(())
}

async fn cmd_usage(bot: &Bot, chat_id: ChatId, coordinator: &Arc<Coordinator>) -> Result<()> {
    let store = Arc::clone(&coordinator.store);
    let usage = tokio::task::spawn_blocking(move || store.usage_summary())
        .await?
        .unwrap_or_default();
    let mut lines = vec![
        "API Usage (lifetime):".to_string(),
        format!("Total calls: {}", usage.total_calls),
        format!("Input tokens: {}", usage.input_tokens),
        format!("Output tokens: {}", usage.output_tokens),
    ];
    if usage.thinking_tokens > 0 {
        lines.push(format!("Thinking tokens: {}", usage.thinking_tokens));
    }
    bot.send_message(chat_id, lines.join("\n")).await?;
    Ok(())
}

async fn cmd_cost(bot: &Bot, chat_id: ChatId, coordinator: &Arc<Coordinator>) -> Result<()> {
    let store = Arc::clone(&coordinator.store);
    let (today, month, by_model) = tokio::task::spawn_blocking(move || {
        let today = budget::today_spend(&store);
        let month = budget::month_spend(&store);
        let by_model = store.usage_by_model_since(0.0).unwrap_or_default();
        (today, month, by_model)
    })
    .await?;

    let mut lines = vec![
        "API Cost Estimate:".to_string(),
        format!("Today: ${today:.4}"),
        format!("Last 30 days: ${month:.4}"),
    ];
    if !by_model.is_empty() {
        lines.push("\nBy model (lifetime):".to_string());
        for row in &by_model {
            let cost = budget::cost_of(std::slice::from_ref(row));
            let short = row.model.rsplit('-').next().unwrap_or(&row.model);
            lines.push(format!("  {short}: {} calls, ${cost:.4}", row.calls));
        }
    }
    bot.send_message(chat_id, lines.join("\n")).await?;
    Ok(())
}

async fn cmd_health(bot: &Bot, chat_id: ChatId, coordinator: &Arc<Coordinator>) -> Result<()> {
    let coordinator_bg = Arc::clone(coordinator);
    let report = tokio::task::spawn_blocking(move || {
        let mut lines = vec!["System Health:".to_string()];

        match guards::ram_used_percent() {
            Some(percent) => lines.push(format!("RAM: {percent}% used")),
            None => lines.push("RAM: unknown".to_string()),
        }
        lines.push(format!(
            "Active tasks: {} / {}",
            coordinator_bg.guards.in_flight(),
            coordinator_bg.config.max_concurrent_tasks
        ));

        let local = coordinator_bg.gateway.local_client();
        if local.healthy() {
            let models = local.list_models();
            lines.push(format!("Ollama: online ({} models)", models.len()));
            if !models.is_empty() {
                let shown: Vec<&str> = models.iter().take(5).map(|m| m.as_str()).collect();
                lines.push(format!("  Models: {}", shown.join(", ")));
            }
        } else {
            lines.push("Ollama: offline".to_string());
        }

        match guards::free_disk_bytes(&coordinator_bg.config.base_dir) {
            Some(bytes) => lines.push(format!(
                "Disk free: {:.1} GB",
                bytes as f64 / 1_073_741_824.0
            )),
            None => lines.push("Disk free: unknown".to_string()),
        }

        let usage = coordinator_bg.store.usage_summary().unwrap_or_default();
        lines.push(format!("API calls (total): {}", usage.total_calls));
        lines.push(format!(
            "Tokens: {} in / {} out",
            usage.input_tokens, usage.output_tokens
        ));
        let by_model = coordinator_bg.store.usage_by_model_since(0.0).unwrap_or_default();
        lines.push(format!("Est. cost: ${:.2}", budget::cost_of(&by_model)));

        // Per-project venv health.
        let mut venv_issues = Vec::new();
        for project in coordinator_bg.projects.all() {
            if let Some(venv) = &project.venv {
                let python = std::path::Path::new(venv).join("bin").join("python3");
                if !python.exists() {
                    venv_issues.push(format!(
                        "  '{}': venv python not found at {}",
                        project.name,
                        python.display()
                    ));
                }
            }
        }
        if !venv_issues.is_empty() {
            lines.push("Project venv issues:".to_string());
            lines.extend(venv_issues);
        }
        lines.join("\n")
    })
    .await?;

    bot.send_message(chat_id, report).await?;
    Ok(())
}

async fn cmd_exec(
    bot: &Bot,
    chat_id: ChatId,
    coordinator: &Arc<Coordinator>,
    command: &str,
) -> Result<()> {
    if command.is_empty() {
        bot.send_message(chat_id, "Usage: /exec <command>\nExample: /exec ls -la ~/Desktop")
            .await?;
        return Ok(());
    }

    let head: String = command.chars().take(100).collect();
    bot.send_message(chat_id, format!("Running: {head}...")).await?;

    let config = Arc::clone(&coordinator.config);
    let cmd = command.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let result = run_shell(&cmd, &config.host_home, Some(60), None, &[], "exec", &config);
        crate::core::sandbox::live::clear("exec");
        result
    })
    .await?;

    let mut output = String::new();
    if !result.stdout.is_empty() {
        output.push_str(&result.stdout.chars().take(3000).collect::<String>());
    }
    if !result.stderr.is_empty() {
        let stderr: String = result.stderr.chars().take(1000).collect();
        output.push_str(&format!("\n[stderr]\n{}", sanitize_error(&stderr)));
    }
    if output.trim().is_empty() {
        output = "(no output)".to_string();
    }
    let status = if result.success {
        "OK".to_string()
    } else {
        format!("EXIT {}", result.return_code)
    };
    send_long_message(bot, chat_id, &format!("[{status}]\n{output}")).await;
    Ok(())
}

async fn cmd_context(
    bot: &Bot,
    chat_id: ChatId,
    coordinator: &Arc<Coordinator>,
    user_id: i64,
    args: &str,
) -> Result<()> {
    if args == "clear" {
        coordinator.store.clear_context(user_id)?;
        bot.send_message(chat_id, "Conversation memory cleared (context + history).")
            .await?;
        return Ok(());
    }

    let history = coordinator.store.recent_history(user_id, 8).unwrap_or_default();
    if history.is_empty() {
        bot.send_message(chat_id, "No conversation history yet.").await?;
        return Ok(());
    }

    let mut lines = vec!["Recent conversation memory:".to_string()];
    for entry in &history {
        let role = if entry.role == "user" { "You" } else { "Agent" };
        let content: String = entry.content.chars().take(120).collect();
        lines.push(format!("\n[{role}] {content}"));
    }
    let context = coordinator.store.get_all_context(user_id).unwrap_or_default();
    if !context.is_empty() {
        lines.push("\n\nStored context:".to_string());
        for (key, value) in &context {
            let v: String = value.chars().take(80).collect();
            lines.push(format!("  {key}: {v}"));
        }
    }
    send_long_message(bot, chat_id, &lines.join("\n")).await;
    Ok(())
}

async fn cmd_cancel(
    bot: &Bot,
    chat_id: ChatId,
    coordinator: &Arc<Coordinator>,
    user_id: i64,
) -> Result<()> {
    let cancelled = coordinator.cancel_all(user_id);
    if cancelled > 0 {
        bot.send_message(
            chat_id,
            format!(
                "Cancelled {cancelled} task(s).\nNote: background execution may take a moment to fully stop."
            ),
        )
        .await?;
    } else {
        bot.send_message(chat_id, "No running tasks to cancel.").await?;
    }
    Ok(())
}

async fn cmd_projects(bot: &Bot, chat_id: ChatId, coordinator: &Arc<Coordinator>) -> Result<()> {
    let projects = coordinator.projects.all();
    if projects.is_empty() {
        bot.send_message(
            chat_id,
            "No projects registered. Edit projects.toml to add them.",
        )
        .await?;
        return Ok(());
    }
    let mut lines = vec!["Registered projects:".to_string()];
    for p in projects {
        let commands: Vec<&str> = p.commands.keys().map(|s| s.as_str()).collect();
        let cmd_str = if commands.is_empty() {
            String::new()
        } else {
            format!(" ({})", commands.join(", "))
        };
        lines.push(format!("\n{}{cmd_str}", p.name));
        let triggers: Vec<&str> = p.triggers.iter().take(3).map(|s| s.as_str()).collect();
        lines.push(format!("  Triggers: {}", triggers.join(", ")));
    }
    bot.send_message(chat_id, lines.join("\n")).await?;
    Ok(())
}

async fn cmd_schedule(
    bot: &Bot,
    chat_id: ChatId,
    scheduler: &Arc<Scheduler>,
    user_id: i64,
    args: &str,
) -> Result<()> {
    if args.is_empty() {
        bot.send_message(
            chat_id,
            "Usage: /schedule <minutes> <task>\n\
             Example: /schedule 360 Run the job scraper\n\n\
             /schedule list - Show scheduled tasks\n\
             /schedule remove <id> - Remove a scheduled task",
        )
        .await?;
        return Ok(());
    }

    if args == "list" {
        let jobs = scheduler.list_jobs().unwrap_or_default();
        if jobs.is_empty() {
            bot.send_message(chat_id, "No scheduled tasks.").await?;
        } else {
            let lines: Vec<String> = jobs
                .iter()
                .map(|j| {
                    let head: String = j.message.chars().take(60).collect();
                    format!("- {}: every {}m: {head}", &j.id[..8], j.interval_minutes)
                })
                .collect();
            bot.send_message(chat_id, format!("Scheduled tasks:\n{}", lines.join("\n")))
                .await?;
        }
        return Ok(());
    }

    if let Some(prefix) = args.strip_prefix("remove ") {
        match scheduler.remove_job(prefix.trim()).await? {
            Some(id) => {
                bot.send_message(chat_id, format!("Removed scheduled task {}.", &id[..8]))
                    .await?;
            }
            None => {
                bot.send_message(chat_id, format!("No job found matching: {prefix}"))
                    .await?;
            }
        }
        return Ok(());
    }

    let Some((interval_raw, task_message)) = args.split_once(' ') else {
        bot.send_message(chat_id, "Usage: /schedule <minutes> <task description>")
            .await?;
        return Ok(());
    };
    let interval_minutes: u64 = match interval_raw.parse() {
        Ok(n) => n,
        Err(_) => {
            bot.send_message(
                chat_id,
                format!("Invalid interval: {interval_raw}. Must be a number of minutes."),
            )
            .await?;
            return Ok(());
        }
    };
    if interval_minutes < 1 {
        bot.send_message(chat_id, "Interval must be at least 1 minute.").await?;
        return Ok(());
    }
    if interval_minutes > 43_200 {
        bot.send_message(chat_id, "Interval must be at most 43200 minutes (30 days).")
            .await?;
        return Ok(());
    }

    let job = ScheduledJob {
        id: uuid::Uuid::new_v4().to_string(),
        interval_minutes,
        chat_id: chat_id.0,
        user_id,
        message: task_message.to_string(),
    };
    let job_id = job.id.clone();
    scheduler.add_job(job).await?;

    let hours = interval_minutes / 60;
    let mins = interval_minutes % 60;
    let interval_str = if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    };
    bot.send_message(
        chat_id,
        format!(
            "Scheduled: \"{task_message}\"\nInterval: every {interval_str}\nJob ID: {}\n\
             Use /schedule list to view, /schedule remove {} to cancel.",
            &job_id[..8],
            &job_id[..8]
        ),
    )
    .await?;
    Ok(())
}

async fn cmd_debug(
    bot: &Bot,
    chat_id: ChatId,
    coordinator: &Arc<Coordinator>,
    args: &str,
) -> Result<()> {
    if args.is_empty() {
        bot.send_message(chat_id, "Usage: /debug <task_id>").await?;
        return Ok(());
    }
    match coordinator.find_sidecar(args) {
        Some(path) => {
            let content = std::fs::read_to_string(&path).unwrap_or_default();
            let capped: String = content.chars().take(3800).collect();
            bot.send_message(chat_id, capped).await?;
        }
        None => {
            bot.send_message(chat_id, format!("No debug data found for '{args}'"))
                .await?;
        }
    }
    Ok(())
}

// ── File uploads ─────────────────────────────────────────────────────

async fn handle_document(
    bot: &Bot,
    msg: &Message,
    coordinator: &Arc<Coordinator>,
    user_id: i64,
    doc: teloxide::types::Document,
) -> Result<()> {
    let chat_id = msg.chat.id;
    if doc.file.size as u64 > coordinator.config.max_file_size_bytes {
        bot.send_message(
            chat_id,
            format!(
                "File too large (max {}MB).",
                coordinator.config.max_file_size_bytes / (1024 * 1024)
            ),
        )
        .await?;
        return Ok(());
    }

    let file = bot.get_file(doc.file.id.clone()).await?;
    let mut buf: Vec<u8> = Vec::new();
    bot.download_file(&file.path, &mut buf).await?;
    let filename = doc
        .file_name
        .clone()
        .unwrap_or_else(|| format!("upload_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));

    let saved = save_upload(
        &coordinator.config.uploads_dir,
        &buf,
        &filename,
        coordinator.config.max_file_size_bytes,
    )?;
    coordinator.add_pending_file(user_id, saved);

    bot.send_message(
        chat_id,
        format!("File received: {filename}\nNow send a text message describing what to do with it."),
    )
    .await?;
    Ok(())
}

async fn handle_photo(
    bot: &Bot,
    msg: &Message,
    coordinator: &Arc<Coordinator>,
    user_id: i64,
    photo: teloxide::types::PhotoSize,
) -> Result<()> {
    let file = bot.get_file(photo.file.id.clone()).await?;
    let mut buf: Vec<u8> = Vec::new();
    bot.download_file(&file.path, &mut buf).await?;

    let filename = format!("photo_{}.jpg", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let saved = save_upload(
        &coordinator.config.uploads_dir,
        &buf,
        &filename,
        coordinator.config.max_file_size_bytes,
    )?;
    coordinator.add_pending_file(user_id, saved);

    bot.send_message(
        msg.chat.id,
        "Photo received. Send a text message describing what to do with it.",
    )
    .await?;
    Ok(())
}

// ── Task submission ──────────────────────────────────────────────────

async fn handle_task(
    bot: Bot,
    chat_id: ChatId,
    coordinator: Arc<Coordinator>,
    user_id: i64,
    message: String,
) -> Result<()> {
    if let Err(rejection) = coordinator.admit(user_id) {
        bot.send_message(chat_id, rejection.to_string()).await?;
        return Ok(());
    }

    let task_id = uuid::Uuid::new_v4().to_string();
    let consumed = coordinator.snapshot_pending_files(user_id);

    coordinator.store.create_task(&task_id, user_id, &message)?;
    coordinator
        .store
        .add_history(user_id, "user", &message, &task_id)?;

    let status_msg = bot
        .send_message(chat_id, format!("Starting... (task {})", &task_id[..8]))
        .await?;

    let worker = {
        let coordinator = Arc::clone(&coordinator);
        let task_id = task_id.clone();
        let message = message.clone();
        let files = consumed.clone();
        tokio::spawn(async move {
            coordinator
                .run_pipeline(task_id, user_id, message, files)
                .await
        })
    };
    coordinator.track(user_id, &task_id, worker.abort_handle());

    // Stream status while the pipeline runs, hash-gated so identical
    // snapshots produce no edit (and no rate-limit churn).
    let mut last_edit_hash = 0u64;
    while !worker.is_finished() {
        tokio::time::sleep(Duration::from_secs(STATUS_POLL_SECS)).await;
        let Some(snapshot) = coordinator.status_snapshot(&task_id) else {
            continue;
        };
        let content_hash = hash_of(&snapshot);
        if content_hash != last_edit_hash {
            if edit_status(&bot, chat_id, status_msg.id, &snapshot).await {
                last_edit_hash = content_hash;
            }
        }
    }

    let outcome = worker.await;
    coordinator.untrack(user_id, &task_id);
    coordinator.guards.release();
    coordinator.clear_consumed_files(user_id, &consumed);
    crate::core::pipeline::clear_stage(&task_id);
    crate::core::sandbox::live::clear(&task_id);

    match outcome {
        Ok(Ok(state)) => {
            edit_status(&bot, chat_id, status_msg.id, &format!("Completed. (task {})", &task_id[..8]))
                .await;

            let response = if state.final_response.is_empty() {
                "Task completed but no output was generated.".to_string()
            } else {
                state.final_response.clone()
            };
            send_long_message(&bot, chat_id, &response).await;
            coordinator
                .store
                .add_history(user_id, "assistant", &response, &task_id)?;

            // Structured context for follow-up tasks.
            let _ = coordinator.store.set_context(
                user_id,
                "last_task_type",
                state.task_type.as_str(),
            );
            let head: String = message.chars().take(500).collect();
            let _ = coordinator.store.set_context(user_id, "last_task_message", &head);
            if !state.working_dir.is_empty() {
                let _ =
                    coordinator
                        .store
                        .set_context(user_id, "last_working_dir", &state.working_dir);
            }
            if let Some(project) = &state.project {
                let _ = coordinator
                    .store
                    .set_context(user_id, "last_project_name", &project.name);
            }
            if !state.artifacts.is_empty() {
                let names: Vec<String> = state
                    .artifacts
                    .iter()
                    .filter(|p| p.exists())
                    .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                    .collect();
                let _ = coordinator.store.set_context(
                    user_id,
                    "last_files_created",
                    &serde_json::to_string(&names).unwrap_or_default(),
                );
            }

            let sent = send_artifacts(
                &bot,
                chat_id,
                &state.artifacts,
                coordinator.config.max_file_size_bytes,
            )
            .await;
            if sent == 0 && !state.artifacts.is_empty() {
                error!(
                    "No artifacts were successfully sent out of {} detected",
                    state.artifacts.len()
                );
            }

            let status = if state.verdict() == Verdict::Pass {
                "completed"
            } else {
                "failed"
            };
            coordinator.store.complete_task(
                &task_id,
                status,
                state.task_type.as_str(),
                &state.final_response,
            )?;
        }
        Ok(Err(PipelineFailure::TimedOut(secs))) => {
            error!("Interactive task {task_id} timed out after {secs}s");
            bot.send_message(
                chat_id,
                format!(
                    "Task timed out after {} minutes. The task was too complex or an external service was unresponsive.",
                    secs / 60
                ),
            )
            .await?;
            coordinator.store.update_task_status(
                &task_id,
                "failed",
                Some(&format!("Pipeline timed out after {secs}s")),
            )?;
        }
        Ok(Err(PipelineFailure::Cancelled)) | Err(_) => {
            info!("Task {task_id} was cancelled");
            bot.send_message(chat_id, "Task was cancelled.").await?;
            coordinator
                .store
                .update_task_status(&task_id, "cancelled", None)?;
        }
        Ok(Err(PipelineFailure::Failed(e))) | Ok(Err(PipelineFailure::Internal(e))) => {
            error!("Task {task_id} failed: {e}");
            let safe = sanitize_error(&e);
            bot.send_message(chat_id, format!("Task failed: {safe}")).await?;
            coordinator
                .store
                .update_task_status(&task_id, "failed", Some(&e))?;
        }
    }
    Ok(())
}

async fn edit_status(bot: &Bot, chat_id: ChatId, message_id: MessageId, text: &str) -> bool {
    // "Message is not modified" and transient rate limits are not worth
    // surfacing; the next poll will retry.
    bot.edit_message_text(chat_id, message_id, text).await.is_ok()
}

// ── Chain command ────────────────────────────────────────────────────

async fn cmd_chain(
    bot: Bot,
    chat_id: ChatId,
    coordinator: Arc<Coordinator>,
    user_id: i64,
    raw: String,
) -> Result<()> {
    if raw.is_empty() {
        bot.send_message(
            chat_id,
            "Usage: /chain step 1 -> step 2 -> step 3\nUse {output} to pass artifacts between steps.",
        )
        .await?;
        return Ok(());
    }

    let steps = parse_chain(&raw);
    if steps.len() < 2 {
        bot.send_message(chat_id, "A chain needs at least 2 steps separated by ->")
            .await?;
        return Ok(());
    }

    let base_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let mut previous_artifacts: Vec<PathBuf> = Vec::new();
    let total = steps.len();

    let listing: Vec<String> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| format!("  {}. {s}", i + 1))
        .collect();
    bot.send_message(
        chat_id,
        format!("Starting chain: {total} steps\n{}", listing.join("\n")),
    )
    .await?;

    for (i, step) in steps.iter().enumerate() {
        let step_id = format!("{base_id}-step{i}");
        let step_msg = substitute_output(step, &previous_artifacts);
        let files = previous_artifacts.clone();

        coordinator.store.create_task(&step_id, user_id, &step_msg)?;
        let head: String = step_msg.chars().take(100).collect();
        bot.send_message(chat_id, format!("Step {}/{total}: {head}", i + 1))
            .await?;

        let result = coordinator
            .run_pipeline(step_id.clone(), user_id, step_msg.clone(), files)
            .await;

        let state = match result {
            Ok(state) => state,
            Err(failure) => {
                let reason = match failure {
                    PipelineFailure::TimedOut(_) => "Pipeline timeout".to_string(),
                    PipelineFailure::Cancelled => "Cancelled".to_string(),
                    PipelineFailure::Failed(e) | PipelineFailure::Internal(e) => {
                        sanitize_error(&e)
                    }
                };
                coordinator
                    .store
                    .update_task_status(&step_id, "failed", Some(&reason))?;
                bot.send_message(
                    chat_id,
                    format!(
                        "Chain halted at step {}/{total}: {reason}\nSteps {}-{total} were NOT executed.",
                        i + 1,
                        i + 2
                    ),
                )
                .await?;
                return Ok(());
            }
        };

        let passed = state.verdict() == Verdict::Pass;
        coordinator.store.complete_task(
            &step_id,
            if passed { "completed" } else { "failed" },
            state.task_type.as_str(),
            &state.final_response.chars().take(5000).collect::<String>(),
        )?;

        // STRICT-AND gate: a failed step halts the chain and forwards
        // nothing.
        if !passed {
            let feedback: String = state.audit_feedback.chars().take(300).collect();
            let head: String = state.message.chars().take(100).collect();
            bot.send_message(
                chat_id,
                format!(
                    "Chain halted at step {}/{total}.\n\nStep failed: {head}\nReason: {feedback}\n\n\
                     Steps {}-{total} were NOT executed.\nNo artifacts from this step were forwarded.",
                    i + 1,
                    i + 2
                ),
            )
            .await?;
            return Ok(());
        }

        previous_artifacts = state.artifacts.clone();

        let response = if state.final_response.is_empty() {
            "Step completed.".to_string()
        } else {
            state.final_response.clone()
        };
        send_long_message(&bot, chat_id, &format!("Step {}: {response}", i + 1)).await;
        send_artifacts(
            &bot,
            chat_id,
            &previous_artifacts,
            coordinator.config.max_file_size_bytes,
        )
        .await;
    }

    bot.send_message(chat_id, format!("Chain complete - all {total} steps passed."))
        .await?;
    Ok(())
}

// ── Scheduled jobs ───────────────────────────────────────────────────

async fn run_scheduled_job(bot: Bot, coordinator: Arc<Coordinator>, job: ScheduledJob) {
    if let Err(rejection) = coordinator.admit_scheduled() {
        warn!(
            "Skipping scheduled task '{}': {rejection}",
            job.message.chars().take(60).collect::<String>()
        );
        return;
    }

    let task_id = uuid::Uuid::new_v4().to_string();
    let chat_id = ChatId(job.chat_id);

    let outcome = async {
        coordinator
            .store
            .create_task(&task_id, job.user_id, &job.message)?;
        let result = coordinator
            .run_pipeline(task_id.clone(), job.user_id, job.message.clone(), Vec::new())
            .await;
        anyhow::Ok(result)
    }
    .await;

    coordinator.guards.release();
    crate::core::pipeline::clear_stage(&task_id);
    crate::core::sandbox::live::clear(&task_id);

    match outcome {
        Ok(Ok(state)) => {
            let response: String = state.final_response.chars().take(4000).collect();
            let _ = bot
                .send_message(chat_id, format!("[Scheduled] {response}"))
                .await;
            send_artifacts(
                &bot,
                chat_id,
                &state.artifacts,
                coordinator.config.max_file_size_bytes,
            )
            .await;
            let status = if state.verdict() == Verdict::Pass {
                "completed"
            } else {
                "failed"
            };
            let _ = coordinator.store.complete_task(
                &task_id,
                status,
                state.task_type.as_str(),
                &state.final_response,
            );
        }
        Ok(Err(PipelineFailure::TimedOut(secs))) => {
            error!("Scheduled task {task_id} timed out after {secs}s");
            let head: String = job.message.chars().take(100).collect();
            let _ = bot
                .send_message(
                    chat_id,
                    format!("[Scheduled] Task timed out after {secs}s: {head}"),
                )
                .await;
            let _ = coordinator.store.update_task_status(
                &task_id,
                "failed",
                Some(&format!("Timed out after {secs}s")),
            );
        }
        Ok(Err(failure)) => {
            let reason = match failure {
                PipelineFailure::Failed(e) | PipelineFailure::Internal(e) => e,
                PipelineFailure::Cancelled => "cancelled".to_string(),
                PipelineFailure::TimedOut(_) => unreachable!("handled above"),
            };
            error!("Scheduled task {task_id} failed: {reason}");
            let _ = bot
                .send_message(
                    chat_id,
                    format!("[Scheduled] Task failed: {}", sanitize_error(&reason)),
                )
                .await;
            let _ = coordinator
                .store
                .update_task_status(&task_id, "failed", Some(&reason));
        }
        Err(e) => {
            error!("Scheduled task {task_id} setup failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_are_a_single_chunk() {
        assert_eq!(chunk_message("hello", 4096), vec!["hello"]);
    }

    #[test]
    fn chunks_split_at_line_boundaries() {
        let text = format!("{}\n{}\n{}", "a".repeat(30), "b".repeat(30), "c".repeat(30));
        let chunks = chunk_message(&text, 70);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= 70);
        }
        // No content is lost.
        let rejoined: String = chunks.join("\n");
        assert_eq!(
            rejoined.replace('\n', "").len(),
            text.replace('\n', "").len()
        );
    }

    #[test]
    fn overlong_single_lines_are_hard_split() {
        let text = "x".repeat(10_000);
        let chunks = chunk_message(&text, 4096);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 10_000);
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let text = "é".repeat(5000); // 2 bytes per char
        let chunks = chunk_message(&text, 4096);
        for chunk in &chunks {
            assert!(chunk.len() <= 4096);
            // Would panic on a broken boundary.
            let _ = chunk.chars().count();
        }
    }

    #[test]
    fn command_parsing_distinguishes_prefixes() {
        assert_eq!(command_args("/status", "/status"), Some(String::new()));
        assert_eq!(
            command_args("/exec ls -la", "/exec"),
            Some("ls -la".to_string())
        );
        // "/statusfoo" must not match "/status".
        assert_eq!(command_args("/statusfoo", "/status"), None);
        assert_eq!(command_args("plain message", "/status"), None);
    }

    #[test]
    fn task_duration_is_computed_from_record_timestamps() {
        assert_eq!(
            task_duration("2026-08-01T10:00:00+00:00", "2026-08-01T10:02:05+00:00"),
            Some(125)
        );
        // Incomplete tasks have an empty completed_at.
        assert_eq!(task_duration("2026-08-01T10:00:00+00:00", ""), None);
    }

    #[test]
    fn identical_snapshots_hash_identically() {
        let a = "Generating and running code...\n\nLatest output:\nline 1 (task abcd1234)";
        let b = a.to_string();
        assert_eq!(hash_of(a), hash_of(&b));
        assert_ne!(hash_of(a), hash_of("something else"));
    }
}

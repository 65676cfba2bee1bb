mod config;
mod core;
mod interfaces;
mod logging;

use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::core::coordinator::Coordinator;
use crate::core::llm::Gateway;
use crate::core::projects::ProjectRegistry;
use crate::core::scheduler::{JobStore, Scheduler};
use crate::core::store::{cleanup_workspace_files, Store};
use crate::interfaces::telegram::TelegramInterface;

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(e) = run().await {
        error!("Fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    config.validate()?;
    config.ensure_dirs()?;

    info!("foreman starting up");
    info!("Allowed user IDs: {:?}", config.allowed_user_ids);
    info!("Default model: {}", config.default_model);
    info!("Workspace: {}", config.workspace_dir.display());

    let store = Arc::new(Store::open(&config.db_path)?);

    // Tasks left in running/pending by a crash are history now.
    store.recover_stale_tasks()?;
    store.prune_old_data(30, 90)?;
    cleanup_workspace_files(&[config.outputs_dir.as_path(), config.uploads_dir.as_path()], 7);
    info!("Storage cleanup completed");

    let projects = Arc::new(ProjectRegistry::load(&config.registry_path)?);
    info!("Projects registered: {}", projects.all().len());

    let gateway = Arc::new(Gateway::new(Arc::clone(&config), Arc::clone(&store)));
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&projects),
        Arc::clone(&gateway),
    ));

    let bot = teloxide::Bot::new(&config.telegram_bot_token);

    // The scheduler persists in its own database file and resumes jobs
    // across restarts.
    let job_store = Arc::new(JobStore::open(&config.scheduler_db_path)?);
    let runner = TelegramInterface::job_runner(bot.clone(), Arc::clone(&coordinator));
    let scheduler = Arc::new(Scheduler::start(job_store, runner).await?);

    info!("All services initialized. Send /start to the bot to begin.");

    let interface = TelegramInterface::new(bot, coordinator, scheduler);
    interface.start().await
}

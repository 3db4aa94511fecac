//! limiter-admin — Telegram-бот контроля лимита устройств с эскалацией наказаний.

mod bot;
mod config;
mod connections;
mod db;
mod enforcement;
mod locks;
mod monitor;
mod monitoring;
mod punishment;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::Dispatcher;
use teloxide::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/limiter-admin.toml"));
    tracing::info!(
        "Starting limiter-admin with config {}",
        config_path.display()
    );

    let config = Arc::new(config::Config::load(&config_path)?);
    let token = config.bot_token()?;
    tracing::info!(
        admin_count = config.admin_ids.len(),
        db_path = %config.db_path.display(),
        connections_path = %config.monitoring.connections_path.display(),
        default_limit = config.limits.default,
        tick_interval_secs = config.monitoring.tick_interval_secs,
        "Configuration loaded"
    );

    let db = Arc::new(db::Db::open(&config.db_path).await?);

    let policy = match punishment::PunishmentPolicy::from_config(&config.punishment) {
        Ok(policy) => policy,
        Err(error) => {
            tracing::warn!(
                error = %error,
                "Некорректная секция [punishment], используются значения по умолчанию"
            );
            punishment::PunishmentPolicy::default()
        }
    };
    let engine = Arc::new(punishment::PunishmentEngine::new(
        Arc::clone(&db) as Arc<dyn punishment::ViolationStore>,
        policy,
    ));

    let warnings = Arc::new(monitoring::WarningSystem::new(
        Arc::clone(&db) as Arc<dyn monitoring::WarningStore>,
        config.monitoring_settings(),
    ));
    let restored = warnings.load_warnings().await?;
    tracing::info!(restored = restored, "Monitoring warnings restored");

    let enforcer: Arc<dyn enforcement::Enforcer> =
        Arc::new(enforcement::CommandEnforcer::new(&config.enforcement));
    let source = Arc::new(connections::JsonFileSource::new(
        config.monitoring.connections_path.clone(),
    ));

    let monitor = Arc::new(monitor::Monitor::new(
        Arc::clone(&engine),
        Arc::clone(&warnings),
        Arc::clone(&db),
        Arc::clone(&enforcer),
        source,
        monitor::MonitorSettings {
            limits: config.limits.clone(),
            retention_days: config.monitoring.retention_days,
            fallback_disable_minutes: config.monitoring.fallback_disable_minutes,
        },
    ));

    let bot = Bot::new(token);

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(bot::handlers::forward_monitor_events(
        bot.clone(),
        config.admin_ids.clone(),
        events_rx,
    ));
    tokio::spawn(monitor.run(
        Duration::from_secs(config.monitoring.tick_interval_secs),
        events_tx,
    ));

    let policy_file = Arc::new(config::PolicyFile::new(config.path.clone()));
    let state = bot::handlers::BotState {
        config,
        db,
        engine,
        warnings: Arc::clone(&warnings),
        enforcer,
        policy_file,
    };
    tracing::info!("Dispatcher initialized, bot is ready");

    Dispatcher::builder(bot, bot::handlers::schema())
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    warnings.save_warnings().await?;
    tracing::info!("Monitoring warnings saved, shutting down");
    Ok(())
}

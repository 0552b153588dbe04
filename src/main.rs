//! marzban-admin-bot: Telegram-бот для администрирования аккаунтов панели Marzban.

mod bot;
mod config;
mod db;
mod panel;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::dispatching::Dispatcher;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tokio::sync::Mutex;

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
        .unwrap_or_else(|| PathBuf::from("/etc/marzban-admin-bot.toml"));
    tracing::info!(
        "Starting marzban-admin-bot with config {}",
        config_path.display()
    );

    let config = Arc::new(config::Config::load(&config_path)?);
    let token = config.bot_token()?;
    tracing::info!(
        admin_count = config.admin_ids.len(),
        db_path = %config.db_path.display(),
        panel_url = %config.panel.base_url,
        users_page_size = config.users_page_size,
        throttle_secs = config.throttle_secs,
        "Configuration loaded"
    );

    let db = Arc::new(db::Db::open(&config.db_path).await?);
    let panel = Arc::new(panel::PanelClient::new(&config.panel)?);
    if !panel.check_connection().await {
        tracing::error!(panel_url = %config.panel.base_url, "Panel API is unreachable");
        return Err("не удалось подключиться к API панели".into());
    }
    tracing::info!("Panel API connection verified");

    let bot = Bot::new(token);
    if let Err(error) = bot
        .set_my_commands(bot::handlers::BotCommand::bot_commands())
        .await
    {
        tracing::warn!(error = %error, "Не удалось зарегистрировать команды бота");
    }

    let state = bot::handlers::BotState {
        throttle: Arc::new(bot::throttle::Throttle::new(config.throttle_period())),
        config,
        db,
        panel,
        dialogs: Arc::new(Mutex::new(HashMap::new())),
    };
    tracing::info!("Dispatcher initialized, bot is ready");

    Dispatcher::builder(bot, bot::handlers::schema())
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

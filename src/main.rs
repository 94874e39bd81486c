use std::sync::Arc;

use chrono::Utc;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;

use chorus::backend::OpenAiBackend;
use chorus::config::Config;
use chorus::coord::{FileBus, FileClaimStore};
use chorus::engine::{Engine, InboundEvent};
use chorus::telegram::TelegramClient;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "chorus.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("chorus.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting chorus as @{}...", config.bot_username);
    info!("Loaded config from {config_path}");
    info!("Peers: {:?}", config.peer_bots);

    let claims = FileClaimStore::new(&config.claim_dir);
    if let Err(e) = claims.init() {
        warn!("Failed to create claim dir {}: {e}", claims.dir().display());
    }
    let bus = FileBus::new(&config.bus_dir);
    if let Err(e) = bus.init() {
        warn!("Failed to create bus dir {}: {e}", bus.dir().display());
    }

    let backend = match OpenAiBackend::new(
        config.openai_api_key.clone(),
        config.openai_base_url.clone(),
        config.openai_model.clone(),
        config.system_prompt.clone(),
        config.openai_tools.clone(),
    ) {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to build backend client: {e}");
            std::process::exit(1);
        }
    };

    let engine = Arc::new(Engine::new(
        config.engine_settings(),
        Arc::new(claims),
        Arc::new(bus),
        Arc::new(backend),
        Arc::new(TelegramClient::new(bot.clone())),
        Utc::now(),
    ));
    engine.restore().await;

    let cancel = CancellationToken::new();
    let tasks = [
        tokio::spawn(engine.clone().run_nudge_loop(cancel.clone())),
        tokio::spawn(engine.clone().run_bus_loop(cancel.clone())),
        tokio::spawn(engine.clone().run_persist_loop(cancel.clone())),
    ];

    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![engine])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Shutting down...");
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task failed: {e}");
        }
    }
    info!("👋 Stopped");
}

async fn handle_message(msg: Message, engine: Arc<Engine>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };

    let sender = user.username.as_deref().unwrap_or(&user.first_name).to_string();
    let preview: String = text.chars().take(100).collect();
    debug!("📨 [{}] {}: \"{}\"", msg.chat.id, sender, preview);

    let event = InboundEvent {
        chat_id: msg.chat.id.0,
        message_id: Some(msg.id.0 as i64),
        sender,
        text: text.to_string(),
        timestamp: msg.date,
    };

    let outcome = engine.handle_message(event).await;
    debug!("Chat {} → {:?}", msg.chat.id, outcome);
    Ok(())
}

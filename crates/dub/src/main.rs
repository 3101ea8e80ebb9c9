use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dub_core::{
    bot::LedgerBot, commands::CommandTable, config::Config, ledger::SqliteLedger,
    pipeline::DispatchPipeline,
};
use dub_telegram::{TelegramMessenger, TelegramSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;
    dub_core::logging::init("dub", cfg.debug)?;

    let ledger = Arc::new(
        SqliteLedger::open(&cfg.db_path)
            .with_context(|| format!("failed to open ledger at {}", cfg.db_path.display()))?,
    );

    let bot = dub_telegram::build_bot(&cfg.telegram_bot_token, cfg.pipeline.poll_timeout)?;
    let bot_name = match cfg.bot_name.clone() {
        Some(name) => name,
        None => dub_telegram::bot_username(&bot)
            .await
            .context("failed to resolve bot username")?,
    };
    info!(bot = %bot_name, db = %cfg.db_path.display(), "starting");

    let messenger = Arc::new(TelegramMessenger::new(bot.clone()));
    let handler = Arc::new(LedgerBot::new(
        ledger,
        messenger.clone(),
        messenger,
        Arc::new(CommandTable::standard()),
        Some(bot_name),
    ));
    let source = Arc::new(TelegramSource::new(bot, cfg.pipeline.poll_timeout));

    let cancel = CancellationToken::new();
    let pipeline = DispatchPipeline::new(cfg.pipeline.clone(), source, handler)?;
    let handle = pipeline.start(cancel.clone());

    tokio::spawn(shutdown_on_signal(cancel));

    let stats = handle.wait().await;
    info!(
        enqueued = stats.enqueued,
        handled = stats.handled,
        failed = stats.failed,
        panicked = stats.panicked,
        cursor = stats.cursor,
        "stopped"
    );
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown requested");
    cancel.cancel();
}

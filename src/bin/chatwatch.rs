use anyhow::{Context, Result};
use chatwatch::config::WatcherConfig;
use chatwatch::orchestrator::{ScanEvent, ScanTrigger, Scanner};
use flume::unbounded;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chatwatch=debug")),
        )
        .init();

    let config = WatcherConfig::load();
    if config.contact.trim().is_empty() {
        tracing::warn!(
            "No contact configured; set `contact` in {:?} or CHATWATCH_CONTACT",
            WatcherConfig::config_path()
        );
    }
    tracing::info!(
        "chatwatch starting: contact={:?} poll={}s model={} db={:?}",
        config.contact,
        config.poll_interval_secs,
        config.llm_model,
        config.message_db_path
    );
    tracing::info!(
        "Sinks: calendar={} url_reminders={} native_reminders={} push={}",
        config.enable_calendar,
        config.enable_url_reminders,
        config.enable_native_reminders,
        config.enable_push
    );

    let (event_tx, event_rx) = unbounded();
    let (trigger_tx, trigger_rx) = unbounded();
    let scanner = Arc::new(Scanner::from_config(config, event_tx));

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(async move {
        // Kick one scan immediately so a fresh start baselines the cursor
        // without waiting out the first poll interval.
        let _ = trigger_tx.send(ScanTrigger::Manual);

        let logger = tokio::spawn(log_events(event_rx));
        scanner.run_loop(trigger_rx).await;
        logger.abort();
    });
    Ok(())
}

/// Headless event subscriber: everything a UI would surface gets logged.
async fn log_events(event_rx: flume::Receiver<ScanEvent>) {
    while let Ok(event) = event_rx.recv_async().await {
        match event {
            ScanEvent::Started => tracing::debug!("Scan started"),
            ScanEvent::Finished {
                new_messages,
                items,
                actions,
            } => {
                if new_messages > 0 {
                    tracing::info!(
                        "Scan finished: {} new message(s), {} item(s), {} action(s)",
                        new_messages,
                        items,
                        actions
                    );
                } else {
                    tracing::debug!("Scan finished: nothing new");
                }
            }
            ScanEvent::ActionTaken { title } => tracing::info!("Action taken: {}", title),
            ScanEvent::PermissionHint(msg) => tracing::warn!(
                "Cannot read the Messages database ({}). Grant Full Disk Access to this binary in System Settings > Privacy & Security.",
                msg
            ),
            ScanEvent::Error(msg) => tracing::error!("{}", msg),
        }
    }
}

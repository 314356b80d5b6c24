use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use reply_pilot::config::{ConfigSource, FileConfig, RuntimeConfig, StaticConfig};
use reply_pilot::decision::{
    DecisionService, DisabledDecisionService, HttpDecisionConfig, HttpDecisionService,
};
use reply_pilot::pipeline::{Autopilot, AutopilotDeps, Notice};
use reply_pilot::store::{LibSqlStore, MemoryStore, Store, counters};
use reply_pilot::surface::{MemorySurface, MessageElement};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runtime = RuntimeConfig::from_env();

    // Initialize tracing; the guard flushes the file writer on exit.
    let (file_layer, _log_guard) = match &runtime.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "reply-pilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    eprintln!("Reply Pilot v{}", env!("CARGO_PKG_VERSION"));

    // ── Configuration ───────────────────────────────────────────────────
    let config: Arc<dyn ConfigSource> = match &runtime.config_path {
        Some(path) => {
            eprintln!("   Config: {}", path.display());
            Arc::new(FileConfig::new(path))
        }
        None => {
            eprintln!("   Config: built-in defaults");
            Arc::new(StaticConfig::default())
        }
    };

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = match &runtime.db_path {
        Some(path) => {
            let store = LibSqlStore::new_local(path)
                .await
                .with_context(|| format!("Failed to open database at {}", path.display()))?;
            eprintln!("   Database: {}", path.display());
            Arc::new(store)
        }
        None => {
            eprintln!("   Database: in-memory");
            Arc::new(MemoryStore::new())
        }
    };

    // ── Decision service ────────────────────────────────────────────────
    let decision: Arc<dyn DecisionService> = match &runtime.decision_url {
        Some(url) => {
            let service = HttpDecisionService::new(HttpDecisionConfig {
                base_url: url.clone(),
                api_key: runtime.decision_key.clone(),
                timeout: runtime.decision_timeout,
            })?;
            eprintln!("   Decision service: {url}");
            Arc::new(service)
        }
        None => {
            eprintln!("   Decision service: disabled");
            Arc::new(DisabledDecisionService)
        }
    };

    // ── Surface ─────────────────────────────────────────────────────────
    // The console drives an in-memory surface: each stdin line
    // `conversation: text` arrives as an incoming message.
    let surface = Arc::new(MemorySurface::new());

    let autopilot = Autopilot::new(AutopilotDeps {
        observation: surface.clone(),
        action: surface.clone(),
        config,
        decision,
        store: store.clone(),
    })
    .await
    .context("Failed to load settings")?;

    let mut notices = autopilot.subscribe_notices();
    let mut sent = surface.subscribe_sent();
    let run = autopilot.spawn();

    eprintln!("   Type `conversation: message`, /stats, or /quit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut next_message = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if line == "/stats" {
                    print_stats(&autopilot, store.as_ref()).await;
                    continue;
                }
                let Some((conversation, text)) = line.split_once(':') else {
                    eprintln!("Expected `conversation: message`");
                    continue;
                };
                let (conversation, text) = (conversation.trim(), text.trim());
                if conversation.is_empty() || text.is_empty() {
                    eprintln!("Expected `conversation: message`");
                    continue;
                }

                if !surface.has_contact(conversation) {
                    surface.add_contact(conversation, conversation);
                    if surface.active().is_none() {
                        surface.set_active(Some(conversation));
                    }
                }
                next_message += 1;
                let id = format!("console-{next_message}");
                let now = chrono::Local::now().format("%H:%M:%S").to_string();
                surface.push_message(conversation, MessageElement::text(&id, text).with_time(&now));
            }
            record = sent.recv() => match record {
                Ok(record) => {
                    let to = record.conversation.as_deref().unwrap_or("?");
                    println!("[{to}] <- {}", record.content);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Sent feed lagged");
                }
                Err(RecvError::Closed) => break,
            },
            notice = notices.recv() => match notice {
                Ok(notice) => print_notice(&notice),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notice feed lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    autopilot.stop();
    run.await.context("Autopilot task failed")?;
    print_stats(&autopilot, store.as_ref()).await;
    Ok(())
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::ReplySent { .. } | Notice::ToolSent { .. } => {}
        Notice::SendFailed {
            conversation,
            error,
        } => eprintln!("!! send to {conversation} failed: {error}"),
        Notice::SwitchFailed {
            conversation,
            reason,
        } => eprintln!("!! could not open {conversation}: {reason}"),
        Notice::RecoveryStarted { attempt } => {
            eprintln!("!! rebuilding message subscription (attempt {attempt})")
        }
        Notice::RecoveryExhausted => {
            eprintln!("!! recovery budget exhausted, running degraded")
        }
    }
}

async fn print_stats(autopilot: &Autopilot, store: &dyn Store) {
    let stats = autopilot.queue_stats();
    eprintln!(
        "   queue: {} sent, {} failed, {} cancelled, avg {:?}",
        stats.succeeded, stats.failed, stats.cancelled, stats.average_latency
    );
    for name in [
        counters::MESSAGES_PROCESSED,
        counters::REPLIES_SENT,
        counters::REPLIES_FAILED,
        counters::TOOLS_SENT,
        counters::GATE_REJECTIONS,
    ] {
        match store.counter(name).await {
            Ok(value) => eprintln!("   {name}: {value}"),
            Err(e) => eprintln!("   {name}: unavailable ({e})"),
        }
    }
}

#![warn(clippy::all)]
#![allow(clippy::uninlined_format_args, clippy::too_many_lines)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wagate::alerts::AlertSink;
use wagate::dispatch::WebhookDispatcher;
use wagate::envelope::EventEnvelope;
use wagate::handlers::message::MentionConfig;
use wagate::handlers::{ConnectionHandler, MessageHandler};
use wagate::mention::MentionDetector;
use wagate::router::{EventKind, EventRouter};
use wagate::server::{self, AppState};
use wagate::settings::Settings;
use wagate::store::{ConfigStore, MediaStore, MessageStore, StatsStore};

const STATS_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(300);
const MESSAGES_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// `wagate` — WhatsApp message-routing gateway.
#[derive(Parser, Debug)]
#[command(name = "wagate")]
#[command(version)]
#[command(about = "Route WhatsApp events to HTTP destinations by sender identity", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway (default)
    Serve {
        /// Bind port (overrides WAGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Data directory (overrides WAGATE_DATA_DIR)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Check configuration and destination reachability
    Doctor,

    /// Print the resolved runtime options
    Config,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WAGATE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut settings = Settings::from_env();

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        data_dir: None,
    }) {
        Commands::Serve { port, data_dir } => {
            if let Some(port) = port {
                settings.port = port;
            }
            if let Some(dir) = data_dir {
                settings.data_dir = dir;
            }
            settings.validate()?;
            serve(settings).await
        }
        Commands::Doctor => doctor(&settings).await,
        Commands::Config => {
            let mut shown = settings.clone();
            if shown.admin_password.is_some() {
                shown.admin_password = Some("********".into());
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
            Ok(())
        }
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    std::fs::create_dir_all(&settings.data_dir).with_context(|| {
        format!(
            "failed to create data directory: {}",
            settings.data_dir.display()
        )
    })?;

    // ── Stores ───────────────────────────────────────────────
    let config = Arc::new(ConfigStore::load(
        settings.data_dir.join("contacts.json"),
        settings.webhook_url.clone(),
    )?);
    let stats = Arc::new(StatsStore::load(
        settings.data_dir.join("stats.json"),
        settings.recent_events_limit,
        &EventKind::names(),
    )?);
    let messages = Arc::new(MessageStore::load(
        settings.data_dir.join("messages.json"),
        settings.messages_per_source,
        settings.max_total_messages,
    )?);
    let media = Arc::new(MediaStore::load(
        settings.data_dir.join("media"),
        settings.max_media_files,
        settings.max_media_bytes,
    )?);

    // ── Pipeline ─────────────────────────────────────────────
    let alerts = Arc::new(AlertSink::new(
        settings.alert_webhook_url.clone(),
        settings.alert_rich_url.clone(),
        settings.instance_name.clone(),
        stats.clone(),
    ));
    let dispatcher = Arc::new(WebhookDispatcher::new(
        config.clone(),
        settings.secondary_webhook_url.clone(),
        settings.instance_name.clone(),
    ));
    let message_handler = Arc::new(MessageHandler::new(
        config.clone(),
        stats.clone(),
        messages.clone(),
        dispatcher.clone(),
        alerts.clone(),
        MentionDetector::new(settings.mention_keyword_list()),
        MentionConfig {
            enabled: settings.mention_enabled,
            webhook_url: settings.mention_webhook_url.clone(),
            token: settings.mention_token.clone(),
            mentions_only: settings.mentions_only,
        },
        settings.forward_outgoing,
        settings.forward_message_updates,
    ));
    let connection = Arc::new(ConnectionHandler::new(alerts.clone()));
    let router = Arc::new(EventRouter::new(
        message_handler.clone(),
        connection.clone(),
        stats.clone(),
        settings.log_presence,
    ));

    // The direct client is an embedding seam: the `ClientSession` trait
    // carries the protocol socket, and this build ships none.
    if settings.adapter_enabled {
        anyhow::bail!(
            "WAGATE_ADAPTER_ENABLED is set, but this build carries no client \
             session backend. Embed one through wagate::adapter::ClientSession, \
             or unset the flag and run webhook-only."
        );
    }

    // ── Shutdown plumbing ────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx.clone());

    // Envelope channel: the adapter produces, this loop consumes. In
    // webhook-only mode it idles until shutdown closes it.
    let (_envelope_tx, mut envelope_rx) = mpsc::channel::<EventEnvelope>(256);
    {
        let router = router.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = envelope_rx.recv() => {
                        let Some(envelope) = envelope else { break };
                        router.route(&envelope.event, &envelope.data).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    spawn_autosave_loops(
        stats.clone(),
        messages.clone(),
        shutdown_rx.clone(),
    );

    let state = AppState {
        settings: settings.clone(),
        router,
        config: config.clone(),
        stats: stats.clone(),
        messages: messages.clone(),
        media,
        dispatcher,
        connection,
        adapter: None,
        ingress_count: Arc::new(AtomicU64::new(0)),
    };

    info!(
        instance = %settings.instance_name,
        port = settings.port,
        data_dir = %settings.data_dir.display(),
        "wagate.starting"
    );
    let serve_result = server::serve(state, settings.port, shutdown_rx).await;

    // Ordered shutdown: intake has stopped; flush config, stats, messages.
    info!("wagate.flushing");
    if let Err(e) = config.save() {
        error!(error = %e, "shutdown.config_flush_failed");
    }
    if let Err(e) = stats.save() {
        error!(error = %e, "shutdown.stats_flush_failed");
    }
    if let Err(e) = messages.save() {
        error!(error = %e, "shutdown.messages_flush_failed");
    }
    info!("wagate.stopped");
    serve_result
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "signal.sigterm_unavailable");
                    let _ = ctrl_c.await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("signal.ctrl_c"),
                _ = sigterm.recv() => info!("signal.sigterm"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("signal.ctrl_c");
        }
        let _ = shutdown_tx.send(true);
    });
}

fn spawn_autosave_loops(
    stats: Arc<StatsStore>,
    messages: Arc<MessageStore>,
    shutdown: watch::Receiver<bool>,
) {
    {
        let stats = stats.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATS_AUTOSAVE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = stats.save() {
                            warn!(error = %e, "autosave.stats_failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
    {
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MESSAGES_FLUSH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = messages.flush_if_dirty() {
                            warn!(error = %e, "autosave.messages_failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

async fn doctor(settings: &Settings) -> Result<()> {
    println!("wagate doctor");
    println!("  data dir:        {}", settings.data_dir.display());
    println!(
        "  default webhook: {}",
        settings.webhook_url.as_deref().unwrap_or("(none)")
    );
    println!(
        "  secondary:       {}",
        settings.secondary_webhook_url.as_deref().unwrap_or("(none)")
    );
    println!(
        "  mention hook:    {}",
        if settings.mention_enabled { "enabled" } else { "disabled" }
    );
    println!(
        "  adapter:         {}",
        if settings.adapter_enabled { "enabled" } else { "webhook-only" }
    );

    match settings.validate() {
        Ok(()) => println!("  validation:      ✅ ok"),
        Err(e) => {
            println!("  validation:      ❌ {e}");
            return Err(e);
        }
    }

    if std::fs::create_dir_all(&settings.data_dir).is_ok() {
        println!("  data dir write:  ✅ ok");
    } else {
        println!("  data dir write:  ❌ cannot create");
    }

    if let Some(url) = &settings.webhook_url {
        let config = Arc::new(ConfigStore::load(
            settings.data_dir.join("contacts.json"),
            Some(url.clone()),
        )?);
        let dispatcher =
            WebhookDispatcher::new(config, None, settings.instance_name.clone());
        let outcome = dispatcher.test(None).await;
        if outcome.success {
            println!("  destination:     ✅ reachable ({url})");
        } else {
            println!(
                "  destination:     ⚠️  {}",
                outcome.error.unwrap_or_else(|| "unreachable".into())
            );
        }
    }

    Ok(())
}

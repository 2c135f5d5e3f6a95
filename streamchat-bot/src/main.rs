//! streamchat-bot: pipe stdin into a stream chat channel.
//!
//! Each stdin line is queued for the channel and goes out under the
//! platform's rate limit. Input prefixes:
//!
//!   !priority <text>   queue with priority headroom
//!   /raw <line>        write a protocol line right away
//!
//! The OAuth token comes from --oauth, STREAMCHAT_OAUTH or the config file.
//! Send SIGHUP to re-read the `[session]` table of the config file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use streamchat_bot::config::{self, BotConfig, Overrides, Resolved};
use streamchat_bot::input::{self, Command};
use streamchat_bot::users::UserCache;
use streamchat_sdk::{Event, IrcConnector, LiveConfig, Message, Session};

#[derive(Parser)]
#[command(name = "streamchat-bot", about = "Send stdin to a stream chat channel")]
struct Args {
    /// Chat server address (host:port)
    #[arg(long)]
    server: Option<String>,

    /// Channel to join
    #[arg(long)]
    channel: Option<String>,

    /// Bot account login name
    #[arg(long)]
    nick: Option<String>,

    /// OAuth token for the bot account
    #[arg(long, env = "STREAMCHAT_OAUTH", hide_env_values = true)]
    oauth: Option<String>,

    /// Use TLS
    #[arg(long)]
    tls: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    tls_insecure: bool,

    /// Config file (default: ~/.config/streamchat/bot.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            server: self.server.clone(),
            channel: self.channel.clone(),
            bot_name: self.nick.clone(),
            oauth: self.oauth.clone(),
            tls: self.tls,
            tls_insecure: self.tls_insecure,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "streamchat_bot=info,streamchat_sdk=info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config_path = args.config.clone().unwrap_or_else(config::default_path);
    let file = BotConfig::load(&config_path)?;
    let resolved = Resolved::merge(&args.overrides(), &file)?;

    tracing::info!(
        server = %resolved.server,
        channel = %resolved.channel,
        bot = %resolved.bot_name,
        message_limit = resolved.session.message_limit,
        "Starting streamchat-bot"
    );

    let (events_tx, events_rx) = mpsc::channel(256);
    let connector = IrcConnector::new(&resolved.server, events_tx)
        .tls(resolved.tls)
        .tls_insecure(resolved.tls_insecure);
    let live = LiveConfig::new(resolved.session.clone());
    let session = Arc::new(Session::new(
        &resolved.channel,
        &resolved.bot_name,
        &resolved.oauth,
        Arc::new(connector),
        live.clone(),
    ));

    session.connect().await;
    let consumer = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    let users = Arc::new(UserCache::new(&resolved.channel));
    tokio::spawn(pump_events(events_rx, session.clone(), users.clone()));
    tokio::spawn(read_stdin(session.clone()));
    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(config_path, live));

    tracing::info!("Bot running. Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    tracing::info!(users = users.len(), pending = session.queue_len(), "Shutting down");
    session.close().await;
    consumer.await.context("queue consumer panicked")?;
    Ok(())
}

/// Feed inbound events to the membership cache and act as the reconnect
/// watchdog.
async fn pump_events(mut events: mpsc::Receiver<Event>, session: Arc<Session>, users: Arc<UserCache>) {
    while let Some(event) = events.recv().await {
        users.apply(&event);
        match &event {
            Event::Registered { nick } => tracing::info!("Registered as {nick}"),
            Event::Notice { text, msg_id, .. } => {
                tracing::info!(msg_id = msg_id.as_deref().unwrap_or(""), "Notice: {text}")
            }
            Event::Message { from, target, text, .. } => {
                tracing::debug!(%target, "<{from}> {text}")
            }
            e if e.wants_reconnect() => {
                tracing::warn!(event = ?e, "Connection going away, reconnecting");
                let session = session.clone();
                tokio::spawn(async move {
                    session.reconnect().await;
                });
            }
            _ => {}
        }
    }
    tracing::debug!("Event stream ended");
}

async fn read_stdin(session: Arc<Session>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("stdin closed, no more input");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                return;
            }
        };

        let queued = match input::parse(&line) {
            None => continue,
            Some(Command::Say(text)) => session.say(text),
            Some(Command::Priority(text)) => session.enqueue(Message::priority(text)),
            Some(Command::Raw(raw)) => {
                // Failures are logged by the session.
                let _ = session.send_raw(&raw).await;
                Ok(())
            }
        };
        if queued.is_err() {
            tracing::warn!("Session closed, ignoring further input");
            return;
        }
    }
}

#[cfg(unix)]
async fn reload_on_hangup(path: PathBuf, live: LiveConfig) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "Can't install SIGHUP handler, live reload disabled");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        match BotConfig::load(&path) {
            Ok(file) => {
                live.replace(file.session);
                tracing::info!(
                    message_limit = live.message_limit(),
                    "Reloaded {}",
                    path.display()
                );
            }
            Err(e) => tracing::warn!("Config reload failed, keeping current settings: {e:#}"),
        }
    }
}

//! Persistent configuration for streamchat-bot.
//!
//! Config file lives at `~/.config/streamchat/bot.toml` unless `--config`
//! points elsewhere. Every key is optional; CLI flags win over the file.
//!
//! ```toml
//! server = "irc.chat.twitch.tv:6697"
//! channel = "mychannel"
//! bot_name = "mybot"
//!
//! [session]
//! message_limit = 100.0
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use streamchat_sdk::SessionConfig;
use streamchat_sdk::transport::DEFAULT_SERVER;

/// Contents of bot.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotConfig {
    /// Server address (host:port).
    pub server: Option<String>,
    /// Force TLS (auto-detected from :6697).
    pub tls: Option<bool>,
    /// Skip TLS certificate verification.
    pub tls_insecure: Option<bool>,
    pub channel: Option<String>,
    /// Login name of the bot account.
    pub bot_name: Option<String>,
    /// OAuth token. Prefer the STREAMCHAT_OAUTH env var.
    pub oauth: Option<String>,
    #[serde(default)]
    pub session: SessionConfig,
}

pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("streamchat")
        .join("bot.toml")
}

impl BotConfig {
    /// Read the file at `path`. A missing file yields the defaults; an
    /// unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => Self::parse(&s).with_context(|| format!("bad config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("can't read {}", path.display())),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// Values given on the command line (or through their env vars).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server: Option<String>,
    pub channel: Option<String>,
    pub bot_name: Option<String>,
    pub oauth: Option<String>,
    pub tls: bool,
    pub tls_insecure: bool,
}

/// Effective settings after merging.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub server: String,
    pub tls: bool,
    pub tls_insecure: bool,
    pub channel: String,
    pub bot_name: String,
    pub oauth: String,
    pub session: SessionConfig,
}

impl Resolved {
    /// Merge: CLI overrides > config file > defaults.
    pub fn merge(cli: &Overrides, file: &BotConfig) -> Result<Self> {
        let server = cli
            .server
            .clone()
            .or_else(|| file.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());

        // Ensure server has a port; default to 6697 (TLS) if missing
        let server = if server.contains(':') {
            server
        } else {
            format!("{server}:6697")
        };

        let Some(channel) = cli.channel.clone().or_else(|| file.channel.clone()) else {
            bail!("no channel given: pass --channel or set `channel` in the config file");
        };
        let Some(bot_name) = cli.bot_name.clone().or_else(|| file.bot_name.clone()) else {
            bail!("no bot name given: pass --nick or set `bot_name` in the config file");
        };
        let Some(oauth) = cli.oauth.clone().or_else(|| file.oauth.clone()) else {
            bail!("no credential given: set STREAMCHAT_OAUTH, pass --oauth or set `oauth` in the config file");
        };

        Ok(Self {
            server,
            tls: cli.tls || file.tls.unwrap_or(false),
            tls_insecure: cli.tls_insecure || file.tls_insecure.unwrap_or(false),
            channel: channel.trim_start_matches('#').to_lowercase(),
            bot_name: bot_name.to_lowercase(),
            oauth,
            session: file.session.clone(),
        })
    }
}

//! `mailpost` - hands a message to an SMTP relay.
//!
//! Reads an RFC 5322 message from a file or stdin and delivers it with the
//! settings from a JSON configuration file.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod message;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailpost_smtp::{Config, MailSender, Md5SaslProvider, SmtpMailer};
use message::Message;

/// Send a message through an SMTP relay.
#[derive(Debug, Parser)]
#[command(name = "mailpost", version, about)]
struct Args {
    /// Configuration file (JSON). Defaults to `<config dir>/mailpost/config.json`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read the message from this file instead of stdin.
    #[arg(short, long)]
    message: Option<PathBuf>,

    /// Also deliver to the addresses in the To, Cc and Bcc headers.
    #[arg(short = 't', long)]
    read_recipients: bool,

    /// Trace the SMTP conversation.
    #[arg(short, long)]
    debug: bool,

    /// Recipient address lists.
    recipients: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "mailpost=debug,mailpost_smtp=debug"
    } else {
        "mailpost=info,mailpost_smtp=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = load_config(args.config.as_deref()).await?;
    config.debug |= args.debug;

    let raw = read_message(args.message.as_deref()).await?;
    let mut message = Message::parse(&raw);

    let mut recipients = args.recipients;
    if args.read_recipients {
        recipients.extend(message.recipients());
    }
    if recipients.is_empty() {
        bail!("no recipients given; pass addresses or use --read-recipients");
    }
    message.strip_bcc();

    let mut mailer = SmtpMailer::new(config).with_sasl_provider(Arc::new(Md5SaslProvider));
    mailer
        .send(&recipients, &message.headers, &message.body)
        .await?;

    info!(
        queued_as = mailer.queued_as().unwrap_or("-"),
        "Message delivered"
    );
    if mailer.config().persist {
        mailer.disconnect().await?;
    }
    Ok(())
}

/// Loads the configuration, falling back to defaults when the default file
/// does not exist.
async fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Config::load(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()));
    }

    let path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailpost")
        .join("config.json");
    if !path.exists() {
        info!(path = %path.display(), "No configuration file, using defaults");
        return Ok(Config::default());
    }
    Config::load(&path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))
}

async fn read_message(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut raw = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut raw)
                .await
                .context("Failed to read message from stdin")?;
            Ok(raw)
        }
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

use agora_live::ConversationId;

mod cli;
mod config;
mod credentials;

use crate::cli::Client;
use crate::config::AgoraConfig;

#[derive(Parser)]
#[command(name = "agora")]
#[command(about = "Live chat and notifications for Agora from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config directory (defaults to ~/.agora)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations
    Conversations(ConversationsArgs),

    /// Open a conversation and chat live
    Chat(ChatArgs),

    /// Follow the notification feed
    Notifications,
}

#[derive(Parser)]
struct ConversationsArgs {
    /// Start a conversation with this user id instead of listing
    #[arg(long)]
    with: Option<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ChatArgs {
    /// Conversation id
    id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries conversation output; logs go to stderr.
    let default_directive = if cli.debug {
        "agora=debug,agora_live=debug,info"
    } else {
        "agora=info,agora_live=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = AgoraConfig::new(cli.config_dir.clone())?;
    let file_config = config.load()?;
    let client = Client::new(&config, &file_config)?;

    match cli.command {
        Commands::Conversations(args) => {
            cli::conversations::conversations_command(&client, args.with, args.json).await
        }
        Commands::Chat(args) => {
            cli::chat::chat_command(&client, ConversationId::from(args.id)).await
        }
        Commands::Notifications => cli::notifications::notifications_command(&client).await,
    }
}

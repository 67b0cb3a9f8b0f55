//! `agora chat <id>`: a line-oriented conversation view.
//!
//! Plain lines are sent as messages. Slash commands cover the rest:
//! `/image <path> [caption]`, `/edit <id> <text>`, `/delete <id>`,
//! `/retry <temp id>`, `/reload`, `/reconnect`, `/quit`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use agora_live::{
    ConnectionIndicator, ConversationChannel, ConversationEvent, ConversationId,
    ConversationSnapshot, CurrentUser, Entry, EntryId, ImageUpload, MessagingApi,
};

use super::{Client, clock, split_command, stdin_lines};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatInput {
    Send(String),
    Image { path: PathBuf, caption: String },
    Edit { id: i64, content: String },
    Delete(i64),
    Retry(u64),
    Reload,
    Reconnect,
    Quit,
    Help,
    Empty,
}

impl ChatInput {
    fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let Some((cmd, rest)) = split_command(line) else {
            return Ok(Self::Send(line.to_string()));
        };
        match cmd {
            "quit" | "q" => Ok(Self::Quit),
            "help" => Ok(Self::Help),
            "reload" => Ok(Self::Reload),
            "reconnect" => Ok(Self::Reconnect),
            "image" => {
                let (path, caption) = rest.split_once(' ').unwrap_or((rest, ""));
                if path.is_empty() {
                    return Err("usage: /image <path> [caption]".into());
                }
                Ok(Self::Image {
                    path: PathBuf::from(path),
                    caption: caption.trim().to_string(),
                })
            }
            "edit" => {
                let (id, content) = rest
                    .split_once(' ')
                    .ok_or_else(|| "usage: /edit <id> <text>".to_string())?;
                let id = id.parse().map_err(|_| format!("not a message id: {id}"))?;
                Ok(Self::Edit {
                    id,
                    content: content.trim().to_string(),
                })
            }
            "delete" => rest
                .parse()
                .map(Self::Delete)
                .map_err(|_| "usage: /delete <id>".to_string()),
            "retry" => rest
                .parse()
                .map(Self::Retry)
                .map_err(|_| "usage: /retry <temp id>".to_string()),
            other => Err(format!("unknown command /{other} (try /help)")),
        }
    }
}

const HELP: &str = "commands: /image <path> [caption], /edit <id> <text>, /delete <id>, \
/retry <temp id>, /reload, /reconnect, /quit";

fn entry_label(entry: &Entry) -> String {
    match entry.id {
        EntryId::Server(id) => format!("#{id}"),
        EntryId::Temp(id) => format!("~{id}"),
    }
}

fn format_entry(entry: &Entry, me: &CurrentUser) -> String {
    let who = if me.is(&entry.sender) {
        "you"
    } else if entry.sender.username.is_empty() {
        "?"
    } else {
        entry.sender.username.as_str()
    };
    let mut line = format!(
        "[{}] {} {who}: {}",
        clock(entry.created_at),
        entry_label(entry),
        entry.text()
    );
    if entry.edited {
        line.push_str(" (edited)");
    }
    if entry.optimistic {
        line.push_str(" (sending)");
    }
    line
}

/// Lines to print for the change from `prev` to `next`.
fn render_updates(
    prev: &ConversationSnapshot,
    next: &ConversationSnapshot,
    me: &CurrentUser,
) -> Vec<String> {
    let mut out = Vec::new();

    let (was, is) = (prev.indicator(), next.indicator());
    if was != is {
        match (&next.status.error, next.status.failure()) {
            (_, Some(failure)) => {
                out.push(format!("-- {}: {} (/reconnect to retry) --", is.label(), failure));
            }
            (Some(err), None) if is == ConnectionIndicator::Error => {
                out.push(format!("-- {}: {} --", is.label(), err));
            }
            _ => out.push(format!("-- {} --", is.label())),
        }
    }

    let in_next = |id: EntryId| next.messages.iter().any(|n| n.id == id);
    for entry in &next.messages {
        match prev.messages.iter().find(|e| e.id == entry.id) {
            None => {
                // Our optimistic line was already printed; its echo is not news.
                let replaces_shown = entry.server_id().is_some()
                    && me.is(&entry.sender)
                    && prev.messages.iter().any(|p| {
                        matches!(p.id, EntryId::Temp(_))
                            && !in_next(p.id)
                            && p.text() == entry.text()
                    });
                if !replaces_shown {
                    out.push(format_entry(entry, me));
                }
            }
            Some(before) if before.edited != entry.edited || before.text() != entry.text() => {
                out.push(format_entry(entry, me));
            }
            Some(before) if entry.failed && !before.failed => {
                if let EntryId::Temp(temp) = entry.id {
                    out.push(format!("!! not delivered: \"{}\" (/retry {temp})", entry.text()));
                }
            }
            Some(_) => {}
        }
    }
    for gone in prev
        .messages
        .iter()
        .filter(|p| p.server_id().is_some() && !in_next(p.id))
    {
        out.push(format!("-- message {} deleted --", entry_label(gone)));
    }

    if next.typing_summary != prev.typing_summary {
        if let Some(summary) = &next.typing_summary {
            out.push(format!("   {summary}"));
        }
    }
    out
}

async fn read_image(path: &Path) -> Result<ImageUpload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();
    Ok(ImageUpload {
        file_name,
        mime,
        bytes,
    })
}

pub async fn chat_command(client: &Client, conversation: ConversationId) -> Result<()> {
    let title = match conversation_title(client, &conversation).await {
        Some(title) => title,
        None => format!("conversation {conversation}"),
    };
    println!("== {title} == (/help for commands)");

    let channel = ConversationChannel::open(conversation, client.me.clone(), &client.deps);
    let mut snapshots = channel.subscribe();
    let mut events = channel.events();
    let mut lines = stdin_lines();
    let mut shown = ConversationSnapshot::default();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = snapshots.borrow_and_update().clone();
                for line in render_updates(&shown, &next, &client.me) {
                    println!("{line}");
                }
                shown = next;
            }

            event = events.recv() => match event {
                Ok(ConversationEvent::Error(message)) => eprintln!("!! {message}"),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => debug!(skipped = n, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },

            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match ChatInput::parse(&line) {
                    Ok(ChatInput::Quit) => break,
                    Ok(input) => handle_input(&channel, input).await,
                    Err(usage) => eprintln!("{usage}"),
                }
            }

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    channel.disconnect();
    Ok(())
}

async fn handle_input(channel: &ConversationChannel, input: ChatInput) {
    let result = match input {
        ChatInput::Empty | ChatInput::Quit => Ok(()),
        ChatInput::Help => {
            println!("{HELP}");
            Ok(())
        }
        ChatInput::Send(text) => channel.send(text).await.map(drop),
        ChatInput::Image { path, caption } => match read_image(&path).await {
            Ok(image) => channel.send_with_image(caption, image).await.map(drop),
            Err(e) => {
                eprintln!("!! {e:#}");
                Ok(())
            }
        },
        ChatInput::Edit { id, content } => channel.edit(id, content).await,
        ChatInput::Delete(id) => channel.delete(id).await,
        ChatInput::Retry(temp_id) => channel.resend(temp_id).await.map(drop),
        ChatInput::Reload => {
            channel.reload();
            Ok(())
        }
        ChatInput::Reconnect => {
            channel.reconnect();
            Ok(())
        }
    };
    // Send failures are also reported through the event stream.
    if let Err(e) = result {
        warn!("{}", e);
    }
}

async fn conversation_title(client: &Client, id: &ConversationId) -> Option<String> {
    match client.api.get_conversation(id).await {
        Ok(conversation) => Some(conversation.title_for(&client.me.id)),
        Err(e) => {
            debug!("could not load conversation details: {}", e);
            None
        }
    }
}

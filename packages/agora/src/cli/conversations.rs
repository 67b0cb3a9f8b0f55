//! `agora conversations`: list conversations or start a new one.

use anyhow::{Context, Result};

use agora_live::{Conversation, Message, MessagingApi, UserId};

use super::{Client, clock};

const PREVIEW_LEN: usize = 40;

fn preview(message: &Message) -> String {
    let text = match (&message.content, &message.image_url) {
        (Some(content), _) if !content.is_empty() => content.as_str(),
        (_, Some(_)) => "[image]",
        _ => "",
    };
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > PREVIEW_LEN {
        let cut: String = line.chars().take(PREVIEW_LEN - 3).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

fn format_row(conversation: &Conversation, me: &UserId) -> String {
    let unread = match conversation.unread_count {
        0 => String::new(),
        n => n.to_string(),
    };
    let last = conversation
        .last_message
        .as_ref()
        .map(|m| format!("[{}] {}: {}", clock(m.created_at), m.sender.username, preview(m)))
        .unwrap_or_default();
    format!(
        "{:<10} {:<24} {:<6} {}",
        conversation.id.as_str(),
        conversation.title_for(me),
        unread,
        last
    )
}

/// List conversations, or create one with `with` and print it.
pub async fn conversations_command(client: &Client, with: Option<String>, json: bool) -> Result<()> {
    if let Some(other) = with {
        let conversation = client
            .api
            .create_conversation(&UserId::from(other.as_str()))
            .await
            .with_context(|| format!("Failed to start a conversation with user {other}"))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&conversation)?);
        } else {
            println!(
                "Conversation {} with {}. Open it with: agora chat {}",
                conversation.id,
                conversation.title_for(&client.me.id),
                conversation.id
            );
        }
        return Ok(());
    }

    let conversations = client
        .api
        .list_conversations()
        .await
        .context("Failed to list conversations")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conversations)?);
    } else if conversations.is_empty() {
        println!("No conversations.");
    } else {
        println!("{:<10} {:<24} {:<6} {}", "ID", "WITH", "UNREAD", "LAST MESSAGE");
        println!("{}", "-".repeat(80));
        for conversation in &conversations {
            println!("{}", format_row(conversation, &client.me.id));
        }
        println!("\n{} conversation(s)", conversations.len());
    }

    Ok(())
}

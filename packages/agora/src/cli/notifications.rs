//! `agora notifications`: follow the notification feed.

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use agora_live::{
    FriendRequestResponse, Notification, NotificationEvent, NotificationFeed,
    NotificationSnapshot,
};

use super::{Client, clock, split_command, stdin_lines};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedInput {
    Read(i64),
    ReadAll,
    Clear,
    Respond(i64, FriendRequestResponse),
    Refresh,
    Reconnect,
    Quit,
    Help,
    Empty,
}

impl FeedInput {
    fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let (cmd, rest) = split_command(line).unwrap_or((line, ""));
        let id = || -> std::result::Result<i64, String> {
            rest.parse().map_err(|_| format!("usage: /{cmd} <id>"))
        };
        match cmd {
            "read" => Ok(Self::Read(id()?)),
            "readall" => Ok(Self::ReadAll),
            "clear" => Ok(Self::Clear),
            "accept" => Ok(Self::Respond(id()?, FriendRequestResponse::Accept)),
            "decline" => Ok(Self::Respond(id()?, FriendRequestResponse::Decline)),
            "refresh" => Ok(Self::Refresh),
            "reconnect" => Ok(Self::Reconnect),
            "quit" | "q" => Ok(Self::Quit),
            "help" => Ok(Self::Help),
            other => Err(format!("unknown command {other} (try /help)")),
        }
    }
}

const HELP: &str = "commands: /read <id>, /readall, /clear, /accept <request id>, \
/decline <request id>, /refresh, /reconnect, /quit";

fn format_notification(n: &Notification) -> String {
    let marker = if n.is_read { ' ' } else { '*' };
    let when = n.created_at.map(clock).unwrap_or_else(|| "--:--".to_string());
    let mut line = format!("{marker} [{when}] #{} {}", n.id, n.message);
    if let Some(request) = n.friend_request_id {
        match &n.invalid_reason {
            Some(reason) => line.push_str(&format!(" ({reason})")),
            None => line.push_str(&format!(" (/accept {request} or /decline {request})")),
        }
    }
    line
}

/// Lines to print for the change from `prev` to `next`.
fn render_updates(prev: &NotificationSnapshot, next: &NotificationSnapshot) -> Vec<String> {
    let mut out = Vec::new();
    let indicator = next.status.indicator();
    if prev.status.indicator() != indicator {
        match next.status.failure() {
            Some(failure) => out.push(format!("-- {}: {} --", indicator.label(), failure)),
            None => out.push(format!("-- {} --", indicator.label())),
        }
    }
    // Newest first in the list, oldest first on screen.
    for n in next.notifications.items().iter().rev() {
        if prev.notifications.get(n.id).is_none() {
            out.push(format_notification(n));
        }
    }
    if next.notifications.is_empty() && !prev.notifications.is_empty() {
        out.push("-- notifications cleared --".to_string());
    }
    if prev.unread_count != next.unread_count {
        out.push(format!("   {} unread", next.unread_count));
    }
    out
}

pub async fn notifications_command(client: &Client) -> Result<()> {
    println!("== notifications == (/help for commands)");

    let feed = NotificationFeed::open(client.me.id.clone(), &client.deps);
    let mut snapshots = feed.subscribe();
    let mut events = feed.events();
    let mut lines = stdin_lines();
    let mut shown = NotificationSnapshot::default();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = snapshots.borrow_and_update().clone();
                for line in render_updates(&shown, &next) {
                    println!("{line}");
                }
                shown = next;
            }

            event = events.recv() => match event {
                Ok(NotificationEvent::Invalidated { notification_id, message }) => {
                    println!("!! #{notification_id}: {message}");
                }
                Ok(NotificationEvent::Error(message)) => eprintln!("!! {message}"),
                Ok(NotificationEvent::Received(_)) => {}
                Err(RecvError::Lagged(n)) => debug!(skipped = n, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },

            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match FeedInput::parse(&line) {
                    Ok(FeedInput::Quit) => break,
                    Ok(input) => handle_input(&feed, input).await,
                    Err(usage) => eprintln!("{usage}"),
                }
            }

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    feed.disconnect();
    Ok(())
}

async fn handle_input(feed: &NotificationFeed, input: FeedInput) {
    let result = match input {
        FeedInput::Empty | FeedInput::Quit => Ok(()),
        FeedInput::Help => {
            println!("{HELP}");
            Ok(())
        }
        FeedInput::Read(id) => feed.mark_as_read(id).await,
        FeedInput::ReadAll => feed.mark_all_read().await,
        FeedInput::Clear => feed.clear().await,
        FeedInput::Respond(request, response) => {
            let result = feed.respond_to_friend_request(request, response).await;
            if result.is_ok() {
                println!("-- friend request {request}: {response} --");
            }
            result
        }
        FeedInput::Refresh => {
            feed.refresh();
            Ok(())
        }
        FeedInput::Reconnect => {
            feed.reconnect();
            Ok(())
        }
    };
    // Failures are also reported through the event stream.
    if let Err(e) = result {
        warn!("{}", e);
    }
}

//! Optimistic reconciliation of a conversation's message list.
//!
//! Local sends appear immediately as optimistic entries keyed by a temporary
//! id. When the server echoes the message (live or via REST) the optimistic
//! entry is replaced in place; if no echo arrives before its deadline the
//! entry is flagged failed and kept so the user can resend it.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use crate::models::{CurrentUser, Message, Sender};

pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Distance from the bottom (px) within which the view counts as pinned.
pub const BOTTOM_THRESHOLD: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryId {
    Server(i64),
    Temp(u64),
}

/// A message as shown: either confirmed or still in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
    pub optimistic: bool,
    pub failed: bool,
}

impl Entry {
    fn confirmed(message: Message) -> Self {
        Self {
            id: EntryId::Server(message.id),
            content: message.content,
            image_url: message.image_url,
            sender: message.sender,
            created_at: message.created_at,
            edited: message.is_edited,
            optimistic: false,
            failed: false,
        }
    }

    pub fn server_id(&self) -> Option<i64> {
        match self.id {
            EntryId::Server(id) => Some(id),
            EntryId::Temp(_) => None,
        }
    }

    /// Content for display; image-only messages render as `[image]`.
    pub fn text(&self) -> &str {
        match (&self.content, &self.image_url) {
            (Some(content), _) if !content.is_empty() => content,
            (_, Some(_)) => "[image]",
            _ => "",
        }
    }
}

/// What the user typed, kept around so a failed send can be retried.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Draft {
    pub content: String,
    pub image_url: Option<String>,
}

impl Draft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            image_url: None,
        }
    }
}

/// Scroll geometry of the message view, in px.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub scroll_top: f64,
    pub client_height: f64,
    pub scroll_height: f64,
}

impl Viewport {
    /// A view that is always at the bottom.
    pub fn pinned() -> Self {
        Self::default()
    }

    pub fn is_at_bottom(&self) -> bool {
        self.scroll_height - self.scroll_top - self.client_height < BOTTOM_THRESHOLD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Server id already present.
    Duplicate,
    /// Replaced the optimistic entry at `index`.
    Confirmed { index: usize },
    /// Appended at `index`; `scroll` asks the view to jump to the bottom.
    Appended { index: usize, scroll: bool },
}

#[derive(Debug)]
struct Pending {
    temp_id: u64,
    deadline: Instant,
    draft: Draft,
}

#[derive(Debug)]
pub struct MessageStore {
    me: CurrentUser,
    entries: Vec<Entry>,
    pending: Vec<Pending>,
    last_temp_id: u64,
    send_timeout: Duration,
}

impl MessageStore {
    pub fn new(me: CurrentUser) -> Self {
        Self::with_timeout(me, SEND_TIMEOUT)
    }

    pub fn with_timeout(me: CurrentUser, send_timeout: Duration) -> Self {
        Self {
            me,
            entries: Vec::new(),
            pending: Vec::new(),
            last_temp_id: 0,
            send_timeout,
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn me(&self) -> &CurrentUser {
        &self.me
    }

    /// Show a local send immediately. Returns its temporary id.
    pub fn append_optimistic(&mut self, draft: Draft, now: Instant) -> u64 {
        let wall = Utc::now();
        let mut temp_id = wall.timestamp_millis().max(0) as u64;
        if temp_id <= self.last_temp_id {
            temp_id = self.last_temp_id + 1;
        }
        self.last_temp_id = temp_id;

        self.entries.push(Entry {
            id: EntryId::Temp(temp_id),
            content: Some(draft.content.clone()),
            image_url: draft.image_url.clone(),
            sender: self.me.as_sender(),
            created_at: wall,
            edited: false,
            optimistic: true,
            failed: false,
        });
        self.pending.push(Pending {
            temp_id,
            deadline: now + self.send_timeout,
            draft,
        });
        temp_id
    }

    /// Merge a server-confirmed message.
    pub fn reconcile_incoming(&mut self, message: Message, viewport: &Viewport) -> Reconciled {
        if self.index_of_server(message.id).is_some() {
            debug!(id = message.id, "ignoring duplicate message");
            return Reconciled::Duplicate;
        }

        let own = self.me.is(&message.sender);
        if own {
            let slot = self.optimistic_slot(non_empty(message.content.as_deref()));
            if let Some(index) = slot {
                if let EntryId::Temp(temp_id) = self.entries[index].id {
                    self.pending.retain(|p| p.temp_id != temp_id);
                }
                self.entries[index] = Entry::confirmed(message);
                return Reconciled::Confirmed { index };
            }
        }

        let scroll = own || viewport.is_at_bottom();
        self.entries.push(Entry::confirmed(message));
        Reconciled::Appended {
            index: self.entries.len() - 1,
            scroll,
        }
    }

    /// Replace a message by server id. Returns whether it was found.
    pub fn apply_edit(&mut self, message: &Message) -> bool {
        match self.index_of_server(message.id) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.content = message.content.clone();
                entry.image_url = message.image_url.clone();
                entry.edited = true;
                true
            }
            None => false,
        }
    }

    pub fn apply_delete(&mut self, id: i64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != EntryId::Server(id));
        before != self.entries.len()
    }

    /// Replace the whole list with a server listing, sorted by creation time.
    /// Duplicate ids in the listing keep their first occurrence.
    ///
    /// Local entries survive: an in-flight entry is dropped only when the
    /// listing brings a new own message with the same content, and failed
    /// entries stay until they are taken for resend.
    pub fn replace_all(&mut self, mut messages: Vec<Message>) {
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let known: HashSet<i64> = self.entries.iter().filter_map(Entry::server_id).collect();
        let mut seen = HashSet::new();
        let listing: Vec<Message> = messages
            .into_iter()
            .filter(|m| seen.insert(m.id))
            .collect();

        let local: Vec<Entry> = self
            .entries
            .drain(..)
            .filter(|e| matches!(e.id, EntryId::Temp(_)))
            .collect();
        let mut claimed = vec![false; local.len()];
        for message in &listing {
            if known.contains(&message.id) || !self.me.is(&message.sender) {
                continue;
            }
            let content = non_empty(message.content.as_deref());
            let slot = local.iter().enumerate().position(|(i, e)| {
                !claimed[i] && e.optimistic && non_empty(e.content.as_deref()) == content
            });
            if let Some(index) = slot {
                claimed[index] = true;
            }
        }

        self.entries = listing.into_iter().map(Entry::confirmed).collect();
        self.entries.extend(
            local
                .into_iter()
                .zip(claimed)
                .filter(|(_, claimed)| !claimed)
                .map(|(entry, _)| entry),
        );
        let entries = &self.entries;
        self.pending
            .retain(|p| entries.iter().any(|e| e.id == EntryId::Temp(p.temp_id)));
    }

    /// Flag every optimistic entry whose deadline has passed.
    pub fn expire_due(&mut self, now: Instant) -> Vec<u64> {
        let due: Vec<u64> = self
            .pending
            .iter()
            .filter(|p| p.deadline <= now && self.is_optimistic(p.temp_id))
            .map(|p| p.temp_id)
            .collect();
        for temp_id in &due {
            self.mark_failed(*temp_id);
        }
        due
    }

    /// Flag an optimistic entry failed. The entry stays in the list and its
    /// draft is kept for [`MessageStore::take_failed`].
    pub fn mark_failed(&mut self, temp_id: u64) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.id == EntryId::Temp(temp_id))
        else {
            return false;
        };
        if !entry.optimistic {
            return false;
        }
        entry.optimistic = false;
        entry.failed = true;
        debug!(temp_id, "message flagged as failed");
        true
    }

    /// Remove a failed entry and hand back what was typed.
    pub fn take_failed(&mut self, temp_id: u64) -> Option<Draft> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == EntryId::Temp(temp_id) && e.failed)?;
        self.entries.remove(index);
        let pos = self.pending.iter().position(|p| p.temp_id == temp_id)?;
        Some(self.pending.remove(pos).draft)
    }

    /// Earliest deadline among entries still waiting for confirmation.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .filter(|p| self.is_optimistic(p.temp_id))
            .map(|p| p.deadline)
            .min()
    }

    /// Index of the oldest own in-flight entry with exactly this content.
    fn optimistic_slot(&self, content: Option<&str>) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.optimistic
                && matches!(e.id, EntryId::Temp(_))
                && self.me.is(&e.sender)
                && non_empty(e.content.as_deref()) == content
        })
    }

    fn is_optimistic(&self, temp_id: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.id == EntryId::Temp(temp_id) && e.optimistic)
    }

    fn index_of_server(&self, id: i64) -> Option<usize> {
        self.entries.iter().position(|e| e.id == EntryId::Server(id))
    }
}

/// Image-only messages arrive with either no content or an empty string.
fn non_empty(content: Option<&str>) -> Option<&str> {
    content.filter(|c| !c.is_empty())
}

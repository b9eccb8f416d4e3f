//! Who is in the session and where their cursor is.
//!
//! ```text
//! transport presence event
//!       │
//!       ▼
//! PresenceTable::handle_event()
//!       │  (own echoes ignored)
//!       ▼
//! UserPresence rows ──► UI cursors and roster
//! ```
//!
//! Colors are derived from the user id so every client paints the same user
//! the same way without coordination.

use std::collections::HashMap;
use std::time::Duration;

use hozo_core::Point;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::UserInfo;

pub type UserId = Uuid;

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable, vivid `#rrggbb` color for a user id.
pub fn assign_color(user_id: &UserId) -> String {
    let hue = ((user_id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        channel(r),
        channel(g),
        channel(b)
    )
}

fn channel(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Presence records and events
// ───────────────────────────────────────────────────────────────────

/// One participant as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct UserPresence {
    pub user_id: UserId,
    pub name: String,
    pub color: String,
    /// `None` until the user has reported a cursor.
    pub cursor: Option<Point>,
}

impl UserPresence {
    pub fn new(user_id: UserId, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            color: color.into(),
            cursor: None,
        }
    }
}

impl From<UserInfo> for UserPresence {
    fn from(info: UserInfo) -> Self {
        Self::new(info.user_id, info.user_name, info.color)
    }
}

/// Presence change delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Complete participant set. Replaces everything known.
    Snapshot(Vec<UserPresence>),
    Joined {
        user_id: UserId,
        name: String,
        color: String,
    },
    Left {
        user_id: UserId,
    },
    Cursor {
        user_id: UserId,
        name: String,
        color: String,
        cursor: Point,
    },
}

impl PresenceEvent {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            PresenceEvent::Snapshot(_) => None,
            PresenceEvent::Joined { user_id, .. }
            | PresenceEvent::Left { user_id }
            | PresenceEvent::Cursor { user_id, .. } => Some(*user_id),
        }
    }
}

/// Effect of one presence event on the participant set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterChange {
    /// Whether the table changed at all, cursors included.
    pub changed: bool,
    pub joined: Vec<UserPresence>,
    pub left: Vec<UserPresence>,
}

/// Presence published by the local client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PresenceUpdate {
    Cursor(Point),
    Leave,
}

// ───────────────────────────────────────────────────────────────────
// Presence table
// ───────────────────────────────────────────────────────────────────

/// The participant set of the current session, local user included.
#[derive(Debug)]
pub struct PresenceTable {
    local_user_id: Option<UserId>,
    users: HashMap<UserId, UserPresence>,
    cursor_interval: Duration,
    last_cursor_sent: Option<Instant>,
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::with_interval(Duration::ZERO)
    }

    /// Table that throttles local cursor publication to one per `interval`.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            local_user_id: None,
            users: HashMap::new(),
            cursor_interval: interval,
            last_cursor_sent: None,
        }
    }

    /// Start over for a freshly joined session.
    pub fn reset(&mut self, local: UserPresence, others: impl IntoIterator<Item = UserPresence>) {
        self.users.clear();
        self.local_user_id = Some(local.user_id);
        for user in others {
            self.users.insert(user.user_id, user);
        }
        self.users.insert(local.user_id, local);
        self.last_cursor_sent = None;
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.local_user_id = None;
        self.last_cursor_sent = None;
    }

    /// Apply a transport event. Returns whether the table changed.
    pub fn handle_event(&mut self, event: &PresenceEvent) -> bool {
        match event {
            PresenceEvent::Snapshot(users) => {
                let local = self
                    .local_user_id
                    .and_then(|id| self.users.get(&id).cloned());
                let mut next: HashMap<UserId, UserPresence> =
                    users.iter().map(|u| (u.user_id, u.clone())).collect();
                // The local row is ours; a snapshot taken before our own
                // registration landed must not drop it.
                if let Some(local) = local {
                    next.insert(local.user_id, local);
                }
                let changed = next != self.users;
                self.users = next;
                changed
            }

            PresenceEvent::Joined {
                user_id,
                name,
                color,
            } => {
                if self.is_local(user_id) {
                    return false;
                }
                let entry = self
                    .users
                    .entry(*user_id)
                    .or_insert_with(|| UserPresence::new(*user_id, name.clone(), color.clone()));
                entry.name = name.clone();
                entry.color = color.clone();
                true
            }

            PresenceEvent::Left { user_id } => {
                if self.is_local(user_id) {
                    return false;
                }
                self.users.remove(user_id).is_some()
            }

            PresenceEvent::Cursor {
                user_id,
                name,
                color,
                cursor,
            } => {
                if self.is_local(user_id) {
                    return false;
                }
                // Cursor from a user we missed the join for: add a row.
                let entry = self
                    .users
                    .entry(*user_id)
                    .or_insert_with(|| UserPresence::new(*user_id, name.clone(), color.clone()));
                entry.cursor = Some(*cursor);
                true
            }
        }
    }

    /// Apply a transport event and report who arrived and who departed.
    pub fn apply_event(&mut self, event: &PresenceEvent) -> RosterChange {
        let before = match event {
            PresenceEvent::Snapshot(_) | PresenceEvent::Left { .. } => self.users.clone(),
            PresenceEvent::Joined { .. } | PresenceEvent::Cursor { .. } => HashMap::new(),
        };
        let known = event.user_id().is_some_and(|id| self.users.contains_key(&id));

        let mut change = RosterChange {
            changed: self.handle_event(event),
            ..RosterChange::default()
        };
        if !change.changed {
            return change;
        }

        match event {
            PresenceEvent::Snapshot(_) | PresenceEvent::Left { .. } => {
                change.joined = self
                    .users
                    .values()
                    .filter(|u| !before.contains_key(&u.user_id))
                    .cloned()
                    .collect();
                change.left = before
                    .into_values()
                    .filter(|u| !self.users.contains_key(&u.user_id))
                    .collect();
            }
            PresenceEvent::Joined { user_id, .. } | PresenceEvent::Cursor { user_id, .. } => {
                if !known {
                    change.joined.extend(self.users.get(user_id).cloned());
                }
            }
        }
        change.joined.sort_by(|a, b| a.name.cmp(&b.name));
        change.left.sort_by(|a, b| a.name.cmp(&b.name));
        change
    }

    /// Record the local cursor. Returns the point when it should be
    /// published, `None` while throttled.
    pub fn update_local_cursor(&mut self, position: Point) -> Option<Point> {
        if let Some(local) = self.local_user_id.and_then(|id| self.users.get_mut(&id)) {
            local.cursor = Some(position);
        }

        let now = Instant::now();
        if let Some(last) = self.last_cursor_sent {
            if now.duration_since(last) < self.cursor_interval {
                return None;
            }
        }
        self.last_cursor_sent = Some(now);
        Some(position)
    }

    pub fn local_user_id(&self) -> Option<UserId> {
        self.local_user_id
    }

    pub fn local_user(&self) -> Option<&UserPresence> {
        self.local_user_id.and_then(|id| self.users.get(&id))
    }

    pub fn get(&self, user_id: &UserId) -> Option<&UserPresence> {
        self.users.get(user_id)
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Everyone, ordered by name then id.
    pub fn users(&self) -> Vec<&UserPresence> {
        let mut users: Vec<&UserPresence> = self.users.values().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then(a.user_id.cmp(&b.user_id)));
        users
    }

    /// Everyone except the local user.
    pub fn remote_users(&self) -> Vec<&UserPresence> {
        self.users()
            .into_iter()
            .filter(|u| Some(u.user_id) != self.local_user_id)
            .collect()
    }

    fn is_local(&self, user_id: &UserId) -> bool {
        self.local_user_id.as_ref() == Some(user_id)
    }
}

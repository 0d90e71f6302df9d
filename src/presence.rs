use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// No sync received since the channel was (re)joined.
    Unknown,
    Offline,
    Online,
}

/// Derives counterpart presence from the live channel's member list.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    state: Presence,
    members: BTreeSet<String>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self {
            state: Presence::Unknown,
            members: BTreeSet::new(),
        }
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute from a full member list (self inclusive). Returns true when
    /// the online flag changed.
    pub fn on_sync<I, S>(&mut self, participant_ids: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let was_online = self.is_online();
        self.members = participant_ids.into_iter().map(Into::into).collect();
        self.state = if self.members.len() > 1 {
            Presence::Online
        } else {
            Presence::Offline
        };
        was_online != self.is_online()
    }

    /// Back to unknown until the next sync. Returns true when the online flag changed.
    pub fn reset(&mut self) -> bool {
        let was_online = self.is_online();
        self.state = Presence::Unknown;
        self.members.clear();
        was_online
    }

    pub fn state(&self) -> Presence {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == Presence::Online
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }
}

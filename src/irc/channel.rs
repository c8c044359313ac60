//! Channel state: membership, role overlays, modes, mask lists, topic.
//!
//! Each channel owns its state behind its own reader/writer lock. Role
//! overlays (owners/operators/halfops/voices) are keyed by folded nick and
//! are always subsets of the membership map.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use super::message::Message;
use super::modes::{match_hostmask, ChannelModes, ListEntry};
use super::session::Session;

/// A named room. `name` preserves the case used at creation; lookups use
/// the folded form (the registry key).
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    pub created: u64,
    pub state: RwLock<ChannelState>,
}

/// Mutable channel state, guarded by the channel lock.
#[derive(Debug, Default)]
pub struct ChannelState {
    pub topic: String,
    pub topic_by: String,
    /// Unix timestamp of the last topic change.
    pub topic_time: u64,
    pub modes: ChannelModes,
    pub ban_list: Vec<ListEntry>,
    pub quiet_list: Vec<ListEntry>,
    pub except_list: Vec<ListEntry>,
    pub invite_list: Vec<ListEntry>,
    /// Membership, keyed by folded nick.
    pub members: HashMap<String, Arc<Session>>,
    pub owners: HashSet<String>,
    pub operators: HashSet<String>,
    pub halfops: HashSet<String>,
    pub voices: HashSet<String>,
}

/// Why a JOIN was refused, in the order the checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDenied {
    /// 473 — invite-only and neither invited nor on the invite list.
    InviteOnly,
    /// 475 — wrong or missing channel key.
    BadKey,
    /// 471 — the member limit is reached.
    Full,
    /// 474 — matches the ban list with no exception.
    Banned,
}

impl Channel {
    pub fn new(name: &str, default_modes: &str) -> Arc<Self> {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut state = ChannelState::default();
        state.modes.apply_defaults(default_modes);
        Arc::new(Self {
            name: name.to_owned(),
            created,
            state: RwLock::new(state),
        })
    }

    /// Deliver a message to every member except at most one, identified by
    /// session id. The membership snapshot is taken under the read lock;
    /// the queue pushes happen after it is released.
    pub async fn broadcast(&self, msg: &Message, exclude: Option<u64>) {
        let targets: Vec<Arc<Session>> = {
            let st = self.state.read().await;
            st.members
                .values()
                .filter(|s| Some(s.id) != exclude)
                .cloned()
                .collect()
        };

        for session in targets {
            session.send(msg.clone());
        }
    }
}

impl ChannelState {
    /// Insert a member. The first member of a fresh channel becomes a
    /// channel operator. The caller updates the session's own channel set.
    pub fn add_member(&mut self, folded_nick: &str, session: Arc<Session>) {
        let first = self.members.is_empty();
        self.members.insert(folded_nick.to_owned(), session);
        if first {
            self.operators.insert(folded_nick.to_owned());
        }
    }

    /// Remove a member from the membership map and every role overlay.
    /// Returns true when the channel is now empty.
    pub fn remove_member(&mut self, folded_nick: &str) -> bool {
        self.members.remove(folded_nick);
        self.owners.remove(folded_nick);
        self.operators.remove(folded_nick);
        self.halfops.remove(folded_nick);
        self.voices.remove(folded_nick);
        self.members.is_empty()
    }

    /// Re-key a member after a nick change.
    pub fn rename_member(&mut self, old_folded: &str, new_folded: &str) {
        if let Some(session) = self.members.remove(old_folded) {
            self.members.insert(new_folded.to_owned(), session);
        }
        for set in [
            &mut self.owners,
            &mut self.operators,
            &mut self.halfops,
            &mut self.voices,
        ] {
            if set.remove(old_folded) {
                set.insert(new_folded.to_owned());
            }
        }
    }

    pub fn is_member(&self, folded_nick: &str) -> bool {
        self.members.contains_key(folded_nick)
    }

    pub fn is_owner(&self, folded_nick: &str) -> bool {
        self.owners.contains(folded_nick)
    }

    pub fn is_operator(&self, folded_nick: &str) -> bool {
        self.operators.contains(folded_nick)
    }

    pub fn is_halfop(&self, folded_nick: &str) -> bool {
        self.halfops.contains(folded_nick)
    }

    pub fn is_voice(&self, folded_nick: &str) -> bool {
        self.voices.contains(folded_nick)
    }

    /// Owner, operator, or halfop.
    pub fn is_halfop_or_better(&self, folded_nick: &str) -> bool {
        self.is_owner(folded_nick) || self.is_operator(folded_nick) || self.is_halfop(folded_nick)
    }

    /// Owner or operator.
    pub fn is_op_or_better(&self, folded_nick: &str) -> bool {
        self.is_owner(folded_nick) || self.is_operator(folded_nick)
    }

    /// The highest role prefix a member holds: `~` owner, `@` op,
    /// `%` halfop, `+` voice, else empty.
    pub fn prefix_for(&self, folded_nick: &str) -> &'static str {
        if self.is_owner(folded_nick) {
            "~"
        } else if self.is_operator(folded_nick) {
            "@"
        } else if self.is_halfop(folded_nick) {
            "%"
        } else if self.is_voice(folded_nick) {
            "+"
        } else {
            ""
        }
    }

    /// Evaluate a join attempt: invite-only, then key, then limit, then
    /// ban/except, returning the first failure. `invited` reflects an
    /// explicit INVITE; `bypass` is god mode.
    pub fn check_join(
        &self,
        prefix: &str,
        key: &str,
        invited: bool,
        bypass: bool,
    ) -> Result<(), JoinDenied> {
        if bypass {
            return Ok(());
        }

        if self.modes.invite_only
            && !invited
            && !matches_any(&self.invite_list, prefix)
        {
            return Err(JoinDenied::InviteOnly);
        }

        if let Some(ref chan_key) = self.modes.key {
            if key != chan_key {
                return Err(JoinDenied::BadKey);
            }
        }

        if let Some(limit) = self.modes.limit {
            if self.members.len() >= limit {
                return Err(JoinDenied::Full);
            }
        }

        if matches_any(&self.ban_list, prefix) && !matches_any(&self.except_list, prefix) {
            return Err(JoinDenied::Banned);
        }

        Ok(())
    }

    /// Whether a member may speak: quieted members need halfop or better;
    /// moderated channels need voice or better.
    pub fn can_send_message(&self, folded_nick: &str, prefix: &str) -> bool {
        if matches_any(&self.quiet_list, prefix) && !self.is_halfop_or_better(folded_nick) {
            return false;
        }

        if self.modes.moderated
            && !self.is_halfop_or_better(folded_nick)
            && !self.is_voice(folded_nick)
        {
            return false;
        }

        true
    }

    /// Record a topic change, stamping the setter and time.
    pub fn set_topic(&mut self, topic: &str, by: &str) {
        self.topic = topic.to_owned();
        self.topic_by = by.to_owned();
        self.topic_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
    }
}

/// Whether a prefix matches any entry of a mask list.
pub fn matches_any(list: &[ListEntry], prefix: &str) -> bool {
    list.iter().any(|e| match_hostmask(&e.mask, prefix))
}

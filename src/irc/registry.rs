//! Process-wide registry: every connected session, the nick index, and the
//! channel table, all behind one reader/writer lock.
//!
//! Lookup keys are case-folded; the values keep their display case. The
//! registry also routes server notices (SNOMASK categories) and keeps the
//! WHOWAS history, since both walk the session table.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::channel::Channel;
use super::message::Message;
use super::modes::{WhowasBuffer, WhowasEntry};
use super::session::Session;

/// How many WHOWAS records to retain.
const WHOWAS_CAPACITY: usize = 512;

#[derive(Debug)]
struct Tables {
    /// Every connected session, registered or not, by session id.
    connections: HashMap<u64, Arc<Session>>,
    /// Folded nick → session id, for every nick claimed by a live
    /// session (a pre-registration NICK claims its nick too).
    nicks: HashMap<String, u64>,
    /// Folded channel name → channel.
    channels: HashMap<String, Arc<Channel>>,
    whowas: WhowasBuffer,
}

/// The shared session/channel tables.
#[derive(Debug)]
pub struct Registry {
    tables: RwLock<Tables>,
}

/// Channel-table admission failure.
#[derive(Debug, thiserror::Error)]
#[error("channel limit reached")]
pub struct ChannelLimitReached;

impl Registry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                connections: HashMap::new(),
                nicks: HashMap::new(),
                channels: HashMap::new(),
                whowas: WhowasBuffer::new(WHOWAS_CAPACITY),
            }),
        }
    }

    /// Admit a new connection unless the server is full.
    /// Returns false at `max_clients`; the caller replies and closes.
    pub async fn add_connection(&self, session: Arc<Session>, max_clients: usize) -> bool {
        let mut t = self.tables.write().await;
        if t.connections.len() >= max_clients {
            return false;
        }
        t.connections.insert(session.id, session);
        true
    }

    /// Drop a connection and its nick binding, if any.
    pub async fn remove_connection(&self, id: u64, folded_nick: Option<&str>) {
        let mut t = self.tables.write().await;
        t.connections.remove(&id);
        if let Some(nick) = folded_nick {
            if t.nicks.get(nick) == Some(&id) {
                t.nicks.remove(nick);
            }
        }
    }

    /// Claim a folded nick for a session. Fails when another live session
    /// holds it (a session may re-claim its own nick in different case).
    pub async fn bind_nick(&self, folded_nick: &str, id: u64) -> bool {
        let mut t = self.tables.write().await;
        match t.nicks.get(folded_nick) {
            Some(&holder) if holder != id => false,
            _ => {
                t.nicks.insert(folded_nick.to_owned(), id);
                true
            }
        }
    }

    /// Atomically move a session's nick binding, enforcing uniqueness.
    pub async fn rebind_nick(&self, old_folded: &str, new_folded: &str, id: u64) -> bool {
        let mut t = self.tables.write().await;
        match t.nicks.get(new_folded) {
            Some(&holder) if holder != id => false,
            _ => {
                if t.nicks.get(old_folded) == Some(&id) {
                    t.nicks.remove(old_folded);
                }
                t.nicks.insert(new_folded.to_owned(), id);
                true
            }
        }
    }

    pub async fn is_nick_in_use(&self, folded_nick: &str) -> bool {
        self.tables.read().await.nicks.contains_key(folded_nick)
    }

    /// Look up a registered session by folded nick.
    pub async fn session_by_nick(&self, folded_nick: &str) -> Option<Arc<Session>> {
        let t = self.tables.read().await;
        let id = t.nicks.get(folded_nick)?;
        t.connections.get(id).cloned()
    }

    /// Snapshot of every connected session.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.tables.read().await.connections.values().cloned().collect()
    }

    pub async fn client_count(&self) -> usize {
        self.tables.read().await.connections.len()
    }

    pub async fn channel(&self, folded_name: &str) -> Option<Arc<Channel>> {
        self.tables.read().await.channels.get(folded_name).cloned()
    }

    /// Fetch a channel, creating it (with the configured default modes)
    /// when absent. Creation is refused at `max_channels`.
    pub async fn get_or_create_channel(
        &self,
        folded_name: &str,
        display_name: &str,
        default_modes: &str,
        max_channels: usize,
    ) -> Result<Arc<Channel>, ChannelLimitReached> {
        let mut t = self.tables.write().await;
        if let Some(chan) = t.channels.get(folded_name) {
            return Ok(chan.clone());
        }
        if t.channels.len() >= max_channels {
            return Err(ChannelLimitReached);
        }

        let chan = Channel::new(display_name, default_modes);
        t.channels.insert(folded_name.to_owned(), chan.clone());
        Ok(chan)
    }

    /// Remove a channel from the table (used when membership hits zero).
    pub async fn remove_channel(&self, folded_name: &str) {
        self.tables.write().await.channels.remove(folded_name);
    }

    /// Snapshot of (folded name, channel) pairs.
    pub async fn channels(&self) -> Vec<(String, Arc<Channel>)> {
        self.tables
            .read()
            .await
            .channels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn channel_count(&self) -> usize {
        self.tables.read().await.channels.len()
    }

    /// Fan a server notice out to every operator subscribed to the given
    /// snomask category letter.
    pub async fn send_snomask(&self, server_name: &str, letter: char, text: &str) {
        let sessions = self.sessions().await;
        for session in sessions {
            let st = session.state.read().await;
            if st.oper && st.snomasks.contains(&letter) {
                let notice = Message::from_source(
                    server_name,
                    "NOTICE",
                    vec![st.nick.clone(), format!("*** {text}")],
                );
                drop(st);
                session.send(notice);
            }
        }
    }

    /// Record a departed session for WHOWAS.
    pub async fn record_whowas(&self, entry: WhowasEntry) {
        self.tables.write().await.whowas.push(entry);
    }

    /// WHOWAS lookup, most recent first.
    pub async fn whowas(&self, nick: &str) -> Vec<WhowasEntry> {
        self.tables
            .read()
            .await
            .whowas
            .lookup(nick)
            .into_iter()
            .cloned()
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-connection session state.
//!
//! A [`Session`] is owned by its connection task. The immutable shell
//! (id, address, transport kind, outbound queue handle) is freely shared;
//! everything mutable lives in [`SessionState`] behind the session's own
//! reader/writer lock.
//!
//! Every line destined for a session — direct replies and channel
//! broadcasts alike — goes through the one outbound queue, drained by the
//! session's task. That single queue is what makes per-session delivery
//! order the emission order.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, RwLock};

use crate::config::PrivacyConfig;

use super::message::Message;

/// Commands per minute allowed before registration completes.
const UNREGISTERED_FLOOD_LIMIT: u32 = 100;
const UNREGISTERED_FLOOD_WINDOW: Duration = Duration::from_secs(60);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// An instruction for a session's connection task.
#[derive(Debug)]
pub enum Outbound {
    /// Deliver one protocol line.
    Line(Message),
    /// Flush pending lines and close the connection. The string is the
    /// quit reason propagated to the session's channels.
    Disconnect(String),
}

/// One connected client.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub addr: SocketAddr,
    /// True when the transport is TLS (user mode `z` mirrors this).
    pub secure: bool,
    tx: mpsc::UnboundedSender<Outbound>,
    pub state: RwLock<SessionState>,
}

/// Mutable session state, guarded by the session lock.
#[derive(Debug)]
pub struct SessionState {
    /// Current nick; empty before the first accepted NICK.
    pub nick: String,
    pub user: String,
    pub realname: String,
    /// Observed remote host (display may be masked, see `visible_host`).
    pub host: String,
    pub registered: bool,
    pub oper: bool,
    pub oper_class: Option<String>,
    /// Extra permission tokens from the matched oper record.
    pub oper_flags: Vec<String>,
    /// Away message; empty means not away.
    pub away: String,
    /// Single-letter user modes.
    pub modes: HashSet<char>,
    /// Server-notice categories this session is subscribed to.
    pub snomasks: HashSet<char>,
    /// Negotiated IRCv3 capabilities (stub).
    pub capabilities: HashSet<String>,
    pub connect_time: SystemTime,
    pub last_activity: Instant,
    pub last_pong: Instant,
    pub waiting_for_pong: bool,
    /// Flood window counters.
    pub message_count: u32,
    pub last_message: Instant,
    /// Folded names of channels this session is in.
    pub channels: HashSet<String>,
    /// Folded names of channels with a pending INVITE for this session.
    pub invites: HashSet<String>,
}

impl Session {
    pub fn new(
        addr: SocketAddr,
        secure: bool,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let mut modes = HashSet::new();
        if secure {
            modes.insert('z');
        }

        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            secure,
            tx,
            state: RwLock::new(SessionState {
                nick: String::new(),
                user: String::new(),
                realname: String::new(),
                host: addr.ip().to_string(),
                registered: false,
                oper: false,
                oper_class: None,
                oper_flags: Vec::new(),
                away: String::new(),
                modes,
                snomasks: HashSet::new(),
                capabilities: HashSet::new(),
                connect_time: SystemTime::now(),
                last_activity: now,
                last_pong: now,
                waiting_for_pong: false,
                message_count: 0,
                last_message: now,
                channels: HashSet::new(),
                invites: HashSet::new(),
            }),
        })
    }

    /// Queue one line for delivery. A send to a session whose task has
    /// already exited is silently dropped.
    pub fn send(&self, msg: Message) {
        let _ = self.tx.send(Outbound::Line(msg));
    }

    /// Queue a disconnect. Lines queued before this are still flushed.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Disconnect(reason.into()));
    }

    pub async fn nick(&self) -> String {
        self.state.read().await.nick.clone()
    }

    /// Nick for numeric replies: `*` before a nick is chosen.
    pub async fn display_nick(&self) -> String {
        let st = self.state.read().await;
        st.display_nick().to_owned()
    }

    pub async fn is_registered(&self) -> bool {
        self.state.read().await.registered
    }

    pub async fn is_oper(&self) -> bool {
        self.state.read().await.oper
    }

    /// The `nick!user@host` source prefix for this session.
    pub async fn prefix(&self) -> String {
        self.state.read().await.prefix()
    }
}

impl SessionState {
    pub fn display_nick(&self) -> &str {
        if self.nick.is_empty() {
            "*"
        } else {
            &self.nick
        }
    }

    pub fn prefix(&self) -> String {
        format!("{}!{}@{}", self.display_nick(), self.user, self.host)
    }

    /// Unix timestamp of the connect time.
    pub fn connect_unix(&self) -> u64 {
        self.connect_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Current user modes as `+...`, or empty when none are set.
    pub fn modes_string(&self) -> String {
        if self.modes.is_empty() {
            return String::new();
        }
        let mut letters: Vec<char> = self.modes.iter().copied().collect();
        letters.sort_unstable();
        let mut out = String::from("+");
        out.extend(letters);
        out
    }

    /// Current snomasks as `+...`, or empty when none are set.
    pub fn snomask_string(&self) -> String {
        if self.snomasks.is_empty() {
            return String::new();
        }
        let mut letters: Vec<char> = self.snomasks.iter().copied().collect();
        letters.sort_unstable();
        let mut out = String::from("+");
        out.extend(letters);
        out
    }

    /// Whether this session is hidden from WHO/WHOIS/NAMES/LIST for
    /// ordinary users (modes `H` or `S`).
    pub fn is_stealthy(&self) -> bool {
        self.modes.contains(&'H') || self.modes.contains(&'S')
    }

    /// God mode: bypasses channel join restrictions.
    pub fn has_god_mode(&self) -> bool {
        self.modes.contains(&'G')
    }

    /// The host to show a given requester, honoring the privacy settings
    /// and user mode `x`. The mask renders as `<nick>.<suffix>`.
    pub fn visible_host(
        &self,
        privacy: &PrivacyConfig,
        requester_is_oper: bool,
        requester_is_self: bool,
    ) -> String {
        if !privacy.hide_hosts_from_users {
            return self.host.clone();
        }
        if requester_is_oper && privacy.oper_bypass_host_hide {
            return self.host.clone();
        }
        if requester_is_self {
            return self.host.clone();
        }
        format!("{}.{}", self.display_nick(), privacy.masked_host_suffix)
    }

    /// Sliding-window flood accounting; returns true when the session has
    /// exceeded its budget and must be dropped. Operators are exempt.
    ///
    /// Unregistered sessions get a fixed 100 commands per 60 s. Registered
    /// sessions get `flood_lines × 3` within a `flood_seconds` window.
    pub fn check_flood(&mut self, now: Instant, flood_lines: u32, flood_seconds: u64) -> bool {
        if self.oper {
            return false;
        }

        let (window, limit) = if self.registered {
            (Duration::from_secs(flood_seconds), flood_lines * 3)
        } else {
            (UNREGISTERED_FLOOD_WINDOW, UNREGISTERED_FLOOD_LIMIT)
        };

        if now.duration_since(self.last_message) > window {
            self.message_count = 0;
        }
        self.message_count += 1;
        self.last_message = now;

        self.message_count > limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_session() -> Arc<Session> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Session::new("127.0.0.1:50000".parse().unwrap(), false, tx)
    }

    fn privacy(hide: bool, oper_bypass: bool) -> PrivacyConfig {
        PrivacyConfig {
            hide_hosts_from_users: hide,
            oper_bypass_host_hide: oper_bypass,
            masked_host_suffix: "users.shoal".into(),
        }
    }

    #[tokio::test]
    async fn prefix_uses_star_before_nick() {
        let session = test_session();
        assert_eq!(session.display_nick().await, "*");

        session.state.write().await.nick = "marlin".into();
        session.state.write().await.user = "m".into();
        let prefix = session.prefix().await;
        assert!(prefix.starts_with("marlin!m@"), "{prefix}");
    }

    #[tokio::test]
    async fn tls_sessions_start_with_mode_z() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("127.0.0.1:50000".parse().unwrap(), true, tx);
        assert!(session.state.read().await.modes.contains(&'z'));
    }

    #[tokio::test]
    async fn mode_strings_are_sorted() {
        let session = test_session();
        {
            let mut st = session.state.write().await;
            st.modes.extend(['w', 'o', 's']);
            st.snomasks.extend(['o', 'c']);
        }
        let st = session.state.read().await;
        assert_eq!(st.modes_string(), "+osw");
        assert_eq!(st.snomask_string(), "+co");
    }

    #[test]
    fn flood_allows_burst_within_limit() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("127.0.0.1:50000".parse().unwrap(), false, tx);
        let mut st = session.state.try_write().unwrap();
        st.registered = true;

        let now = Instant::now();
        for _ in 0..30 {
            assert!(!st.check_flood(now, 10, 60));
        }
        // 31st line in the window breaches flood_lines * 3.
        assert!(st.check_flood(now, 10, 60));
    }

    #[test]
    fn flood_window_resets() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("127.0.0.1:50000".parse().unwrap(), false, tx);
        let mut st = session.state.try_write().unwrap();
        st.registered = true;

        let start = Instant::now();
        for _ in 0..30 {
            assert!(!st.check_flood(start, 10, 60));
        }
        // Past the window the counter starts over.
        let later = start + Duration::from_secs(61);
        assert!(!st.check_flood(later, 10, 60));
    }

    #[test]
    fn opers_are_flood_exempt() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("127.0.0.1:50000".parse().unwrap(), false, tx);
        let mut st = session.state.try_write().unwrap();
        st.registered = true;
        st.oper = true;

        let now = Instant::now();
        for _ in 0..1000 {
            assert!(!st.check_flood(now, 10, 60));
        }
    }

    #[test]
    fn unregistered_flood_uses_fixed_budget() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("127.0.0.1:50000".parse().unwrap(), false, tx);
        let mut st = session.state.try_write().unwrap();

        let now = Instant::now();
        for _ in 0..100 {
            assert!(!st.check_flood(now, 10, 60));
        }
        assert!(st.check_flood(now, 10, 60));
    }

    #[test]
    fn visible_host_masks_for_plain_users() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("127.0.0.1:50000".parse().unwrap(), false, tx);
        let mut st = session.state.try_write().unwrap();
        st.nick = "marlin".into();
        st.host = "203.0.113.7".into();

        let cfg = privacy(true, true);
        assert_eq!(st.visible_host(&cfg, false, false), "marlin.users.shoal");
        assert_eq!(st.visible_host(&cfg, true, false), "203.0.113.7");
        assert_eq!(st.visible_host(&cfg, false, true), "203.0.113.7");

        let open = privacy(false, false);
        assert_eq!(st.visible_host(&open, false, false), "203.0.113.7");
    }

    #[tokio::test]
    async fn queued_lines_arrive_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::new("127.0.0.1:50000".parse().unwrap(), false, tx);

        session.send(Message::new("PING", vec!["a".into()]));
        session.send(Message::new("PING", vec!["b".into()]));
        session.disconnect("bye");

        match rx.recv().await {
            Some(Outbound::Line(msg)) => assert_eq!(msg.params, vec!["a"]),
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await {
            Some(Outbound::Line(msg)) => assert_eq!(msg.params, vec!["b"]),
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await {
            Some(Outbound::Disconnect(reason)) => assert_eq!(reason, "bye"),
            other => panic!("unexpected {other:?}"),
        }
    }
}

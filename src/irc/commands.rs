//! Command dispatch and handlers.
//!
//! Every command other than NICK, USER, PASS, PING, PONG, CAP, and QUIT is
//! gated behind registration (451). Each handler owns its parameter arity
//! check, its permission checks, and the broadcasts for any state change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::channel::{Channel, JoinDenied};
use super::message::Message;
use super::modes::{parse_extended_ban, parse_mode_string, ListEntry};
use super::names::{is_channel_name, is_valid_channel_name, is_valid_nick};
use super::replies::*;
use super::server::Server;
use super::session::Session;

/// What the session loop should do after a command.
pub enum CommandOutcome {
    Continue,
    Quit(String),
}

/// Route one parsed message to its handler.
pub async fn dispatch(
    server: &Arc<Server>,
    session: &Arc<Session>,
    msg: Message,
) -> CommandOutcome {
    let command = msg.command.to_uppercase();
    let params = msg.params;

    let registered = session.is_registered().await;
    if !registered
        && !matches!(
            command.as_str(),
            "NICK" | "USER" | "PASS" | "PING" | "PONG" | "CAP" | "QUIT"
        )
    {
        reply(server, session, ERR_NOTREGISTERED, vec![
            "You have not registered".into(),
        ])
        .await;
        return CommandOutcome::Continue;
    }

    match command.as_str() {
        "CAP" => handle_cap(server, session, &params).await,
        "PASS" => {} // accepted, unused
        "NICK" => handle_nick(server, session, &params).await,
        "USER" => handle_user(server, session, &params).await,
        "PING" => handle_ping(server, session, &params).await,
        "PONG" => handle_pong(session).await,
        "JOIN" => handle_join(server, session, &params).await,
        "PART" => handle_part(server, session, &params).await,
        "PRIVMSG" => handle_message(server, session, &params, false).await,
        "NOTICE" => handle_message(server, session, &params, true).await,
        "TOPIC" => handle_topic(server, session, &params).await,
        "NAMES" => handle_names(server, session, &params).await,
        "LIST" => handle_list(server, session).await,
        "INVITE" => handle_invite(server, session, &params).await,
        "KICK" => handle_kick(server, session, &params).await,
        "AWAY" => handle_away(server, session, &params).await,
        "WHO" => handle_who(server, session, &params).await,
        "WHOIS" => handle_whois(server, session, &params).await,
        "WHOWAS" => handle_whowas(server, session, &params).await,
        "MODE" => handle_mode(server, session, &params).await,
        "MOTD" => send_motd(server, session).await,
        "OPER" => handle_oper(server, session, &params).await,
        "SNOMASK" => handle_snomask(server, session, &params).await,
        "KILL" => handle_kill(server, session, &params).await,
        "REHASH" => handle_rehash(server, session).await,
        "TRACE" => handle_trace(server, session).await,
        "WALLOPS" => handle_wallops(server, session, &params).await,
        "OPERWALL" => handle_operwall(server, session, &params).await,
        "GLOBALNOTICE" => handle_globalnotice(server, session, &params).await,
        "QUIT" => {
            let reason = params
                .first()
                .filter(|r| !r.is_empty())
                .cloned()
                .unwrap_or_else(|| "Client quit".to_owned());
            return CommandOutcome::Quit(reason);
        }
        other => {
            debug!(command = other, "unknown command");
            reply(server, session, ERR_UNKNOWNCOMMAND, vec![
                other.to_owned(),
                "Unknown command".into(),
            ])
            .await;
        }
    }

    CommandOutcome::Continue
}

// ── Shared helpers ───────────────────────────────────────────────

/// Send a server numeric addressed to this session.
async fn reply(server: &Arc<Server>, session: &Arc<Session>, code: u16, params: Vec<String>) {
    let cfg = server.config().await;
    let nick = session.display_nick().await;
    session.send(Message::numeric(&cfg.server.name, code, &nick, params));
}

/// `:<server> NOTICE <nick> :*** <text>` to this session.
async fn server_notice(server: &Arc<Server>, session: &Arc<Session>, text: &str) {
    let cfg = server.config().await;
    let nick = session.display_nick().await;
    session.send(Message::from_source(
        &cfg.server.name,
        "NOTICE",
        vec![nick, format!("*** {text}")],
    ));
}

/// A snapshot of the calling session's identity, for handlers.
struct Caller {
    nick: String,
    folded_nick: String,
    prefix: String,
    oper: bool,
    oper_class: Option<String>,
    oper_flags: Vec<String>,
}

async fn caller(server: &Arc<Server>, session: &Arc<Session>) -> Caller {
    let cfg = server.config().await;
    let st = session.state.read().await;
    Caller {
        nick: st.nick.clone(),
        folded_nick: cfg.features.case_mapping.fold(&st.nick),
        prefix: st.prefix(),
        oper: st.oper,
        oper_class: st.oper_class.clone(),
        oper_flags: st.oper_flags.clone(),
    }
}

/// 481 unless the caller is an IRC operator.
async fn require_oper(server: &Arc<Server>, session: &Arc<Session>) -> bool {
    if session.is_oper().await {
        return true;
    }
    reply(server, session, ERR_NOPRIVILEGES, vec![
        "Permission Denied- You're not an IRC operator".into(),
    ])
    .await;
    false
}

async fn need_more_params(server: &Arc<Server>, session: &Arc<Session>, command: &str) {
    reply(server, session, ERR_NEEDMOREPARAMS, vec![
        command.to_owned(),
        "Not enough parameters".into(),
    ])
    .await;
}

/// Clamp a string to `max` bytes without splitting a character.
fn truncated(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Registration ─────────────────────────────────────────────────

async fn handle_cap(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    // Capability negotiation stub: an empty LS, everything else accepted.
    if params.first().is_some_and(|p| p == "LS") {
        let cfg = server.config().await;
        let nick = session.display_nick().await;
        session.send(Message::from_source(
            &cfg.server.name,
            "CAP",
            vec![nick, "LS".into(), String::new()],
        ));
    }
}

async fn handle_nick(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let cfg = server.config().await;

    let Some(new_nick) = params.first().filter(|n| !n.is_empty()) else {
        reply(server, session, ERR_NONICKNAMEGIVEN, vec![
            "No nickname given".into(),
        ])
        .await;
        return;
    };

    if !is_valid_nick(new_nick, cfg.limits.max_nick_length) {
        reply(server, session, ERR_ERRONEUSNICKNAME, vec![
            new_nick.clone(),
            "Erroneous nickname".into(),
        ])
        .await;
        return;
    }

    let folded_new = cfg.features.case_mapping.fold(new_nick);
    let (registered, old_nick, old_prefix) = {
        let st = session.state.read().await;
        (st.registered, st.nick.clone(), st.prefix())
    };
    let folded_old = cfg.features.case_mapping.fold(&old_nick);

    let claimed = if old_nick.is_empty() {
        server.registry.bind_nick(&folded_new, session.id).await
    } else {
        server
            .registry
            .rebind_nick(&folded_old, &folded_new, session.id)
            .await
    };
    if !claimed {
        reply(server, session, ERR_NICKNAMEINUSE, vec![
            new_nick.clone(),
            "Nickname is already in use".into(),
        ])
        .await;
        return;
    }

    if !registered {
        session.state.write().await.nick = new_nick.clone();
        try_register(server, session).await;
        return;
    }

    // Announce to the session itself and everyone sharing a channel,
    // once each, then rekey the membership maps.
    let channels: Vec<String> = {
        let st = session.state.read().await;
        st.channels.iter().cloned().collect()
    };

    let nick_line = Message::from_source(&old_prefix, "NICK", vec![new_nick.clone()]);
    let mut seen: HashSet<u64> = HashSet::from([session.id]);
    session.send(nick_line.clone());
    for folded in &channels {
        if let Some(chan) = server.registry.channel(folded).await {
            let members: Vec<Arc<Session>> =
                chan.state.read().await.members.values().cloned().collect();
            for member in members {
                if seen.insert(member.id) {
                    member.send(nick_line.clone());
                }
            }
            chan.state
                .write()
                .await
                .rename_member(&folded_old, &folded_new);
        }
    }

    let (user, host) = {
        let mut st = session.state.write().await;
        st.nick = new_nick.clone();
        (st.user.clone(), st.host.clone())
    };

    server
        .registry
        .send_snomask(
            &cfg.server.name,
            'n',
            &format!("Nick change: {old_nick} -> {new_nick} ({user}@{host})"),
        )
        .await;
}

async fn handle_user(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    if params.len() < 4 {
        need_more_params(server, session, "USER").await;
        return;
    }

    if session.is_registered().await {
        reply(server, session, ERR_ALREADYREGISTRED, vec![
            "You may not reregister".into(),
        ])
        .await;
        return;
    }

    {
        let mut st = session.state.write().await;
        st.user = params[0].clone();
        // params[1] and params[2] (mode, unused) are ignored.
        st.realname = params[3].clone();
    }

    try_register(server, session).await;
}

/// Flip to registered once both NICK and USER have landed, then greet.
async fn try_register(server: &Arc<Server>, session: &Arc<Session>) {
    let became_registered = {
        let mut st = session.state.write().await;
        if !st.registered && !st.nick.is_empty() && !st.user.is_empty() {
            st.registered = true;
            true
        } else {
            false
        }
    };
    if !became_registered {
        return;
    }

    send_welcome(server, session).await;

    let cfg = server.config().await;
    let (nick, user, host) = {
        let st = session.state.read().await;
        (st.nick.clone(), st.user.clone(), st.host.clone())
    };
    server
        .registry
        .send_snomask(
            &cfg.server.name,
            'c',
            &format!("Client connect: {nick} ({user}@{host})"),
        )
        .await;
}

/// The 001-005 greeting plus MOTD.
async fn send_welcome(server: &Arc<Server>, session: &Arc<Session>) {
    let cfg = server.config().await;
    let (nick, prefix) = {
        let st = session.state.read().await;
        (st.nick.clone(), st.prefix())
    };
    let name = &cfg.server.name;

    session.send(Message::numeric(name, RPL_WELCOME, &nick, vec![format!(
        "Welcome to {}, {prefix}",
        cfg.server.network
    )]));
    session.send(Message::numeric(name, RPL_YOURHOST, &nick, vec![format!(
        "Your host is {name}, running version {}",
        cfg.server.version
    )]));
    session.send(Message::numeric(name, RPL_CREATED, &nick, vec![
        "This server was created recently".into(),
    ]));
    session.send(Message::numeric(name, RPL_MYINFO, &nick, vec![
        name.clone(),
        cfg.server.version.clone(),
        "BGHSiostwxz".into(),
        "bhiklmnopqstv".into(),
    ]));
    session.send(Message::numeric(name, RPL_ISUPPORT, &nick, vec![
        "PREFIX=(qohv)~@%+".into(),
        "CHANTYPES=#&!+".into(),
        "CHANMODES=b,k,l,imnpst".into(),
        format!("NICKLEN={}", cfg.limits.max_nick_length),
        format!("CHANNELLEN={}", cfg.limits.max_channel_length),
        format!("TOPICLEN={}", cfg.limits.max_topic_length),
        format!("KICKLEN={}", cfg.limits.max_kick_length),
        format!("NETWORK={}", cfg.server.network),
        format!("CASEMAPPING={}", cfg.features.case_mapping.token()),
        "are supported by this server".into(),
    ]));

    if !cfg.motd.is_empty() {
        send_motd(server, session).await;
    }
}

async fn send_motd(server: &Arc<Server>, session: &Arc<Session>) {
    let cfg = server.config().await;
    let nick = session.display_nick().await;
    let name = &cfg.server.name;

    session.send(Message::numeric(name, RPL_MOTDSTART, &nick, vec![format!(
        "- {name} Message of the Day -"
    )]));
    for line in &cfg.motd {
        session.send(Message::numeric(name, RPL_MOTD, &nick, vec![format!(
            "- {line}"
        )]));
    }
    session.send(Message::numeric(name, RPL_ENDOFMOTD, &nick, vec![
        "End of /MOTD command".into(),
    ]));
}

// ── Keepalive ────────────────────────────────────────────────────

async fn handle_ping(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let Some(token) = params.first() else {
        reply(server, session, ERR_NOORIGIN, vec!["No origin specified".into()]).await;
        return;
    };
    let cfg = server.config().await;
    session.send(Message::from_source(
        &cfg.server.name,
        "PONG",
        vec![cfg.server.name.clone(), token.clone()],
    ));
}

async fn handle_pong(session: &Arc<Session>) {
    let mut st = session.state.write().await;
    st.last_pong = std::time::Instant::now();
    st.waiting_for_pong = false;
}

// ── Channel membership ───────────────────────────────────────────

async fn handle_join(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let Some(targets) = params.first() else {
        need_more_params(server, session, "JOIN").await;
        return;
    };

    let cfg = server.config().await;
    let keys: Vec<&str> = params
        .get(1)
        .map(|k| k.split(',').collect())
        .unwrap_or_default();

    for (i, name) in targets.split(',').enumerate() {
        if name.is_empty() {
            continue;
        }

        if name == "0" {
            // Special target: leave every channel.
            let channels: Vec<String> = {
                let st = session.state.read().await;
                st.channels.iter().cloned().collect()
            };
            for folded in channels {
                if let Some(chan) = server.registry.channel(&folded).await {
                    part_channel(server, session, &chan, &folded, "Leaving all channels").await;
                }
            }
            continue;
        }

        if !is_valid_channel_name(name, cfg.limits.max_channel_length) {
            reply(server, session, ERR_NOSUCHCHANNEL, vec![
                name.to_owned(),
                "No such channel".into(),
            ])
            .await;
            continue;
        }

        let folded = cfg.features.case_mapping.fold(name);
        if session.state.read().await.channels.contains(&folded) {
            continue;
        }

        let chan = match server
            .registry
            .get_or_create_channel(
                &folded,
                name,
                &cfg.channels.default_modes,
                cfg.limits.max_channels,
            )
            .await
        {
            Ok(chan) => chan,
            Err(_) => {
                reply(server, session, ERR_TOOMANYCHANNELS, vec![
                    name.to_owned(),
                    "You have joined too many channels".into(),
                ])
                .await;
                continue;
            }
        };

        let who = caller(server, session).await;
        let (invited, god) = {
            let st = session.state.read().await;
            (st.invites.contains(&folded), st.oper && st.has_god_mode())
        };
        let key = keys.get(i).copied().unwrap_or("");

        let verdict = {
            let st = chan.state.read().await;
            if st.members.len() >= cfg.limits.max_channel_users && !god {
                Err(JoinDenied::Full)
            } else {
                st.check_join(&who.prefix, key, invited, god)
            }
        };

        if let Err(denied) = verdict {
            let (code, text) = match denied {
                JoinDenied::InviteOnly => (ERR_INVITEONLYCHAN, "Cannot join channel (+i)"),
                JoinDenied::BadKey => (ERR_BADCHANNELKEY, "Cannot join channel (+k)"),
                JoinDenied::Full => (ERR_CHANNELISFULL, "Cannot join channel (+l)"),
                JoinDenied::Banned => (ERR_BANNEDFROMCHAN, "Cannot join channel (+b)"),
            };
            reply(server, session, code, vec![name.to_owned(), text.to_owned()]).await;
            continue;
        }

        // Join: membership first, then the session's own channel set.
        chan.state
            .write()
            .await
            .add_member(&who.folded_nick, Arc::clone(session));
        {
            let mut st = session.state.write().await;
            st.channels.insert(folded.clone());
            st.invites.remove(&folded);
        }

        let join_line =
            Message::from_source(&who.prefix, "JOIN", vec![chan.name.clone()]);
        chan.broadcast(&join_line, None).await;

        // Topic, then names.
        let topic = {
            let st = chan.state.read().await;
            if st.topic.is_empty() {
                None
            } else {
                Some((st.topic.clone(), st.topic_by.clone(), st.topic_time))
            }
        };
        if let Some((text, by, time)) = topic {
            reply(server, session, RPL_TOPIC, vec![chan.name.clone(), text]).await;
            reply(server, session, RPL_TOPICWHOTIME, vec![
                chan.name.clone(),
                by,
                time.to_string(),
            ])
            .await;
        }

        send_names(server, session, &chan).await;
    }
}

async fn handle_part(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let Some(targets) = params.first() else {
        need_more_params(server, session, "PART").await;
        return;
    };
    let reason = params
        .get(1)
        .filter(|r| !r.is_empty())
        .cloned()
        .unwrap_or_else(|| "Leaving".to_owned());

    let cfg = server.config().await;
    for name in targets.split(',') {
        let folded = cfg.features.case_mapping.fold(name);
        if !session.state.read().await.channels.contains(&folded) {
            reply(server, session, ERR_NOTONCHANNEL, vec![
                name.to_owned(),
                "You're not on that channel".into(),
            ])
            .await;
            continue;
        }
        match server.registry.channel(&folded).await {
            Some(chan) => part_channel(server, session, &chan, &folded, &reason).await,
            None => {
                session.state.write().await.channels.remove(&folded);
            }
        }
    }
}

/// Broadcast PART and remove the member; drop the channel if it empties.
async fn part_channel(
    server: &Arc<Server>,
    session: &Arc<Session>,
    chan: &Arc<Channel>,
    folded: &str,
    reason: &str,
) {
    let who = caller(server, session).await;

    let part_line = Message::from_source(&who.prefix, "PART", vec![
        chan.name.clone(),
        reason.to_owned(),
    ]);
    chan.broadcast(&part_line, None).await;

    let empty = chan.state.write().await.remove_member(&who.folded_nick);
    session.state.write().await.channels.remove(folded);
    if empty {
        server.registry.remove_channel(folded).await;
    }
}

// ── Messaging ────────────────────────────────────────────────────

async fn handle_message(
    server: &Arc<Server>,
    session: &Arc<Session>,
    params: &[String],
    notice: bool,
) {
    // NOTICE never generates error replies.
    let Some(target) = params.first() else {
        if !notice {
            reply(server, session, ERR_NORECIPIENT, vec![
                "No recipient given (PRIVMSG)".into(),
            ])
            .await;
        }
        return;
    };
    let Some(text) = params.get(1) else {
        if !notice {
            reply(server, session, ERR_NOTEXTTOSEND, vec!["No text to send".into()]).await;
        }
        return;
    };

    let cfg = server.config().await;
    let command = if notice { "NOTICE" } else { "PRIVMSG" };
    let who = caller(server, session).await;

    if is_channel_name(target) {
        let folded = cfg.features.case_mapping.fold(target);
        let Some(chan) = server.registry.channel(&folded).await else {
            if !notice {
                reply(server, session, ERR_NOSUCHCHANNEL, vec![
                    target.clone(),
                    "No such channel".into(),
                ])
                .await;
            }
            return;
        };

        let is_member = session.state.read().await.channels.contains(&folded);
        let allowed = {
            let st = chan.state.read().await;
            if !is_member && st.modes.no_external {
                Err("Cannot send to channel")
            } else if !st.can_send_message(&who.folded_nick, &who.prefix) {
                Err("Cannot send to channel (+m)")
            } else {
                Ok(())
            }
        };

        if let Err(denial) = allowed {
            if !notice {
                reply(server, session, ERR_CANNOTSENDTOCHAN, vec![
                    chan.name.clone(),
                    denial.to_owned(),
                ])
                .await;
            }
            return;
        }

        let line = Message::from_source(&who.prefix, command, vec![
            chan.name.clone(),
            text.clone(),
        ]);
        chan.broadcast(&line, Some(session.id)).await;
    } else {
        let folded = cfg.features.case_mapping.fold(target);
        let Some(peer) = server.registry.session_by_nick(&folded).await else {
            if !notice {
                reply(server, session, ERR_NOSUCHNICK, vec![
                    target.clone(),
                    "No such nick/channel".into(),
                ])
                .await;
            }
            return;
        };

        let (peer_nick, away) = {
            let st = peer.state.read().await;
            (st.nick.clone(), st.away.clone())
        };

        if !notice && !away.is_empty() {
            reply(server, session, RPL_AWAY, vec![peer_nick.clone(), away]).await;
        }

        peer.send(Message::from_source(&who.prefix, command, vec![
            peer_nick,
            text.clone(),
        ]));
    }
}

// ── Channel queries and management ───────────────────────────────

async fn handle_topic(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let Some(name) = params.first() else {
        need_more_params(server, session, "TOPIC").await;
        return;
    };

    let cfg = server.config().await;
    let folded = cfg.features.case_mapping.fold(name);
    let Some(chan) = server.registry.channel(&folded).await else {
        reply(server, session, ERR_NOSUCHCHANNEL, vec![
            name.clone(),
            "No such channel".into(),
        ])
        .await;
        return;
    };

    if !session.state.read().await.channels.contains(&folded) {
        reply(server, session, ERR_NOTONCHANNEL, vec![
            name.clone(),
            "You're not on that channel".into(),
        ])
        .await;
        return;
    }

    let Some(new_topic) = params.get(1) else {
        // Query.
        let (topic, by, time) = {
            let st = chan.state.read().await;
            (st.topic.clone(), st.topic_by.clone(), st.topic_time)
        };
        if topic.is_empty() {
            reply(server, session, RPL_NOTOPIC, vec![
                chan.name.clone(),
                "No topic is set".into(),
            ])
            .await;
        } else {
            reply(server, session, RPL_TOPIC, vec![chan.name.clone(), topic]).await;
            reply(server, session, RPL_TOPICWHOTIME, vec![
                chan.name.clone(),
                by,
                time.to_string(),
            ])
            .await;
        }
        return;
    };

    let who = caller(server, session).await;
    {
        let st = chan.state.read().await;
        if st.modes.topic_locked && !st.is_halfop_or_better(&who.folded_nick) && !who.oper {
            drop(st);
            reply(server, session, ERR_CHANOPRIVSNEEDED, vec![
                chan.name.clone(),
                "You're not channel operator".into(),
            ])
            .await;
            return;
        }
    }

    let topic = truncated(new_topic, cfg.limits.max_topic_length).to_owned();
    chan.state.write().await.set_topic(&topic, &who.nick);

    let line = Message::from_source(&who.prefix, "TOPIC", vec![chan.name.clone(), topic]);
    chan.broadcast(&line, None).await;
}

async fn handle_names(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let cfg = server.config().await;

    match params.first() {
        None => {
            let channels: Vec<String> = {
                let st = session.state.read().await;
                st.channels.iter().cloned().collect()
            };
            for folded in channels {
                if let Some(chan) = server.registry.channel(&folded).await {
                    send_names(server, session, &chan).await;
                }
            }
        }
        Some(targets) => {
            for name in targets.split(',') {
                let folded = cfg.features.case_mapping.fold(name);
                if !session.state.read().await.channels.contains(&folded) {
                    continue;
                }
                if let Some(chan) = server.registry.channel(&folded).await {
                    send_names(server, session, &chan).await;
                }
            }
        }
    }
}

/// 353/366 for one channel, from this viewer's perspective (stealthy
/// members are hidden from non-operators).
async fn send_names(server: &Arc<Server>, session: &Arc<Session>, chan: &Arc<Channel>) {
    let viewer_oper = session.is_oper().await;

    let (symbol, members) = {
        let st = chan.state.read().await;
        let symbol = if st.modes.secret {
            "@"
        } else if st.modes.private {
            "*"
        } else {
            "="
        };
        let members: Vec<(&'static str, Arc<Session>)> = st
            .members
            .iter()
            .map(|(folded, member)| (st.prefix_for(folded), member.clone()))
            .collect();
        (symbol, members)
    };

    let mut names = Vec::with_capacity(members.len());
    for (role_prefix, member) in members {
        let mst = member.state.read().await;
        if mst.is_stealthy() && !viewer_oper && member.id != session.id {
            continue;
        }
        names.push(format!("{role_prefix}{}", mst.nick));
    }

    reply(server, session, RPL_NAMREPLY, vec![
        symbol.to_owned(),
        chan.name.clone(),
        names.join(" "),
    ])
    .await;
    reply(server, session, RPL_ENDOFNAMES, vec![
        chan.name.clone(),
        "End of /NAMES list".into(),
    ])
    .await;
}

async fn handle_list(server: &Arc<Server>, session: &Arc<Session>) {
    let viewer_oper = session.is_oper().await;
    reply(server, session, RPL_LISTSTART, vec![
        "Channel".into(),
        "Users  Name".into(),
    ])
    .await;

    for (folded, chan) in server.registry.channels().await {
        let is_member = session.state.read().await.channels.contains(&folded);
        let entry = {
            let st = chan.state.read().await;
            // Secret and private channels stay off the list for outsiders.
            if (st.modes.secret || st.modes.private) && !is_member && !viewer_oper {
                None
            } else {
                Some((st.members.len(), st.topic.clone()))
            }
        };
        if let Some((count, topic)) = entry {
            reply(server, session, RPL_LIST, vec![
                chan.name.clone(),
                count.to_string(),
                topic,
            ])
            .await;
        }
    }

    reply(server, session, RPL_LISTEND, vec!["End of /LIST".into()]).await;
}

async fn handle_invite(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    if params.len() < 2 {
        need_more_params(server, session, "INVITE").await;
        return;
    }
    let target_nick = &params[0];
    let chan_name = &params[1];
    let cfg = server.config().await;

    let Some(target) = server
        .registry
        .session_by_nick(&cfg.features.case_mapping.fold(target_nick))
        .await
    else {
        reply(server, session, ERR_NOSUCHNICK, vec![
            target_nick.clone(),
            "No such nick/channel".into(),
        ])
        .await;
        return;
    };

    let folded = cfg.features.case_mapping.fold(chan_name);
    let Some(chan) = server.registry.channel(&folded).await else {
        reply(server, session, ERR_NOSUCHCHANNEL, vec![
            chan_name.clone(),
            "No such channel".into(),
        ])
        .await;
        return;
    };

    if !session.state.read().await.channels.contains(&folded) {
        reply(server, session, ERR_NOTONCHANNEL, vec![
            chan_name.clone(),
            "You're not on that channel".into(),
        ])
        .await;
        return;
    }

    let target_folded = cfg.features.case_mapping.fold(&target.nick().await);
    let who = caller(server, session).await;
    {
        let st = chan.state.read().await;
        if st.is_member(&target_folded) {
            drop(st);
            reply(server, session, ERR_USERONCHANNEL, vec![
                target_nick.clone(),
                chan_name.clone(),
                "is already on channel".into(),
            ])
            .await;
            return;
        }
        // Inviting into an invite-only channel takes channel-op rights.
        if st.modes.invite_only && !st.is_op_or_better(&who.folded_nick) && !who.oper {
            drop(st);
            reply(server, session, ERR_CHANOPRIVSNEEDED, vec![
                chan.name.clone(),
                "You're not channel operator".into(),
            ])
            .await;
            return;
        }
    }

    let target_display = target.nick().await;
    target.state.write().await.invites.insert(folded);
    target.send(Message::from_source(&who.prefix, "INVITE", vec![
        target_display.clone(),
        chan.name.clone(),
    ]));
    reply(server, session, RPL_INVITING, vec![target_display, chan.name.clone()]).await;
}

async fn handle_kick(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    if params.len() < 2 {
        need_more_params(server, session, "KICK").await;
        return;
    }
    let chan_name = &params[0];
    let target_nick = &params[1];
    let cfg = server.config().await;

    let folded = cfg.features.case_mapping.fold(chan_name);
    let Some(chan) = server.registry.channel(&folded).await else {
        reply(server, session, ERR_NOSUCHCHANNEL, vec![
            chan_name.clone(),
            "No such channel".into(),
        ])
        .await;
        return;
    };

    if !session.state.read().await.channels.contains(&folded) {
        reply(server, session, ERR_NOTONCHANNEL, vec![
            chan_name.clone(),
            "You're not on that channel".into(),
        ])
        .await;
        return;
    }

    let Some(target) = server
        .registry
        .session_by_nick(&cfg.features.case_mapping.fold(target_nick))
        .await
    else {
        reply(server, session, ERR_NOSUCHNICK, vec![
            target_nick.clone(),
            "No such nick/channel".into(),
        ])
        .await;
        return;
    };
    let target_folded = cfg.features.case_mapping.fold(&target.nick().await);

    let who = caller(server, session).await;
    let verdict = {
        let st = chan.state.read().await;
        if !st.is_member(&target_folded) {
            Err((ERR_USERNOTINCHANNEL, "They aren't on that channel"))
        } else if !st.is_halfop_or_better(&who.folded_nick) && !who.oper {
            Err((ERR_CHANOPRIVSNEEDED, "You're not channel operator"))
        } else if st.is_op_or_better(&target_folded)
            && !st.is_op_or_better(&who.folded_nick)
            && !who.oper
        {
            // Halfops cannot remove operators or owners.
            Err((ERR_CHANOPRIVSNEEDED, "You're not channel operator"))
        } else {
            Ok(())
        }
    };

    if let Err((code, text)) = verdict {
        let params = if code == ERR_USERNOTINCHANNEL {
            vec![target_nick.clone(), chan.name.clone(), text.to_owned()]
        } else {
            vec![chan.name.clone(), text.to_owned()]
        };
        reply(server, session, code, params).await;
        return;
    }

    let reason = params
        .get(2)
        .filter(|r| !r.is_empty())
        .map(|r| truncated(r, cfg.limits.max_kick_length).to_owned())
        .unwrap_or_else(|| "No reason given".to_owned());

    let target_display = target.nick().await;
    let kick_line = Message::from_source(&who.prefix, "KICK", vec![
        chan.name.clone(),
        target_display,
        reason,
    ]);
    // The target sees its own removal.
    chan.broadcast(&kick_line, None).await;

    let empty = chan.state.write().await.remove_member(&target_folded);
    target.state.write().await.channels.remove(&folded);
    if empty {
        server.registry.remove_channel(&folded).await;
    }
}

async fn handle_away(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let cfg = server.config().await;
    let message = params.first().filter(|m| !m.is_empty());

    match message {
        None => {
            session.state.write().await.away.clear();
            reply(server, session, RPL_UNAWAY, vec![
                "You are no longer marked as being away".into(),
            ])
            .await;
        }
        Some(text) => {
            session.state.write().await.away =
                truncated(text, cfg.limits.max_away_length).to_owned();
            reply(server, session, RPL_NOWAWAY, vec![
                "You have been marked as being away".into(),
            ])
            .await;
        }
    }
}

// ── User queries ─────────────────────────────────────────────────

async fn handle_who(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let Some(target) = params.first() else {
        need_more_params(server, session, "WHO").await;
        return;
    };

    let cfg = server.config().await;
    let viewer_oper = session.is_oper().await;

    if is_channel_name(target) {
        let folded = cfg.features.case_mapping.fold(target);
        if let Some(chan) = server.registry.channel(&folded).await {
            let members: Vec<(&'static str, Arc<Session>)> = {
                let st = chan.state.read().await;
                st.members
                    .iter()
                    .map(|(f, m)| (st.prefix_for(f), m.clone()))
                    .collect()
            };

            for (role_prefix, member) in members {
                let mst = member.state.read().await;
                if mst.is_stealthy() && !viewer_oper && member.id != session.id {
                    continue;
                }

                let mut flags = String::new();
                flags.push(if mst.away.is_empty() { 'H' } else { 'G' });
                if mst.oper {
                    flags.push('*');
                }
                flags.push_str(role_prefix);

                let host = mst.visible_host(&cfg.privacy, viewer_oper, member.id == session.id);
                reply(server, session, RPL_WHOREPLY, vec![
                    chan.name.clone(),
                    mst.user.clone(),
                    host,
                    cfg.server.name.clone(),
                    mst.nick.clone(),
                    flags,
                    format!("0 {}", mst.realname),
                ])
                .await;
            }
        }
    }

    reply(server, session, RPL_ENDOFWHO, vec![
        target.clone(),
        "End of /WHO list".into(),
    ])
    .await;
}

async fn handle_whois(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let Some(target_nick) = params.first() else {
        need_more_params(server, session, "WHOIS").await;
        return;
    };

    let cfg = server.config().await;
    let viewer_oper = session.is_oper().await;
    let target = server
        .registry
        .session_by_nick(&cfg.features.case_mapping.fold(target_nick))
        .await;

    let visible = match &target {
        Some(t) => {
            let st = t.state.read().await;
            !st.is_stealthy() || viewer_oper || t.id == session.id
        }
        None => false,
    };

    let Some(target) = target.filter(|_| visible) else {
        reply(server, session, ERR_NOSUCHNICK, vec![
            target_nick.clone(),
            "No such nick".into(),
        ])
        .await;
        reply(server, session, RPL_ENDOFWHOIS, vec![
            target_nick.clone(),
            "End of /WHOIS list".into(),
        ])
        .await;
        return;
    };

    let is_self = target.id == session.id;
    let (nick, user, realname, away, oper, modes, secure, idle, signon, channels) = {
        let st = target.state.read().await;
        (
            st.nick.clone(),
            st.user.clone(),
            st.realname.clone(),
            st.away.clone(),
            st.oper,
            st.modes_string(),
            st.modes.contains(&'z'),
            st.last_activity.elapsed().as_secs(),
            st.connect_unix(),
            st.channels.iter().cloned().collect::<Vec<_>>(),
        )
    };
    let host = target
        .state
        .read()
        .await
        .visible_host(&cfg.privacy, viewer_oper, is_self);

    reply(server, session, RPL_WHOISUSER, vec![
        nick.clone(),
        user,
        host,
        "*".into(),
        realname,
    ])
    .await;
    reply(server, session, RPL_WHOISSERVER, vec![
        nick.clone(),
        cfg.server.name.clone(),
        cfg.server.description.clone(),
    ])
    .await;

    if oper {
        reply(server, session, RPL_WHOISOPERATOR, vec![
            nick.clone(),
            "is an IRC operator".into(),
        ])
        .await;
    }
    if !away.is_empty() {
        reply(server, session, RPL_AWAY, vec![nick.clone(), away]).await;
    }

    reply(server, session, RPL_WHOISIDLE, vec![
        nick.clone(),
        idle.to_string(),
        signon.to_string(),
        "seconds idle, signon time".into(),
    ])
    .await;

    let mut chan_names = Vec::new();
    let target_folded = cfg.features.case_mapping.fold(&nick);
    for folded in &channels {
        if let Some(chan) = server.registry.channel(folded).await {
            let st = chan.state.read().await;
            chan_names.push(format!("{}{}", st.prefix_for(&target_folded), chan.name));
        }
    }
    if !chan_names.is_empty() {
        reply(server, session, RPL_WHOISCHANNELS, vec![
            nick.clone(),
            chan_names.join(" "),
        ])
        .await;
    }

    if (viewer_oper || is_self) && !modes.is_empty() {
        reply(server, session, RPL_WHOISMODES, vec![
            nick.clone(),
            format!("is using modes {modes}"),
        ])
        .await;
    }
    if secure {
        reply(server, session, RPL_WHOISSECURE, vec![
            nick.clone(),
            "is using a secure connection".into(),
        ])
        .await;
    }

    reply(server, session, RPL_ENDOFWHOIS, vec![
        nick,
        "End of /WHOIS list".into(),
    ])
    .await;
}

async fn handle_whowas(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let Some(nick) = params.first() else {
        need_more_params(server, session, "WHOWAS").await;
        return;
    };

    let hits = server.registry.whowas(nick).await;
    if hits.is_empty() {
        reply(server, session, ERR_WASNOSUCHNICK, vec![
            nick.clone(),
            "There was no such nickname".into(),
        ])
        .await;
    }
    for entry in hits {
        reply(server, session, RPL_WHOWASUSER, vec![
            entry.nick,
            entry.user,
            entry.host,
            "*".into(),
            entry.realname,
        ])
        .await;
    }
    reply(server, session, RPL_ENDOFWHOWAS, vec![
        nick.clone(),
        "End of WHOWAS".into(),
    ])
    .await;
}

// ── MODE ─────────────────────────────────────────────────────────

async fn handle_mode(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    let Some(target) = params.first() else {
        need_more_params(server, session, "MODE").await;
        return;
    };

    if is_channel_name(target) {
        handle_channel_mode(server, session, target, params).await;
    } else {
        handle_user_mode(server, session, target, params).await;
    }
}

async fn handle_user_mode(
    server: &Arc<Server>,
    session: &Arc<Session>,
    target: &str,
    params: &[String],
) {
    let cfg = server.config().await;
    let who = caller(server, session).await;

    if cfg.features.case_mapping.fold(target) != who.folded_nick {
        reply(server, session, ERR_USERSDONTMATCH, vec![
            "Cannot change mode for other users".into(),
        ])
        .await;
        return;
    }

    let Some(mode_string) = params.get(1) else {
        let modes = session.state.read().await.modes_string();
        let modes = if modes.is_empty() { "+".to_owned() } else { modes };
        reply(server, session, RPL_UMODEIS, vec![modes]).await;
        return;
    };

    let policy = server.oper_policy().await;
    let mut adding = true;
    let mut applied: Vec<String> = Vec::new();
    let mut deopered = false;

    {
        let mut st = session.state.write().await;
        for ch in mode_string.chars() {
            match ch {
                '+' => adding = true,
                '-' => adding = false,
                'i' | 'w' | 'x' | 'B' => {
                    if adding {
                        st.modes.insert(ch);
                    } else {
                        st.modes.remove(&ch);
                    }
                    applied.push(format!("{}{ch}", if adding { '+' } else { '-' }));
                }
                's' => {
                    // Server notices are oper-only to enable.
                    if adding && !st.oper {
                        continue;
                    }
                    if adding {
                        st.modes.insert('s');
                    } else {
                        st.modes.remove(&'s');
                    }
                    applied.push(format!("{}s", if adding { '+' } else { '-' }));
                }
                'o' => {
                    if adding {
                        // Operator status comes only from OPER.
                        reply_unknown_umode(session, &cfg, &who.nick).await;
                    } else {
                        let was_oper = st.oper;
                        st.oper = false;
                        st.oper_class = None;
                        st.oper_flags.clear();
                        st.modes.remove(&'o');
                        st.snomasks.clear();
                        applied.push("-o".into());
                        deopered = was_oper;
                    }
                }
                'z' => {
                    // Transport-derived; attempts to toggle are ignored.
                }
                'G' | 'H' | 'S' => {
                    if !st.oper {
                        reply_unknown_umode(session, &cfg, &who.nick).await;
                        continue;
                    }
                    let needed = if ch == 'G' { "god_mode" } else { "stealth_mode" };
                    if !policy.has_permission(
                        st.oper_class.as_deref(),
                        &st.oper_flags,
                        needed,
                    ) {
                        continue;
                    }
                    if adding {
                        st.modes.insert(ch);
                    } else {
                        st.modes.remove(&ch);
                    }
                    applied.push(format!("{}{ch}", if adding { '+' } else { '-' }));
                }
                _ => {
                    reply_unknown_umode(session, &cfg, &who.nick).await;
                }
            }
        }
    }

    if deopered {
        server
            .registry
            .send_snomask(
                &cfg.server.name,
                'o',
                &format!("{} is no longer an IRC operator", who.nick),
            )
            .await;
    }

    if !applied.is_empty() {
        session.send(Message::from_source(&who.nick, "MODE", vec![
            who.nick.clone(),
            applied.join(""),
        ]));
    }
}

async fn reply_unknown_umode(session: &Arc<Session>, cfg: &crate::config::Config, nick: &str) {
    session.send(Message::numeric(
        &cfg.server.name,
        ERR_UMODEUNKNOWNFLAG,
        nick,
        vec!["Unknown MODE flag".into()],
    ));
}

async fn handle_channel_mode(
    server: &Arc<Server>,
    session: &Arc<Session>,
    target: &str,
    params: &[String],
) {
    let cfg = server.config().await;
    let folded = cfg.features.case_mapping.fold(target);

    let Some(chan) = server.registry.channel(&folded).await else {
        reply(server, session, ERR_NOSUCHCHANNEL, vec![
            target.to_owned(),
            "No such channel".into(),
        ])
        .await;
        return;
    };

    if !session.state.read().await.channels.contains(&folded) {
        reply(server, session, ERR_NOTONCHANNEL, vec![
            target.to_owned(),
            "You're not on that channel".into(),
        ])
        .await;
        return;
    }

    let Some(mode_string) = params.get(1) else {
        let modes = chan.state.read().await.modes.to_mode_string();
        reply(server, session, RPL_CHANNELMODEIS, vec![chan.name.clone(), modes]).await;
        return;
    };

    let who = caller(server, session).await;
    {
        let st = chan.state.read().await;
        if !st.is_halfop_or_better(&who.folded_nick) && !who.oper {
            drop(st);
            reply(server, session, ERR_CHANOPRIVSNEEDED, vec![
                chan.name.clone(),
                "You're not channel operator".into(),
            ])
            .await;
            return;
        }
    }

    let changes = parse_mode_string(mode_string, &params[2..]);

    // Resolve membership-mode targets before taking the channel write
    // lock (registry reads must come first in the lock order).
    let mut resolved: HashMap<String, Option<(Arc<Session>, String, String)>> = HashMap::new();
    for change in &changes {
        if matches!(change.mode, 'q' | 'o' | 'h' | 'v') {
            if let Some(param) = &change.param {
                let key = cfg.features.case_mapping.fold(param);
                if !resolved.contains_key(&key) {
                    let found = match server.registry.session_by_nick(&key).await {
                        Some(peer) => {
                            let display = peer.nick().await;
                            let peer_folded = cfg.features.case_mapping.fold(&display);
                            Some((peer, display, peer_folded))
                        }
                        None => None,
                    };
                    resolved.insert(key, found);
                }
            }
        }
    }

    let mut applied = String::new();
    let mut applied_args: Vec<String> = Vec::new();
    // Numeric replies composed under the lock; snomask notes sent after.
    let mut snomask_notes: Vec<String> = Vec::new();
    let now = unix_now();

    {
        let mut st = chan.state.write().await;
        for change in changes {
            let sign = if change.setting { '+' } else { '-' };
            match change.mode {
                'q' | 'o' | 'h' | 'v' => {
                    let Some(param) = change.param else { continue };

                    // Owner status moves only by owners (or server opers).
                    if change.mode == 'q' && !st.is_owner(&who.folded_nick) && !who.oper {
                        session.send(Message::numeric(
                            &cfg.server.name,
                            ERR_CHANOPRIVSNEEDED,
                            &who.nick,
                            vec![chan.name.clone(), "You're not channel owner".into()],
                        ));
                        continue;
                    }

                    let key = cfg.features.case_mapping.fold(&param);
                    let Some(Some((_, display, peer_folded))) = resolved.get(&key) else {
                        session.send(Message::numeric(
                            &cfg.server.name,
                            ERR_NOSUCHNICK,
                            &who.nick,
                            vec![param.clone(), "No such nick/channel".into()],
                        ));
                        continue;
                    };
                    if !st.is_member(peer_folded) {
                        session.send(Message::numeric(
                            &cfg.server.name,
                            ERR_USERNOTINCHANNEL,
                            &who.nick,
                            vec![
                                display.clone(),
                                chan.name.clone(),
                                "They aren't on that channel".into(),
                            ],
                        ));
                        continue;
                    }

                    let set = match change.mode {
                        'q' => &mut st.owners,
                        'o' => &mut st.operators,
                        'h' => &mut st.halfops,
                        _ => &mut st.voices,
                    };
                    if change.setting {
                        set.insert(peer_folded.clone());
                    } else {
                        set.remove(peer_folded);
                    }
                    applied.push(sign);
                    applied.push(change.mode);
                    applied_args.push(display.clone());
                }

                'm' => {
                    st.modes.moderated = change.setting;
                    applied.push(sign);
                    applied.push('m');
                }
                'n' => {
                    st.modes.no_external = change.setting;
                    applied.push(sign);
                    applied.push('n');
                }
                't' => {
                    st.modes.topic_locked = change.setting;
                    applied.push(sign);
                    applied.push('t');
                }
                'i' => {
                    st.modes.invite_only = change.setting;
                    applied.push(sign);
                    applied.push('i');
                }
                's' => {
                    st.modes.secret = change.setting;
                    applied.push(sign);
                    applied.push('s');
                }
                'p' => {
                    st.modes.private = change.setting;
                    applied.push(sign);
                    applied.push('p');
                }

                'k' => {
                    if change.setting {
                        let Some(key) = change.param.filter(|k| !k.is_empty()) else {
                            continue;
                        };
                        st.modes.key = Some(key.clone());
                        applied.push_str("+k");
                        applied_args.push(key);
                    } else {
                        st.modes.key = None;
                        applied.push_str("-k");
                    }
                }
                'l' => {
                    if change.setting {
                        let Some(limit) = change
                            .param
                            .as_deref()
                            .and_then(|v| v.parse::<usize>().ok())
                            .filter(|&v| v > 0)
                        else {
                            continue;
                        };
                        st.modes.limit = Some(limit);
                        applied.push_str("+l");
                        applied_args.push(limit.to_string());
                    } else {
                        st.modes.limit = None;
                        applied.push_str("-l");
                    }
                }

                'b' => match change.param {
                    None => {
                        // List query.
                        for entry in &st.ban_list {
                            session.send(Message::numeric(
                                &cfg.server.name,
                                RPL_BANLIST,
                                &who.nick,
                                vec![
                                    chan.name.clone(),
                                    entry.mask.clone(),
                                    entry.set_by.clone(),
                                    entry.set_at.to_string(),
                                ],
                            ));
                        }
                        session.send(Message::numeric(
                            &cfg.server.name,
                            RPL_ENDOFBANLIST,
                            &who.nick,
                            vec![chan.name.clone(), "End of channel ban list".into()],
                        ));
                    }
                    Some(mask) => match parse_extended_ban(&mask) {
                        Some(('q', inner)) => {
                            if change.setting {
                                if !st.quiet_list.iter().any(|e| e.mask == inner) {
                                    st.quiet_list.push(ListEntry {
                                        mask: inner.to_owned(),
                                        set_by: who.nick.clone(),
                                        set_at: now,
                                    });
                                }
                                snomask_notes.push(format!(
                                    "{} set quiet ban {inner} on {}",
                                    who.nick, chan.name
                                ));
                            } else {
                                st.quiet_list.retain(|e| e.mask != inner);
                                snomask_notes.push(format!(
                                    "{} removed quiet ban {inner} on {}",
                                    who.nick, chan.name
                                ));
                            }
                            applied.push(sign);
                            applied.push('b');
                            applied_args.push(mask.clone());
                        }
                        Some((other, _)) => {
                            // Unknown extended ban types are rejected, not
                            // degraded to ordinary bans.
                            session.send(Message::numeric(
                                &cfg.server.name,
                                ERR_UNKNOWNMODE,
                                &who.nick,
                                vec![
                                    format!("~{other}"),
                                    "is unknown mode char to me".into(),
                                ],
                            ));
                        }
                        None => {
                            if change.setting {
                                if !st.ban_list.iter().any(|e| e.mask == mask) {
                                    st.ban_list.push(ListEntry {
                                        mask: mask.clone(),
                                        set_by: who.nick.clone(),
                                        set_at: now,
                                    });
                                }
                            } else {
                                st.ban_list.retain(|e| e.mask != mask);
                            }
                            applied.push(sign);
                            applied.push('b');
                            applied_args.push(mask);
                        }
                    },
                },

                other => {
                    session.send(Message::numeric(
                        &cfg.server.name,
                        ERR_UNKNOWNMODE,
                        &who.nick,
                        vec![other.to_string(), "is unknown mode char to me".into()],
                    ));
                }
            }
        }
    }

    for note in snomask_notes {
        if who.oper {
            server.registry.send_snomask(&cfg.server.name, 'x', &note).await;
        }
    }

    if !applied.is_empty() {
        let mut line_params = vec![chan.name.clone(), applied];
        line_params.extend(applied_args);
        let line = Message::from_source(&who.prefix, "MODE", line_params);
        chan.broadcast(&line, None).await;
    }
}

// ── Operator commands ────────────────────────────────────────────

async fn handle_oper(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    if params.len() < 2 {
        need_more_params(server, session, "OPER").await;
        return;
    }

    let cfg = server.config().await;
    if !cfg.features.enable_oper {
        reply(server, session, ERR_NOOPERHOST, vec!["O-lines are disabled".into()]).await;
        return;
    }

    let name = &params[0];
    let password = &params[1];
    let who = caller(server, session).await;

    let record = cfg.opers.iter().find(|o| {
        o.name == *name
            && o.password == *password
            && super::modes::match_hostmask(&o.host, &who.prefix)
    });

    let Some(record) = record else {
        reply(server, session, ERR_PASSWDMISMATCH, vec!["Password incorrect".into()]).await;
        return;
    };

    let snomask_mask = {
        let mut st = session.state.write().await;
        st.oper = true;
        st.oper_class = record.class.clone();
        st.oper_flags = record.flags.clone();
        st.modes.extend(['o', 's', 'w']);
        st.snomasks.extend(['c', 'o', 's']);
        st.snomask_string()
    };

    reply(server, session, RPL_YOUREOPER, vec![
        "You are now an IRC operator".into(),
    ])
    .await;
    reply(server, session, RPL_SNOMASK, vec![
        snomask_mask,
        "Server notice mask".into(),
    ])
    .await;
    session.send(Message::from_source(&who.nick, "MODE", vec![
        who.nick.clone(),
        "+osw".into(),
    ]));

    let (user, host) = {
        let st = session.state.read().await;
        (st.user.clone(), st.host.clone())
    };
    server
        .registry
        .send_snomask(
            &cfg.server.name,
            'o',
            &format!("{} ({user}@{host}) is now an IRC operator", who.nick),
        )
        .await;
}

async fn handle_snomask(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    if !require_oper(server, session).await {
        return;
    }

    // Recognized server-notice categories.
    const SNOMASK_LETTERS: &[char] = &['c', 'k', 'o', 'x', 'f', 'n', 's', 'd'];

    if let Some(mode_string) = params.first() {
        let mut st = session.state.write().await;
        let mut adding = true;
        for ch in mode_string.chars() {
            match ch {
                '+' => adding = true,
                '-' => adding = false,
                letter if SNOMASK_LETTERS.contains(&letter) => {
                    if adding {
                        st.snomasks.insert(letter);
                    } else {
                        st.snomasks.remove(&letter);
                    }
                }
                _ => {}
            }
        }
    }

    let mask = session.state.read().await.snomask_string();
    let mask = if mask.is_empty() { "+".to_owned() } else { mask };
    reply(server, session, RPL_SNOMASK, vec![mask, "Server notice mask".into()]).await;
}

async fn handle_kill(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    if !require_oper(server, session).await {
        return;
    }
    let Some(target_nick) = params.first() else {
        need_more_params(server, session, "KILL").await;
        return;
    };
    let reason = params
        .get(1)
        .filter(|r| !r.is_empty())
        .cloned()
        .unwrap_or_else(|| "Killed by operator".to_owned());

    let cfg = server.config().await;
    let Some(target) = server
        .registry
        .session_by_nick(&cfg.features.case_mapping.fold(target_nick))
        .await
    else {
        reply(server, session, ERR_NOSUCHNICK, vec![
            target_nick.clone(),
            "No such nick/channel".into(),
        ])
        .await;
        return;
    };

    let who = caller(server, session).await;
    let (target_oper, target_class, target_display) = {
        let st = target.state.read().await;
        (st.oper, st.oper_class.clone(), st.nick.clone())
    };

    if target_oper {
        let policy = server.oper_policy().await;
        if !policy.can_operate_on(
            who.oper_class.as_deref(),
            &who.oper_flags,
            target_class.as_deref(),
        ) {
            reply(server, session, ERR_CANTKILLSERVER, vec![
                "You can't kill other operators".into(),
            ])
            .await;
            return;
        }
    }

    let kill_reason = format!("Killed ({} ({reason}))", who.nick);
    target.send(Message::new("ERROR", vec![kill_reason.clone()]));
    target.disconnect(kill_reason);

    // Let the other opers know.
    for peer in server.registry.sessions().await {
        if peer.id == session.id || peer.id == target.id {
            continue;
        }
        let st = peer.state.read().await;
        if st.oper {
            let line = Message::from_source(&cfg.server.name, "WALLOPS", vec![format!(
                "{} killed {target_display} ({reason})",
                who.nick
            )]);
            drop(st);
            peer.send(line);
        }
    }
    server
        .registry
        .send_snomask(
            &cfg.server.name,
            'k',
            &format!("{} killed {target_display} ({reason})", who.nick),
        )
        .await;
}

async fn handle_rehash(server: &Arc<Server>, session: &Arc<Session>) {
    if !require_oper(server, session).await {
        return;
    }
    let who = caller(server, session).await;
    let cfg = server.config().await;

    match server.rehash().await {
        Ok(()) => {
            server_notice(server, session, "Configuration reloaded successfully").await;
            server
                .registry
                .send_snomask(
                    &cfg.server.name,
                    's',
                    &format!("Configuration reloaded by {}", who.nick),
                )
                .await;
        }
        Err(e) => {
            server_notice(server, session, &format!("REHASH failed: {e}")).await;
            server
                .registry
                .send_snomask(
                    &cfg.server.name,
                    's',
                    &format!("REHASH failed by {}: {e}", who.nick),
                )
                .await;
        }
    }
}

async fn handle_trace(server: &Arc<Server>, session: &Arc<Session>) {
    if !require_oper(server, session).await {
        return;
    }
    let cfg = server.config().await;
    reply(server, session, RPL_TRACELINK, vec![
        "Link".into(),
        cfg.server.version.clone(),
        cfg.server.name.clone(),
        cfg.server.network.clone(),
    ])
    .await;

    let clients = server.registry.client_count().await;
    reply(server, session, RPL_TRACEEND, vec![
        cfg.server.name.clone(),
        format!("End of TRACE with {clients} clients"),
    ])
    .await;
}

async fn handle_wallops(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    if !require_oper(server, session).await {
        return;
    }
    let Some(text) = params.first() else {
        need_more_params(server, session, "WALLOPS").await;
        return;
    };

    let who = caller(server, session).await;
    for peer in server.registry.sessions().await {
        let st = peer.state.read().await;
        if st.modes.contains(&'w') {
            drop(st);
            peer.send(Message::from_source(&who.nick, "WALLOPS", vec![text.clone()]));
        }
    }
}

async fn handle_operwall(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    if !require_oper(server, session).await {
        return;
    }
    let Some(text) = params.first() else {
        need_more_params(server, session, "OPERWALL").await;
        return;
    };

    let who = caller(server, session).await;
    for peer in server.registry.sessions().await {
        let st = peer.state.read().await;
        if st.oper {
            drop(st);
            peer.send(Message::from_source(&who.nick, "WALLOPS", vec![text.clone()]));
        }
    }
}

async fn handle_globalnotice(server: &Arc<Server>, session: &Arc<Session>, params: &[String]) {
    if !require_oper(server, session).await {
        return;
    }
    let Some(text) = params.first() else {
        need_more_params(server, session, "GLOBALNOTICE").await;
        return;
    };

    let cfg = server.config().await;
    let who = caller(server, session).await;

    for peer in server.registry.sessions().await {
        let st = peer.state.read().await;
        if !st.registered {
            continue;
        }
        let line = Message::from_source(&cfg.server.name, "NOTICE", vec![
            st.nick.clone(),
            format!("[GLOBAL] {text}"),
        ]);
        drop(st);
        peer.send(line);
    }

    server
        .registry
        .send_snomask(
            &cfg.server.name,
            's',
            &format!("Global notice from {}: {text}", who.nick),
        )
        .await;
}

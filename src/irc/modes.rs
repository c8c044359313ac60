//! Channel modes — data structures and pure functions for mode parsing,
//! hostmask matching, and WHOWAS history.

/// Per-channel mode flags. Key and limit are carried inline: `+k` is set
/// exactly when `key` is `Some`, `+l` exactly when `limit` is `Some`.
#[derive(Debug, Clone, Default)]
pub struct ChannelModes {
    /// +i — invite only
    pub invite_only: bool,
    /// +m — moderated (only voice and better can speak)
    pub moderated: bool,
    /// +n — no external messages (must be in channel to send)
    pub no_external: bool,
    /// +t — only halfops and better can set the topic
    pub topic_locked: bool,
    /// +s — secret (hidden from LIST)
    pub secret: bool,
    /// +p — private
    pub private: bool,
    /// +k — channel key (password)
    pub key: Option<String>,
    /// +l — user limit
    pub limit: Option<usize>,
}

impl ChannelModes {
    /// Apply a config-style default mode string such as `+nt`. Only the
    /// parameterless flags make sense as defaults; anything else is ignored.
    pub fn apply_defaults(&mut self, default_modes: &str) {
        for ch in default_modes.chars() {
            match ch {
                'i' => self.invite_only = true,
                'm' => self.moderated = true,
                'n' => self.no_external = true,
                't' => self.topic_locked = true,
                's' => self.secret = true,
                'p' => self.private = true,
                _ => {}
            }
        }
    }

    /// Render current modes as an IRC mode string, e.g. "+ntk sekrit".
    pub fn to_mode_string(&self) -> String {
        let mut flags = String::from("+");
        let mut params = Vec::new();

        if self.invite_only {
            flags.push('i');
        }
        if self.moderated {
            flags.push('m');
        }
        if self.no_external {
            flags.push('n');
        }
        if self.private {
            flags.push('p');
        }
        if self.secret {
            flags.push('s');
        }
        if self.topic_locked {
            flags.push('t');
        }
        if let Some(ref key) = self.key {
            flags.push('k');
            params.push(key.clone());
        }
        if let Some(limit) = self.limit {
            flags.push('l');
            params.push(limit.to_string());
        }

        if params.is_empty() {
            flags
        } else {
            format!("{flags} {}", params.join(" "))
        }
    }
}

/// An entry on one of a channel's mask lists (ban, quiet, except, invite).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Wildcard hostmask pattern (e.g. `*!*@bad.host`).
    pub mask: String,
    /// Nick of the user who set the entry.
    pub set_by: String,
    /// Unix timestamp when the entry was set.
    pub set_at: u64,
}

/// A parsed mode change: `+n`, `-m`, `+k sekrit`, etc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    /// true = setting (+), false = unsetting (-)
    pub setting: bool,
    /// The mode character
    pub mode: char,
    /// Optional parameter (key, limit, nick for membership modes, ban mask)
    pub param: Option<String>,
}

/// Parse an IRC mode string with its parameters into individual mode changes.
///
/// CHANMODES classification:
/// - Type A (list, takes param when present): `b`
/// - Type B (always takes param): `k`
/// - Type C (param on set, no param on unset): `l`
/// - Type D (never takes param): `i, m, n, p, s, t`
/// - Membership (always takes param): `q, o, h, v`
pub fn parse_mode_string(mode_str: &str, params: &[String]) -> Vec<ModeChange> {
    let mut changes = Vec::new();
    let mut setting = true;
    let mut param_idx = 0;

    let mut take_param = |param_idx: &mut usize| -> Option<String> {
        if *param_idx < params.len() {
            let p = params[*param_idx].clone();
            *param_idx += 1;
            Some(p)
        } else {
            None
        }
    };

    for ch in mode_str.chars() {
        match ch {
            '+' => setting = true,
            '-' => setting = false,
            // Type A: list mode. `+b` with no param means "list bans".
            'b' => {
                let param = take_param(&mut param_idx);
                changes.push(ModeChange {
                    setting,
                    mode: 'b',
                    param,
                });
            }
            // Type B: always takes a param.
            'k' => {
                let param = take_param(&mut param_idx);
                changes.push(ModeChange {
                    setting,
                    mode: 'k',
                    param,
                });
            }
            // Type C: param on set, no param on unset.
            'l' => {
                let param = if setting {
                    take_param(&mut param_idx)
                } else {
                    None
                };
                changes.push(ModeChange {
                    setting,
                    mode: 'l',
                    param,
                });
            }
            // Type D: no param.
            'i' | 'm' | 'n' | 'p' | 's' | 't' => {
                changes.push(ModeChange {
                    setting,
                    mode: ch,
                    param: None,
                });
            }
            // Membership modes: always take a nick param.
            'q' | 'o' | 'h' | 'v' => {
                let param = take_param(&mut param_idx);
                changes.push(ModeChange {
                    setting,
                    mode: ch,
                    param,
                });
            }
            // Unknown — still emit it so the caller can send 472.
            _ => {
                changes.push(ModeChange {
                    setting,
                    mode: ch,
                    param: None,
                });
            }
        }
    }

    changes
}

/// Split an extended-ban mask of the form `~x:mask` into its type letter
/// and inner mask. Returns None for ordinary masks.
pub fn parse_extended_ban(mask: &str) -> Option<(char, &str)> {
    let rest = mask.strip_prefix('~')?;
    let mut chars = rest.chars();
    let kind = chars.next()?;
    let rest = chars.as_str().strip_prefix(':')?;
    Some((kind, rest))
}

/// Match a wildcard hostmask pattern against a full `nick!user@host`.
///
/// Supports `*` (zero or more characters) and `?` (exactly one character).
/// Case-insensitive comparison, as everywhere else in the protocol.
pub fn match_hostmask(mask: &str, full_hostmask: &str) -> bool {
    let mask = mask.to_ascii_lowercase();
    let full = full_hostmask.to_ascii_lowercase();
    wildcard_match(mask.as_bytes(), full.as_bytes())
}

/// Iterative wildcard matcher for `*` and `?` (no stack growth on long
/// patterns).
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let mut pi = 0;
    let mut ti = 0;
    let mut star_pi = usize::MAX;
    let mut star_ti = 0;

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == b'?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == b'*' {
            star_pi = pi;
            star_ti = ti;
            pi += 1;
        } else if star_pi != usize::MAX {
            pi = star_pi + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }

    // Consume trailing *'s in pattern.
    while pi < pattern.len() && pattern[pi] == b'*' {
        pi += 1;
    }

    pi == pattern.len()
}

/// A record of a disconnected user for WHOWAS.
#[derive(Debug, Clone)]
pub struct WhowasEntry {
    pub nick: String,
    pub user: String,
    pub host: String,
    pub realname: String,
    pub disconnect_time: u64,
}

/// Ring buffer of WHOWAS entries (fixed capacity).
#[derive(Debug)]
pub struct WhowasBuffer {
    entries: Vec<WhowasEntry>,
    capacity: usize,
}

impl WhowasBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an entry. If at capacity, the oldest entry is evicted.
    pub fn push(&mut self, entry: WhowasEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }

    /// Look up entries by nick (case-insensitive), most recent first.
    pub fn lookup(&self, nick: &str) -> Vec<&WhowasEntry> {
        let lower = nick.to_ascii_lowercase();
        self.entries
            .iter()
            .rev()
            .filter(|e| e.nick.to_ascii_lowercase() == lower)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── ChannelModes ────────────────────────────────────────────────

    #[test]
    fn default_modes_are_empty() {
        let modes = ChannelModes::default();
        assert_eq!(modes.to_mode_string(), "+");
        assert!(modes.key.is_none());
        assert!(modes.limit.is_none());
    }

    #[test]
    fn apply_defaults_sets_flags() {
        let mut modes = ChannelModes::default();
        modes.apply_defaults("+nt");
        assert!(modes.no_external);
        assert!(modes.topic_locked);
        assert!(!modes.moderated);
        assert_eq!(modes.to_mode_string(), "+nt");
    }

    #[test]
    fn mode_string_with_key_and_limit() {
        let modes = ChannelModes {
            no_external: true,
            topic_locked: true,
            secret: true,
            key: Some("sekrit".into()),
            limit: Some(42),
            ..ChannelModes::default()
        };
        assert_eq!(modes.to_mode_string(), "+nstkl sekrit 42");
    }

    #[test]
    fn mode_string_with_limit_only() {
        let modes = ChannelModes {
            no_external: true,
            limit: Some(10),
            ..ChannelModes::default()
        };
        assert_eq!(modes.to_mode_string(), "+nl 10");
    }

    // ── parse_mode_string ───────────────────────────────────────────

    #[test]
    fn parse_simple_flags() {
        let changes = parse_mode_string("+nt", &[]);
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[0],
            ModeChange {
                setting: true,
                mode: 'n',
                param: None
            }
        );
        assert_eq!(
            changes[1],
            ModeChange {
                setting: true,
                mode: 't',
                param: None
            }
        );
    }

    #[test]
    fn parse_mixed_set_unset() {
        let changes = parse_mode_string("+nt-m", &[]);
        assert_eq!(changes.len(), 3);
        assert!(changes[0].setting);
        assert!(changes[1].setting);
        assert!(!changes[2].setting);
        assert_eq!(changes[2].mode, 'm');
    }

    #[test]
    fn parse_key_mode() {
        let changes = parse_mode_string("+k", &["sekrit".into()]);
        assert_eq!(
            changes,
            vec![ModeChange {
                setting: true,
                mode: 'k',
                param: Some("sekrit".into())
            }]
        );
    }

    #[test]
    fn parse_limit_set_and_unset() {
        let changes = parse_mode_string("+l", &["50".into()]);
        assert_eq!(
            changes,
            vec![ModeChange {
                setting: true,
                mode: 'l',
                param: Some("50".into())
            }]
        );

        let changes = parse_mode_string("-l", &[]);
        assert_eq!(
            changes,
            vec![ModeChange {
                setting: false,
                mode: 'l',
                param: None
            }]
        );
    }

    #[test]
    fn parse_membership_modes() {
        let changes = parse_mode_string("+o-v", &["marlin".into(), "otter".into()]);
        assert_eq!(
            changes,
            vec![
                ModeChange {
                    setting: true,
                    mode: 'o',
                    param: Some("marlin".into())
                },
                ModeChange {
                    setting: false,
                    mode: 'v',
                    param: Some("otter".into())
                },
            ]
        );
    }

    #[test]
    fn parse_ban_list_query() {
        let changes = parse_mode_string("+b", &[]);
        assert_eq!(
            changes,
            vec![ModeChange {
                setting: true,
                mode: 'b',
                param: None
            }]
        );
    }

    #[test]
    fn parse_complex_mode_string() {
        let changes = parse_mode_string("+ntk-m+l", &["sekrit".into(), "25".into()]);
        assert_eq!(changes.len(), 5);
        assert_eq!(changes[2].param.as_deref(), Some("sekrit"));
        assert!(!changes[3].setting);
        assert_eq!(changes[4].param.as_deref(), Some("25"));
    }

    #[test]
    fn parse_unknown_mode_is_surfaced() {
        let changes = parse_mode_string("+w", &[]);
        assert_eq!(
            changes,
            vec![ModeChange {
                setting: true,
                mode: 'w',
                param: None
            }]
        );
    }

    // ── parse_extended_ban ──────────────────────────────────────────

    #[test]
    fn extended_ban_quiet() {
        assert_eq!(
            parse_extended_ban("~q:*!*@bad.host"),
            Some(('q', "*!*@bad.host"))
        );
    }

    #[test]
    fn extended_ban_other_letter() {
        assert_eq!(parse_extended_ban("~c:#reef"), Some(('c', "#reef")));
    }

    #[test]
    fn ordinary_masks_are_not_extended() {
        assert_eq!(parse_extended_ban("*!*@bad.host"), None);
        assert_eq!(parse_extended_ban("~q"), None);
        assert_eq!(parse_extended_ban("~"), None);
    }

    // ── match_hostmask ──────────────────────────────────────────────

    #[test]
    fn exact_match() {
        assert!(match_hostmask("nick!user@host", "nick!user@host"));
    }

    #[test]
    fn case_insensitive() {
        assert!(match_hostmask("NICK!USER@HOST", "nick!user@host"));
        assert!(match_hostmask("nick!user@host", "NICK!USER@HOST"));
    }

    #[test]
    fn star_wildcard() {
        assert!(match_hostmask("*!*@bad.host", "anyone!anything@bad.host"));
        assert!(!match_hostmask("*!*@bad.host", "anyone!anything@good.host"));
    }

    #[test]
    fn question_wildcard() {
        assert!(match_hostmask("n?ck!user@host", "nick!user@host"));
        assert!(!match_hostmask("n?ck!user@host", "niiick!user@host"));
    }

    #[test]
    fn star_in_host() {
        assert!(match_hostmask("*!*@*.bad.net", "user!ident@sub.bad.net"));
        assert!(!match_hostmask("*!*@*.bad.net", "user!ident@bad.net"));
    }

    #[test]
    fn all_wildcard() {
        assert!(match_hostmask("*", "anything!goes@here"));
        assert!(match_hostmask("*!*@*", "anything!goes@here"));
    }

    #[test]
    fn empty_pattern() {
        assert!(!match_hostmask("", "nick!user@host"));
        assert!(match_hostmask("", ""));
    }

    // ── WhowasBuffer ────────────────────────────────────────────────

    #[test]
    fn whowas_push_and_lookup() {
        let mut buf = WhowasBuffer::new(3);
        buf.push(WhowasEntry {
            nick: "Marlin".into(),
            user: "m".into(),
            host: "host.example".into(),
            realname: "Marlin M".into(),
            disconnect_time: 100,
        });

        let results = buf.lookup("marlin");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].nick, "Marlin");
        assert_eq!(buf.lookup("MARLIN").len(), 1);
    }

    #[test]
    fn whowas_eviction() {
        let mut buf = WhowasBuffer::new(2);
        for (i, nick) in ["a", "b", "c"].iter().enumerate() {
            buf.push(WhowasEntry {
                nick: nick.to_string(),
                user: nick.to_string(),
                host: "h".into(),
                realname: String::new(),
                disconnect_time: i as u64,
            });
        }

        assert!(buf.lookup("a").is_empty());
        assert_eq!(buf.lookup("b").len(), 1);
        assert_eq!(buf.lookup("c").len(), 1);
    }

    #[test]
    fn whowas_most_recent_first() {
        let mut buf = WhowasBuffer::new(10);
        buf.push(WhowasEntry {
            nick: "same".into(),
            user: "old".into(),
            host: "h".into(),
            realname: String::new(),
            disconnect_time: 1,
        });
        buf.push(WhowasEntry {
            nick: "same".into(),
            user: "new".into(),
            host: "h".into(),
            realname: String::new(),
            disconnect_time: 2,
        });

        let results = buf.lookup("same");
        assert_eq!(results[0].user, "new");
        assert_eq!(results[1].user, "old");
    }
}

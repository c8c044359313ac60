//! Nickname and channel-name validation, and case folding for lookups.
//!
//! All registry and channel-membership keys use the folded form of a name;
//! broadcast output preserves the original case.

use serde::Deserialize;

/// Case-folding rule for nick and channel-name comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseMapping {
    /// RFC 1459: ASCII lowering plus `{` → `[`, `}` → `]`, `|` → `\`.
    #[default]
    Rfc1459,
    /// Plain ASCII lowering.
    Ascii,
}

impl CaseMapping {
    /// Fold a name for case-insensitive comparison.
    pub fn fold(self, s: &str) -> String {
        match self {
            CaseMapping::Ascii => s.to_ascii_lowercase(),
            CaseMapping::Rfc1459 => s
                .chars()
                .map(|c| match c {
                    '{' => '[',
                    '}' => ']',
                    '|' => '\\',
                    _ => c.to_ascii_lowercase(),
                })
                .collect(),
        }
    }

    /// ISUPPORT token value.
    pub fn token(self) -> &'static str {
        match self {
            CaseMapping::Rfc1459 => "rfc1459",
            CaseMapping::Ascii => "ascii",
        }
    }
}

/// Characters legal anywhere in a nick besides letters and digits.
const NICK_SPECIAL: &[char] = &['[', ']', '\\', '`', '_', '^', '{', '|', '}'];

/// Check nickname legality: 1..=max_len characters, first a letter or one
/// of ``[]\`_^{|}``, the rest also allowing digits and `-`.
pub fn is_valid_nick(nick: &str, max_len: usize) -> bool {
    if nick.is_empty() || nick.len() > max_len {
        return false;
    }

    let mut chars = nick.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() && !NICK_SPECIAL.contains(&first) {
        return false;
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || NICK_SPECIAL.contains(&c))
}

/// Check channel-name legality: 1..=max_len characters, first one of `#&!+`.
pub fn is_valid_channel_name(name: &str, max_len: usize) -> bool {
    !name.is_empty() && name.len() <= max_len && is_channel_name(name)
}

/// Whether a message target names a channel rather than a user.
pub fn is_channel_name(name: &str) -> bool {
    matches!(name.chars().next(), Some('#' | '&' | '!' | '+'))
}

//! Channel store: membership, operators, modes, bans and invites.
//!
//! Members are referenced by nickname only. Keeping the user's own channel
//! set in step is the caller's job (see `ServerState::join_channel`).

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::CommandError;
use crate::registry::normalize;

/// Characters a channel name may start with.
pub const CHANNEL_PREFIXES: [char; 4] = ['#', '&', '+', '!'];

const MAX_CHANNEL_NAME: usize = 50;

pub fn is_channel_name(name: &str) -> bool {
    name.starts_with(CHANNEL_PREFIXES)
        && name.len() > 1
        && name.len() <= MAX_CHANNEL_NAME
        && !name.contains([' ', ',', '\x07'])
}

/// A ban on a `nick!user@host` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub mask: String,
    pub set_by: String,
}

impl BanEntry {
    pub fn new(mask: &str, set_by: &str) -> Self {
        Self {
            mask: mask.to_string(),
            set_by: set_by.to_string(),
        }
    }

    pub fn matches(&self, hostmask: &str) -> bool {
        wildcard_match(&self.mask, hostmask)
    }
}

/// Case-insensitive glob with `*` and `?`.
///
/// Backtracks only to the most recent `*`, so the cost stays linear in
/// the product of the two lengths however many stars the mask holds.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.to_lowercase().into_bytes();
    let text = text.to_lowercase().into_bytes();
    let (mut p, mut t) = (0, 0);
    // Pattern position after the last `*`, and the text position it absorbed up to.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some((p + 1, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((resume, absorbed)) => {
                    star = Some((resume, absorbed + 1));
                    p = resume;
                    t = absorbed + 1;
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Expand a bare nick into a full mask so `+b bob` bans `bob!*@*`.
pub fn normalize_mask(mask: &str) -> String {
    match (mask.contains('!'), mask.contains('@')) {
        (true, true) => mask.to_string(),
        (true, false) => format!("{mask}@*"),
        (false, true) => format!("*!{mask}"),
        (false, false) => format!("{mask}!*@*"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    /// Lowercased nick to display nick.
    members: BTreeMap<String, String>,
    operators: HashSet<String>,
    pub topic: Option<Topic>,
    pub key: Option<String>,
    pub limit: Option<usize>,
    pub invite_only: bool,
    pub bans: Vec<BanEntry>,
    invites: HashSet<String>,
}

impl Channel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: BTreeMap::new(),
            operators: HashSet::new(),
            topic: None,
            key: None,
            limit: None,
            invite_only: false,
            bans: Vec::new(),
            invites: HashSet::new(),
        }
    }

    pub fn is_member(&self, nick: &str) -> bool {
        self.members.contains_key(&normalize(nick))
    }

    pub fn is_operator(&self, nick: &str) -> bool {
        self.operators.contains(&normalize(nick))
    }

    pub fn is_invited(&self, nick: &str) -> bool {
        self.invites.contains(&normalize(nick))
    }

    pub fn is_banned(&self, hostmask: &str) -> bool {
        self.bans.iter().any(|b| b.matches(hostmask))
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.values().map(String::as_str)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn operators(&self) -> impl Iterator<Item = &str> {
        self.members
            .iter()
            .filter(|(key, _)| self.operators.contains(*key))
            .map(|(_, nick)| nick.as_str())
    }

    pub fn invites(&self) -> impl Iterator<Item = &str> {
        self.invites.iter().map(String::as_str)
    }

    /// Admission gate for JOIN: key, then ban, then invite-only, then limit.
    pub fn admit(&self, nick: &str, hostmask: &str, key: Option<&str>) -> Result<(), CommandError> {
        if let Some(expected) = &self.key
            && key != Some(expected.as_str())
        {
            return Err(CommandError::BadChannelKey(self.name.clone()));
        }
        if self.is_banned(hostmask) {
            return Err(CommandError::BannedFromChan(self.name.clone()));
        }
        if self.invite_only && !self.is_invited(nick) {
            return Err(CommandError::InviteOnlyChan(self.name.clone()));
        }
        if let Some(limit) = self.limit
            && self.members.len() >= limit
        {
            return Err(CommandError::ChannelIsFull(self.name.clone()));
        }
        Ok(())
    }

    /// Returns false when already a member. A pending invite is used up.
    pub fn add_member(&mut self, nick: &str) -> bool {
        let key = normalize(nick);
        self.invites.remove(&key);
        if self.members.contains_key(&key) {
            return false;
        }
        self.members.insert(key, nick.to_string());
        true
    }

    /// Drops the member together with its operator and invite entries.
    pub fn remove_member(&mut self, nick: &str) -> bool {
        let key = normalize(nick);
        self.operators.remove(&key);
        self.invites.remove(&key);
        self.members.remove(&key).is_some()
    }

    pub fn rename_member(&mut self, old: &str, new: &str) {
        let old_key = normalize(old);
        if self.members.remove(&old_key).is_none() {
            return;
        }
        let new_key = normalize(new);
        if self.operators.remove(&old_key) {
            self.operators.insert(new_key.clone());
        }
        self.members.insert(new_key, new.to_string());
    }

    /// Only members can hold operator status.
    pub fn set_operator(&mut self, nick: &str, op: bool) -> bool {
        let key = normalize(nick);
        if !self.members.contains_key(&key) {
            return false;
        }
        if op {
            self.operators.insert(key)
        } else {
            self.operators.remove(&key)
        }
    }

    pub fn add_invite(&mut self, nick: &str) -> bool {
        self.invites.insert(normalize(nick))
    }

    pub fn remove_invite(&mut self, nick: &str) -> bool {
        self.invites.remove(&normalize(nick))
    }

    pub fn add_ban(&mut self, mask: &str, set_by: &str) -> bool {
        let mask = normalize_mask(mask);
        if self.bans.iter().any(|b| b.mask.eq_ignore_ascii_case(&mask)) {
            return false;
        }
        self.bans.push(BanEntry::new(&mask, set_by));
        true
    }

    pub fn remove_ban(&mut self, mask: &str) -> bool {
        let mask = normalize_mask(mask);
        let before = self.bans.len();
        self.bans.retain(|b| !b.mask.eq_ignore_ascii_case(&mask));
        self.bans.len() != before
    }

    /// Current flags with their arguments, e.g. `["+ikl", "secret", "10"]`.
    pub fn mode_string(&self) -> Vec<String> {
        let mut flags = String::from("+");
        let mut args = Vec::new();
        if self.invite_only {
            flags.push('i');
        }
        if let Some(key) = &self.key {
            flags.push('k');
            args.push(key.clone());
        }
        if let Some(limit) = self.limit {
            flags.push('l');
            args.push(limit.to_string());
        }
        let mut out = vec![flags];
        out.extend(args);
        out
    }

    /// `@nick` for operators, `nick` otherwise.
    pub fn names(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|(key, nick)| {
                if self.operators.contains(key) {
                    format!("@{nick}")
                } else {
                    nick.clone()
                }
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct ChannelStore {
    channels: HashMap<String, Channel>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&normalize(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(&normalize(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(&normalize(name))
    }

    /// The channel and whether it was just created.
    pub fn get_or_create(&mut self, name: &str) -> (&mut Channel, bool) {
        let key = normalize(name);
        let created = !self.channels.contains_key(&key);
        let channel = self.channels.entry(key).or_insert_with(|| Channel::new(name));
        (channel, created)
    }

    pub fn add_member(&mut self, name: &str, nick: &str) -> bool {
        self.get_or_create(name).0.add_member(nick)
    }

    pub fn remove_member(&mut self, name: &str, nick: &str) -> bool {
        self.get_mut(name).is_some_and(|c| c.remove_member(nick))
    }

    pub fn delete_if_empty(&mut self, name: &str) -> bool {
        let key = normalize(name);
        if self.channels.get(&key).is_some_and(Channel::is_empty) {
            self.channels.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

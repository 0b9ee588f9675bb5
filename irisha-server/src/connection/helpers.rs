//! Shared helpers: who a command acts for, replies, and fan-out.

use std::collections::BTreeSet;

use crate::error::CommandError;
use crate::irc::Message;
use crate::registry::{Handle, normalize};
use crate::server::{Sender, ServerState};

/// Who a command acts for.
#[derive(Debug, Clone)]
pub(crate) struct Actor {
    pub nick: String,
    /// Link the line arrived on when relayed by a peer.
    pub link: Option<Handle>,
    /// The prefix named a server (burst and mode sync from peers).
    pub is_server: bool,
}

impl Actor {
    pub fn is_local(&self) -> bool {
        self.link.is_none()
    }
}

/// The local user on `handle`, or whoever a peer's prefix names.
pub(crate) fn actor(state: &ServerState, handle: Handle, msg: &Message) -> Result<Actor, CommandError> {
    match state.sender(handle) {
        Some(Sender::User(nick)) => Ok(Actor {
            nick,
            link: None,
            is_server: false,
        }),
        Some(Sender::Peer(link_name)) => {
            let name = msg.source_name().unwrap_or(&link_name);
            if state.registry.is_own_name(name) {
                return Err(CommandError::ProtocolViolation(format!(
                    "{link_name} relayed a line as this server"
                )));
            }
            let conn = state
                .registry
                .find_by_name(name)
                .ok_or_else(|| CommandError::NoSuchNick(name.to_string()))?;
            if conn.next_hop() != handle {
                return Err(CommandError::ProtocolViolation(format!(
                    "{link_name} relayed a line as {name}"
                )));
            }
            Ok(Actor {
                nick: conn.name.clone(),
                link: Some(handle),
                is_server: conn.server().is_some(),
            })
        }
        Some(Sender::Pending) | None => Err(CommandError::NotRegistered),
    }
}

/// Send a numeric or command from this server to `handle`.
pub(crate) fn reply(state: &ServerState, handle: Handle, command: &str, params: Vec<&str>) {
    let msg = Message::from_server(state.server_name(), command, params);
    state.registry.send(handle, &msg);
}

/// Report a failure without aborting the rest of a multi-target command.
pub(crate) fn send_error(state: &ServerState, handle: Handle, recipient: &str, err: &CommandError) {
    let Some(code) = err.numeric() else {
        return;
    };
    let subjects = err.subjects();
    let text = err.text();
    let mut params = vec![recipient];
    params.extend(subjects.iter().map(String::as_str));
    params.push(&text);
    reply(state, handle, code, params);
}

/// `nick!user@host` when known, the bare name otherwise.
pub(crate) fn hostmask(state: &ServerState, name: &str) -> String {
    state
        .registry
        .find_by_name(name)
        .map(|c| c.hostmask())
        .unwrap_or_else(|| name.to_string())
}

/// Deliver to a user connected to this server; remote users are skipped.
pub(crate) fn send_local(state: &ServerState, nick: &str, msg: &Message) {
    if let Some(conn) = state.registry.user(nick)
        && conn.is_direct()
    {
        state.registry.send(conn.next_hop(), msg);
    }
}

/// Send to every direct peer except `except`.
pub(crate) fn relay_to_peers(state: &ServerState, except: Option<Handle>, msg: &Message) {
    for peer in state.registry.direct_peers() {
        if Some(peer) != except {
            state.registry.send(peer, msg);
        }
    }
}

/// Send to the local members of `channel`, optionally skipping one nick.
pub(crate) fn send_to_channel(state: &ServerState, channel: &str, msg: &Message, except: Option<&str>) {
    let Some(chan) = state.channels.get(channel) else {
        return;
    };
    let skip = except.map(normalize);
    for member in chan.members() {
        if skip.as_deref() != Some(normalize(member).as_str()) {
            send_local(state, member, msg);
        }
    }
}

/// Local users sharing at least one channel with `nick`, lowercased.
pub(crate) fn co_members(state: &ServerState, nick: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let Some(user) = state.registry.user(nick).and_then(|c| c.user()) else {
        return seen;
    };
    for name in &user.channels {
        if let Some(chan) = state.channels.get(name) {
            seen.extend(chan.members().map(normalize));
        }
    }
    seen.remove(&normalize(nick));
    seen
}

/// Show `msg` to everyone sharing a channel with `nick`, and to `nick`
/// itself when `include_self` is set.
pub(crate) fn notify_observers(state: &ServerState, nick: &str, msg: &Message, include_self: bool) {
    for observer in co_members(state, nick) {
        send_local(state, &observer, msg);
    }
    if include_self {
        send_local(state, nick, msg);
    }
}

/// Numerics relayed by a peer go to the user they address, never answered.
pub(crate) fn route_numeric(state: &ServerState, msg: &Message) {
    let Some(target) = msg.param(0) else {
        return;
    };
    if state.registry.user(target).is_some() {
        state.registry.send_to(target, msg);
    }
}

/// Letters, digits and `[]\`_^{|}-`, not starting with a digit or `-`.
pub(crate) fn is_valid_nick(nick: &str) -> bool {
    const MAX_NICK: usize = 30;
    let special = |c: char| "[]\\`_^{|}".contains(c);
    let mut chars = nick.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    nick.len() <= MAX_NICK
        && (first.is_ascii_alphabetic() || special(first))
        && chars.all(|c| c.is_ascii_alphanumeric() || special(c) || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_syntax() {
        for ok in ["alice", "Bob_", "[away]", "x-1", "a"] {
            assert!(is_valid_nick(ok), "{ok}");
        }
        for bad in ["", "1abc", "-dash", "has space", "#chan", "a!b", "\u{e9}mile"] {
            assert!(!is_valid_nick(bad), "{bad}");
        }
        assert!(!is_valid_nick(&"a".repeat(31)));
    }
}

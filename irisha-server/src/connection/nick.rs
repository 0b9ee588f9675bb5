//! NICK: identity claim while pending, rename once registered, and remote
//! user introduction or rename when relayed by a peer.

use crate::error::{CommandError, Outcome};
use crate::irc::Message;
use crate::registry::{Handle, normalize};
use crate::s2s;
use crate::server::{Sender, ServerState};

use super::helpers::{is_valid_nick, notify_observers, relay_to_peers};
use super::registration::try_complete_registration;

pub(super) fn handle_nick(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let Some(requested) = msg.param(0).filter(|n| !n.is_empty()) else {
        return Err(CommandError::NoNicknameGiven);
    };
    match state.sender(handle) {
        Some(Sender::Pending) => claim(state, handle, requested),
        Some(Sender::User(current)) => rename_local(state, &current, requested),
        Some(Sender::Peer(_)) => {
            let known_user = msg
                .source_name()
                .and_then(|p| state.registry.user(p))
                .map(|c| c.name.clone());
            match known_user {
                Some(old) => rename_remote(state, handle, &old, requested),
                None => s2s::introduce_user(state, handle, msg),
            }
        }
        None => Ok(()),
    }
}

fn claim(state: &mut ServerState, handle: Handle, nick: &str) -> Outcome {
    if !is_valid_nick(nick) {
        return Err(CommandError::ErroneousNickname(nick.to_string()));
    }
    if state.registry.is_taken(nick) {
        return Err(CommandError::NicknameInUse(nick.to_string()));
    }
    if let Some(pending) = state.registry.pending_mut(handle) {
        pending.nick = Some(nick.to_string());
    }
    try_complete_registration(state, handle)
}

fn rename_local(state: &mut ServerState, current: &str, requested: &str) -> Outcome {
    if !is_valid_nick(requested) {
        return Err(CommandError::ErroneousNickname(requested.to_string()));
    }
    if current == requested {
        return Ok(());
    }
    if normalize(current) != normalize(requested) && state.registry.is_taken(requested) {
        return Err(CommandError::NicknameInUse(requested.to_string()));
    }

    let mask = super::helpers::hostmask(state, current);
    apply_rename(state, current, requested)
        .map_err(|_| CommandError::NicknameInUse(requested.to_string()))?;
    tracing::info!(old = %current, new = %requested, "Nick changed");

    let notice = Message::with_prefix(&mask, "NICK", vec![requested]);
    notify_observers(state, requested, &notice, true);
    let relay = Message::with_prefix(current, "NICK", vec![requested]);
    relay_to_peers(state, None, &relay);
    Ok(())
}

fn rename_remote(state: &mut ServerState, link: Handle, old: &str, requested: &str) -> Outcome {
    if normalize(old) != normalize(requested) && state.registry.is_taken(requested) {
        tracing::warn!(%link, %old, new = %requested, "Nick collision on relayed rename");
        return Err(CommandError::NickCollision(requested.to_string()));
    }
    let mask = super::helpers::hostmask(state, old);
    apply_rename(state, old, requested)
        .map_err(|_| CommandError::NickCollision(requested.to_string()))?;

    let notice = Message::with_prefix(&mask, "NICK", vec![requested]);
    notify_observers(state, requested, &notice, false);
    let relay = Message::with_prefix(old, "NICK", vec![requested]);
    relay_to_peers(state, Some(link), &relay);
    Ok(())
}

/// Registry rename plus the member entry in every joined channel.
fn apply_rename(state: &mut ServerState, old: &str, new: &str) -> Result<(), crate::registry::RegistryError> {
    state.registry.rename(old, new)?;
    let channels: Vec<String> = state
        .registry
        .user(new)
        .and_then(|c| c.user())
        .map(|u| u.channels.iter().cloned().collect())
        .unwrap_or_default();
    for name in channels {
        if let Some(channel) = state.channels.get_mut(&name) {
            channel.rename_member(old, new);
        }
    }
    Ok(())
}

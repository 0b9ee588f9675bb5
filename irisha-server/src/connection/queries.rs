//! Keepalive and server queries: PING, PONG, TIME, MOTD, VERSION.

use crate::error::{CommandError, Outcome};
use crate::irc::{self, Message};
use crate::registry::Handle;
use crate::server::{Sender, ServerState};

use super::helpers::reply;
use super::registration::send_motd;

/// Name used to address replies to whoever sent `msg` on `handle`.
fn requester(state: &ServerState, handle: Handle, msg: &Message) -> String {
    match state.sender(handle) {
        Some(Sender::User(nick)) => nick,
        Some(Sender::Peer(name)) => msg.source_name().unwrap_or(&name).to_string(),
        Some(Sender::Pending) | None => state
            .registry
            .pending(handle)
            .and_then(|p| p.nick.clone())
            .unwrap_or_else(|| "*".to_string()),
    }
}

/// Forward `msg` toward server `target`, keeping the original sender.
fn forward(state: &ServerState, handle: Handle, msg: &Message, target: &str) -> Outcome {
    let Some(next_hop) = state.registry.server(target).map(|c| c.next_hop()) else {
        return Err(CommandError::NoSuchServer(target.to_string()));
    };
    if next_hop == handle {
        // Would bounce straight back.
        return Ok(());
    }
    let mut relayed = msg.clone();
    relayed.prefix = Some(requester(state, handle, msg));
    state.registry.send(next_hop, &relayed);
    Ok(())
}

pub(super) fn handle_ping(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let Some(origin) = msg.param(0) else {
        return Err(CommandError::NoOrigin);
    };
    match msg.param(1) {
        Some(target) if !state.registry.is_own_name(target) => forward(state, handle, msg, target),
        _ => {
            let own = state.server_name().to_string();
            reply(state, handle, "PONG", vec![own.as_str(), origin]);
            Ok(())
        }
    }
}

/// Activity was already recorded on receipt; only relayed PONGs need work.
pub(super) fn handle_pong(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    if msg.params.is_empty() {
        return Err(CommandError::NoOrigin);
    }
    if let Some(target) = msg.param(1)
        && !state.registry.is_own_name(target)
        && let Some(next_hop) = state.registry.resolve_transport(target)
        && next_hop != handle
    {
        state.registry.send(next_hop, msg);
    }
    Ok(())
}

pub(super) fn handle_time(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    if let Some(target) = msg.param(0)
        && !state.registry.is_own_name(target)
    {
        return forward(state, handle, msg, target);
    }
    let nick = requester(state, handle, msg);
    let own = state.server_name().to_string();
    let now = chrono::Local::now().format("%A %B %d %Y -- %H:%M:%S %:z").to_string();
    reply(state, handle, irc::RPL_TIME, vec![nick.as_str(), &own, &now]);
    Ok(())
}

pub(super) fn handle_motd(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    if let Some(target) = msg.param(0)
        && !state.registry.is_own_name(target)
    {
        return forward(state, handle, msg, target);
    }
    let nick = requester(state, handle, msg);
    send_motd(state, handle, &nick);
    Ok(())
}

pub(super) fn handle_version(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    if let Some(target) = msg.param(0)
        && !state.registry.is_own_name(target)
    {
        return forward(state, handle, msg, target);
    }
    let nick = requester(state, handle, msg);
    let own = state.server_name().to_string();
    let version = concat!("irisha-", env!("CARGO_PKG_VERSION"), ".");
    reply(state, handle, irc::RPL_VERSION, vec![nick.as_str(), version, &own, "relay"]);
    Ok(())
}

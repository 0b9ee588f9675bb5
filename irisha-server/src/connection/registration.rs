//! Registration: PASS, USER and the SERVER handshake.
//!
//! State lives in the [`PendingRegistration`] keyed by handle, so lines may
//! arrive across any number of reads. NICK + USER promote to a local user;
//! SERVER promotes to a direct peer.

use std::collections::{BTreeSet, HashSet};

use crate::error::{CommandError, Outcome};
use crate::irc::{self, Message};
use crate::registry::{Connection, Handle, Kind, Route, ServerInfo, Stage, UserInfo};
use crate::s2s;
use crate::server::{Sender, ServerState};

use super::helpers::{relay_to_peers, reply};

pub(super) fn handle_pass(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let ok = match msg.param(0) {
        Some(supplied) => {
            msg.prefix.is_some() || state.password.as_deref().is_none_or(|pw| pw == supplied)
        }
        None => return Err(CommandError::NeedMoreParams("PASS".into())),
    };
    let Some(pending) = state.registry.pending_mut(handle) else {
        return Err(CommandError::AlreadyRegistered);
    };
    if pending.stage != Stage::AwaitingFirstLine {
        return Err(CommandError::AlreadyRegistered);
    }
    if !ok {
        tracing::warn!(%handle, "Password mismatch");
        return Err(CommandError::PasswordMismatch);
    }
    pending.stage = Stage::PasswordChecked;
    Ok(())
}

pub(super) fn handle_user(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let Some(pending) = state.registry.pending_mut(handle) else {
        return Err(CommandError::AlreadyRegistered);
    };
    if msg.params.len() < 4 {
        return Err(CommandError::NeedMoreParams("USER".into()));
    }
    if pending.user.is_some() {
        return Err(CommandError::AlreadyRegistered);
    }
    pending.user = Some((msg.params[0].clone(), msg.params[3].clone()));
    try_complete_registration(state, handle)
}

/// Promote once both NICK and USER have been seen.
pub(super) fn try_complete_registration(state: &mut ServerState, handle: Handle) -> Outcome {
    let Some(pending) = state.registry.pending(handle) else {
        return Ok(());
    };
    let (Some(nick), Some(_)) = (&pending.nick, &pending.user) else {
        return Ok(());
    };
    if state.password.is_some() && pending.stage != Stage::PasswordChecked {
        return Err(CommandError::PasswordMismatch);
    }
    if state.registry.is_taken(nick) {
        let nick = nick.clone();
        if let Some(pending) = state.registry.pending_mut(handle) {
            pending.nick = None;
        }
        return Err(CommandError::NicknameInUse(nick));
    }

    let Some(pending) = state.registry.take_pending(handle) else {
        return Ok(());
    };
    let (Some(nick), Some((username, realname))) = (pending.nick, pending.user) else {
        return Ok(());
    };
    let info = UserInfo {
        username,
        host: pending.host,
        realname,
        server: state.server_name().to_string(),
        modes: BTreeSet::new(),
        away: None,
        channels: HashSet::new(),
    };
    let introduction = s2s::user_introduction(&nick, 0, &info, 1);
    state
        .registry
        .register(Connection {
            name: nick.clone(),
            hopcount: 0,
            route: Route::Direct(pending.transport),
            kind: Kind::User(info),
        })
        .map_err(|_| CommandError::NicknameInUse(nick.clone()))?;

    tracing::info!(%handle, %nick, "Client registered");
    send_welcome(state, handle, &nick);
    relay_to_peers(state, None, &introduction);
    Ok(())
}

fn send_welcome(state: &ServerState, handle: Handle, nick: &str) {
    let server = state.server_name();
    let version = concat!("irisha-", env!("CARGO_PKG_VERSION"));
    let mask = super::helpers::hostmask(state, nick);
    let created = state.started.format("%Y-%m-%d %H:%M:%S UTC").to_string();

    reply(state, handle, irc::RPL_WELCOME, vec![
        nick,
        &format!("Welcome to the Internet Relay Network {mask}"),
    ]);
    reply(state, handle, irc::RPL_YOURHOST, vec![
        nick,
        &format!("Your host is {server}, running version {version}"),
    ]);
    reply(state, handle, irc::RPL_CREATED, vec![
        nick,
        &format!("This server was created {created}"),
    ]);
    reply(state, handle, irc::RPL_MYINFO, vec![nick, server, version, "iw", "bIiklo"]);
    send_motd(state, handle, nick);
}

/// The welcome text, one 372 per line, or 422 when there is none.
pub(crate) fn send_motd(state: &ServerState, handle: Handle, nick: &str) {
    let server = state.server_name();
    let welcome = state.settings.welcome.trim_end();
    if welcome.is_empty() {
        reply(state, handle, irc::ERR_NOMOTD, vec![nick, "MOTD File is missing"]);
        return;
    }
    reply(state, handle, irc::RPL_MOTDSTART, vec![
        nick,
        &format!("- {server} Message of the day - "),
    ]);
    for line in welcome.lines() {
        reply(state, handle, irc::RPL_MOTD, vec![nick, &format!("- {line}")]);
    }
    reply(state, handle, irc::RPL_ENDOFMOTD, vec![nick, "End of MOTD command"]);
}

pub(super) fn handle_server(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    match state.sender(handle) {
        Some(Sender::Pending) => register_link(state, handle, msg),
        Some(Sender::Peer(_)) => s2s::introduce_server(state, handle, msg),
        Some(Sender::User(_)) => Err(CommandError::AlreadyRegistered),
        None => Ok(()),
    }
}

/// `SERVER name hop :info` on a pending connection: a new direct link.
fn register_link(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    if msg.params.len() < 2 {
        return Err(CommandError::NeedMoreParams("SERVER".into()));
    }
    let name = msg.params[0].clone();
    let info = msg.params[msg.params.len() - 1].clone();

    let Some(pending) = state.registry.pending(handle) else {
        return Ok(());
    };
    // A link we dialed was authenticated by our own PASS.
    if !pending.outbound && state.password.is_some() && pending.stage != Stage::PasswordChecked {
        return Err(CommandError::PasswordMismatch);
    }
    if state.registry.is_taken(&name) {
        return Err(CommandError::LinkRejected(format!("ID \"{name}\" already registered")));
    }

    let Some(pending) = state.registry.take_pending(handle) else {
        return Ok(());
    };
    let token = state.registry.next_token();
    let own = state.server_name().to_string();
    state
        .registry
        .register(Connection {
            name: name.clone(),
            hopcount: 1,
            route: Route::Direct(pending.transport),
            kind: Kind::Server(ServerInfo {
                token,
                info: info.clone(),
                uplink: own.clone(),
            }),
        })
        .map_err(|e| CommandError::LinkRejected(e.to_string()))?;
    tracing::info!(%handle, server = %name, token, "Peer server linked");

    if !pending.outbound {
        if let Some(password) = &state.password {
            let pass = Message::from_server(&own, "PASS", vec![password.as_str()]);
            state.registry.send(handle, &pass);
        }
        let description = state.settings.description.clone();
        let server = Message::from_server(&own, "SERVER", vec![own.as_str(), "1", &description]);
        state.registry.send(handle, &server);
    }
    let ping = Message::from_server(&own, "PING", vec![own.as_str()]);
    state.registry.send(handle, &ping);

    s2s::send_burst(state, handle);
    let introduction = Message::from_server(&own, "SERVER", vec![
        name.as_str(),
        "1",
        &token.to_string(),
        &info,
    ]);
    relay_to_peers(state, Some(handle), &introduction);
    Ok(())
}

//! Server-to-server federation.
//!
//! Peers form a spanning tree. Every server and user learned from a peer is
//! registered locally, routed through the direct link it arrived on:
//!
//! ```text
//! :hub SERVER leaf.net 2 7 :Leaf server
//! :leaf.net NICK carol 1 carol host 1 +i :Carol
//! ```
//!
//! Hop counts grow by one per link crossed. Tokens are assigned locally by
//! [`crate::registry::Registry::next_token`]. When a link goes away, the
//! whole subtree behind it is dropped and the loss is announced with SQUIT.

use std::collections::HashSet;

use crate::error::{CommandError, Outcome};
use crate::irc::Message;
use crate::registry::{
    Connection, Handle, Kind, PendingRegistration, Route, ServerInfo, Transport, UserInfo,
    normalize,
};
use crate::connection::helpers::relay_to_peers;
use crate::server::{Sender, ServerState};

/// Dial-out handshake: our PASS and SERVER, then wait for theirs.
pub fn start_link(state: &mut ServerState, transport: Transport, host: &str, password: &str) {
    let own = state.server_name().to_string();
    let description = state.settings.description.clone();
    transport.send(&Message::new("PASS", vec![password]));
    transport.send(&Message::new("SERVER", vec![own.as_str(), "1", &description]));
    state
        .registry
        .insert_pending(PendingRegistration::outbound(transport, host.to_string()));
}

/// `:server NICK nick hop user host token +modes :realname`
pub(crate) fn user_introduction(nick: &str, hopcount: u32, info: &UserInfo, token: u32) -> Message {
    Message::with_prefix(&info.server, "NICK", vec![
        nick,
        &hopcount.to_string(),
        &info.username,
        &info.host,
        &token.to_string(),
        &info.mode_string(),
        &info.realname,
    ])
}

/// `:uplink SERVER name hop token :info`
fn server_introduction(conn: &Connection, info: &ServerInfo) -> Message {
    Message::with_prefix(&info.uplink, "SERVER", vec![
        conn.name.as_str(),
        &conn.hopcount.to_string(),
        &info.token.to_string(),
        &info.info,
    ])
}

/// Everything this side knows, for a freshly linked peer.
pub(crate) fn send_burst(state: &ServerState, link: Handle) {
    let mut servers: Vec<&Connection> = state
        .registry
        .connections()
        .filter(|c| c.server().is_some() && c.next_hop() != link)
        .collect();
    // Uplinks before the servers they introduced.
    servers.sort_by_key(|c| c.hopcount);
    for conn in servers {
        if let Some(info) = conn.server() {
            state.registry.send(link, &server_introduction(conn, info));
        }
    }

    let own_token = 1;
    for conn in state.registry.connections() {
        let Some(info) = conn.user() else {
            continue;
        };
        if conn.next_hop() == link && !conn.is_direct() {
            continue;
        }
        let token = state
            .registry
            .server(&info.server)
            .and_then(|s| s.server())
            .map_or(own_token, |s| s.token);
        state
            .registry
            .send(link, &user_introduction(&conn.name, conn.hopcount, info, token));
        if let Some(away) = &info.away {
            state
                .registry
                .send(link, &Message::with_prefix(&conn.name, "AWAY", vec![away.as_str()]));
        }
    }

    let own = state.server_name();
    for channel in state.channels.iter() {
        for member in channel.members() {
            let behind_link = state
                .registry
                .find_by_name(member)
                .is_some_and(|c| !c.is_direct() && c.next_hop() == link);
            if !behind_link {
                state
                    .registry
                    .send(link, &Message::with_prefix(member, "JOIN", vec![channel.name.as_str()]));
            }
        }

        let mut flags = channel.mode_string();
        for op in channel.operators() {
            flags[0].push('o');
            flags.push(op.to_string());
        }
        if flags.len() > 1 || flags[0].len() > 1 {
            let mut params = vec![channel.name.as_str()];
            params.extend(flags.iter().map(String::as_str));
            state.registry.send(link, &Message::with_prefix(own, "MODE", params));
        }
        if let Some(topic) = &channel.topic {
            let line = Message::with_prefix(own, "TOPIC", vec![channel.name.as_str(), &topic.text]);
            state.registry.send(link, &line);
        }
    }
}

/// The sender's hop count plus the link it crossed, `None` when unusable.
fn relayed_hopcount(param: &str) -> Option<u32> {
    param.parse::<u32>().ok()?.checked_add(1)
}

/// Relayed `SERVER name hop [token] :info` on an established link.
pub(crate) fn introduce_server(state: &mut ServerState, link: Handle, msg: &Message) -> Outcome {
    if msg.params.len() < 3 {
        return Err(CommandError::NeedMoreParams("SERVER".into()));
    }
    let name = msg.params[0].clone();
    let Some(hopcount) = relayed_hopcount(&msg.params[1]) else {
        return Err(CommandError::NeedMoreParams("SERVER".into()));
    };
    let info = msg.params[msg.params.len() - 1].clone();
    let link_name = state.registry.find_by_handle(link).map(|c| c.name.clone()).unwrap_or_default();
    let uplink = msg
        .source_name()
        .filter(|p| state.registry.server(p).is_some())
        .map_or(link_name, str::to_string);

    if state.registry.is_taken(&name) {
        tracing::warn!(%link, server = %name, "Relayed server name already registered");
        let error = Message::new("ERROR", vec![format!("Server {name} already exists").as_str()]);
        state.registry.send(link, &error);
        return Ok(());
    }

    let token = state.registry.next_token();
    let conn = Connection {
        name: name.clone(),
        hopcount,
        route: Route::Via(link),
        kind: Kind::Server(ServerInfo {
            token,
            info,
            uplink,
        }),
    };
    let relay = conn.server().map(|info| server_introduction(&conn, info));
    state
        .registry
        .register(conn)
        .map_err(|e| CommandError::LinkRejected(e.to_string()))?;
    tracing::info!(%link, server = %name, hops = hopcount, token, "Server introduced");

    if let Some(relay) = relay {
        relay_to_peers(state, Some(link), &relay);
    }
    Ok(())
}

/// Relayed `NICK nick hop user host token +modes :realname`.
pub(crate) fn introduce_user(state: &mut ServerState, link: Handle, msg: &Message) -> Outcome {
    if msg.params.len() < 7 {
        return Err(CommandError::NeedMoreParams("NICK".into()));
    }
    let nick = msg.params[0].clone();
    let Some(hopcount) = relayed_hopcount(&msg.params[1]) else {
        return Err(CommandError::NeedMoreParams("NICK".into()));
    };
    if state.registry.is_taken(&nick) {
        tracing::warn!(%link, %nick, "Nick collision on introduction");
        return Err(CommandError::NickCollision(nick));
    }

    let link_name = state.registry.find_by_handle(link).map(|c| c.name.clone()).unwrap_or_default();
    let server = msg
        .source_name()
        .filter(|p| state.registry.server(p).is_some())
        .map_or(link_name, str::to_string);
    let token = msg.params[4].parse::<u32>().unwrap_or(0);
    let info = UserInfo {
        username: msg.params[2].clone(),
        host: msg.params[3].clone(),
        realname: msg.params[6].clone(),
        server,
        modes: msg.params[5].chars().filter(|c| c.is_ascii_alphabetic()).collect(),
        away: None,
        channels: HashSet::new(),
    };
    let relay = user_introduction(&nick, hopcount, &info, token);
    state
        .registry
        .register(Connection {
            name: nick.clone(),
            hopcount,
            route: Route::Via(link),
            kind: Kind::User(info),
        })
        .map_err(|_| CommandError::NickCollision(nick.clone()))?;
    tracing::debug!(%link, %nick, "Remote user introduced");

    relay_to_peers(state, Some(link), &relay);
    Ok(())
}

/// QUIT relayed from a peer for one of its users.
pub(crate) fn remote_quit(state: &mut ServerState, link: Handle, nick: &str, reason: &str) {
    let Some(conn) = state.registry.user(nick) else {
        return;
    };
    if conn.is_direct() {
        // Peers cannot end local users.
        tracing::warn!(%link, %nick, "Peer sent QUIT for a local user");
        return;
    }
    let name = conn.name.clone();
    let Some(conn) = state.registry.unregister(&name) else {
        return;
    };
    if let Kind::User(info) = &conn.kind {
        let quit = Message::with_prefix(&conn.hostmask(), "QUIT", vec![reason]);
        state.remove_from_channels(&conn.name, info, &quit);
    }
    relay_to_peers(state, Some(link), &Message::with_prefix(&name, "QUIT", vec![reason]));
}

pub(crate) fn handle_squit(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let Some(Sender::Peer(link_name)) = state.sender(handle) else {
        return Err(CommandError::NoPrivileges);
    };
    let Some(target) = msg.param(0) else {
        return Err(CommandError::NeedMoreParams("SQUIT".into()));
    };
    let reason = msg.param(1).unwrap_or(link_name.as_str()).to_string();

    // The peer is closing our link.
    if state.registry.is_own_name(target) || normalize(target) == normalize(&link_name) {
        state.disconnect(handle, &reason);
        return Ok(());
    }

    let Some(server) = state.registry.server(target) else {
        return Err(CommandError::NoSuchServer(target.to_string()));
    };
    if server.next_hop() != handle {
        // Only the side facing the server may remove it.
        return Ok(());
    }
    let name = server.name.clone();
    let quit_reason = format!("{} {}", link_name, name);
    let subtree = state.registry.subtree(&name);
    remove_names(state, subtree, &quit_reason);
    tracing::info!(%handle, server = %name, %reason, "Server split off");

    let relay = Message::with_prefix(&link_name, "SQUIT", vec![name.as_str(), &reason]);
    relay_to_peers(state, Some(handle), &relay);
    Ok(())
}

/// A direct link is gone: drop everything behind it and tell the rest of
/// the network. The link's own entry is already unregistered.
pub(crate) fn prune_link(state: &mut ServerState, link: Handle, name: &str, reason: &str) {
    let quit_reason = format!("{} {}", state.server_name(), name);
    let behind = state.registry.behind(link);
    tracing::info!(%link, server = %name, dropped = behind.len(), "Pruning link");
    remove_names(state, behind, &quit_reason);

    let own = state.server_name().to_string();
    let squit = Message::with_prefix(&own, "SQUIT", vec![name, reason]);
    relay_to_peers(state, Some(link), &squit);
}

/// Unregister every name given, showing users' departures locally.
fn remove_names(state: &mut ServerState, names: Vec<String>, quit_reason: &str) {
    let mut departed = 0;
    for name in names {
        let Some(conn) = state.registry.unregister(&name) else {
            continue;
        };
        if let Kind::User(info) = &conn.kind {
            let quit = Message::with_prefix(&conn.hostmask(), "QUIT", vec![quit_reason]);
            state.remove_from_channels(&conn.name, info, &quit);
            departed += 1;
        }
        if let Route::Direct(transport) = conn.route {
            transport.close();
        }
    }
    if departed > 0 {
        tracing::debug!(count = departed, "Remote users split off");
    }
}

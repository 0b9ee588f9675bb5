//! PRIVMSG, NOTICE and AWAY.

use crate::channels::is_channel_name;
use crate::error::{CommandError, Outcome};
use crate::irc::{self, Message};
use crate::registry::Handle;
use crate::server::ServerState;

use super::helpers::{Actor, actor, hostmask, relay_to_peers, reply, send_error, send_to_channel};

pub(super) fn handle_privmsg(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    deliver(state, handle, msg, "PRIVMSG")
}

/// NOTICE never produces error replies.
pub(super) fn handle_notice(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let _ = deliver(state, handle, msg, "NOTICE");
    Ok(())
}

fn deliver(state: &mut ServerState, handle: Handle, msg: &Message, command: &str) -> Outcome {
    let actor = actor(state, handle, msg)?;
    let Some(targets) = msg.param(0).filter(|t| !t.is_empty()) else {
        return Err(CommandError::NoRecipient(command.to_string()));
    };
    let Some(text) = msg.param(1).filter(|t| !t.is_empty()) else {
        return Err(CommandError::NoTextToSend);
    };
    let notice = command == "NOTICE";

    for target in targets.split(',') {
        let result = if is_channel_name(target) {
            to_channel(state, &actor, command, target, text)
        } else {
            to_user(state, handle, &actor, command, target, text)
        };
        if let Err(err) = result
            && actor.is_local()
            && !notice
        {
            send_error(state, handle, &actor.nick, &err);
        }
    }
    Ok(())
}

fn to_channel(state: &ServerState, actor: &Actor, command: &str, target: &str, text: &str) -> Outcome {
    let Some(channel) = state.channels.get(target) else {
        return Err(CommandError::NoSuchChannel(target.to_string()));
    };
    // Servers relay for their own members; local senders must have joined.
    if actor.is_local() && !channel.is_member(&actor.nick) {
        return Err(CommandError::CannotSendToChan(channel.name.clone()));
    }
    let display = channel.name.as_str();

    let mask = hostmask(state, &actor.nick);
    let local = Message::with_prefix(&mask, command, vec![display, text]);
    send_to_channel(state, display, &local, Some(&actor.nick));
    let relay = Message::with_prefix(&actor.nick, command, vec![display, text]);
    relay_to_peers(state, actor.link, &relay);
    Ok(())
}

fn to_user(
    state: &ServerState,
    handle: Handle,
    actor: &Actor,
    command: &str,
    target: &str,
    text: &str,
) -> Outcome {
    let Some(conn) = state.registry.user(target) else {
        return Err(CommandError::NoSuchNick(target.to_string()));
    };
    let Some(info) = conn.user() else {
        return Err(CommandError::NoSuchNick(target.to_string()));
    };

    if conn.is_direct() {
        let mask = hostmask(state, &actor.nick);
        let line = Message::with_prefix(&mask, command, vec![conn.name.as_str(), text]);
        state.registry.send(conn.next_hop(), &line);
    } else if Some(conn.next_hop()) != actor.link {
        let line = Message::with_prefix(&actor.nick, command, vec![conn.name.as_str(), text]);
        state.registry.send(conn.next_hop(), &line);
    }

    if command == "PRIVMSG"
        && actor.is_local()
        && let Some(away) = &info.away
    {
        reply(state, handle, irc::RPL_AWAY, vec![actor.nick.as_str(), &conn.name, away]);
    }
    Ok(())
}

pub(super) fn handle_away(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let actor = actor(state, handle, msg)?;
    let text = msg.param(0).filter(|t| !t.is_empty());
    if let Some(info) = state
        .registry
        .find_by_name_mut(&actor.nick)
        .and_then(|c| c.user_mut())
    {
        info.away = text.map(str::to_string);
    }

    if actor.is_local() {
        match text {
            Some(_) => reply(state, handle, irc::RPL_NOWAWAY, vec![
                actor.nick.as_str(),
                "You have been marked as being away",
            ]),
            None => reply(state, handle, irc::RPL_UNAWAY, vec![
                actor.nick.as_str(),
                "You are no longer marked as being away",
            ]),
        }
    }
    let relay = Message::with_prefix(&actor.nick, "AWAY", text.into_iter().collect());
    relay_to_peers(state, actor.link, &relay);
    Ok(())
}

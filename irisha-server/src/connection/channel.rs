//! Channel commands: JOIN, PART, MODE, TOPIC, INVITE, NAMES.
//!
//! Local actors go through membership, operator and admission checks. Lines
//! relayed by a peer were already checked on the originating server and are
//! applied as they come.

use crate::channels::{Topic, is_channel_name};
use crate::error::{CommandError, Outcome};
use crate::irc::{self, Message};
use crate::registry::Handle;
use crate::server::ServerState;

use super::helpers::{
    Actor, actor, hostmask, relay_to_peers, reply, send_error, send_local, send_to_channel,
};

pub(super) fn handle_join(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let actor = actor(state, handle, msg)?;
    let Some(targets) = msg.param(0) else {
        return Err(CommandError::NeedMoreParams("JOIN".into()));
    };

    if targets == "0" {
        let joined: Vec<String> = state
            .registry
            .user(&actor.nick)
            .and_then(|c| c.user())
            .map(|u| u.channels.iter().cloned().collect())
            .unwrap_or_default();
        for name in joined {
            let display = state.channels.get(&name).map(|c| c.name.clone()).unwrap_or(name);
            part_one(state, &actor, &display, &actor.nick);
        }
        return Ok(());
    }

    // Keys pair with channels by position; each channel uses up one slot.
    let mut keys = msg.param(1).map(|k| k.split(',')).into_iter().flatten();
    for name in targets.split(',') {
        let key = keys.next().filter(|k| !k.is_empty());
        if !is_channel_name(name) {
            if actor.is_local() {
                send_error(state, handle, &actor.nick, &CommandError::NoSuchChannel(name.to_string()));
            }
            continue;
        }
        if let Err(err) = join_one(state, &actor, name, key)
            && actor.is_local()
        {
            send_error(state, handle, &actor.nick, &err);
        }
    }
    Ok(())
}

fn join_one(state: &mut ServerState, actor: &Actor, name: &str, key: Option<&str>) -> Outcome {
    if actor.is_server {
        return Err(CommandError::NoSuchNick(actor.nick.clone()));
    }
    let nick = actor.nick.as_str();
    let mask = hostmask(state, nick);

    let created = match state.channels.get(name) {
        Some(channel) => {
            if channel.is_member(nick) {
                return Ok(());
            }
            if actor.is_local() {
                channel.admit(nick, &mask, key)?;
            }
            false
        }
        None => true,
    };

    state.join_channel(nick, name);
    let Some(channel) = state.channels.get_mut(name) else {
        return Ok(());
    };
    // Remote creators get their operator status from the relayed MODE.
    if created && actor.is_local() {
        channel.set_operator(nick, true);
        channel.key = key.map(str::to_string);
    }
    let chan_name = channel.name.clone();
    tracing::debug!(%nick, channel = %chan_name, created, "Joined channel");

    let join = Message::with_prefix(&mask, "JOIN", vec![chan_name.as_str()]);
    send_to_channel(state, &chan_name, &join, None);
    if actor.is_local() {
        send_topic(state, nick, &chan_name);
        send_names(state, nick, &chan_name);
    }

    let relay = Message::with_prefix(nick, "JOIN", vec![chan_name.as_str()]);
    relay_to_peers(state, actor.link, &relay);
    if created && actor.is_local() {
        let own = state.server_name().to_string();
        let params = match key {
            Some(key) => vec![chan_name.as_str(), "+ok", nick, key],
            None => vec![chan_name.as_str(), "+o", nick],
        };
        relay_to_peers(state, None, &Message::from_server(&own, "MODE", params));
    }
    Ok(())
}

fn send_topic(state: &ServerState, nick: &str, channel: &str) {
    let Some(handle) = state.registry.resolve_transport(nick) else {
        return;
    };
    let Some(chan) = state.channels.get(channel) else {
        return;
    };
    match &chan.topic {
        Some(topic) => reply(state, handle, irc::RPL_TOPIC, vec![nick, &chan.name, &topic.text]),
        None => reply(state, handle, irc::RPL_NOTOPIC, vec![nick, &chan.name, "No topic is set"]),
    }
}

fn send_names(state: &ServerState, nick: &str, channel: &str) {
    let Some(handle) = state.registry.resolve_transport(nick) else {
        return;
    };
    if let Some(chan) = state.channels.get(channel) {
        let names = chan.names().join(" ");
        reply(state, handle, irc::RPL_NAMREPLY, vec![nick, "=", &chan.name, &names]);
    }
    reply(state, handle, irc::RPL_ENDOFNAMES, vec![nick, channel, "End of NAMES list"]);
}

pub(super) fn handle_part(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let actor = actor(state, handle, msg)?;
    let Some(targets) = msg.param(0) else {
        return Err(CommandError::NeedMoreParams("PART".into()));
    };
    let reason = msg.param(1).unwrap_or(actor.nick.as_str()).to_string();

    for name in targets.split(',') {
        let Some(channel) = state.channels.get(name) else {
            if actor.is_local() {
                send_error(state, handle, &actor.nick, &CommandError::NoSuchChannel(name.to_string()));
            }
            continue;
        };
        if !channel.is_member(&actor.nick) {
            if actor.is_local() {
                send_error(state, handle, &actor.nick, &CommandError::NotOnChannel(name.to_string()));
            }
            continue;
        }
        let display = channel.name.clone();
        part_one(state, &actor, &display, &reason);
    }
    Ok(())
}

/// Announce and apply one departure. The caller checked membership.
fn part_one(state: &mut ServerState, actor: &Actor, channel: &str, reason: &str) {
    let mask = hostmask(state, &actor.nick);
    let part = Message::with_prefix(&mask, "PART", vec![channel, reason]);
    send_to_channel(state, channel, &part, None);
    state.leave_channel(&actor.nick, channel);

    let relay = Message::with_prefix(&actor.nick, "PART", vec![channel, reason]);
    relay_to_peers(state, actor.link, &relay);
}

pub(super) fn handle_mode(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let actor = actor(state, handle, msg)?;
    let Some(target) = msg.param(0) else {
        return Err(CommandError::NeedMoreParams("MODE".into()));
    };
    if is_channel_name(target) {
        channel_mode(state, handle, &actor, msg)
    } else {
        user_mode(state, handle, &actor, msg)
    }
}

/// One applied mode change, echoed to members and peers.
struct ModeChange {
    adding: bool,
    flag: char,
    arg: Option<String>,
}

fn channel_mode(state: &mut ServerState, handle: Handle, actor: &Actor, msg: &Message) -> Outcome {
    let target = msg.param(0).unwrap_or_default();
    let Some(channel) = state.channels.get(target) else {
        return Err(CommandError::NoSuchChannel(target.to_string()));
    };
    let display = channel.name.clone();

    let Some(modes) = msg.param(1) else {
        let mut params = vec![actor.nick.clone(), display];
        params.extend(channel.mode_string());
        reply(state, handle, irc::RPL_CHANNELMODEIS, params.iter().map(String::as_str).collect());
        return Ok(());
    };

    // Bare list queries are open to everyone.
    let listing = modes.trim_start_matches('+');
    if msg.params.len() == 2 && (listing == "b" || listing == "I") {
        if actor.is_local() {
            send_list(state, handle, &actor.nick, &display, listing == "b");
        }
        return Ok(());
    }

    if actor.is_local() && !channel.is_operator(&actor.nick) {
        return Err(CommandError::ChanOpPrivsNeeded(display));
    }

    let mut args = msg.params.iter().skip(2).map(String::as_str);
    let mut changes = Vec::new();
    let mut adding = true;
    for flag in modes.chars() {
        match flag {
            '+' => adding = true,
            '-' => adding = false,
            'i' | 'k' | 'l' | 'b' | 'I' | 'o' => {
                match apply_channel_mode(state, &display, actor, adding, flag, &mut args) {
                    Ok(Some(change)) => changes.push(change),
                    Ok(None) => {}
                    Err(err) if actor.is_local() => send_error(state, handle, &actor.nick, &err),
                    Err(_) => {}
                }
            }
            unknown => {
                if actor.is_local() {
                    send_error(state, handle, &actor.nick, &CommandError::UnknownMode(unknown));
                }
            }
        }
    }
    if changes.is_empty() {
        return Ok(());
    }

    let (flags, change_args) = render_changes(&changes);
    let mut params = vec![display.as_str(), flags.as_str()];
    params.extend(change_args.iter().map(String::as_str));

    let mask = hostmask(state, &actor.nick);
    let echo = Message::with_prefix(&mask, "MODE", params.clone());
    send_to_channel(state, &display, &echo, None);
    let relay = Message::with_prefix(&actor.nick, "MODE", params);
    relay_to_peers(state, actor.link, &relay);
    Ok(())
}

/// Apply one flag through the channel's own mutators. `Ok(None)` means
/// nothing changed.
fn apply_channel_mode<'a>(
    state: &mut ServerState,
    channel: &str,
    actor: &Actor,
    adding: bool,
    flag: char,
    args: &mut impl Iterator<Item = &'a str>,
) -> Result<Option<ModeChange>, CommandError> {
    let needs_arg = match flag {
        'k' | 'l' => adding,
        'b' | 'I' | 'o' => true,
        _ => false,
    };
    let arg = if needs_arg {
        Some(args.next().ok_or_else(|| CommandError::NeedMoreParams("MODE".into()))?)
    } else {
        None
    };
    if flag == 'o'
        && let Some(nick) = arg
        && state.registry.user(nick).is_none()
    {
        return Err(CommandError::NoSuchNick(nick.to_string()));
    }

    let Some(chan) = state.channels.get_mut(channel) else {
        return Ok(None);
    };
    let changed = match (flag, arg) {
        ('i', _) => {
            let changed = chan.invite_only != adding;
            chan.invite_only = adding;
            changed
        }
        ('k', Some(key)) => {
            if chan.key.is_some() && actor.is_local() {
                return Err(CommandError::KeySet(chan.name.clone()));
            }
            chan.key = Some(key.to_string());
            true
        }
        ('k', None) => chan.key.take().is_some(),
        ('l', Some(limit)) => match limit.parse::<usize>() {
            Ok(limit) if limit > 0 => {
                chan.limit = Some(limit);
                true
            }
            _ => false,
        },
        ('l', None) => chan.limit.take().is_some(),
        ('b', Some(mask)) if adding => chan.add_ban(mask, &actor.nick),
        ('b', Some(mask)) => chan.remove_ban(mask),
        ('I', Some(nick)) if adding => chan.add_invite(nick),
        ('I', Some(nick)) => chan.remove_invite(nick),
        ('o', Some(nick)) => {
            if !chan.is_member(nick) {
                return Err(CommandError::UserNotInChannel(nick.to_string(), chan.name.clone()));
            }
            chan.set_operator(nick, adding)
        }
        _ => false,
    };

    Ok(changed.then(|| ModeChange {
        adding,
        flag,
        arg: arg.map(str::to_string),
    }))
}

/// `+ik-l` plus the arguments in order.
fn render_changes(changes: &[ModeChange]) -> (String, Vec<String>) {
    let mut flags = String::new();
    let mut args = Vec::new();
    let mut sign = None;
    for change in changes {
        if sign != Some(change.adding) {
            flags.push(if change.adding { '+' } else { '-' });
            sign = Some(change.adding);
        }
        flags.push(change.flag);
        if let Some(arg) = &change.arg {
            args.push(arg.clone());
        }
    }
    (flags, args)
}

fn send_list(state: &ServerState, handle: Handle, nick: &str, channel: &str, bans: bool) {
    let Some(chan) = state.channels.get(channel) else {
        return;
    };
    if bans {
        for ban in &chan.bans {
            reply(state, handle, irc::RPL_BANLIST, vec![nick, &chan.name, &ban.mask, &ban.set_by]);
        }
        reply(state, handle, irc::RPL_ENDOFBANLIST, vec![nick, &chan.name, "End of channel ban list"]);
    } else {
        for invited in chan.invites() {
            reply(state, handle, irc::RPL_INVITELIST, vec![nick, &chan.name, invited]);
        }
        reply(state, handle, irc::RPL_ENDOFINVITELIST, vec![nick, &chan.name, "End of channel invite list"]);
    }
}

fn user_mode(state: &mut ServerState, handle: Handle, actor: &Actor, msg: &Message) -> Outcome {
    let target = msg.param(0).unwrap_or_default();
    let Some(user) = state.registry.user(target) else {
        return Err(CommandError::NoSuchNick(target.to_string()));
    };
    if user.name.to_lowercase() != actor.nick.to_lowercase() {
        return Err(CommandError::UsersDontMatch);
    }

    let Some(modes) = msg.param(1) else {
        let current = user.user().map(|u| u.mode_string()).unwrap_or_default();
        reply(state, handle, irc::RPL_UMODEIS, vec![actor.nick.as_str(), &current]);
        return Ok(());
    };

    let mut changes = Vec::new();
    let mut unknown = false;
    let mut adding = true;
    if let Some(info) = state
        .registry
        .find_by_name_mut(target)
        .and_then(|c| c.user_mut())
    {
        for flag in modes.chars() {
            match flag {
                '+' => adding = true,
                '-' => adding = false,
                'i' | 'w' => {
                    let changed = if adding {
                        info.modes.insert(flag)
                    } else {
                        info.modes.remove(&flag)
                    };
                    if changed {
                        changes.push(ModeChange { adding, flag, arg: None });
                    }
                }
                _ => unknown = true,
            }
        }
    }
    if unknown && actor.is_local() {
        send_error(state, handle, &actor.nick, &CommandError::UmodeUnknownFlag);
    }
    if changes.is_empty() {
        return Ok(());
    }

    let (flags, _) = render_changes(&changes);
    let echo = Message::with_prefix(&actor.nick, "MODE", vec![actor.nick.as_str(), &flags]);
    send_local(state, &actor.nick, &echo);
    relay_to_peers(state, actor.link, &echo);
    Ok(())
}

pub(super) fn handle_topic(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let actor = actor(state, handle, msg)?;
    let Some(target) = msg.param(0) else {
        return Err(CommandError::NeedMoreParams("TOPIC".into()));
    };
    let Some(channel) = state.channels.get(target) else {
        return Err(CommandError::NoSuchChannel(target.to_string()));
    };
    let display = channel.name.clone();

    let Some(text) = msg.param(1) else {
        if actor.is_local() {
            send_topic(state, &actor.nick, &display);
        }
        return Ok(());
    };
    if actor.is_local() && !channel.is_member(&actor.nick) {
        return Err(CommandError::NotOnChannel(display));
    }

    if let Some(chan) = state.channels.get_mut(&display) {
        chan.topic = (!text.is_empty()).then(|| Topic {
            text: text.to_string(),
            set_by: actor.nick.clone(),
        });
    }
    let mask = hostmask(state, &actor.nick);
    let echo = Message::with_prefix(&mask, "TOPIC", vec![display.as_str(), text]);
    send_to_channel(state, &display, &echo, None);
    let relay = Message::with_prefix(&actor.nick, "TOPIC", vec![display.as_str(), text]);
    relay_to_peers(state, actor.link, &relay);
    Ok(())
}

pub(super) fn handle_invite(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let actor = actor(state, handle, msg)?;
    let (Some(target), Some(channel_name)) = (msg.param(0), msg.param(1)) else {
        return Err(CommandError::NeedMoreParams("INVITE".into()));
    };
    let Some(target_nick) = state.registry.user(target).map(|c| c.name.clone()) else {
        return Err(CommandError::NoSuchNick(target.to_string()));
    };
    let Some(channel) = state.channels.get(channel_name) else {
        return Err(CommandError::NoSuchChannel(channel_name.to_string()));
    };
    let display = channel.name.clone();

    if actor.is_local() {
        if !channel.is_member(&actor.nick) {
            return Err(CommandError::NotOnChannel(display));
        }
        if channel.is_member(&target_nick) {
            return Err(CommandError::UserOnChannel(target_nick, display));
        }
        if channel.invite_only && !channel.is_operator(&actor.nick) {
            return Err(CommandError::ChanOpPrivsNeeded(display));
        }
    }

    if let Some(chan) = state.channels.get_mut(&display) {
        chan.add_invite(&target_nick);
    }
    if actor.is_local() {
        reply(state, handle, irc::RPL_INVITING, vec![actor.nick.as_str(), &target_nick, &display]);
    }

    // Peers record the invite too so the target's own server admits it.
    let mask = hostmask(state, &actor.nick);
    let notice = Message::with_prefix(&mask, "INVITE", vec![target_nick.as_str(), display.as_str()]);
    send_local(state, &target_nick, &notice);
    let relay = Message::with_prefix(&actor.nick, "INVITE", vec![target_nick.as_str(), display.as_str()]);
    relay_to_peers(state, actor.link, &relay);
    Ok(())
}

pub(super) fn handle_names(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let actor = actor(state, handle, msg)?;
    if !actor.is_local() {
        return Ok(());
    }
    match msg.param(0) {
        Some(targets) => {
            for name in targets.split(',') {
                send_names(state, &actor.nick, name);
            }
        }
        None => reply(state, handle, irc::RPL_ENDOFNAMES, vec![actor.nick.as_str(), "*", "End of NAMES list"]),
    }
    Ok(())
}

//! Per-socket I/O tasks and command dispatch.
//!
//! Sockets are served by a reader task and a writer task that only move
//! bytes. Parsed lines come back here through [`dispatch`], which runs on
//! the state owner. Handlers are split into submodules:
//! - [`registration`]: PASS, USER, SERVER handshake, welcome burst
//! - [`nick`]: NICK for pending, local and relayed senders
//! - [`channel`]: JOIN, PART, MODE, TOPIC, INVITE, NAMES
//! - [`messaging`]: PRIVMSG, NOTICE, AWAY
//! - [`queries`]: PING, PONG, TIME, MOTD, VERSION
//! - [`helpers`]: reply and fan-out utilities

mod channel;
pub mod helpers;
mod messaging;
mod nick;
mod queries;
mod registration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::codec::MAX_LINE;
use crate::error::{CommandError, Outcome};
use crate::irc::Message;
use crate::registry::{Handle, Stage, Transport, normalize};
use crate::s2s;
use crate::server::{Event, Sender, ServerState};

/// Lines queued toward one socket before it counts as stuck.
const OUTBOUND_QUEUE: usize = 4096;

/// Spawn reader and writer tasks for `stream`.
pub fn spawn(stream: TcpStream, handle: Handle, events: mpsc::Sender<Event>) -> Transport {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    let write_events = events.clone();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                tracing::warn!(%handle, "Write error: {e}");
                let reason = format!("Write error: {e}");
                let _ = write_events.send(Event::Closed { handle, reason }).await;
                return;
            }
            // Drain whatever else is queued, then flush once.
            let mut batch_count = 0;
            while let Ok(queued) = rx.try_recv() {
                if let Err(e) = writer.write_all(queued.as_bytes()).await {
                    tracing::warn!(%handle, "Write error: {e}");
                    let reason = format!("Write error: {e}");
                    let _ = write_events.send(Event::Closed { handle, reason }).await;
                    return;
                }
                batch_count += 1;
                if batch_count >= 64 {
                    break;
                }
            }
            if let Err(e) = writer.flush().await {
                tracing::warn!(%handle, "Flush error: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader_task = tokio::spawn(async move {
        let mut buf = [0u8; MAX_LINE];
        loop {
            let event = match reader.read(&mut buf).await {
                Ok(0) => Event::Closed {
                    handle,
                    reason: "Connection closed".to_string(),
                },
                Ok(n) => Event::Received {
                    handle,
                    bytes: buf[..n].to_vec(),
                },
                Err(e) => Event::Closed {
                    handle,
                    reason: format!("Read error: {e}"),
                },
            };
            let closed = matches!(event, Event::Closed { .. });
            if events.send(event).await.is_err() || closed {
                break;
            }
        }
    });

    Transport::new(handle, tx).with_reader(reader_task.abort_handle())
}

type Handler = fn(&mut ServerState, Handle, &Message) -> Outcome;

const COMMANDS: &[(&str, Handler)] = &[
    ("PASS", registration::handle_pass),
    ("NICK", nick::handle_nick),
    ("USER", registration::handle_user),
    ("SERVER", registration::handle_server),
    ("PING", queries::handle_ping),
    ("PONG", queries::handle_pong),
    ("QUIT", handle_quit),
    ("SQUIT", s2s::handle_squit),
    ("ERROR", handle_error),
    ("JOIN", channel::handle_join),
    ("PART", channel::handle_part),
    ("MODE", channel::handle_mode),
    ("TOPIC", channel::handle_topic),
    ("INVITE", channel::handle_invite),
    ("NAMES", channel::handle_names),
    ("PRIVMSG", messaging::handle_privmsg),
    ("NOTICE", messaging::handle_notice),
    ("AWAY", messaging::handle_away),
    ("TIME", queries::handle_time),
    ("MOTD", queries::handle_motd),
    ("VERSION", queries::handle_version),
];

/// Usable before registration completes.
const REGISTRATION_COMMANDS: &[&str] = &["PASS", "NICK", "USER", "SERVER", "PING", "PONG", "QUIT", "ERROR"];

/// Run one parsed line from `handle`.
pub fn dispatch(state: &mut ServerState, handle: Handle, mut msg: Message) {
    let Some(sender) = state.sender(handle) else {
        return;
    };
    msg.command.make_ascii_uppercase();

    match check_prefix(state, handle, &sender, &msg) {
        Ok(true) => {}
        Ok(false) => return,
        Err(err) => return report(state, handle, &sender, &msg, err),
    }

    if sender == Sender::Pending
        && let Some(pending) = state.registry.pending_mut(handle)
        && pending.stage == Stage::AwaitingFirstLine
        && msg.command != "PASS"
    {
        pending.stage = Stage::Unauthenticated;
    }

    if matches!(sender, Sender::Peer(_)) && is_numeric(&msg.command) {
        return helpers::route_numeric(state, &msg);
    }

    let Some(&(_, handler)) = COMMANDS.iter().find(|(name, _)| *name == msg.command) else {
        let err = CommandError::UnknownCommand(msg.command.clone());
        return report(state, handle, &sender, &msg, err);
    };

    if sender == Sender::Pending && !REGISTRATION_COMMANDS.contains(&msg.command.as_str()) {
        return report(state, handle, &sender, &msg, CommandError::NotRegistered);
    }

    if let Err(err) = handler(state, handle, &msg) {
        report(state, handle, &sender, &msg, err);
    }
}

fn is_numeric(command: &str) -> bool {
    command.len() == 3 && command.bytes().all(|b| b.is_ascii_digit())
}

/// `Ok(false)` means the line is dropped after a notice.
fn check_prefix(state: &ServerState, handle: Handle, sender: &Sender, msg: &Message) -> Result<bool, CommandError> {
    let Some(claimed) = msg.source_name() else {
        return Ok(true);
    };
    let nick = match sender {
        Sender::User(nick) => nick,
        // A peer speaks only for names reached through its own link.
        Sender::Peer(link_name) => {
            return match state.registry.find_by_name(claimed) {
                Some(conn) if conn.next_hop() != handle => Err(CommandError::ProtocolViolation(
                    format!("{link_name} sent a line as {claimed}, who is not behind it"),
                )),
                _ => Ok(true),
            };
        }
        Sender::Pending => return Ok(true),
    };
    if normalize(claimed) == normalize(nick) {
        return Ok(true);
    }
    if state.registry.is_taken(claimed) {
        return Err(CommandError::ProtocolViolation(format!(
            "{nick} sent a line as {claimed}"
        )));
    }
    let notice = Message::from_server(state.server_name(), "NOTICE", vec![nick.as_str(), "Wrong prefix"]);
    state.registry.send_to(nick, &notice);
    Ok(false)
}

/// Answer a failed command, closing the connection when the failure is fatal.
fn report(state: &mut ServerState, handle: Handle, sender: &Sender, msg: &Message, err: CommandError) {
    let recipient = match sender {
        Sender::Pending => state
            .registry
            .pending(handle)
            .and_then(|p| p.nick.clone())
            .unwrap_or_else(|| "*".to_string()),
        Sender::User(nick) => nick.clone(),
        Sender::Peer(name) => msg.source_name().unwrap_or(name).to_string(),
    };

    helpers::send_error(state, handle, &recipient, &err);

    if err.is_fatal() {
        tracing::warn!(%handle, "Closing connection: {err}");
        state.disconnect(handle, &err.text());
    } else {
        tracing::debug!(%handle, command = %msg.command, "Command failed: {err}");
    }
}

fn handle_quit(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    let reason = msg.param(0).unwrap_or("Client Quit");
    match state.sender(handle) {
        Some(Sender::Peer(_)) => {
            let nick = msg
                .source_name()
                .ok_or_else(|| CommandError::NeedMoreParams("QUIT".into()))?;
            s2s::remote_quit(state, handle, nick, reason);
        }
        Some(_) => state.disconnect(handle, &format!("Quit: {reason}")),
        None => {}
    }
    Ok(())
}

/// `ERROR` from a peer is logged, never answered.
fn handle_error(state: &mut ServerState, handle: Handle, msg: &Message) -> Outcome {
    if let Some(Sender::Peer(name)) = state.sender(handle) {
        tracing::warn!(%handle, server = %name, "Peer reported error: {}", msg.param(0).unwrap_or(""));
    }
    Ok(())
}

//! Server state and the event loop that drives it.
//!
//! One task owns [`ServerState`]. Socket reader and writer tasks only move
//! bytes and report through [`Event`]s, so commands run one at a time and
//! handlers mutate the registry and channel store without locks.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::channels::ChannelStore;
use crate::config::{ServerConfig, Settings};
use crate::connection::{self, helpers};
use crate::irc::Message;
use crate::registry::{Handle, Kind, PendingRegistration, Registry, Route, Transport, UserInfo};
use crate::s2s;

/// How often idle connections are checked.
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Capacity of the queue from socket tasks to the state owner.
const EVENT_QUEUE: usize = 4096;

/// Reported by socket tasks.
#[derive(Debug)]
pub enum Event {
    Received { handle: Handle, bytes: Vec<u8> },
    Closed { handle: Handle, reason: String },
}

/// What a transport handle currently belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sender {
    Pending,
    User(String),
    Peer(String),
}

pub struct ServerState {
    pub registry: Registry,
    pub channels: ChannelStore,
    pub settings: Settings,
    /// Required from clients and inbound peers when set.
    pub password: Option<String>,
    pub started: DateTime<Utc>,
}

impl ServerState {
    pub fn new(settings: Settings, password: Option<String>) -> Self {
        Self {
            registry: Registry::new(&settings.domain),
            channels: ChannelStore::new(),
            settings,
            password,
            started: Utc::now(),
        }
    }

    pub fn server_name(&self) -> &str {
        self.registry.own_name()
    }

    /// Start registration for a freshly accepted socket.
    pub fn accept(&mut self, transport: Transport, host: &str) {
        self.registry
            .insert_pending(PendingRegistration::new(transport, host.to_string()));
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Received { handle, bytes } => self.receive(handle, &bytes),
            Event::Closed { handle, reason } => {
                if self.registry.contains_handle(handle) {
                    self.disconnect(handle, &reason);
                }
            }
        }
        self.flush_failed();
    }

    /// Feed bytes read from `handle` through framing and dispatch.
    pub fn receive(&mut self, handle: Handle, bytes: &[u8]) {
        let Some(transport) = self.registry.transport_mut(handle) else {
            return;
        };
        transport.touch(Instant::now());
        let lines = match transport.inbound().push(bytes) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(%handle, "Dropping connection: {e}");
                self.disconnect(handle, "Input line was too long");
                return;
            }
        };

        for line in lines {
            tracing::debug!(%handle, "<- {line}");
            connection::dispatch(self, handle, Message::parse(&line));
            if !self.registry.contains_handle(handle) {
                break;
            }
        }
        self.flush_failed();
    }

    pub fn sender(&self, handle: Handle) -> Option<Sender> {
        if self.registry.pending(handle).is_some() {
            return Some(Sender::Pending);
        }
        let conn = self.registry.find_by_handle(handle)?;
        Some(match conn.kind {
            Kind::User(_) => Sender::User(conn.name.clone()),
            Kind::Server(_) => Sender::Peer(conn.name.clone()),
        })
    }

    /// Keepalive pass over every live transport.
    ///
    /// Idle past the ping interval gets one PING; idle past the connection
    /// timeout is dropped. Works on a snapshot, so removals are harmless.
    pub fn sweep(&mut self, now: Instant) {
        let ping_interval = self.settings.ping_interval();
        let timeout = self.settings.connection_timeout();

        for handle in self.registry.handles() {
            let is_pending = self.registry.pending(handle).is_some();
            let Some(transport) = self.registry.transport_mut(handle) else {
                continue;
            };
            let idle = transport.idle(now);
            if idle >= timeout {
                tracing::info!(%handle, idle_secs = idle.as_secs(), "Ping timeout");
                self.disconnect(handle, "Ping timeout");
            } else if idle >= ping_interval && !is_pending && !transport.probed() {
                transport.mark_probed();
                let ping = Message::from_server(self.server_name(), "PING", vec![self.server_name()]);
                self.registry.send(handle, &ping);
            }
        }
        self.flush_failed();
    }

    /// Tear down whatever `handle` belongs to. The only way connections leave.
    pub fn disconnect(&mut self, handle: Handle, reason: &str) {
        if let Some(pending) = self.registry.take_pending(handle) {
            tracing::info!(%handle, %reason, "Unregistered connection closed");
            let error = Message::new("ERROR", vec![format!("Closing Link: {} ({reason})", pending.host).as_str()]);
            pending.transport.send(&error);
            pending.transport.close();
            return;
        }

        let Some(name) = self.registry.find_by_handle(handle).map(|c| c.name.clone()) else {
            return;
        };
        let Some(conn) = self.registry.unregister(&name) else {
            return;
        };

        match &conn.kind {
            Kind::User(info) => {
                tracing::info!(%handle, nick = %conn.name, %reason, "Client disconnected");
                let quit = Message::with_prefix(&conn.hostmask(), "QUIT", vec![reason]);
                self.remove_from_channels(&conn.name, info, &quit);
                let relay = Message::with_prefix(&conn.name, "QUIT", vec![reason]);
                helpers::relay_to_peers(self, None, &relay);
            }
            Kind::Server(_) => {
                tracing::info!(%handle, server = %conn.name, %reason, "Peer link lost");
                s2s::prune_link(self, handle, &conn.name, reason);
            }
        }

        if let Route::Direct(transport) = conn.route {
            let error = Message::new("ERROR", vec![format!("Closing Link: {name} ({reason})").as_str()]);
            transport.send(&error);
            transport.close();
        }
    }

    /// Tear down every connection whose outbound queue overflowed.
    pub fn flush_failed(&mut self) {
        loop {
            let failed = self.registry.take_failed();
            if failed.is_empty() {
                break;
            }
            for handle in failed {
                if self.registry.contains_handle(handle) {
                    self.disconnect(handle, "Send queue exceeded");
                }
            }
        }
    }

    /// Add `nick` to `channel` on both sides. False if already a member.
    pub fn join_channel(&mut self, nick: &str, channel: &str) -> bool {
        let Some(user) = self
            .registry
            .find_by_name_mut(nick)
            .and_then(|c| c.user_mut())
        else {
            return false;
        };
        user.channels.insert(channel.to_lowercase());
        self.channels.add_member(channel, nick)
    }

    /// Remove `nick` from `channel` on both sides, deleting it when empty.
    pub fn leave_channel(&mut self, nick: &str, channel: &str) -> bool {
        if let Some(user) = self
            .registry
            .find_by_name_mut(nick)
            .and_then(|c| c.user_mut())
        {
            user.channels.remove(&channel.to_lowercase());
        }
        let removed = self.channels.remove_member(channel, nick);
        self.channels.delete_if_empty(channel);
        removed
    }

    /// Drop an already unregistered user from all its channels, showing
    /// `quit` to the local users that shared one with it.
    pub(crate) fn remove_from_channels(&mut self, nick: &str, info: &UserInfo, quit: &Message) {
        let mut observers = BTreeSet::new();
        for name in &info.channels {
            if let Some(channel) = self.channels.get(name) {
                observers.extend(channel.members().map(str::to_lowercase));
            }
            self.channels.remove_member(name, nick);
            self.channels.delete_if_empty(name);
        }
        observers.remove(&nick.to_lowercase());
        for observer in observers {
            helpers::send_local(self, &observer, quit);
        }
    }
}

/// Listener plus state owner.
pub struct Server {
    config: ServerConfig,
    settings: Settings,
}

impl Server {
    pub fn new(config: ServerConfig, settings: Settings) -> Self {
        Self { config, settings }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");
        let handle = tokio::spawn(self.serve(listener));
        Ok((addr, handle))
    }

    async fn serve(self, listener: TcpListener) -> Result<()> {
        let password = self
            .config
            .password
            .clone()
            .or_else(|| self.settings.password.clone());
        let mut state = ServerState::new(self.settings, password);
        let (events_tx, mut events) = mpsc::channel::<Event>(EVENT_QUEUE);
        let mut next_handle = 0u64;

        if let Some(peer) = &self.config.peer {
            match TcpStream::connect(peer.address()).await {
                Ok(stream) => {
                    next_handle += 1;
                    let handle = Handle(next_handle);
                    tracing::info!(%handle, peer = %peer.address(), "Linking to peer");
                    let transport = connection::spawn(stream, handle, events_tx.clone());
                    s2s::start_link(&mut state, transport, &peer.host, &peer.password);
                }
                Err(e) => tracing::warn!(peer = %peer.address(), "Peer link failed: {e}"),
            }
        }

        let mut sweep = tokio::time::interval(SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        next_handle += 1;
                        let handle = Handle(next_handle);
                        tracing::info!(%handle, %addr, "New connection");
                        let transport = connection::spawn(stream, handle, events_tx.clone());
                        state.accept(transport, &addr.ip().to_string());
                    }
                    Err(e) => tracing::warn!("Accept error: {e}"),
                },
                Some(event) = events.recv() => state.handle_event(event),
                _ = sweep.tick() => state.sweep(Instant::now()),
                _ = &mut shutdown => {
                    tracing::info!(connections = state.registry.len(), "Shutting down");
                    return Ok(());
                }
            }
        }
    }
}

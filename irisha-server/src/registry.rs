//! Connection registry.
//!
//! Owns every live connection: pending registrations keyed by transport
//! handle, and registered users and servers keyed by name. Remote users and
//! servers learned from peers are registered too, routed through the handle
//! of the direct link they sit behind.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::codec::LineBuffer;
use crate::irc::Message;

/// Identifies one accepted or dialed socket. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("name {0:?} is already registered")]
    NameConflict(String),
    #[error("no connection named {0:?}")]
    UnknownName(String),
}

/// The owned end of a socket: outbound queue, reader task, receive buffer.
///
/// Dropping the sender ends the writer task once it has flushed what is
/// queued; [`Transport::close`] also stops the reader.
#[derive(Debug)]
pub struct Transport {
    handle: Handle,
    tx: mpsc::Sender<String>,
    reader: Option<AbortHandle>,
    inbound: LineBuffer,
    last_activity: Instant,
    probed: bool,
}

impl Transport {
    pub fn new(handle: Handle, tx: mpsc::Sender<String>) -> Self {
        Self {
            handle,
            tx,
            reader: None,
            inbound: LineBuffer::new(),
            last_activity: Instant::now(),
            probed: false,
        }
    }

    pub fn with_reader(mut self, reader: AbortHandle) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Queue one line. Returns false when the queue is full or gone.
    pub fn send(&self, msg: &Message) -> bool {
        tracing::debug!(handle = %self.handle, "-> {msg}");
        self.tx.try_send(format!("{msg}\r\n")).is_ok()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        self.probed = false;
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Whether a keepalive probe went out since the last activity.
    pub fn probed(&self) -> bool {
        self.probed
    }

    pub fn mark_probed(&mut self) {
        self.probed = true;
    }

    pub fn inbound(&mut self) -> &mut LineBuffer {
        &mut self.inbound
    }

    /// Release the socket. Consumes the transport so it happens once.
    pub fn close(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

/// Progress of the password step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitingFirstLine,
    PasswordChecked,
    Unauthenticated,
}

/// A socket that has not yet become a user or a server.
#[derive(Debug)]
pub struct PendingRegistration {
    pub transport: Transport,
    pub stage: Stage,
    pub host: String,
    pub nick: Option<String>,
    /// `(username, realname)` from USER.
    pub user: Option<(String, String)>,
    /// Set when this server dialed the link, so no PASS/SERVER reply is due.
    pub outbound: bool,
}

impl PendingRegistration {
    pub fn new(transport: Transport, host: String) -> Self {
        Self {
            transport,
            stage: Stage::AwaitingFirstLine,
            host,
            nick: None,
            user: None,
            outbound: false,
        }
    }

    pub fn outbound(transport: Transport, host: String) -> Self {
        Self {
            outbound: true,
            ..Self::new(transport, host)
        }
    }
}

/// How to reach a registered connection.
#[derive(Debug)]
pub enum Route {
    Direct(Transport),
    /// Behind the direct link with this handle.
    Via(Handle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    pub host: String,
    pub realname: String,
    /// Server the user is connected to.
    pub server: String,
    pub modes: BTreeSet<char>,
    pub away: Option<String>,
    /// Lowercased names of joined channels.
    pub channels: HashSet<String>,
}

impl UserInfo {
    pub fn mode_string(&self) -> String {
        std::iter::once('+').chain(self.modes.iter().copied()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Locally assigned propagation token.
    pub token: u32,
    pub info: String,
    /// Server that introduced this one.
    pub uplink: String,
}

#[derive(Debug)]
pub enum Kind {
    User(UserInfo),
    Server(ServerInfo),
}

/// A registered user or server, local or remote.
#[derive(Debug)]
pub struct Connection {
    pub name: String,
    pub hopcount: u32,
    pub route: Route,
    pub kind: Kind,
}

impl Connection {
    pub fn is_direct(&self) -> bool {
        matches!(self.route, Route::Direct(_))
    }

    pub fn next_hop(&self) -> Handle {
        match &self.route {
            Route::Direct(transport) => transport.handle(),
            Route::Via(handle) => *handle,
        }
    }

    pub fn transport(&self) -> Option<&Transport> {
        match &self.route {
            Route::Direct(transport) => Some(transport),
            Route::Via(_) => None,
        }
    }

    pub fn user(&self) -> Option<&UserInfo> {
        match &self.kind {
            Kind::User(info) => Some(info),
            Kind::Server(_) => None,
        }
    }

    pub fn user_mut(&mut self) -> Option<&mut UserInfo> {
        match &mut self.kind {
            Kind::User(info) => Some(info),
            Kind::Server(_) => None,
        }
    }

    pub fn server(&self) -> Option<&ServerInfo> {
        match &self.kind {
            Kind::Server(info) => Some(info),
            Kind::User(_) => None,
        }
    }

    /// `nick!user@host` for users, the bare name for servers.
    pub fn hostmask(&self) -> String {
        match &self.kind {
            Kind::User(info) => format!("{}!{}@{}", self.name, info.username, info.host),
            Kind::Server(_) => self.name.clone(),
        }
    }
}

/// Case-insensitive registry key.
pub fn normalize(name: &str) -> String {
    name.to_lowercase()
}

pub struct Registry {
    own_name: String,
    by_name: HashMap<String, Connection>,
    by_handle: HashMap<Handle, String>,
    pending: HashMap<Handle, PendingRegistration>,
    token_high_water: u32,
    failed: RefCell<Vec<Handle>>,
}

impl Registry {
    /// `own_name` is reserved: nothing else may register under it.
    pub fn new(own_name: &str) -> Self {
        Self {
            own_name: own_name.to_string(),
            by_name: HashMap::new(),
            by_handle: HashMap::new(),
            pending: HashMap::new(),
            token_high_water: 0,
            failed: RefCell::new(Vec::new()),
        }
    }

    pub fn own_name(&self) -> &str {
        &self.own_name
    }

    pub fn is_own_name(&self, name: &str) -> bool {
        normalize(name) == normalize(&self.own_name)
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.is_own_name(name) || self.by_name.contains_key(&normalize(name))
    }

    pub fn register(&mut self, connection: Connection) -> Result<(), RegistryError> {
        if self.is_taken(&connection.name) {
            return Err(RegistryError::NameConflict(connection.name));
        }
        let key = normalize(&connection.name);
        if let Route::Direct(transport) = &connection.route {
            self.by_handle.insert(transport.handle(), key.clone());
        }
        self.by_name.insert(key, connection);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Option<Connection> {
        let connection = self.by_name.remove(&normalize(name))?;
        if let Route::Direct(transport) = &connection.route {
            self.by_handle.remove(&transport.handle());
        }
        Some(connection)
    }

    /// Move `old` to `new`: the new name is claimed before the old one goes.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), RegistryError> {
        let old_key = normalize(old);
        let new_key = normalize(new);
        if new_key != old_key && self.is_taken(new) {
            return Err(RegistryError::NameConflict(new.to_string()));
        }
        let mut connection = self
            .by_name
            .remove(&old_key)
            .ok_or_else(|| RegistryError::UnknownName(old.to_string()))?;
        connection.name = new.to_string();
        if let Route::Direct(transport) = &connection.route {
            self.by_handle.insert(transport.handle(), new_key.clone());
        }
        self.by_name.insert(new_key, connection);
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Connection> {
        self.by_name.get(&normalize(name))
    }

    pub fn find_by_name_mut(&mut self, name: &str) -> Option<&mut Connection> {
        self.by_name.get_mut(&normalize(name))
    }

    pub fn find_by_handle(&self, handle: Handle) -> Option<&Connection> {
        self.by_handle
            .get(&handle)
            .and_then(|key| self.by_name.get(key))
    }

    pub fn find_by_handle_mut(&mut self, handle: Handle) -> Option<&mut Connection> {
        let key = self.by_handle.get(&handle)?;
        self.by_name.get_mut(key)
    }

    pub fn user(&self, nick: &str) -> Option<&Connection> {
        self.find_by_name(nick).filter(|c| c.user().is_some())
    }

    pub fn server(&self, name: &str) -> Option<&Connection> {
        self.find_by_name(name).filter(|c| c.server().is_some())
    }

    /// Strictly increasing for the lifetime of the registry.
    pub fn next_token(&mut self) -> u32 {
        self.token_high_water += 1;
        self.token_high_water
    }

    /// Handle of the direct link that leads to `name`.
    pub fn resolve_transport(&self, name: &str) -> Option<Handle> {
        self.find_by_name(name).map(Connection::next_hop)
    }

    pub fn insert_pending(&mut self, pending: PendingRegistration) {
        self.pending.insert(pending.transport.handle(), pending);
    }

    pub fn pending(&self, handle: Handle) -> Option<&PendingRegistration> {
        self.pending.get(&handle)
    }

    pub fn pending_mut(&mut self, handle: Handle) -> Option<&mut PendingRegistration> {
        self.pending.get_mut(&handle)
    }

    pub fn take_pending(&mut self, handle: Handle) -> Option<PendingRegistration> {
        self.pending.remove(&handle)
    }

    pub fn contains_handle(&self, handle: Handle) -> bool {
        self.pending.contains_key(&handle) || self.by_handle.contains_key(&handle)
    }

    pub fn transport(&self, handle: Handle) -> Option<&Transport> {
        match self.pending.get(&handle) {
            Some(pending) => Some(&pending.transport),
            None => self.find_by_handle(handle).and_then(Connection::transport),
        }
    }

    pub fn transport_mut(&mut self, handle: Handle) -> Option<&mut Transport> {
        if self.pending.contains_key(&handle) {
            return self.pending.get_mut(&handle).map(|pending| &mut pending.transport);
        }
        match &mut self.find_by_handle_mut(handle)?.route {
            Route::Direct(transport) => Some(transport),
            Route::Via(_) => None,
        }
    }

    /// Every handle with a live transport, in a stable order.
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self
            .pending
            .keys()
            .chain(self.by_handle.keys())
            .copied()
            .collect();
        handles.sort();
        handles
    }

    /// Handles of directly linked peer servers.
    pub fn direct_peers(&self) -> Vec<Handle> {
        let mut peers: Vec<Handle> = self
            .by_name
            .values()
            .filter(|c| c.server().is_some())
            .filter_map(|c| c.transport().map(Transport::handle))
            .collect();
        peers.sort();
        peers
    }

    /// Names routed through the link `handle`, excluding the link itself.
    pub fn behind(&self, handle: Handle) -> Vec<String> {
        self.by_name
            .values()
            .filter(|c| matches!(c.route, Route::Via(h) if h == handle))
            .map(|c| c.name.clone())
            .collect()
    }

    /// `root` plus every server whose uplink chain reaches it, and the users
    /// on any of those servers.
    pub fn subtree(&self, root: &str) -> Vec<String> {
        let mut servers: HashSet<String> = HashSet::from([normalize(root)]);
        loop {
            let before = servers.len();
            for conn in self.by_name.values() {
                if let Some(info) = conn.server()
                    && servers.contains(&normalize(&info.uplink))
                {
                    servers.insert(normalize(&conn.name));
                }
            }
            if servers.len() == before {
                break;
            }
        }
        self.by_name
            .values()
            .filter(|c| match &c.kind {
                Kind::Server(_) => servers.contains(&normalize(&c.name)),
                Kind::User(info) => servers.contains(&normalize(&info.server)),
            })
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue `msg` on the transport of `handle`.
    ///
    /// A full or closed queue is remembered so the connection can be torn
    /// down once the current event is done.
    pub fn send(&self, handle: Handle, msg: &Message) {
        let Some(transport) = self.transport(handle) else {
            return;
        };
        if !transport.send(msg) {
            tracing::warn!(%handle, "Send buffer full or closed");
            self.failed.borrow_mut().push(handle);
        }
    }

    /// Send toward `name`, directly or through its next hop.
    pub fn send_to(&self, name: &str, msg: &Message) {
        if let Some(handle) = self.resolve_transport(name) {
            self.send(handle, msg);
        }
    }

    pub fn take_failed(&self) -> Vec<Handle> {
        let mut failed = std::mem::take(&mut *self.failed.borrow_mut());
        failed.sort();
        failed.dedup();
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn transport(id: u64) -> (Transport, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (Transport::new(Handle(id), tx), rx)
    }

    fn local_user(name: &str, transport: Transport) -> Connection {
        Connection {
            name: name.to_string(),
            hopcount: 0,
            route: Route::Direct(transport),
            kind: Kind::User(UserInfo {
                username: name.to_string(),
                host: "localhost".into(),
                realname: name.to_string(),
                server: "irc.test".into(),
                modes: BTreeSet::new(),
                away: None,
                channels: HashSet::new(),
            }),
        }
    }

    fn server(name: &str, route: Route, uplink: &str, token: u32) -> Connection {
        Connection {
            name: name.to_string(),
            hopcount: 1,
            route,
            kind: Kind::Server(ServerInfo {
                token,
                info: String::new(),
                uplink: uplink.to_string(),
            }),
        }
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut reg = Registry::new("irc.test");
        let (t1, _rx1) = transport(1);
        let (t2, _rx2) = transport(2);
        reg.register(local_user("alice", t1)).unwrap();
        let err = reg.register(local_user("ALICE", t2)).unwrap_err();
        assert_eq!(err, RegistryError::NameConflict("ALICE".into()));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.find_by_handle(Handle(1)).unwrap().name, "alice");
        assert!(reg.find_by_handle(Handle(2)).is_none());
    }

    #[test]
    fn own_name_is_reserved() {
        let mut reg = Registry::new("irc.test");
        let (t, _rx) = transport(1);
        assert!(reg.register(local_user("IRC.test", t)).is_err());
    }

    #[test]
    fn rename_moves_both_indexes() {
        let mut reg = Registry::new("irc.test");
        let (t1, _rx1) = transport(1);
        reg.register(local_user("alice", t1)).unwrap();
        reg.rename("alice", "Alicia").unwrap();
        assert!(reg.find_by_name("alice").is_none());
        assert_eq!(reg.find_by_handle(Handle(1)).unwrap().name, "Alicia");
        // Case-only change of one's own name is allowed.
        reg.rename("alicia", "ALICIA").unwrap();
        assert_eq!(reg.find_by_name("alicia").unwrap().name, "ALICIA");
    }

    #[test]
    fn rename_onto_taken_name_changes_nothing() {
        let mut reg = Registry::new("irc.test");
        let (t1, _rx1) = transport(1);
        let (t2, _rx2) = transport(2);
        reg.register(local_user("alice", t1)).unwrap();
        reg.register(local_user("bob", t2)).unwrap();
        assert!(reg.rename("bob", "alice").is_err());
        assert_eq!(reg.find_by_handle(Handle(1)).unwrap().name, "alice");
        assert_eq!(reg.find_by_handle(Handle(2)).unwrap().name, "bob");
    }

    #[test]
    fn tokens_never_repeat_after_disconnect() {
        let mut reg = Registry::new("irc.test");
        let mut seen = Vec::new();
        for id in 0..3 {
            let token = reg.next_token();
            let (t, _rx) = transport(id);
            reg.register(server(&format!("s{id}.net"), Route::Direct(t), "irc.test", token))
                .unwrap();
            seen.push(token);
        }
        // Drop the holder of the highest token.
        reg.unregister("s2.net");
        let next = reg.next_token();
        assert!(seen.iter().all(|&t| t < next));
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(next, 4);
    }

    #[test]
    fn indirect_entries_resolve_to_their_link() {
        let mut reg = Registry::new("irc.test");
        let (t, _rx) = transport(7);
        reg.register(server("hub.net", Route::Direct(t), "irc.test", 1)).unwrap();
        reg.register(server("leaf.net", Route::Via(Handle(7)), "hub.net", 2)).unwrap();
        assert_eq!(reg.resolve_transport("leaf.net"), Some(Handle(7)));
        assert_eq!(reg.resolve_transport("hub.net"), Some(Handle(7)));
        assert_eq!(reg.behind(Handle(7)), vec!["leaf.net".to_string()]);
        assert_eq!(reg.direct_peers(), vec![Handle(7)]);
    }

    #[test]
    fn subtree_follows_uplinks() {
        let mut reg = Registry::new("irc.test");
        let (t, _rx) = transport(1);
        reg.register(server("hub.net", Route::Direct(t), "irc.test", 1)).unwrap();
        reg.register(server("a.net", Route::Via(Handle(1)), "hub.net", 2)).unwrap();
        reg.register(server("b.net", Route::Via(Handle(1)), "a.net", 3)).unwrap();
        reg.register(server("c.net", Route::Via(Handle(1)), "hub.net", 4)).unwrap();

        let mut sub = reg.subtree("a.net");
        sub.sort();
        assert_eq!(sub, vec!["a.net".to_string(), "b.net".to_string()]);
    }

    #[test]
    fn failed_sends_are_collected() {
        let mut reg = Registry::new("irc.test");
        let (tx, rx) = mpsc::channel(1);
        reg.register(local_user("alice", Transport::new(Handle(1), tx)))
            .unwrap();
        drop(rx);
        reg.send(Handle(1), &Message::new("PING", vec!["x"]));
        reg.send(Handle(1), &Message::new("PING", vec!["y"]));
        assert_eq!(reg.take_failed(), vec![Handle(1)]);
        assert!(reg.take_failed().is_empty());
    }

    #[test]
    fn pending_and_registered_handles_are_disjoint() {
        let mut reg = Registry::new("irc.test");
        let (t, _rx) = transport(3);
        reg.insert_pending(PendingRegistration::new(t, "localhost".into()));
        assert!(reg.contains_handle(Handle(3)));
        assert!(reg.find_by_handle(Handle(3)).is_none());

        let pending = reg.take_pending(Handle(3)).unwrap();
        reg.register(local_user("carol", pending.transport)).unwrap();
        assert!(reg.pending(Handle(3)).is_none());
        assert_eq!(reg.handles(), vec![Handle(3)]);
    }
}

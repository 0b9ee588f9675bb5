//! Drives [`ServerState`] directly with in-memory transports.
#![allow(dead_code)]

use irisha_server::config::Settings;
use irisha_server::registry::{Handle, Transport};
use irisha_server::s2s;
use irisha_server::server::ServerState;
use tokio::sync::mpsc;

pub const PASSWORD: &str = "secret";

pub fn settings(domain: &str) -> Settings {
    Settings {
        domain: domain.to_string(),
        welcome: "Hello there\nBe nice".to_string(),
        description: format!("{domain} test server"),
        ..Settings::default()
    }
}

pub fn state() -> ServerState {
    ServerState::new(settings("irc.test"), Some(PASSWORD.to_string()))
}

/// One accepted socket, seen from the far end.
pub struct Client {
    pub handle: Handle,
    rx: mpsc::Receiver<String>,
}

impl Client {
    /// Everything queued so far, without line endings.
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            lines.push(line.trim_end_matches("\r\n").to_string());
        }
        lines
    }

    /// Lines whose command (or numeric) is `command`.
    pub fn drain_command(&mut self, command: &str) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter(|l| l.split(' ').nth(1) == Some(command))
            .collect()
    }

    pub fn send(&self, state: &mut ServerState, line: &str) {
        state.receive(self.handle, format!("{line}\r\n").as_bytes());
    }
}

pub fn connect(state: &mut ServerState, id: u64) -> Client {
    let (tx, rx) = mpsc::channel(4096);
    let handle = Handle(id);
    state.accept(Transport::new(handle, tx), "127.0.0.1");
    Client { handle, rx }
}

/// Connect and fully register `nick`, discarding the welcome burst.
pub fn register(state: &mut ServerState, id: u64, nick: &str) -> Client {
    let mut client = connect(state, id);
    let burst = format!("PASS {PASSWORD}\r\nNICK {nick}\r\nUSER {nick} 0 * :{nick} Test\r\n");
    state.receive(client.handle, burst.as_bytes());
    client.drain();
    client
}

/// Link a peer server through an inbound connection, discarding the
/// handshake and burst it receives.
pub fn link_peer(state: &mut ServerState, id: u64, name: &str) -> Client {
    let mut peer = connect(state, id);
    let handshake = format!("PASS {PASSWORD}\r\nSERVER {name} 1 :{name} peer\r\n");
    state.receive(peer.handle, handshake.as_bytes());
    peer.drain();
    peer
}

/// Dial out to a peer: the returned client carries what we send it.
pub fn dial(state: &mut ServerState, id: u64, password: &str) -> Client {
    let (tx, rx) = mpsc::channel(4096);
    let handle = Handle(id);
    s2s::start_link(state, Transport::new(handle, tx), "127.0.0.1", password);
    Client { handle, rx }
}

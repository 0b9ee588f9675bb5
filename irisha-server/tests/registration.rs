//! Registration, keepalive and disconnect behaviour of a single server.

mod common;

use std::time::{Duration, Instant};

use common::{PASSWORD, connect, register, state};
use pretty_assertions::assert_eq;

#[test]
fn registration_and_join_in_one_read() {
    let mut state = state();
    let mut alice = connect(&mut state, 1);

    state.receive(
        alice.handle,
        b"PASS secret\r\nNICK alice\r\nUSER alice 0 * :Alice A\r\nJOIN #lobby\r\n",
    );

    let lines = alice.drain();
    let version = concat!("irisha-", env!("CARGO_PKG_VERSION"));
    assert_eq!(lines[0], ":irc.test 001 alice :Welcome to the Internet Relay Network alice!alice@127.0.0.1");
    assert_eq!(lines[3], format!(":irc.test 004 alice irc.test {version} iw bIiklo"));
    assert_eq!(&lines[5..8], [
        ":irc.test 372 alice :- Hello there",
        ":irc.test 372 alice :- Be nice",
        ":irc.test 376 alice :End of MOTD command",
    ]);
    assert_eq!(&lines[8..], [
        ":alice!alice@127.0.0.1 JOIN #lobby",
        ":irc.test 331 alice #lobby :No topic is set",
        ":irc.test 353 alice = #lobby @alice",
        ":irc.test 366 alice #lobby :End of NAMES list",
    ]);

    let channel = state.channels.get("#lobby").unwrap();
    assert_eq!(channel.members().collect::<Vec<_>>(), ["alice"]);
    assert!(channel.is_operator("alice"));
    assert!(state.registry.user("alice").unwrap().is_direct());
}

#[test]
fn lines_split_across_reads() {
    let mut state = state();
    let mut alice = connect(&mut state, 1);

    for chunk in ["PA", "SS secret\r", "\nNICK al", "ice\r\nUSER alice 0 * :A\r", "\n"] {
        state.receive(alice.handle, chunk.as_bytes());
    }

    assert_eq!(alice.drain_command("001").len(), 1);
    assert_eq!(state.registry.pending_count(), 0);
}

#[test]
fn nick_in_use_keeps_connection_pending() {
    let mut state = state();
    let _alice = register(&mut state, 1, "alice");
    let mut other = connect(&mut state, 2);

    other.send(&mut state, "PASS secret");
    other.send(&mut state, "NICK Alice");
    assert_eq!(other.drain(), [":irc.test 433 * Alice :Nickname is already in use"]);

    other.send(&mut state, "NICK alice2");
    other.send(&mut state, "USER a2 0 * :Second");
    assert_eq!(other.drain_command("001").len(), 1);
    assert_eq!(state.registry.len(), 2);
}

#[test]
fn wrong_password_closes_connection() {
    let mut state = state();
    let mut client = connect(&mut state, 1);

    client.send(&mut state, "PASS nope");

    assert_eq!(client.drain(), [
        ":irc.test 464 * :Password incorrect",
        "ERROR :Closing Link: 127.0.0.1 (Password incorrect)",
    ]);
    assert!(!state.registry.contains_handle(client.handle));
}

#[test]
fn missing_password_refuses_registration() {
    let mut state = state();
    let mut client = connect(&mut state, 1);

    client.send(&mut state, "NICK alice");
    client.send(&mut state, "USER alice 0 * :Alice");

    let lines = client.drain();
    assert_eq!(lines[0], ":irc.test 464 alice :Password incorrect");
    assert!(lines[1].starts_with("ERROR :Closing Link"));
    assert!(state.registry.user("alice").is_none());
}

#[test]
fn late_pass_is_rejected() {
    let mut state = state();
    let mut client = connect(&mut state, 1);

    client.send(&mut state, "NICK alice");
    client.send(&mut state, &format!("PASS {PASSWORD}"));

    assert_eq!(client.drain(), [":irc.test 462 alice :Unauthorized command (already registered)"]);
}

#[test]
fn commands_before_registration() {
    let mut state = state();
    let mut client = connect(&mut state, 1);

    client.send(&mut state, "JOIN #lobby");
    client.send(&mut state, "FROB");

    assert_eq!(client.drain(), [
        ":irc.test 451 * :You have not registered",
        ":irc.test 421 * FROB :Unknown command",
    ]);
}

#[test]
fn erroneous_and_missing_nick() {
    let mut state = state();
    let mut client = connect(&mut state, 1);

    client.send(&mut state, "NICK");
    client.send(&mut state, "NICK 9lives");

    assert_eq!(client.drain(), [
        ":irc.test 431 * :No nickname given",
        ":irc.test 432 * 9lives :Erroneous nickname",
    ]);
}

#[test]
fn oversized_line_drops_connection() {
    let mut state = state();
    let mut client = connect(&mut state, 1);

    let line = format!("PRIVMSG #x :{}\r\n", "a".repeat(600));
    state.receive(client.handle, line.as_bytes());

    let lines = client.drain();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("ERROR :Closing Link"));
    assert!(!state.registry.contains_handle(client.handle));
}

#[test]
fn rename_is_seen_by_channel_members() {
    let mut state = state();
    let mut alice = register(&mut state, 1, "alice");
    let mut bob = register(&mut state, 2, "bob");
    alice.send(&mut state, "JOIN #lobby");
    bob.send(&mut state, "JOIN #lobby");
    alice.drain();
    bob.drain();

    alice.send(&mut state, "NICK alicia");

    assert_eq!(alice.drain(), [":alice!alice@127.0.0.1 NICK alicia"]);
    assert_eq!(bob.drain(), [":alice!alice@127.0.0.1 NICK alicia"]);
    assert!(state.channels.get("#lobby").unwrap().is_operator("alicia"));
    assert!(state.registry.user("alice").is_none());
}

#[test]
fn rename_to_taken_nick_is_refused() {
    let mut state = state();
    let mut alice = register(&mut state, 1, "alice");
    let mut bob = register(&mut state, 2, "bob");
    alice.send(&mut state, "JOIN #lobby");
    bob.send(&mut state, "JOIN #lobby");
    alice.drain();
    bob.drain();

    alice.send(&mut state, "NICK BOB");

    assert_eq!(alice.drain(), [":irc.test 433 alice BOB :Nickname is already in use"]);
    assert!(bob.drain().is_empty());
    assert!(state.registry.user("alice").unwrap().is_direct());
    assert_eq!(state.registry.user("bob").unwrap().next_hop(), bob.handle);
    let members: Vec<_> = state.channels.get("#lobby").unwrap().members().collect();
    assert_eq!(members, ["alice", "bob"]);

    // Changing only the case of one's own nick is not a conflict.
    alice.send(&mut state, "NICK Alice");
    assert_eq!(alice.drain(), [":alice!alice@127.0.0.1 NICK Alice"]);
}

#[test]
fn wrong_prefix_is_dropped_with_notice() {
    let mut state = state();
    let mut alice = register(&mut state, 1, "alice");

    alice.send(&mut state, ":ghost JOIN #lobby");

    assert_eq!(alice.drain(), [":irc.test NOTICE alice :Wrong prefix"]);
    assert!(!state.channels.contains("#lobby"));
}

#[test]
fn prefix_of_another_user_is_fatal() {
    let mut state = state();
    let mut alice = register(&mut state, 1, "alice");
    let _bob = register(&mut state, 2, "bob");

    alice.send(&mut state, ":bob PRIVMSG alice :hi");

    let lines = alice.drain();
    assert!(lines.last().unwrap().starts_with("ERROR :Closing Link: alice"));
    assert!(state.registry.user("alice").is_none());
}

#[test]
fn ping_and_time_queries() {
    let mut state = state();
    let mut alice = register(&mut state, 1, "alice");

    alice.send(&mut state, "PING :abc");
    alice.send(&mut state, "PING");
    alice.send(&mut state, "TIME");

    let lines = alice.drain();
    assert_eq!(lines[0], ":irc.test PONG irc.test abc");
    assert_eq!(lines[1], ":irc.test 409 alice :No origin specified");
    assert!(lines[2].starts_with(":irc.test 391 alice irc.test :"));
}

#[test]
fn idle_connections_are_probed_then_dropped() {
    let mut state = state();
    let mut alice = register(&mut state, 1, "alice");
    let mut lurker = connect(&mut state, 2);
    let start = Instant::now();

    state.sweep(start + Duration::from_secs(31));
    assert_eq!(alice.drain(), [":irc.test PING irc.test"]);
    assert!(lurker.drain().is_empty());

    // Only one probe per idle period.
    state.sweep(start + Duration::from_secs(60));
    assert!(alice.drain().is_empty());

    state.sweep(start + Duration::from_secs(121));
    assert_eq!(alice.drain(), ["ERROR :Closing Link: alice (Ping timeout)"]);
    assert_eq!(lurker.drain(), ["ERROR :Closing Link: 127.0.0.1 (Ping timeout)"]);
    assert!(state.registry.is_empty());
    assert_eq!(state.registry.pending_count(), 0);
}

#[test]
fn quit_reaches_channel_members() {
    let mut state = state();
    let mut alice = register(&mut state, 1, "alice");
    let mut bob = register(&mut state, 2, "bob");
    alice.send(&mut state, "JOIN #lobby");
    bob.send(&mut state, "JOIN #lobby");
    alice.drain();
    bob.drain();

    alice.send(&mut state, "QUIT :bye");

    assert_eq!(alice.drain(), ["ERROR :Closing Link: alice (Quit: bye)"]);
    assert_eq!(bob.drain(), [":alice!alice@127.0.0.1 QUIT :Quit: bye"]);
    let channel = state.channels.get("#lobby").unwrap();
    assert_eq!(channel.members().collect::<Vec<_>>(), ["bob"]);
}

//! End-to-end over real sockets.

mod common;

use std::time::Duration;

use irisha_server::config::ServerConfig;
use irisha_server::server::Server;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::time::timeout;

async fn read_until(reader: &mut BufReader<OwnedReadHalf>, needle: &str) -> Vec<String> {
    let mut seen = Vec::new();
    loop {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for server")
            .expect("read failed");
        assert!(n > 0, "server closed the connection; saw {seen:?}");
        let line = line.trim_end().to_string();
        let done = line.contains(needle);
        seen.push(line);
        if done {
            return seen;
        }
    }
}

#[tokio::test]
async fn register_join_and_chat() {
    let config = ServerConfig {
        password: Some("secret".to_string()),
        ..ServerConfig::default()
    };
    let (addr, server) = Server::new(config, common::settings("live.test"))
        .start()
        .await
        .unwrap();

    let (alice_read, mut alice) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut alice_read = BufReader::new(alice_read);
    alice
        .write_all(b"PASS secret\r\nNICK alice\r\nUSER alice 0 * :Alice\r\nJOIN #lobby\r\n")
        .await
        .unwrap();
    let lines = read_until(&mut alice_read, " 366 ").await;
    assert!(lines[0].starts_with(":live.test 001 alice "));
    assert!(lines.iter().any(|l| l == ":live.test 353 alice = #lobby @alice"));

    let (bob_read, mut bob) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut bob_read = BufReader::new(bob_read);
    // Split mid-line on purpose.
    bob.write_all(b"PASS secret\r\nNICK bob\r\nUSER bob 0 * :B").await.unwrap();
    bob.write_all(b"ob\r\nJOIN #lobby\r\nPRIVMSG #lobby :hi alice\r\n").await.unwrap();
    read_until(&mut bob_read, " 366 ").await;

    let lines = read_until(&mut alice_read, "PRIVMSG").await;
    assert_eq!(lines.last().unwrap(), ":bob!bob@127.0.0.1 PRIVMSG #lobby :hi alice");

    bob.write_all(b"QUIT :done\r\n").await.unwrap();
    let lines = read_until(&mut bob_read, "ERROR").await;
    assert_eq!(lines.last().unwrap(), "ERROR :Closing Link: bob (Quit: done)");
    let lines = read_until(&mut alice_read, "QUIT").await;
    assert_eq!(lines.last().unwrap(), ":bob!bob@127.0.0.1 QUIT :Quit: done");

    server.abort();
}

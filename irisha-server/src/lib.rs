pub mod channels;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod irc;
pub mod registry;
pub mod s2s;
pub mod server;

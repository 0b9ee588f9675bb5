//! Protocol message model.
//!
//! Grammar: `[:prefix ]command[ arg]*[ :trailing]`. Parsing works on a single
//! line with its terminator already stripped by [`crate::codec`].

use std::fmt;

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Sender override: a nickname, `nick!user@host`, or a server name.
    pub prefix: Option<String>,
    pub command: String,
    /// Positional arguments. The last one may contain spaces.
    pub params: Vec<String>,
}

impl Message {
    /// Parse one line. Never fails: garbage yields an empty command, which
    /// the dispatcher rejects.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);

        let (prefix, rest) = match line.strip_prefix(':') {
            Some(after) => match after.split_once(' ') {
                Some((prefix, rest)) => (Some(prefix.to_string()), rest),
                None => (Some(after.to_string()), ""),
            },
            None => (None, line),
        };

        let rest = rest.trim_start_matches(' ');
        let (command, mut remaining) = rest.split_once(' ').unwrap_or((rest, ""));

        let mut params = Vec::new();
        loop {
            remaining = remaining.trim_start_matches(' ');
            if remaining.is_empty() {
                break;
            }
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match remaining.split_once(' ') {
                Some((arg, tail)) => {
                    params.push(arg.to_string());
                    remaining = tail;
                }
                None => {
                    params.push(remaining.to_string());
                    break;
                }
            }
        }

        Message {
            prefix,
            command: command.to_string(),
            params,
        }
    }

    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Message {
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        }
    }

    /// A message carrying `prefix` as its sender.
    pub fn with_prefix(prefix: &str, command: &str, params: Vec<&str>) -> Self {
        Message {
            prefix: Some(prefix.to_string()),
            ..Message::new(command, params)
        }
    }

    /// A reply originating from this server.
    pub fn from_server(server_name: &str, command: &str, params: Vec<&str>) -> Self {
        Message::with_prefix(server_name, command, params)
    }

    /// Name part of the prefix (`nick` of `nick!user@host`).
    pub fn source_name(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split(['!', '@']).next().unwrap_or(p))
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Serialize without the line terminator.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(prefix) = &self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }
        out.push_str(&self.command);

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            out.push(' ');
            if i == last && needs_colon(param) {
                out.push(':');
            }
            out.push_str(param);
        }
        out
    }
}

fn needs_colon(param: &str) -> bool {
    param.is_empty() || param.contains(' ') || param.starts_with(':')
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

// Numeric replies
pub const RPL_WELCOME: &str = "001";
pub const RPL_YOURHOST: &str = "002";
pub const RPL_CREATED: &str = "003";
pub const RPL_MYINFO: &str = "004";
pub const RPL_UMODEIS: &str = "221";
pub const RPL_AWAY: &str = "301";
pub const RPL_UNAWAY: &str = "305";
pub const RPL_NOWAWAY: &str = "306";
pub const RPL_CHANNELMODEIS: &str = "324";
pub const RPL_NOTOPIC: &str = "331";
pub const RPL_TOPIC: &str = "332";
pub const RPL_INVITING: &str = "341";
pub const RPL_INVITELIST: &str = "346";
pub const RPL_ENDOFINVITELIST: &str = "347";
pub const RPL_VERSION: &str = "351";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";
pub const RPL_BANLIST: &str = "367";
pub const RPL_ENDOFBANLIST: &str = "368";
pub const RPL_MOTD: &str = "372";
pub const RPL_MOTDSTART: &str = "375";
pub const RPL_ENDOFMOTD: &str = "376";
pub const RPL_TIME: &str = "391";

// Error replies
pub const ERR_NOSUCHNICK: &str = "401";
pub const ERR_NOSUCHSERVER: &str = "402";
pub const ERR_NOSUCHCHANNEL: &str = "403";
pub const ERR_CANNOTSENDTOCHAN: &str = "404";
pub const ERR_NOORIGIN: &str = "409";
pub const ERR_NORECIPIENT: &str = "411";
pub const ERR_NOTEXTTOSEND: &str = "412";
pub const ERR_UNKNOWNCOMMAND: &str = "421";
pub const ERR_NOMOTD: &str = "422";
pub const ERR_NONICKNAMEGIVEN: &str = "431";
pub const ERR_ERRONEUSNICKNAME: &str = "432";
pub const ERR_NICKNAMEINUSE: &str = "433";
pub const ERR_NICKCOLLISION: &str = "436";
pub const ERR_USERNOTINCHANNEL: &str = "441";
pub const ERR_NOTONCHANNEL: &str = "442";
pub const ERR_USERONCHANNEL: &str = "443";
pub const ERR_NOTREGISTERED: &str = "451";
pub const ERR_NEEDMOREPARAMS: &str = "461";
pub const ERR_ALREADYREGISTRED: &str = "462";
pub const ERR_PASSWDMISMATCH: &str = "464";
pub const ERR_KEYSET: &str = "467";
pub const ERR_CHANNELISFULL: &str = "471";
pub const ERR_UNKNOWNMODE: &str = "472";
pub const ERR_INVITEONLYCHAN: &str = "473";
pub const ERR_BANNEDFROMCHAN: &str = "474";
pub const ERR_BADCHANNELKEY: &str = "475";
pub const ERR_NOPRIVILEGES: &str = "481";
pub const ERR_CHANOPRIVSNEEDED: &str = "482";
pub const ERR_UMODEUNKNOWNFLAG: &str = "501";
pub const ERR_USERSDONTMATCH: &str = "502";

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_bare_command() {
        let msg = Message::parse("QUIT");
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "QUIT");
        assert!(msg.params.is_empty());
    }

    #[test]
    fn parse_prefix_and_trailing() {
        let msg = Message::parse(":alice!a@host PRIVMSG #lobby :hello  there :)");
        assert_eq!(msg.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(msg.source_name(), Some("alice"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#lobby", "hello  there :)"]);
    }

    #[test]
    fn parse_user_registration() {
        let msg = Message::parse("USER alice 0 * :Alice Liddell");
        assert_eq!(msg.params, vec!["alice", "0", "*", "Alice Liddell"]);
    }

    #[test]
    fn parse_collapses_repeated_spaces() {
        let msg = Message::parse("JOIN   #a,#b    key1");
        assert_eq!(msg.command, "JOIN");
        assert_eq!(msg.params, vec!["#a,#b", "key1"]);
    }

    #[test]
    fn parse_empty_trailing() {
        let msg = Message::parse("TOPIC #lobby :");
        assert_eq!(msg.params, vec!["#lobby", ""]);
    }

    #[test]
    fn parse_is_total() {
        assert_eq!(Message::parse("").command, "");
        let only_prefix = Message::parse(":server.name");
        assert_eq!(only_prefix.prefix.as_deref(), Some("server.name"));
        assert_eq!(only_prefix.command, "");
        assert_eq!(Message::parse("   ").command, "");
    }

    #[test]
    fn parse_strips_terminator() {
        let msg = Message::parse("PING irisha.local\r\n");
        assert_eq!(msg.params, vec!["irisha.local"]);
    }

    #[test]
    fn wire_uses_colon_only_when_needed() {
        let msg = Message::from_server("irc.test", "PONG", vec!["irc.test", "token"]);
        assert_eq!(msg.to_wire(), ":irc.test PONG irc.test token");

        let msg = Message::with_prefix("bob", "PRIVMSG", vec!["#c", "two words"]);
        assert_eq!(msg.to_string(), ":bob PRIVMSG #c :two words");

        let msg = Message::new("TOPIC", vec!["#c", ""]);
        assert_eq!(msg.to_wire(), "TOPIC #c :");

        let msg = Message::new("PRIVMSG", vec!["#c", ":)"]);
        assert_eq!(msg.to_wire(), "PRIVMSG #c ::)");
    }

    #[test]
    fn wire_output_parses_back() {
        let original = Message::with_prefix(
            "peer.net",
            "NICK",
            vec!["carol", "2", "c", "host", "1", "+i", "Carol C"],
        );
        assert_eq!(Message::parse(&original.to_wire()), original);
    }
}

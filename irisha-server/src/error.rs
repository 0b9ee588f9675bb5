//! Command failure kinds and their numeric replies.

use crate::irc;

/// Why a command was refused.
///
/// Most variants become a numeric reply to the sender and leave state
/// untouched. [`CommandError::is_fatal`] marks the ones that end the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("No such nick/channel")]
    NoSuchNick(String),
    #[error("No such server")]
    NoSuchServer(String),
    #[error("No such channel")]
    NoSuchChannel(String),
    #[error("Cannot send to channel")]
    CannotSendToChan(String),
    #[error("No origin specified")]
    NoOrigin,
    #[error("No recipient given")]
    NoRecipient(String),
    #[error("No text to send")]
    NoTextToSend,
    #[error("Unknown command")]
    UnknownCommand(String),
    #[error("No nickname given")]
    NoNicknameGiven,
    #[error("Erroneous nickname")]
    ErroneousNickname(String),
    #[error("Nickname is already in use")]
    NicknameInUse(String),
    #[error("Nickname collision")]
    NickCollision(String),
    #[error("They aren't on that channel")]
    UserNotInChannel(String, String),
    #[error("You're not on that channel")]
    NotOnChannel(String),
    #[error("is already on channel")]
    UserOnChannel(String, String),
    #[error("You have not registered")]
    NotRegistered,
    #[error("Not enough parameters")]
    NeedMoreParams(String),
    #[error("Unauthorized command (already registered)")]
    AlreadyRegistered,
    #[error("Password incorrect")]
    PasswordMismatch,
    #[error("Channel key already set")]
    KeySet(String),
    #[error("Cannot join channel (+l)")]
    ChannelIsFull(String),
    #[error("is unknown mode char to me")]
    UnknownMode(char),
    #[error("Cannot join channel (+i)")]
    InviteOnlyChan(String),
    #[error("Cannot join channel (+b)")]
    BannedFromChan(String),
    #[error("Cannot join channel (+k)")]
    BadChannelKey(String),
    #[error("Permission Denied- You're not an IRC operator")]
    NoPrivileges,
    #[error("You're not channel operator")]
    ChanOpPrivsNeeded(String),
    #[error("Unknown MODE flag")]
    UmodeUnknownFlag,
    #[error("Cannot change mode for other users")]
    UsersDontMatch,
    /// Peer link refused: answered with `ERROR` and closed.
    #[error("{0}")]
    LinkRejected(String),
    /// Spoofed prefix and similar: the connection is dropped.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Result of running one command.
pub type Outcome = Result<(), CommandError>;

impl CommandError {
    /// Numeric code, or `None` for failures answered without one.
    pub fn numeric(&self) -> Option<&'static str> {
        use CommandError::*;
        Some(match self {
            NoSuchNick(_) => irc::ERR_NOSUCHNICK,
            NoSuchServer(_) => irc::ERR_NOSUCHSERVER,
            NoSuchChannel(_) => irc::ERR_NOSUCHCHANNEL,
            CannotSendToChan(_) => irc::ERR_CANNOTSENDTOCHAN,
            NoOrigin => irc::ERR_NOORIGIN,
            NoRecipient(_) => irc::ERR_NORECIPIENT,
            NoTextToSend => irc::ERR_NOTEXTTOSEND,
            UnknownCommand(_) => irc::ERR_UNKNOWNCOMMAND,
            NoNicknameGiven => irc::ERR_NONICKNAMEGIVEN,
            ErroneousNickname(_) => irc::ERR_ERRONEUSNICKNAME,
            NicknameInUse(_) => irc::ERR_NICKNAMEINUSE,
            NickCollision(_) => irc::ERR_NICKCOLLISION,
            UserNotInChannel(..) => irc::ERR_USERNOTINCHANNEL,
            NotOnChannel(_) => irc::ERR_NOTONCHANNEL,
            UserOnChannel(..) => irc::ERR_USERONCHANNEL,
            NotRegistered => irc::ERR_NOTREGISTERED,
            NeedMoreParams(_) => irc::ERR_NEEDMOREPARAMS,
            AlreadyRegistered => irc::ERR_ALREADYREGISTRED,
            PasswordMismatch => irc::ERR_PASSWDMISMATCH,
            KeySet(_) => irc::ERR_KEYSET,
            ChannelIsFull(_) => irc::ERR_CHANNELISFULL,
            UnknownMode(_) => irc::ERR_UNKNOWNMODE,
            InviteOnlyChan(_) => irc::ERR_INVITEONLYCHAN,
            BannedFromChan(_) => irc::ERR_BANNEDFROMCHAN,
            BadChannelKey(_) => irc::ERR_BADCHANNELKEY,
            NoPrivileges => irc::ERR_NOPRIVILEGES,
            ChanOpPrivsNeeded(_) => irc::ERR_CHANOPRIVSNEEDED,
            UmodeUnknownFlag => irc::ERR_UMODEUNKNOWNFLAG,
            UsersDontMatch => irc::ERR_USERSDONTMATCH,
            LinkRejected(_) | ProtocolViolation(_) => return None,
        })
    }

    /// Arguments placed between the recipient and the text of the reply.
    pub fn subjects(&self) -> Vec<String> {
        use CommandError::*;
        match self {
            NoSuchNick(s) | NoSuchServer(s) | NoSuchChannel(s) | CannotSendToChan(s)
            | UnknownCommand(s) | ErroneousNickname(s) | NicknameInUse(s) | NickCollision(s)
            | NotOnChannel(s) | NeedMoreParams(s) | KeySet(s) | ChannelIsFull(s)
            | InviteOnlyChan(s) | BannedFromChan(s) | BadChannelKey(s)
            | ChanOpPrivsNeeded(s) => vec![s.clone()],
            UserNotInChannel(a, b) | UserOnChannel(a, b) => vec![a.clone(), b.clone()],
            UnknownMode(c) => vec![c.to_string()],
            NoRecipient(_) | NoOrigin | NoTextToSend | NoNicknameGiven | NotRegistered
            | AlreadyRegistered | PasswordMismatch | NoPrivileges | UmodeUnknownFlag
            | UsersDontMatch | LinkRejected(_) | ProtocolViolation(_) => Vec::new(),
        }
    }

    /// Reply text. `NoRecipient` names the command inside the text.
    pub fn text(&self) -> String {
        match self {
            CommandError::NoRecipient(command) => format!("No recipient given ({command})"),
            other => other.to_string(),
        }
    }

    /// Whether the connection must be closed after reporting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommandError::PasswordMismatch
                | CommandError::LinkRejected(_)
                | CommandError::ProtocolViolation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_codes_are_stable() {
        let chan = "#c".to_string();
        assert_eq!(CommandError::BadChannelKey(chan.clone()).numeric(), Some("475"));
        assert_eq!(CommandError::BannedFromChan(chan.clone()).numeric(), Some("474"));
        assert_eq!(CommandError::InviteOnlyChan(chan.clone()).numeric(), Some("473"));
        assert_eq!(CommandError::ChannelIsFull(chan).numeric(), Some("471"));
    }

    #[test]
    fn registration_codes_are_stable() {
        assert_eq!(CommandError::NoNicknameGiven.numeric(), Some("431"));
        assert_eq!(CommandError::NicknameInUse("a".into()).numeric(), Some("433"));
        assert_eq!(CommandError::NeedMoreParams("USER".into()).numeric(), Some("461"));
        assert_eq!(CommandError::UnknownCommand("FOO".into()).numeric(), Some("421"));
    }

    #[test]
    fn subjects_and_text() {
        let err = CommandError::UserOnChannel("bob".into(), "#c".into());
        assert_eq!(err.subjects(), vec!["bob", "#c"]);
        assert_eq!(err.text(), "is already on channel");
        assert_eq!(
            CommandError::NoRecipient("PRIVMSG".into()).text(),
            "No recipient given (PRIVMSG)"
        );
    }

    #[test]
    fn only_link_level_failures_are_fatal() {
        assert!(CommandError::PasswordMismatch.is_fatal());
        assert!(CommandError::ProtocolViolation("spoof".into()).is_fatal());
        assert!(!CommandError::NicknameInUse("a".into()).is_fatal());
        assert!(CommandError::ProtocolViolation("x".into()).numeric().is_none());
    }
}

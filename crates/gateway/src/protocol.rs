//! Line protocol: command parsing and reply formatting.
//!
//! One command per line. The verb is case-insensitive; message text is the
//! verbatim remainder of the line after its leading arguments.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use sprout_database::{Conversation, Message, Visibility};
use sprout_messaging::MessagingError;

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Auth,
    Send,
    SendAtt,
    Join,
    Leave,
    Channel,
    ChannelAtt,
    Create,
    Add,
    Remove,
    Promote,
    Demote,
    Update,
    Delete,
    Members,
    Channels,
    History,
    HistoryChannel,
    Read,
    Unsend,
    Ping,
    Quit,
}

impl Verb {
    pub fn requires_auth(self) -> bool {
        !matches!(self, Verb::Auth)
    }
}

impl FromStr for Verb {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let verb = match s.to_ascii_uppercase().as_str() {
            "AUTH" => Verb::Auth,
            "SEND" => Verb::Send,
            "SENDATT" => Verb::SendAtt,
            "JOIN" => Verb::Join,
            "LEAVE" => Verb::Leave,
            "CHANNEL" => Verb::Channel,
            "CHANNELATT" => Verb::ChannelAtt,
            "CREATE" => Verb::Create,
            "ADD" => Verb::Add,
            "REMOVE" => Verb::Remove,
            "PROMOTE" => Verb::Promote,
            "DEMOTE" => Verb::Demote,
            "UPDATE" => Verb::Update,
            "DELETE" => Verb::Delete,
            "MEMBERS" => Verb::Members,
            "CHANNELS" => Verb::Channels,
            "HISTORY" => Verb::History,
            "HISTORYCHANNEL" => Verb::HistoryChannel,
            "READ" => Verb::Read,
            "UNSEND" => Verb::Unsend,
            "PING" => Verb::Ping,
            "QUIT" => Verb::Quit,
            _ => return Err(ProtocolError::UnknownCommand(s.to_string())),
        };
        Ok(verb)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Auth {
        token: String,
    },
    Send {
        recipient_id: i64,
        attachments: Vec<String>,
        content: String,
    },
    Join {
        channel_id: i64,
    },
    Leave {
        channel_id: i64,
    },
    Channel {
        channel_id: i64,
        attachments: Vec<String>,
        content: String,
    },
    Create {
        visibility: Visibility,
        name: String,
        description: String,
    },
    Add {
        channel_id: i64,
        user_id: i64,
    },
    Remove {
        channel_id: i64,
        user_id: i64,
    },
    Promote {
        channel_id: i64,
        user_id: i64,
    },
    Demote {
        channel_id: i64,
        user_id: i64,
    },
    Update {
        channel_id: i64,
        field: String,
        value: String,
    },
    Delete {
        channel_id: i64,
    },
    Members {
        channel_id: i64,
    },
    Channels,
    History {
        user_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    },
    HistoryChannel {
        channel_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    },
    Read {
        message_id: i64,
    },
    Unsend {
        message_id: i64,
    },
    Ping,
    Quit,
}

/// Split a line into its verb and the untouched argument text.
pub fn split_verb(line: &str) -> Result<(Verb, &str), ProtocolError> {
    let (verb, args) = next_token(line);
    Ok((verb.parse()?, args))
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (verb, args) = split_verb(line)?;
        Self::from_parts(verb, args)
    }

    pub fn from_parts(verb: Verb, args: &str) -> Result<Self, ProtocolError> {
        let mut args = Args::new(args);
        let command = match verb {
            Verb::Auth => Command::Auth {
                token: args.word("AUTH <token>")?.to_string(),
            },
            Verb::Send => Command::Send {
                recipient_id: args.id("SEND <recipientId> <text>")?,
                attachments: Vec::new(),
                content: args.text("SEND <recipientId> <text>")?,
            },
            Verb::SendAtt => Command::Send {
                recipient_id: args.id(SENDATT_USAGE)?,
                attachments: args.references(SENDATT_USAGE)?,
                content: args.text_or_empty(),
            },
            Verb::Join => Command::Join {
                channel_id: args.id("JOIN <channelId>")?,
            },
            Verb::Leave => Command::Leave {
                channel_id: args.id("LEAVE <channelId>")?,
            },
            Verb::Channel => Command::Channel {
                channel_id: args.id("CHANNEL <channelId> <text>")?,
                attachments: Vec::new(),
                content: args.text("CHANNEL <channelId> <text>")?,
            },
            Verb::ChannelAtt => Command::Channel {
                channel_id: args.id(CHANNELATT_USAGE)?,
                attachments: args.references(CHANNELATT_USAGE)?,
                content: args.text_or_empty(),
            },
            Verb::Create => {
                let visibility = args
                    .word(CREATE_USAGE)?
                    .parse::<Visibility>()
                    .map_err(|_| ProtocolError::invalid(CREATE_USAGE))?;
                Command::Create {
                    visibility,
                    name: args.word(CREATE_USAGE)?.to_string(),
                    description: args.text_or_empty().trim().to_string(),
                }
            }
            Verb::Add => {
                let (channel_id, user_id) = args.channel_and_user("ADD <channelId> <userId>")?;
                Command::Add { channel_id, user_id }
            }
            Verb::Remove => {
                let (channel_id, user_id) =
                    args.channel_and_user("REMOVE <channelId> <userId>")?;
                Command::Remove { channel_id, user_id }
            }
            Verb::Promote => {
                let (channel_id, user_id) =
                    args.channel_and_user("PROMOTE <channelId> <userId>")?;
                Command::Promote { channel_id, user_id }
            }
            Verb::Demote => {
                let (channel_id, user_id) =
                    args.channel_and_user("DEMOTE <channelId> <userId>")?;
                Command::Demote { channel_id, user_id }
            }
            Verb::Update => Command::Update {
                channel_id: args.id(UPDATE_USAGE)?,
                field: args.word(UPDATE_USAGE)?.to_string(),
                value: args.text(UPDATE_USAGE)?,
            },
            Verb::Delete => Command::Delete {
                channel_id: args.id("DELETE <channelId>")?,
            },
            Verb::Members => Command::Members {
                channel_id: args.id("MEMBERS <channelId>")?,
            },
            Verb::Channels => Command::Channels,
            Verb::History => Command::History {
                user_id: args.id(HISTORY_USAGE)?,
                limit: args.optional_number(HISTORY_USAGE)?,
                offset: args.optional_number(HISTORY_USAGE)?,
            },
            Verb::HistoryChannel => Command::HistoryChannel {
                channel_id: args.id(HISTORYCHANNEL_USAGE)?,
                limit: args.optional_number(HISTORYCHANNEL_USAGE)?,
                offset: args.optional_number(HISTORYCHANNEL_USAGE)?,
            },
            Verb::Read => Command::Read {
                message_id: args.id("READ <messageId>")?,
            },
            Verb::Unsend => Command::Unsend {
                message_id: args.id("UNSEND <messageId>")?,
            },
            Verb::Ping => Command::Ping,
            Verb::Quit => Command::Quit,
        };
        Ok(command)
    }
}

const SENDATT_USAGE: &str = "SENDATT <recipientId> <ref[,ref...]> <text>";
const CHANNELATT_USAGE: &str = "CHANNELATT <channelId> <ref[,ref...]> <text>";
const CREATE_USAGE: &str = "CREATE <public|private> <name> [description]";
const UPDATE_USAGE: &str = "UPDATE <channelId> <field> <value>";
const HISTORY_USAGE: &str = "HISTORY <userId> [limit] [offset]";
const HISTORYCHANNEL_USAGE: &str = "HISTORYCHANNEL <channelId> [limit] [offset]";

fn next_token(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest),
        None => (input, ""),
    }
}

/// Cursor over the argument text of one command.
struct Args<'a> {
    rest: &'a str,
}

impl<'a> Args<'a> {
    fn new(rest: &'a str) -> Self {
        Self { rest }
    }

    fn word(&mut self, usage: &str) -> Result<&'a str, ProtocolError> {
        let (token, rest) = next_token(self.rest);
        if token.is_empty() {
            return Err(ProtocolError::invalid(usage));
        }
        self.rest = rest;
        Ok(token)
    }

    fn id(&mut self, usage: &str) -> Result<i64, ProtocolError> {
        self.word(usage)?
            .parse()
            .map_err(|_| ProtocolError::invalid(usage))
    }

    fn channel_and_user(&mut self, usage: &str) -> Result<(i64, i64), ProtocolError> {
        Ok((self.id(usage)?, self.id(usage)?))
    }

    fn optional_number(&mut self, usage: &str) -> Result<Option<i64>, ProtocolError> {
        let (token, rest) = next_token(self.rest);
        if token.is_empty() {
            return Ok(None);
        }
        self.rest = rest;
        token
            .parse()
            .map(Some)
            .map_err(|_| ProtocolError::invalid(usage))
    }

    fn references(&mut self, usage: &str) -> Result<Vec<String>, ProtocolError> {
        let references: Vec<String> = self
            .word(usage)?
            .split(',')
            .map(str::trim)
            .filter(|reference| !reference.is_empty())
            .map(str::to_string)
            .collect();
        if references.is_empty() {
            return Err(ProtocolError::invalid(usage));
        }
        Ok(references)
    }

    /// The rest of the line, verbatim. Must not be blank.
    fn text(&mut self, usage: &str) -> Result<String, ProtocolError> {
        if self.rest.trim().is_empty() {
            return Err(ProtocolError::invalid(usage));
        }
        Ok(self.text_or_empty())
    }

    fn text_or_empty(&mut self) -> String {
        std::mem::take(&mut self.rest).to_string()
    }
}

/// A reply line sent back on the connection that issued the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(String),
    Error(String),
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Self {
        Reply::Ok(message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(message) if message.is_empty() => f.write_str("OK"),
            Reply::Ok(message) => write!(f, "OK {message}"),
            Reply::Error(message) => write!(f, "ERROR {message}"),
        }
    }
}

impl From<MessagingError> for Reply {
    fn from(error: MessagingError) -> Self {
        Reply::Error(error.to_string())
    }
}

impl From<ProtocolError> for Reply {
    fn from(error: ProtocolError) -> Self {
        Reply::Error(error.to_string())
    }
}

/// One stored message as listed by `HISTORY` and `HISTORYCHANNEL`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord<'a> {
    pub message_id: i64,
    pub sender_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,
    pub content: &'a str,
    pub created_at: &'a str,
    pub attachments: &'a [String],
    pub is_read: bool,
}

impl<'a> From<&'a Message> for HistoryRecord<'a> {
    fn from(message: &'a Message) -> Self {
        let (recipient_id, channel_id) = match message.conversation {
            Conversation::Direct { recipient_id } => (Some(recipient_id), None),
            Conversation::Channel { channel_id } => (None, Some(channel_id)),
        };
        Self {
            message_id: message.id,
            sender_id: message.sender_id,
            recipient_id,
            channel_id,
            content: &message.content,
            created_at: &message.created_at,
            attachments: &message.attachments,
            is_read: message.is_read,
        }
    }
}

/// Render one history entry as a `MESSAGE {json}` line.
pub fn history_line(message: &Message) -> serde_json::Result<String> {
    Ok(format!(
        "MESSAGE {}",
        serde_json::to_string(&HistoryRecord::from(message))?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_with_verbatim_text() {
        let command = Command::parse("SEND 2 hello  there ").unwrap();
        assert_eq!(
            command,
            Command::Send {
                recipient_id: 2,
                attachments: Vec::new(),
                content: "hello  there ".to_string(),
            }
        );
    }

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(
            Command::parse("join 7").unwrap(),
            Command::Join { channel_id: 7 }
        );
        assert_eq!(Command::parse("ping").unwrap(), Command::Ping);
    }

    #[test]
    fn unknown_verb_is_reported() {
        let error = Command::parse("DANCE 1").unwrap_err();
        assert_eq!(Reply::from(error).to_string(), "ERROR Unknown command");
    }

    #[test]
    fn malformed_arguments_are_reported() {
        for line in ["SEND abc hi", "SEND 2", "JOIN", "JOIN x", "ADD 1", "HISTORY 1 many"] {
            let error = Command::parse(line).unwrap_err();
            assert!(
                matches!(error, ProtocolError::InvalidArguments(_)),
                "{line} should be invalid"
            );
            assert!(Reply::from(error)
                .to_string()
                .starts_with("ERROR Invalid arguments: "));
        }
    }

    #[test]
    fn parses_attachment_commands() {
        assert_eq!(
            Command::parse("SENDATT 3 a.png,b.png look at these").unwrap(),
            Command::Send {
                recipient_id: 3,
                attachments: vec!["a.png".to_string(), "b.png".to_string()],
                content: "look at these".to_string(),
            }
        );
        assert!(matches!(
            Command::parse("CHANNELATT 4 doc.pdf").unwrap(),
            Command::Channel { channel_id: 4, ref attachments, ref content }
                if attachments.len() == 1 && content.is_empty()
        ));
    }

    #[test]
    fn parses_channel_administration() {
        assert_eq!(
            Command::parse("CREATE private crabs rust lovers only").unwrap(),
            Command::Create {
                visibility: Visibility::Private,
                name: "crabs".to_string(),
                description: "rust lovers only".to_string(),
            }
        );
        assert!(Command::parse("CREATE secret crabs").is_err());
        assert_eq!(
            Command::parse("UPDATE 5 description new words").unwrap(),
            Command::Update {
                channel_id: 5,
                field: "description".to_string(),
                value: "new words".to_string(),
            }
        );
        assert_eq!(
            Command::parse("HISTORYCHANNEL 5 10").unwrap(),
            Command::HistoryChannel {
                channel_id: 5,
                limit: Some(10),
                offset: None,
            }
        );
    }

    #[test]
    fn reply_formatting() {
        assert_eq!(Reply::ok("Message sent").to_string(), "OK Message sent");
        assert_eq!(Reply::ok("").to_string(), "OK");
        assert_eq!(
            Reply::from(MessagingError::NotAuthenticated).to_string(),
            "ERROR Not authenticated"
        );
    }
}

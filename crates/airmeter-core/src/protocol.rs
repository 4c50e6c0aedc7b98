use crate::{Message, MessageKind, PublisherId, Reading};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Separator between the command token and its payload.
pub const COMMAND_SEPARATOR: char = ' ';

/// Commands carried over the relay channel. The set is closed: anything else
/// is either a newer protocol revision or garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    RosterList,
    JoinRequest,
    OutboundMessage,
    ErrorMessage,
    Reading,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::RosterList,
        Command::JoinRequest,
        Command::OutboundMessage,
        Command::ErrorMessage,
        Command::Reading,
    ];

    /// Token as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::RosterList => "/list",
            Command::JoinRequest => "/join",
            Command::OutboundMessage => "/msg",
            Command::ErrorMessage => "/err",
            Command::Reading => "/reading",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::RosterList => "roster-list",
            Command::JoinRequest => "join-request",
            Command::OutboundMessage => "outbound-message",
            Command::ErrorMessage => "error-message",
            Command::Reading => "reading",
        }
    }

    /// Kind of log entry produced by a message command.
    pub fn message_kind(&self) -> Option<MessageKind> {
        match self {
            Command::OutboundMessage => Some(MessageKind::Info),
            Command::ErrorMessage => Some(MessageKind::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "/list" | "roster-list" => Ok(Command::RosterList),
            "/join" | "join-request" => Ok(Command::JoinRequest),
            "/msg" | "outbound-message" => Ok(Command::OutboundMessage),
            "/err" | "error-message" => Ok(Command::ErrorMessage),
            "/reading" | "reading" => Ok(Command::Reading),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unrecognised command {0}")]
    UnknownCommand(String),
    #[error("{command} payload is not valid json: {source}")]
    Payload {
        command: Command,
        #[source]
        source: serde_json::Error,
    },
    #[error("{command} payload is empty")]
    EmptyPayload { command: Command },
}

/// Body of a join request.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct JoinPayload {
    pub pub_id: PublisherId,
}

/// Splits a frame into its command token and the payload that follows the
/// first separator. A frame without a separator has an empty payload.
pub fn split_frame(raw: &str) -> (&str, &str) {
    let frame = raw.trim_end_matches(&['\r', '\n'][..]);
    frame
        .split_once(COMMAND_SEPARATOR)
        .unwrap_or((frame, ""))
}

pub fn roster_request() -> String {
    Command::RosterList.as_str().to_string()
}

pub fn join_request(publisher: PublisherId) -> String {
    let payload = JoinPayload { pub_id: publisher };
    // JoinPayload only holds an integer, serialization cannot fail.
    let body = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
    format!("{} {body}", Command::JoinRequest.as_str())
}

pub fn decode_reading(payload: &str) -> Result<Reading, ProtocolError> {
    decode_json(Command::Reading, payload)
}

pub fn decode_roster(payload: &str) -> Result<Vec<PublisherId>, ProtocolError> {
    decode_json(Command::RosterList, payload)
}

/// Builds a log message from a full `/msg` or `/err` frame.
pub fn decode_message(frame: &str) -> Result<Message, ProtocolError> {
    let (token, text) = split_frame(frame);
    let command: Command = token.parse()?;
    let kind = command
        .message_kind()
        .ok_or_else(|| ProtocolError::UnknownCommand(token.to_string()))?;
    Ok(Message {
        kind,
        text: text.to_string(),
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(
    command: Command,
    payload: &str,
) -> Result<T, ProtocolError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(ProtocolError::EmptyPayload { command });
    }
    serde_json::from_str(payload).map_err(|source| ProtocolError::Payload { command, source })
}

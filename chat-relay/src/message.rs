use std::fmt;
use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::id::ClientId;

/// Sender tag used for lines meant only for the receiving client.
pub const SYSTEM_SENDER: &str = "SYSTEM";

pub const NICKNAME_PROMPT: &str = "Please enter a nickname: ";

/// A line the relay sends to a client.
///
/// Apart from the bare identifier sent on connect, every line starts with a
/// sender tag followed by `:`. Clients use that tag to suppress their own
/// broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    /// The identifier assigned to the receiving client, alone on the line.
    Identifier(ClientId),
    /// `SYSTEM:<text>`, private to the receiving client.
    System(String),
    /// `<id>:<nickname>: <text>`
    Chat {
        sender: ClientId,
        nickname: String,
        text: String,
    },
    /// `<id>:<nickname> <event>`
    Event {
        sender: ClientId,
        nickname: String,
        event: String,
    },
}

impl ServerLine {
    pub fn prompt() -> Self {
        ServerLine::System(NICKNAME_PROMPT.to_string())
    }

    pub fn welcome(nickname: &str) -> Self {
        ServerLine::System(format!("Welcome to the chat {nickname}!"))
    }

    pub fn renamed_confirmation(nickname: &str) -> Self {
        ServerLine::System(format!("Successfully changed nickname to {nickname}"))
    }

    pub fn missing_nickname() -> Self {
        ServerLine::System("No nickname provided!".to_string())
    }

    pub fn identity(id: &ClientId) -> Self {
        ServerLine::System(format!("Your id is: {id}"))
    }

    pub fn server_full() -> Self {
        ServerLine::System("Server is full, try again later".to_string())
    }

    pub fn chat(sender: &ClientId, nickname: &str, text: &str) -> Self {
        ServerLine::Chat {
            sender: sender.clone(),
            nickname: nickname.to_string(),
            text: text.to_string(),
        }
    }

    pub fn joined(sender: &ClientId, nickname: &str) -> Self {
        Self::event(sender, nickname, "joined the chat!".to_string())
    }

    pub fn left(sender: &ClientId, nickname: &str) -> Self {
        Self::event(sender, nickname, "left the chat!".to_string())
    }

    pub fn renamed(sender: &ClientId, old: &str, new: &str) -> Self {
        Self::event(sender, old, format!("renamed themselves to {new}"))
    }

    fn event(sender: &ClientId, nickname: &str, event: String) -> Self {
        ServerLine::Event {
            sender: sender.clone(),
            nickname: nickname.to_string(),
            event,
        }
    }
}

impl fmt::Display for ServerLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLine::Identifier(id) => write!(f, "{id}"),
            ServerLine::System(text) => write!(f, "{SYSTEM_SENDER}:{text}"),
            ServerLine::Chat {
                sender,
                nickname,
                text,
            } => write!(f, "{sender}:{nickname}: {text}"),
            ServerLine::Event {
                sender,
                nickname,
                event,
            } => write!(f, "{sender}:{nickname} {event}"),
        }
    }
}

/// Splits a received line into its sender tag and the displayable remainder.
///
/// Lines without a `:` have no sender tag and are returned whole.
pub fn split_sender(line: &str) -> (Option<&str>, &str) {
    match line.split_once(':') {
        Some((sender, rest)) => (Some(sender), rest),
        None => (None, line),
    }
}

/// Writes one line followed by `\n` and flushes so the peer sees it promptly.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

//! Administrative console for a running relay.

use anyhow::{Context, Result, anyhow};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::info;

use crate::message::write_line;
use crate::server::RelayHandle;

const HELP: &[&str] = &[
    "/shutdown     stop the relay and disconnect everyone",
    "/list         show connected clients",
    "/say <text>   send a SYSTEM line to every client",
    "/help         show this summary",
];

#[derive(Debug, PartialEq, Eq)]
pub enum AdminCommand {
    Shutdown,
    List,
    Say { text: String },
    Help,
}

impl AdminCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty command"));
        }

        let (command, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (trimmed, ""),
        };

        match (command, rest.is_empty()) {
            ("/shutdown", true) => Ok(AdminCommand::Shutdown),
            ("/list", true) => Ok(AdminCommand::List),
            ("/help", true) => Ok(AdminCommand::Help),
            ("/say", false) => Ok(AdminCommand::Say {
                text: rest.to_string(),
            }),
            ("/say", true) => Err(anyhow!("/say requires a message: /say <text>")),
            ("/shutdown" | "/list" | "/help", false) => {
                Err(anyhow!("{command} takes no arguments"))
            }
            _ => Err(anyhow!(
                "unknown command. Try: /shutdown, /list, /say <text>, /help"
            )),
        }
    }
}

/// Executes admin commands from `input` until `/shutdown` or end of input.
///
/// End of input only stops the console; the relay keeps running.
pub async fn run<W>(
    mut input: mpsc::Receiver<String>,
    mut output: W,
    relay: RelayHandle,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = input.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match AdminCommand::parse(&line) {
            Ok(AdminCommand::Shutdown) => {
                info!("shutdown requested from console");
                relay.shutdown();
                write_line(&mut output, "relay shutting down")
                    .await
                    .context("failed to write console output")?;
                return Ok(());
            }
            Ok(AdminCommand::List) => list_sessions(&relay),
            Ok(AdminCommand::Say { text }) => {
                let reached = relay.announce(&text);
                vec![format!("announced to {reached} client(s)")]
            }
            Ok(AdminCommand::Help) => HELP.iter().map(|line| line.to_string()).collect(),
            Err(err) => vec![format!("error: {err}")],
        };

        for line in reply {
            write_line(&mut output, &line)
                .await
                .context("failed to write console output")?;
        }
    }

    info!("console input closed");
    Ok(())
}

fn list_sessions(relay: &RelayHandle) -> Vec<String> {
    let sessions = relay.active_sessions();
    if sessions.is_empty() {
        return vec!["no connected clients".to_string()];
    }
    sessions
        .into_iter()
        .map(|(id, nickname)| format!("{id} {nickname}"))
        .collect()
}

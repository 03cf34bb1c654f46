use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    input::spawn_stdin_reader,
    message::{split_sender, write_line},
};

const QUIT_COMMAND: &str = "/quit";

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut lines, mut writer) = establish_connection(&args).await?;
    let id = negotiate(&mut lines, &mut writer, args.nickname.as_deref()).await?;

    let mut input = spawn_stdin_reader();
    run_client_loop(&id, &mut lines, &mut writer, &mut input).await?;
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "relay connection already closed");
    }

    Ok(())
}

/// Text to show for a line received from the relay, or `None` when the line
/// is this client's own broadcast coming back.
pub fn visible_text<'a>(own_id: &str, line: &'a str) -> Option<&'a str> {
    match split_sender(line) {
        (Some(sender), _) if sender == own_id => None,
        (_, text) => Some(text),
    }
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader).lines(), writer))
}

/// Reads the identifier and the nickname prompt. Answers the prompt directly
/// when a nickname was given; otherwise shows it and lets the first typed
/// line answer it.
async fn negotiate(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    nickname: Option<&str>,
) -> Result<String> {
    let id = lines
        .next_line()
        .await?
        .context("relay closed the connection before assigning an identifier")?;
    let prompt = lines
        .next_line()
        .await?
        .context("relay closed the connection before asking for a nickname")?;

    match nickname {
        Some(nickname) => write_line(writer, nickname).await?,
        None => show(split_sender(&prompt).1, "").await?,
    }

    Ok(id)
}

async fn run_client_loop(
    id: &str,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    input: &mut mpsc::Receiver<String>,
) -> Result<()> {
    loop {
        select! {
            server_line = lines.next_line() => {
                if !handle_server_line(id, server_line).await? {
                    break;
                }
            }
            typed = input.recv() => {
                if !handle_typed_line(typed, writer).await? {
                    break;
                }
            }
            interrupted = tokio::signal::ctrl_c() => {
                if let Err(error) = interrupted {
                    warn!(?error, "ctrl-c listener failed, leaving");
                }
                write_line(writer, QUIT_COMMAND).await?;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(id: &str, line: io::Result<Option<String>>) -> Result<bool> {
    match line? {
        Some(line) => {
            if let Some(text) = visible_text(id, &line) {
                show(text, "\n").await?;
            }
            Ok(true)
        }
        None => {
            show("Disconnected from server", "\n").await?;
            Ok(false)
        }
    }
}

async fn handle_typed_line(typed: Option<String>, writer: &mut OwnedWriteHalf) -> Result<bool> {
    let line = typed.unwrap_or_else(|| QUIT_COMMAND.to_string());
    write_line(writer, &line).await?;

    if line.starts_with(QUIT_COMMAND) {
        show("You disconnected", "\n").await?;
        return Ok(false);
    }
    Ok(true)
}

async fn show(text: &str, end: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(format!("{text}{end}").as_bytes()).await?;
    stdout.flush().await
}

//! The interactive chat loop.
//!
//! Reads lines from `input`, turns them into `Command`s and runs them against
//! one `Session`. End of input, `/quit` and Ctrl-C all end the loop the same
//! way: through `Session::disconnect`.

use std::io::{self, Write};
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{info, warn};

use crate::broker::BrokerConnector;
use crate::chat::{DispatchSink, Session, SessionStats};
use crate::config::Settings;
use crate::console::command::{Command, HELP};
use crate::utils::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Who to chat as and where. Missing values are prompted for or defaulted.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub username: Option<String>,
    pub room: Option<String>,
}

pub async fn run<R, W>(
    input: R,
    out: &mut W,
    options: ChatOptions,
    connector: Arc<dyn BrokerConnector>,
    display: Arc<dyn DispatchSink>,
    settings: Settings,
) -> Result<(), ChatError>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();

    let username = match options.username.filter(|u| !u.trim().is_empty()) {
        Some(username) => username,
        None => match prompt_username(&mut lines, out).await? {
            Some(username) => username,
            None => return Ok(()),
        },
    };
    let room = options
        .room
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| settings.chat.default_room.clone());

    let mut session = Session::new(&username, &room, connector, display, settings)?;
    session.connect().await?;
    writeln!(out, "=== popchat ===")?;
    writeln!(
        out,
        "Connected to {} as '{}' in room '{}'.",
        session.stats().broker,
        session.username(),
        session.current_room()
    )?;
    writeln!(out, "Type /help for commands.")?;

    let looped = read_loop(&mut session, &mut lines, out).await;
    let disconnected = session.disconnect().await;
    info!(username = %username, "Chat ended");
    looped?;
    disconnected
}

async fn prompt_username<R, W>(lines: &mut Lines<R>, out: &mut W) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    loop {
        write!(out, "Enter your username: ")?;
        out.flush()?;
        match lines.next_line().await? {
            None => return Ok(None),
            Some(line) if line.trim().is_empty() => {
                writeln!(out, "Username cannot be empty.")?;
            }
            Some(line) => return Ok(Some(line.trim().to_string())),
        }
    }
}

async fn read_loop<R, W>(
    session: &mut Session,
    lines: &mut Lines<R>,
    out: &mut W,
) -> Result<(), ChatError>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if execute(session, Command::parse(&line), out).await? == Flow::Quit {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                writeln!(out)?;
                warn!("Interrupted; leaving the chat");
                break;
            }
        }
    }
    Ok(())
}

/// Run one command. Failures of chat operations are printed, not returned.
pub async fn execute<W: Write>(
    session: &mut Session,
    command: Command,
    out: &mut W,
) -> io::Result<Flow> {
    match command {
        Command::Empty => {}
        Command::Help => writeln!(out, "{HELP}")?,
        Command::Quit => return Ok(Flow::Quit),
        Command::Room(None) => writeln!(out, "Usage: /room <name>")?,
        Command::Room(Some(room)) => match session.change_room(&room).await {
            Ok(()) => writeln!(out, "Now chatting in '{}'.", session.current_room())?,
            Err(e) => writeln!(out, "Error: {e}")?,
        },
        Command::Users => writeln!(
            out,
            "User: {}  Room: {}  State: {}",
            session.username(),
            session.current_room(),
            session.state()
        )?,
        Command::Stats => write_stats(&session.stats(), out)?,
        Command::Clear => {
            write!(out, "\x1B[2J\x1B[1;1H")?;
            out.flush()?;
        }
        Command::Message(text) => {
            if let Err(e) = session.send_message(&text).await {
                writeln!(out, "Error: {e}")?;
            }
        }
        Command::Unknown(name) => {
            writeln!(out, "Unknown command '{name}'. Type /help for commands.")?
        }
    }

    if !session.is_connected() {
        writeln!(out, "Disconnected.")?;
        return Ok(Flow::Quit);
    }
    Ok(Flow::Continue)
}

fn write_stats<W: Write>(stats: &SessionStats, out: &mut W) -> io::Result<()> {
    let assignment = if stats.subscriber.assignment.is_empty() {
        "none".to_string()
    } else {
        stats
            .subscriber
            .assignment
            .iter()
            .map(|tp| tp.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };

    writeln!(out, "Broker: {}", stats.broker)?;
    writeln!(out, "Assignment: {assignment}")?;
    for (tp, offset) in &stats.subscriber.positions {
        writeln!(out, "  {tp} -> next offset {offset}")?;
    }
    let p = &stats.publisher;
    writeln!(
        out,
        "Sent: {}  Failed: {}  Retries: {}  In flight: {}",
        p.sent, p.failed, p.retries, p.in_flight
    )?;
    let s = &stats.subscriber;
    writeln!(
        out,
        "Received: {}  Delivered: {}  Parse failures: {}  Consume errors: {}",
        s.received, s.delivered, s.parse_failures, s.consume_errors
    )
}

//! Stdio transport for the host protocol.
//!
//! Commands arrive one JSON object per line on stdin and are checked against
//! the command table before deserialization, so the host gets a precise error
//! event for an unknown name or a bad argument. Events leave as JSON lines on
//! stdout, which carries nothing else.

use std::io::{self, BufRead, Write};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{AgentCommand, AgentEvent};

/// Every command name the agent accepts.
pub const COMMANDS: &[&str] = &[
    "query",
    "execute_plan",
    "listen_once",
    "system_speak",
    "set_always_listen",
    "reload_skills",
    "config_update",
    "ping",
    "stop",
];

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("expected a JSON object with a \"command\" field")]
    MissingCommand,
    #[error("unknown command \"{0}\"")]
    Unknown(String),
    #[error("invalid {command} command: {source}")]
    Invalid {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse one protocol line.
pub fn parse_command(line: &str) -> Result<AgentCommand, CommandError> {
    let value: Value = serde_json::from_str(line.trim()).map_err(CommandError::Json)?;
    let name = value
        .get("command")
        .and_then(Value::as_str)
        .ok_or(CommandError::MissingCommand)?
        .to_string();
    if !COMMANDS.contains(&name.as_str()) {
        return Err(CommandError::Unknown(name));
    }
    serde_json::from_value(value).map_err(|source| CommandError::Invalid {
        command: name,
        source,
    })
}

/// Write one event line to `out`.
fn write_event<W: Write>(out: &mut W, event: &AgentEvent) -> io::Result<()> {
    let json = serde_json::to_string(event).map_err(io::Error::other)?;
    writeln!(out, "{}", json)?;
    out.flush()
}

/// Emit an event on stdout. A closed pipe means the host is gone; not an error.
pub fn emit_event(event: &AgentEvent) {
    if let Err(e) = write_event(&mut io::stdout().lock(), event) {
        debug!("Event not delivered: {}", e);
    }
}

pub fn emit_error(message: &str) {
    emit_event(&AgentEvent::Error {
        message: message.to_string(),
    });
}

/// Forward parsed commands from `input` until EOF or the receiver is dropped.
///
/// Rejected lines are reported through `on_reject` and skipped.
fn pump_commands<R: BufRead>(
    input: R,
    tx: &mpsc::UnboundedSender<AgentCommand>,
    on_reject: impl Fn(&CommandError),
) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("stdin read error: {}", e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(cmd) => {
                debug!(?cmd, "Host command");
                if tx.send(cmd).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(line = %line.trim(), "Rejected host command: {}", e);
                on_reject(&e);
            }
        }
    }
}

/// Read commands from stdin on a dedicated thread.
///
/// The channel closes when the host closes stdin.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<AgentCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("ipc-stdin".into())
        .spawn(move || {
            pump_commands(io::stdin().lock(), &tx, |e| emit_error(&e.to_string()));
            debug!("stdin reader finished");
        });
    if let Err(e) = spawned {
        warn!("Failed to spawn stdin reader: {}", e);
    }
    rx
}

//! Interactive console: turns typed lines into envelopes and prints events.
//!
//! A line is split on whitespace. A token starting with `!` opens a command
//! whose argument is every following token up to the next `!` token; tokens
//! before the first command are chat text.
//!
//! ```text
//! hello everyone              -> {"text": "hello everyone"}
//! !nickname bob hi            -> {"nickname": "bob hi"}
//! see you !leave bye          -> {"text": "see you", "leave": "bye"}
//! ```

use anyhow::Result;
use mesh_session::{ChatEvent, SessionHandle};
use mesh_wire::{Command, CommandKind, Envelope};
use std::io::BufRead;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const HELP: &str = "\
commands:
  <text>              send a chat message
  !text <text>        same as above
  !nickname <name>    change your display name
  !leave [farewell]   say goodbye and quit
  !help               show this help";

/// Problems with a typed line; nothing is sent
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConsoleError {
    /// `!` followed by a name that is not a local command
    #[error("unknown command `!{0}` (try !help)")]
    UnknownCommand(String),

    /// Command needs an argument that was not given
    #[error("`!{0}` needs an argument")]
    MissingArgument(&'static str),
}

/// What a typed line asks for
#[derive(Debug, PartialEq)]
pub enum ConsoleInput {
    /// Broadcast this envelope
    Send(Envelope),
    /// Print the help text
    Help,
    /// Blank line
    Empty,
}

/// Tokenize one line of input
pub fn parse_line(line: &str) -> Result<ConsoleInput, ConsoleError> {
    let mut envelope = Envelope::new();
    let mut help = false;
    let mut key = "text";
    let mut args: Vec<&str> = Vec::new();
    let mut explicit = false;

    for token in line.split_whitespace() {
        if let Some(next) = token.strip_prefix('!') {
            push_command(&mut envelope, &mut help, key, &args, explicit)?;
            key = next;
            args.clear();
            explicit = true;
        } else {
            args.push(token);
        }
    }
    push_command(&mut envelope, &mut help, key, &args, explicit)?;

    if help {
        Ok(ConsoleInput::Help)
    } else if envelope.is_empty() {
        Ok(ConsoleInput::Empty)
    } else {
        Ok(ConsoleInput::Send(envelope))
    }
}

fn push_command(
    envelope: &mut Envelope,
    help: &mut bool,
    key: &str,
    args: &[&str],
    explicit: bool,
) -> Result<(), ConsoleError> {
    // leading text only counts when there is some
    if !explicit && args.is_empty() {
        return Ok(());
    }

    let argument = args.join(" ");
    if key == "help" {
        *help = true;
        return Ok(());
    }

    let command = match CommandKind::from_key(key) {
        Some(CommandKind::Text) => Command::Text(argument),
        Some(CommandKind::Nickname) if argument.is_empty() => {
            return Err(ConsoleError::MissingArgument("nickname"));
        }
        Some(CommandKind::Nickname) => Command::Nickname(argument),
        Some(CommandKind::Leave) => Command::Leave(argument),
        _ => return Err(ConsoleError::UnknownCommand(key.to_string())),
    };
    envelope.insert(command);
    Ok(())
}

/// Reads stdin, broadcasts what the user types and prints session events
pub struct Console {
    session: SessionHandle,
    events: mpsc::UnboundedReceiver<ChatEvent>,
}

impl Console {
    pub fn new(session: SessionHandle, events: mpsc::UnboundedReceiver<ChatEvent>) -> Self {
        Self { session, events }
    }

    /// Run until the user leaves or stdin ends
    pub async fn run(mut self) -> Result<()> {
        let mut lines = spawn_stdin_reader();
        println!("{}", HELP);

        loop {
            tokio::select! {
                line = lines.recv() => {
                    let Some(line) = line else {
                        info!(component = "console", "End of input; leaving room");
                        self.session.leave("").await?;
                        break;
                    };
                    if self.handle_line(&line).await? {
                        break;
                    }
                }
                Some(event) = self.events.recv() => println!("{}", event),
            }
        }

        while let Ok(event) = self.events.try_recv() {
            println!("{}", event);
        }
        Ok(())
    }

    /// Returns `true` once the session has been left
    async fn handle_line(&mut self, line: &str) -> Result<bool> {
        let mut envelope = match parse_line(line) {
            Ok(ConsoleInput::Send(envelope)) => envelope,
            Ok(ConsoleInput::Help) => {
                println!("{}", HELP);
                return Ok(false);
            }
            Ok(ConsoleInput::Empty) => return Ok(false),
            Err(e) => {
                println!("{}", e);
                return Ok(false);
            }
        };

        let farewell = match envelope.take(CommandKind::Leave) {
            Some(Ok(Command::Leave(farewell))) => Some(farewell),
            _ => None,
        };

        if !envelope.is_empty() {
            debug!(component = "console", "Sending {} commands", envelope.len());
            self.session.broadcast(envelope)?;
        }

        match farewell {
            Some(farewell) => {
                info!(component = "console", "Leaving room");
                self.session.leave(farewell).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Blocking stdin reads run on their own thread so shutdown never waits on them
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    spawn_line_reader(std::io::BufReader::new(std::io::stdin()))
}

fn spawn_line_reader<R>(reader: R) -> mpsc::UnboundedReceiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(component = "console", "Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(line: &str) -> Envelope {
        match parse_line(line).unwrap() {
            ConsoleInput::Send(envelope) => envelope,
            other => panic!("expected an envelope, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(
            sent("hello   everyone"),
            Envelope::from(Command::Text("hello everyone".into()))
        );
    }

    #[test]
    fn test_command_argument_runs_to_next_command() {
        let envelope = sent("!nickname bob the builder !text hi there");
        let expected: Envelope = [
            Command::Nickname("bob the builder".into()),
            Command::Text("hi there".into()),
        ]
        .into_iter()
        .collect();
        assert_eq!(envelope, expected);
    }

    #[test]
    fn test_leading_text_and_leave() {
        let expected: Envelope = [
            Command::Text("see you".into()),
            Command::Leave("bye".into()),
        ]
        .into_iter()
        .collect();
        assert_eq!(sent("see you !leave bye"), expected);
        assert_eq!(sent("!leave"), Envelope::from(Command::Leave(String::new())));
    }

    #[test]
    fn test_help_and_blank() {
        assert_eq!(parse_line("!help").unwrap(), ConsoleInput::Help);
        assert_eq!(parse_line("hi !help").unwrap(), ConsoleInput::Help);
        assert_eq!(parse_line("   ").unwrap(), ConsoleInput::Empty);
        assert_eq!(parse_line("").unwrap(), ConsoleInput::Empty);
    }

    #[test]
    fn test_unknown_and_bootstrap_commands_rejected() {
        assert_eq!(
            parse_line("!shout hey"),
            Err(ConsoleError::UnknownCommand("shout".into()))
        );
        assert_eq!(
            parse_line("!conn true"),
            Err(ConsoleError::UnknownCommand("conn".into()))
        );
        assert_eq!(
            parse_line("!new_peer x"),
            Err(ConsoleError::UnknownCommand("new_peer".into()))
        );
    }

    #[test]
    fn test_nickname_needs_argument() {
        assert_eq!(
            parse_line("!nickname"),
            Err(ConsoleError::MissingArgument("nickname"))
        );
    }

    #[tokio::test]
    async fn test_line_reader_forwards_lines_then_closes() {
        let input = std::io::Cursor::new(b"hello\n!leave bye\n".to_vec());
        let mut lines = spawn_line_reader(input);

        assert_eq!(lines.recv().await.as_deref(), Some("hello"));
        assert_eq!(lines.recv().await.as_deref(), Some("!leave bye"));
        assert_eq!(lines.recv().await, None);
    }
}

//! Input line parsing.
//!
//! Lines starting with `/` are commands; anything else is a message for the
//! active room. A leading `//` sends the rest of the line verbatim, slash
//! included.

use parley_client::Command;
use parley_core::{LocalId, ToastId};

/// Shown for `/help`.
pub const HELP: &str = "\
/join <room>      enter a room (leaves the current one)
/leave            leave the current room
/retry <id>       re-send a message that was not saved
/dismiss <id>     dismiss a notice
/help             show this help
/quit             exit
//text            send a message starting with '/'";

/// What a line of input asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// Forward to the runtime.
    Command(Command),
    /// Print [`HELP`].
    Help,
    /// Blank line.
    Empty,
    /// `/something` that is not a command.
    Unknown {
        /// The line as typed.
        input: String,
    },
    /// Known command, bad arguments.
    InvalidArgs {
        /// Command name without the slash.
        command: &'static str,
        /// What was wrong.
        error: String,
    },
}

/// Parse one input line.
pub fn parse(line: &str) -> Parsed {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Parsed::Empty;
    }

    if let Some(verbatim) = line.strip_prefix("//") {
        return submit(format!("/{verbatim}"));
    }

    let Some(rest) = line.trim_start().strip_prefix('/') else {
        return submit(line.to_owned());
    };

    let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let args = args.trim();
    match name {
        "join" | "j" => match single_arg(args) {
            Some(room) => Parsed::Command(Command::EnterRoom(room.into())),
            None => invalid("join", "expected one room id"),
        },
        "leave" => Parsed::Command(Command::LeaveRoom),
        "retry" => match single_arg(args).map(str::parse::<LocalId>) {
            Some(Ok(id)) => Parsed::Command(Command::Retry(id)),
            Some(Err(e)) => invalid("retry", format!("invalid message id: {e}")),
            None => invalid("retry", "expected one message id"),
        },
        "dismiss" => match single_arg(args).map(str::parse::<ToastId>) {
            Some(Ok(id)) => Parsed::Command(Command::Dismiss(id)),
            Some(Err(e)) => invalid("dismiss", format!("invalid notice id: {e}")),
            None => invalid("dismiss", "expected one notice id"),
        },
        "help" | "?" => Parsed::Help,
        "quit" | "q" | "exit" => Parsed::Command(Command::Quit),
        _ => Parsed::Unknown { input: line.to_owned() },
    }
}

fn submit(content: String) -> Parsed {
    Parsed::Command(Command::Submit { content, metadata: None })
}

fn single_arg(args: &str) -> Option<&str> {
    let mut words = args.split_whitespace();
    match (words.next(), words.next()) {
        (Some(word), None) => Some(word),
        _ => None,
    }
}

fn invalid(command: &'static str, error: impl Into<String>) -> Parsed {
    Parsed::InvalidArgs { command, error: error.into() }
}

//! Parsing of terminal input lines.

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Plain text for the room.
    Send(String),
    /// `/dm <user> <text>`.
    Direct {
        /// Recipient identity.
        to: String,
        /// Message body.
        content: String,
    },
    /// `/who`: print presence.
    Who,
    /// `/status`: print connection status.
    Status,
    /// `/reconnect`: reset backoff and connect now.
    Reconnect,
    /// `/clear`: empty the message buffer.
    Clear,
    /// `/help`.
    Help,
    /// `/quit` or `/exit`.
    Quit,
    /// A slash command that was not understood, with a usage hint.
    Invalid(String),
}

/// Help text listing the commands.
pub const HELP: &str = "\
commands:
  <text>              send to the room
  /dm <user> <text>   send a direct message
  /who                list who is online
  /status             show connection status
  /reconnect          reconnect now
  /clear              clear the message buffer
  /quit               disconnect and exit";

/// Parses one input line. Blank lines yield `None`.
#[must_use]
pub fn parse(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Send(line.to_string()));
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, rest)| (name, rest.trim()));
    let input = match name {
        "dm" | "msg" => match rest.split_once(char::is_whitespace) {
            Some((to, content)) if !content.trim().is_empty() => Input::Direct {
                to: to.to_string(),
                content: content.trim().to_string(),
            },
            _ => Input::Invalid("usage: /dm <user> <text>".into()),
        },
        "who" => Input::Who,
        "status" => Input::Status,
        "reconnect" => Input::Reconnect,
        "clear" => Input::Clear,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command /{other}, try /help")),
    };
    Some(input)
}

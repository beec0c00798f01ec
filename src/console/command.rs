//! Console input parsing.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    /// `/room` with the requested room, `None` when the name is missing.
    Room(Option<String>),
    Users,
    Stats,
    Clear,
    /// Free text to send to the current room.
    Message(String),
    Unknown(String),
    Empty,
}

pub const HELP: &str = "\
Commands:
  /help           Show this help
  /room <name>    Switch to another room
  /users          Show who you are and where
  /stats          Show partition assignment and counters
  /clear          Clear the screen
  /quit, /exit    Leave the chat
Anything else is sent to the current room.";

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        if !line.starts_with('/') {
            return Command::Message(line.to_string());
        }

        let mut parts = line.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default().to_lowercase();
        let arg = parts
            .next()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);

        match name.as_str() {
            "/help" => Command::Help,
            "/quit" | "/exit" => Command::Quit,
            "/room" => Command::Room(arg),
            "/users" => Command::Users,
            "/stats" => Command::Stats,
            "/clear" => Command::Clear,
            _ => Command::Unknown(name),
        }
    }
}

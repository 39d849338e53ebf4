//! Slash commands understood by the interactive loop

/// One line of operator input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text for the model
    Message(String),
    New,
    Switch(String),
    Remove,
    Clear,
    Undo,
    Tokens,
    Sessions,
    Help,
    Quit,
    /// Blank line
    Empty,
    /// A slash command that could not be understood, with the reason
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Message(line.to_string());
        };

        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default().to_ascii_lowercase();
        let arg = parts.next();
        let extra = parts.next().is_some();

        let command = match name.as_str() {
            "new" => Command::New,
            "switch" => match arg {
                Some(id) => Command::Switch(id.to_string()),
                None => return Command::Invalid("usage: /switch <session-id>".to_string()),
            },
            "remove" | "rm" => Command::Remove,
            "clear" => Command::Clear,
            "undo" => Command::Undo,
            "tokens" => Command::Tokens,
            "sessions" | "ls" => Command::Sessions,
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            _ => return Command::Invalid(format!("unknown command '/{}'; try /help", name)),
        };

        let takes_arg = matches!(command, Command::Switch(_));
        if extra || (!takes_arg && arg.is_some()) {
            return Command::Invalid(format!("too many arguments for '/{}'", name));
        }
        command
    }
}

pub const HELP: &str = "\
Commands:
  /new              save this session and start a new one
  /switch <id>      save this session and resume another
  /remove           delete this session and start a new one
  /clear            forget this session's history
  /undo             drop the last exchange
  /tokens           show token usage against the budget
  /sessions         list stored sessions
  /help             show this help
  /quit             save and exit";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(Command::parse("  hello there \n"), Command::Message("hello there".to_string()));
        assert_eq!(Command::parse("   "), Command::Empty);
    }

    #[test]
    fn test_slash_commands() {
        assert_eq!(Command::parse("/new"), Command::New);
        assert_eq!(Command::parse("/SWITCH abc-123"), Command::Switch("abc-123".to_string()));
        assert_eq!(Command::parse("/rm"), Command::Remove);
        assert_eq!(Command::parse("/exit"), Command::Quit);
        assert_eq!(Command::parse("/tokens"), Command::Tokens);
    }

    #[test]
    fn test_bad_commands() {
        assert!(matches!(Command::parse("/switch"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/switch a b"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/undo 3"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/frobnicate"), Command::Invalid(ref m) if m.contains("/help")));
        assert!(matches!(Command::parse("/"), Command::Invalid(_)));
    }
}

//! Interpretation of lines typed by an Active client.
//!
//! Commands are recognised by prefix only. Anything that is not a command is
//! chat text and is relayed verbatim.

const NICK_COMMAND: &str = "/nick";
const NICK_PREFIX: &str = "/nick ";
const QUIT_COMMAND: &str = "/quit";
const ID_COMMAND: &str = "/id";

/// What a single line of client input asks the relay to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/nick <name>`: change the sender's nickname.
    Rename { nickname: String },
    /// `/nick` without a name. Answered privately, nothing changes.
    MissingNickname,
    /// `/quit`: leave the chat.
    Quit,
    /// `/id`: ask for the sender's own identifier.
    IdentityQuery,
    /// Any other line.
    Chat { text: String },
}

impl Command {
    /// Interprets one raw input line.
    ///
    /// Rules are checked in order: `/nick`, `/quit`, `/id`, then chat. The
    /// `/quit` and `/id` checks are plain prefix tests, so `/quitting` quits.
    pub fn interpret(line: &str) -> Self {
        if line == NICK_COMMAND {
            return Command::MissingNickname;
        }
        if let Some(name) = line.strip_prefix(NICK_PREFIX) {
            if name.is_empty() {
                return Command::MissingNickname;
            }
            return Command::Rename {
                nickname: name.to_string(),
            };
        }

        if line.starts_with(QUIT_COMMAND) {
            return Command::Quit;
        }

        if line.starts_with(ID_COMMAND) {
            return Command::IdentityQuery;
        }

        Command::Chat {
            text: line.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_with_name_renames() {
        assert_eq!(
            Command::interpret("/nick Bob"),
            Command::Rename {
                nickname: "Bob".into()
            }
        );
        assert_eq!(
            Command::interpret("/nick Bob the Builder"),
            Command::Rename {
                nickname: "Bob the Builder".into()
            }
        );
    }

    #[test]
    fn nick_keeps_everything_after_the_first_space() {
        assert_eq!(
            Command::interpret("/nick  Bob "),
            Command::Rename {
                nickname: " Bob ".into()
            }
        );
        assert_eq!(
            Command::interpret("/nick   "),
            Command::Rename {
                nickname: "  ".into()
            }
        );
    }

    #[test]
    fn nick_without_name_is_reported() {
        assert_eq!(Command::interpret("/nick"), Command::MissingNickname);
        assert_eq!(Command::interpret("/nick "), Command::MissingNickname);
    }

    #[test]
    fn nick_prefix_without_separator_is_chat() {
        assert_eq!(
            Command::interpret("/nickname"),
            Command::Chat {
                text: "/nickname".into()
            }
        );
    }

    #[test]
    fn quit_and_id_match_by_prefix() {
        assert_eq!(Command::interpret("/quit"), Command::Quit);
        assert_eq!(Command::interpret("/quit now"), Command::Quit);
        assert_eq!(Command::interpret("/id"), Command::IdentityQuery);
        assert_eq!(Command::interpret("/identity"), Command::IdentityQuery);
    }

    #[test]
    fn everything_else_is_chat() {
        for line in ["hello", "", " /quit", "quit", "/help", "a /nick b"] {
            assert_eq!(
                Command::interpret(line),
                Command::Chat { text: line.into() },
                "line {line:?}"
            );
        }
    }
}

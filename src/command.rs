
/// One line of session input, sorted into what the player meant.  Anything
/// that isn't a recognized verb is optimistically treated as a channel send
/// (`gossip hello everyone`); whether that channel actually exists is the
/// loop's problem, since only it knows the channel table.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Name(String),
    Join(String),
    Leave(String),
    Emote { channel: String, text: String },
    Chat { channel: String, text: String },
    Who,
    Quit,
    Empty,
    Huh,
}

impl Command {
    pub fn parse(line: &str) -> Command {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }

        let mut words = line.splitn(2, char::is_whitespace);
        let verb = words.next().unwrap_or("");
        let rest = words.next().unwrap_or("").trim();

        match verb.to_ascii_lowercase().as_str() {
            "name" => {
                if rest.is_empty() {
                    Command::Huh
                } else {
                    Command::Name(rest.to_string())
                }
            }
            "join" => {
                if rest.is_empty() {
                    Command::Huh
                } else {
                    Command::Join(rest.to_string())
                }
            }
            "leave" => {
                if rest.is_empty() {
                    Command::Huh
                } else {
                    Command::Leave(rest.to_string())
                }
            }
            "emote" => {
                let mut parts = rest.splitn(2, char::is_whitespace);
                match (parts.next(), parts.next()) {
                    (Some(channel), Some(text)) if !text.trim().is_empty() => Command::Emote {
                        channel: channel.to_string(),
                        text: text.trim().to_string(),
                    },
                    _ => Command::Huh,
                }
            }
            "who" => Command::Who,
            "quit" => Command::Quit,
            _ => {
                if rest.is_empty() {
                    Command::Huh
                } else {
                    Command::Chat {
                        channel: verb.to_string(),
                        text: rest.to_string(),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_verbs_parse() {
        assert_eq!(Command::parse("name Robin"), Command::Name("Robin".to_string()));
        assert_eq!(Command::parse("join gossip"), Command::Join("gossip".to_string()));
        assert_eq!(Command::parse("leave gossip"), Command::Leave("gossip".to_string()));
        assert_eq!(Command::parse("who"), Command::Who);
        assert_eq!(Command::parse("QUIT"), Command::Quit);
    }

    #[test]
    fn unknown_verbs_become_channel_sends() {
        assert_eq!(
            Command::parse("gossip hello  there"),
            Command::Chat {
                channel: "gossip".to_string(),
                text: "hello  there".to_string(),
            }
        );
    }

    #[test]
    fn emote_needs_a_channel_and_text() {
        assert_eq!(
            Command::parse("emote gossip waves slowly"),
            Command::Emote {
                channel: "gossip".to_string(),
                text: "waves slowly".to_string(),
            }
        );
        assert_eq!(Command::parse("emote gossip"), Command::Huh);
        assert_eq!(Command::parse("emote"), Command::Huh);
    }

    #[test]
    fn odds_and_ends() {
        assert_eq!(Command::parse("   "), Command::Empty);
        assert_eq!(Command::parse("name"), Command::Huh);
        assert_eq!(Command::parse("xyzzy"), Command::Huh);
    }
}

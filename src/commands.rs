//! Slash commands typed at the node console or into a chat box.

use crate::error::ChatError;
use crate::messages::validate_topic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Topic { topic: String, text: String },
    Exit,
    Say(String),
}

/// Returns `Ok(None)` for blank input.
pub fn parse(line: &str) -> Result<Option<Command>, ChatError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Say(line.to_string())));
    }

    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match word {
        "/subscribe" => Command::Subscribe(validate_topic(rest)?.to_string()),
        "/unsubscribe" => Command::Unsubscribe(validate_topic(rest)?.to_string()),
        "/topic" => {
            let (topic, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let topic = validate_topic(topic)?.to_string();
            let text = text.trim();
            if text.is_empty() {
                return Err(ChatError::Invalid("usage: /topic <topic> <text>".to_string()));
            }
            Command::Topic {
                topic,
                text: text.to_string(),
            }
        }
        "/exit" => Command::Exit,
        // Unknown slash words are just chat.
        _ => Command::Say(line.to_string()),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_topic_commands() {
        assert_eq!(
            parse("/subscribe rust").unwrap(),
            Some(Command::Subscribe("rust".to_string()))
        );
        assert_eq!(
            parse("  /unsubscribe   rust ").unwrap(),
            Some(Command::Unsubscribe("rust".to_string()))
        );
        assert_eq!(
            parse("/topic rust lifetimes are fine").unwrap(),
            Some(Command::Topic {
                topic: "rust".to_string(),
                text: "lifetimes are fine".to_string(),
            })
        );
        assert_eq!(parse("/exit").unwrap(), Some(Command::Exit));
    }

    #[test]
    fn plain_text_and_blank_lines() {
        assert_eq!(parse("hello there").unwrap(), Some(Command::Say("hello there".to_string())));
        assert_eq!(parse("/shrug ok").unwrap(), Some(Command::Say("/shrug ok".to_string())));
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn malformed_commands_are_errors() {
        assert!(matches!(parse("/subscribe"), Err(ChatError::MissingTopic)));
        assert!(parse("/topic rust").is_err());
        assert!(parse("/topic").is_err());
    }
}

//! Wire messages, one JSON object per line
//!
//! Inbound on stdin: command strings to speak and bookmark reports from the
//! playback engine. Outbound on stdout: speech text with embedded markers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::marker::MarkerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    /// Text with embedded command tokens
    Command { text: String },
    /// Playback reached a marker
    Bookmark { id: MarkerId },
}

impl Inbound {
    /// Decode one input line
    ///
    /// A line starting with `{` is a JSON message and is dropped with a
    /// warning if it does not decode. Blank lines give `None`. Any other line
    /// is taken as command text so the binary can be driven by hand.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line.starts_with('{') {
            return match serde_json::from_str(line) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("ignoring undecodable message: {}", e);
                    None
                }
            };
        }

        Some(Inbound::Command {
            text: line.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Speech { text: String, at: String },
}

impl Outbound {
    /// Speech message stamped with the current time
    pub fn speech(text: &str) -> Self {
        Outbound::Speech {
            text: text.to_string(),
            at: Utc::now().to_rfc3339(),
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_messages() {
        assert_eq!(
            Inbound::parse_line(r#"{"type":"command","text":"hello !rping_x world"}"#),
            Some(Inbound::Command {
                text: "hello !rping_x world".into()
            })
        );
        assert_eq!(
            Inbound::parse_line(r#"  {"type":"bookmark","id":52}  "#),
            Some(Inbound::Bookmark { id: 52 })
        );
    }

    #[test]
    fn test_parse_plain_and_bad_lines() {
        assert_eq!(
            Inbound::parse_line("say something"),
            Some(Inbound::Command {
                text: "say something".into()
            })
        );
        assert_eq!(Inbound::parse_line("   "), None);
        assert_eq!(Inbound::parse_line(r#"{"type":"bookmark","id":"x"}"#), None);
        assert_eq!(Inbound::parse_line("{not json"), None);
        assert_eq!(Inbound::parse_line("{curly} words !secho_hi"), None);
        assert_eq!(Inbound::parse_line(r#"{"type":"shout","text":"hi"}"#), None);
    }

    #[test]
    fn test_speech_line() {
        let line = Outbound::speech("hi \\mrk=50\\").to_line().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "speech");
        assert_eq!(value["text"], "hi \\mrk=50\\");
        assert!(chrono::DateTime::parse_from_rfc3339(value["at"].as_str().unwrap()).is_ok());
    }
}

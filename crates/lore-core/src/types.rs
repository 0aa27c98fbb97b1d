//! Shared message types used by the temporal store and the gradient transformer.

use serde::{Deserialize, Serialize};

/// A message role. The temporal store only ever persists `User`/`Assistant`;
/// `Tool` and `System` are transformer-internal parts of the live window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One piece of a message's content. Exhaustively matched by the estimator,
/// the tool-output stripper, and the flattener; any future variant should
/// still carry a fixed per-part overhead of ~20 tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MessagePart {
    /// Plain text, included verbatim when flattened.
    Text { text: String },
    /// Model reasoning/thinking content, included with a `[reasoning]` prefix.
    Reasoning { text: String },
    /// A tool call and (if completed) its output.
    Tool {
        name: String,
        /// `None` while the call is still in-flight.
        output: Option<String>,
    },
    /// A step boundary marker, carries no text content.
    StepStart,
    /// A step boundary marker, carries no text content.
    StepFinish,
}

impl MessagePart {
    /// Approximate per-part framing overhead added on top of character counts.
    pub const FRAMING_OVERHEAD: usize = 20;
}

/// A single conversation message as delivered by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    /// Milliseconds since epoch.
    pub created_at: i64,
}

impl Message {
    /// Flatten parts into the single content string the temporal store persists.
    ///
    /// Text is verbatim, reasoning is prefixed, completed tool calls render as
    /// `[tool:NAME] output`. In-flight tool calls and step markers contribute
    /// nothing. Returns `None` when every part is empty (the caller drops such
    /// messages rather than storing them).
    pub fn flatten_content(&self) -> Option<String> {
        let mut pieces = Vec::new();
        for part in &self.parts {
            match part {
                MessagePart::Text { text } if !text.is_empty() => pieces.push(text.clone()),
                MessagePart::Reasoning { text } if !text.is_empty() => {
                    pieces.push(format!("[reasoning] {text}"))
                }
                MessagePart::Tool {
                    name,
                    output: Some(output),
                } => pieces.push(format!("[tool:{name}] {output}")),
                _ => {}
            }
        }
        if pieces.is_empty() {
            None
        } else {
            Some(pieces.join("\n\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(parts: Vec<MessagePart>) -> Message {
        Message {
            id: "m1".to_string(),
            role: Role::User,
            parts,
            created_at: 0,
        }
    }

    #[test]
    fn flattens_text_verbatim() {
        let m = msg(vec![MessagePart::Text {
            text: "hello".to_string(),
        }]);
        assert_eq!(m.flatten_content().as_deref(), Some("hello"));
    }

    #[test]
    fn reasoning_is_prefixed() {
        let m = msg(vec![MessagePart::Reasoning {
            text: "thinking".to_string(),
        }]);
        assert_eq!(m.flatten_content().as_deref(), Some("[reasoning] thinking"));
    }

    #[test]
    fn completed_tool_call_renders_bracketed() {
        let m = msg(vec![MessagePart::Tool {
            name: "grep".to_string(),
            output: Some("3 matches".to_string()),
        }]);
        assert_eq!(m.flatten_content().as_deref(), Some("[tool:grep] 3 matches"));
    }

    #[test]
    fn in_flight_tool_call_contributes_nothing() {
        let m = msg(vec![MessagePart::Tool {
            name: "grep".to_string(),
            output: None,
        }]);
        assert_eq!(m.flatten_content(), None);
    }

    #[test]
    fn all_empty_parts_yield_none() {
        let m = msg(vec![MessagePart::StepStart, MessagePart::StepFinish]);
        assert_eq!(m.flatten_content(), None);
    }
}

use serde::Serialize;

use crate::tags;

/// One NDJSON record streamed to a consumer.
///
/// At most one flag is set; flags that are false are omitted on the wire.
/// Content records carry no flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamEvent {
    pub message_id: String,
    pub text: String,
    pub think: Option<String>,
    pub search: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub started: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub connected: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub finished: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub heartbeat: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl StreamEvent {
    fn bare(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            ..Self::default()
        }
    }

    pub fn started(message_id: &str) -> Self {
        Self {
            started: true,
            ..Self::bare(message_id)
        }
    }

    pub fn connected(message_id: &str) -> Self {
        Self {
            connected: true,
            ..Self::bare(message_id)
        }
    }

    pub fn finished(message_id: &str) -> Self {
        Self {
            finished: true,
            ..Self::bare(message_id)
        }
    }

    pub fn heartbeat(message_id: &str) -> Self {
        Self {
            heartbeat: true,
            ..Self::bare(message_id)
        }
    }

    pub fn error(message_id: &str, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error: true,
            ..Self::bare(message_id)
        }
    }

    /// Split a snapshot into search block, think block and visible text.
    pub fn content(message_id: &str, snapshot: &str) -> Self {
        let (search, rest) = tags::parse_search(snapshot);
        let (think, text) = tags::parse_think(&rest);
        Self {
            text,
            think,
            search,
            ..Self::bare(message_id)
        }
    }

    pub fn is_content(&self) -> bool {
        !(self.started || self.connected || self.finished || self.error || self.heartbeat)
    }

    /// One JSON object followed by `\n`.
    pub fn to_ndjson(&self) -> String {
        let mut line =
            serde_json::to_string(self).unwrap_or_else(|_| fallback_line(&self.message_id));
        line.push('\n');
        line
    }
}

/// Minimal error event for an id whose full event failed to serialize.
fn fallback_line(message_id: &str) -> String {
    serde_json::json!({"message_id": message_id, "text": "", "error": true}).to_string()
}

//! Agent-native inputs and events.
//!
//! These are the values exchanged between the relay and a running agent.
//! They know nothing about the browser wire format; translation to and from
//! wire messages happens in the relay.

use crate::audio::AudioFrame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who is speaking in a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Token accounting reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// The outcome of a tool invocation, fed back to the model and shown to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub status: ToolStatus,
    pub content: Vec<String>,
}

impl ToolResult {
    /// All text blocks joined, as most backends take a single string.
    pub fn text(&self) -> String {
        self.content.join("\n")
    }
}

/// Input delivered to a running agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentInput {
    Audio(AudioFrame),
    Text(String),
    Image { data: String, mime_type: String },
    ToolResult(ToolResult),
}

/// Events emitted by a running agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The backend connection is up.
    ConnectionStart { model: String },
    /// The agent began a new turn.
    ResponseStart { response_id: String },
    /// Synthesized speech.
    Audio(AudioFrame),
    /// An incremental transcript fragment.
    Transcript {
        role: TranscriptRole,
        delta: String,
        is_final: bool,
    },
    /// The user spoke over the agent.
    Interruption,
    ResponseComplete {
        response_id: String,
        stop_reason: String,
    },
    Usage(Usage),
    ToolUse(ToolUse),
    ToolResult(ToolResult),
    Error(String),
}

impl AgentEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::ConnectionStart { .. } => "connection_start",
            AgentEvent::ResponseStart { .. } => "response_start",
            AgentEvent::Audio(_) => "audio",
            AgentEvent::Transcript { .. } => "transcript",
            AgentEvent::Interruption => "interruption",
            AgentEvent::ResponseComplete { .. } => "response_complete",
            AgentEvent::Usage(_) => "usage",
            AgentEvent::ToolUse(_) => "tool_use",
            AgentEvent::ToolResult(_) => "tool_result",
            AgentEvent::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_serializes_camel_case() {
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        };
        let json = serde_json::to_value(usage).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"inputTokens": 10, "outputTokens": 5, "totalTokens": 15})
        );
    }

    #[test]
    fn test_tool_result_text_joins_blocks() {
        let result = ToolResult {
            id: "t1".into(),
            name: "calculator".into(),
            status: ToolStatus::Success,
            content: vec!["Result: 200".into(), "done".into()],
        };
        assert_eq!(result.text(), "Result: 200\ndone");
    }

    #[test]
    fn test_role_display() {
        assert_eq!(TranscriptRole::User.to_string(), "user");
        assert_eq!(TranscriptRole::Assistant.to_string(), "assistant");
    }
}

//! Defines the WebSocket message protocol between the browser client and the relay.

use bidi_core::{
    audio::{MONO, PCM_FORMAT},
    event::{ToolStatus, TranscriptRole},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_format() -> String {
    PCM_FORMAT.to_string()
}

fn default_channels() -> u16 {
    MONO
}

fn default_image_mime() -> String {
    "image/jpeg".to_string()
}

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// A chunk of microphone audio, base64 PCM16.
    #[serde(rename = "bidi_audio_input")]
    AudioInput {
        audio: String,
        #[serde(default = "default_format")]
        format: String,
        /// Falls back to the backend's input rate when absent.
        #[serde(default)]
        sample_rate: Option<u32>,
        #[serde(default = "default_channels")]
        channels: u16,
    },
    /// A typed user turn.
    #[serde(rename = "bidi_text_input")]
    TextInput {
        text: String,
        #[serde(default)]
        role: Option<String>,
    },
    /// A still image, base64 encoded.
    #[serde(rename = "bidi_image_input")]
    ImageInput {
        image: String,
        #[serde(default = "default_image_mime")]
        mime_type: String,
    },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TranscriptDelta {
    pub text: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CurrentToolUse {
    #[serde(rename = "toolUseId")]
    pub tool_use_id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub text: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolResultPayload {
    #[serde(rename = "toolUseId")]
    pub tool_use_id: String,
    pub name: String,
    pub status: ToolStatus,
    pub content: Vec<TextBlock>,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "bidi_connection_start")]
    ConnectionStart { connection_id: Uuid, model: String },
    #[serde(rename = "bidi_response_start")]
    ResponseStart { response_id: String },
    /// Synthesized speech, base64 PCM16.
    #[serde(rename = "bidi_audio_stream")]
    AudioStream {
        audio: String,
        format: String,
        sample_rate: u32,
        channels: u16,
    },
    /// A transcript update: the newest text plus everything accumulated so far.
    #[serde(rename = "bidi_transcript_stream")]
    TranscriptStream {
        delta: TranscriptDelta,
        text: String,
        role: TranscriptRole,
        is_final: bool,
    },
    /// The user spoke over the agent; the client stops playback and clears its buffer.
    #[serde(rename = "bidi_interruption")]
    Interruption,
    #[serde(rename = "bidi_response_complete")]
    ResponseComplete {
        response_id: String,
        stop_reason: String,
    },
    #[serde(rename = "bidi_usage")]
    Usage {
        #[serde(rename = "inputTokens")]
        input_tokens: u64,
        #[serde(rename = "outputTokens")]
        output_tokens: u64,
        #[serde(rename = "totalTokens")]
        total_tokens: u64,
    },
    #[serde(rename = "tool_use_stream")]
    ToolUseStream { current_tool_use: CurrentToolUse },
    #[serde(rename = "tool_result")]
    ToolResult { tool_result: ToolResultPayload },
    #[serde(rename = "bidi_connection_close")]
    ConnectionClose { connection_id: Uuid, reason: String },
    #[serde(rename = "bidi_error")]
    Error { message: String },
}

impl ServerMessage {
    /// Audio is the only kind the relay may drop under pressure or on interruption.
    pub fn is_audio(&self) -> bool {
        matches!(self, ServerMessage::AudioStream { .. })
    }
}

//! The seam between the relay and a realtime speech backend.

use crate::{
    audio::AudioConfig,
    event::{AgentEvent, AgentInput},
    transcript::TranscriptMode,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A tool the model may call, described the way most backends expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool's input object.
    pub input_schema: serde_json::Value,
}

/// Everything a backend needs to open a session.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub system_prompt: String,
    pub tools: Vec<ToolSpec>,
    pub audio: AudioConfig,
}

/// A bidirectional speech model.
///
/// One call to [`RealtimeModel::run`] is one agent run: it connects to the
/// backend, forwards `inputs` until the channel closes, and reports backend
/// output on `events`. Aborting the task running it tears the backend
/// connection down.
#[async_trait]
pub trait RealtimeModel: Send {
    /// Identifier shown to the client, e.g. the backend model id.
    fn model_id(&self) -> &str;

    fn audio_config(&self) -> &AudioConfig;

    fn transcript_mode(&self) -> TranscriptMode {
        TranscriptMode::Coalesce
    }

    async fn run(
        self: Box<Self>,
        setup: SessionSetup,
        inputs: mpsc::Receiver<AgentInput>,
        events: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()>;
}

/// Sends an event, returning `false` once the relay has stopped listening.
pub async fn emit(events: &mpsc::Sender<AgentEvent>, event: AgentEvent) -> bool {
    events.send(event).await.is_ok()
}

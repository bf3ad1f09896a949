//! Amazon Nova Sonic backend.
//!
//! The event codec is always available. The transport that streams it over
//! Bedrock's `InvokeModelWithBidirectionalStream` is behind the `bedrock`
//! feature.

pub mod codec;
#[cfg(feature = "bedrock")]
mod transport;

use anyhow::Result;
use async_trait::async_trait;
use bidi_core::{
    audio::{AudioConfig, NOVA_SONIC_PCM16_SAMPLE_RATE},
    event::{AgentEvent, AgentInput},
    model::{RealtimeModel, SessionSetup},
    transcript::TranscriptMode,
};
use tokio::sync::mpsc;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_MODEL_ID: &str = "amazon.nova-2-sonic-v1:0";
pub const DEFAULT_VOICE: &str = "matthew";
pub const DEFAULT_ENDPOINTING_SENSITIVITY: &str = "HIGH";

/// Whether this build can actually reach Bedrock.
pub const fn transport_available() -> bool {
    cfg!(feature = "bedrock")
}

#[derive(Debug, Clone)]
pub struct NovaSonicConfig {
    pub region: String,
    pub model_id: String,
    pub voice: String,
    pub endpointing_sensitivity: String,
}

impl Default for NovaSonicConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            endpointing_sensitivity: DEFAULT_ENDPOINTING_SENSITIVITY.to_string(),
        }
    }
}

/// A [`RealtimeModel`] backed by Amazon Nova Sonic.
pub struct NovaSonicModel {
    config: NovaSonicConfig,
    audio: AudioConfig,
}

impl NovaSonicModel {
    pub fn new(config: NovaSonicConfig) -> Self {
        let audio = AudioConfig::mono(
            NOVA_SONIC_PCM16_SAMPLE_RATE,
            NOVA_SONIC_PCM16_SAMPLE_RATE,
            config.voice.clone(),
        );
        Self { config, audio }
    }
}

#[async_trait]
impl RealtimeModel for NovaSonicModel {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn audio_config(&self) -> &AudioConfig {
        &self.audio
    }

    /// Nova Sonic emits whole utterances, so transcripts skip coalescing.
    fn transcript_mode(&self) -> TranscriptMode {
        TranscriptMode::Passthrough
    }

    #[cfg(feature = "bedrock")]
    async fn run(
        self: Box<Self>,
        setup: SessionSetup,
        inputs: mpsc::Receiver<AgentInput>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        transport::run(&self.config, setup, inputs, events).await
    }

    #[cfg(not(feature = "bedrock"))]
    async fn run(
        self: Box<Self>,
        _setup: SessionSetup,
        _inputs: mpsc::Receiver<AgentInput>,
        _events: mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        anyhow::bail!("Nova Sonic support was built without the `bedrock` feature")
    }
}

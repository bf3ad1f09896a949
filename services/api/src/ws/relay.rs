//! Event Multiplexer / Relay Core
//!
//! The only place that knows both wire formats. Client messages become agent
//! inputs; agent events become server messages on the outbound queue. The
//! per-connection state shared by both directions is the transcript
//! aggregator and the interruption flag, behind a single lock.

use super::{
    outbound::OutboundQueue,
    protocol::{ClientMessage, CurrentToolUse, ServerMessage, TextBlock, ToolResultPayload, TranscriptDelta},
};
use bidi_core::{
    RelayError,
    audio::{self, AudioConfig},
    event::{AgentEvent, AgentInput, TranscriptRole},
    transcript::{TranscriptAggregator, TranscriptFlush, TranscriptMode},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, mpsc},
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
struct RelayShared {
    transcripts: TranscriptAggregator,
    /// Set by an interruption, cleared when the next response starts.
    interrupted: bool,
    closed: bool,
}

pub struct Relay {
    connection_id: Uuid,
    model: String,
    input_sample_rate: u32,
    agent_inputs: mpsc::Sender<AgentInput>,
    outbound: Arc<OutboundQueue>,
    shared: Mutex<RelayShared>,
}

fn transcript_message(flush: TranscriptFlush) -> ServerMessage {
    ServerMessage::TranscriptStream {
        delta: TranscriptDelta { text: flush.delta },
        text: flush.text,
        role: flush.role,
        is_final: flush.is_final,
    }
}

fn agent_gone() -> RelayError {
    RelayError::Transport("agent run has stopped".to_string())
}

impl Relay {
    pub fn new(
        connection_id: Uuid,
        model: impl Into<String>,
        audio: &AudioConfig,
        transcript_mode: TranscriptMode,
        transcript_idle: Duration,
        agent_inputs: mpsc::Sender<AgentInput>,
        outbound: Arc<OutboundQueue>,
    ) -> Self {
        Self {
            connection_id,
            model: model.into(),
            input_sample_rate: audio.input_sample_rate,
            agent_inputs,
            outbound,
            shared: Mutex::new(RelayShared {
                transcripts: TranscriptAggregator::new(transcript_mode, transcript_idle),
                interrupted: false,
                closed: false,
            }),
        }
    }

    /// Announces the connection to the client.
    pub async fn start(&self) -> bool {
        self.outbound
            .push(ServerMessage::ConnectionStart {
                connection_id: self.connection_id,
                model: self.model.clone(),
            })
            .await
    }

    /// Handles one text frame from the client.
    ///
    /// Malformed or unknown messages are logged and ignored. A decode error is
    /// returned so the caller can log it; it does not end the session.
    pub async fn on_client_text(&self, text: &str) -> Result<(), RelayError> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.on_client_message(msg).await,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed client message");
                Ok(())
            }
        }
    }

    /// Handles a binary frame: raw PCM16 at the backend's input rate.
    pub async fn on_client_binary(&self, bytes: &[u8]) -> Result<(), RelayError> {
        let samples = audio::decode_pcm16(bytes)?;
        let frame = audio::AudioFrame::new(samples, self.input_sample_rate);
        self.agent_inputs
            .send(AgentInput::Audio(frame))
            .await
            .map_err(|_| agent_gone())
    }

    pub async fn on_client_message(&self, msg: ClientMessage) -> Result<(), RelayError> {
        let input = match msg {
            ClientMessage::AudioInput {
                audio,
                format,
                sample_rate,
                channels,
            } => {
                let rate = sample_rate.unwrap_or(self.input_sample_rate);
                AgentInput::Audio(audio::decode_wire(&audio, &format, rate, channels)?)
            }
            ClientMessage::TextInput { text, role } => {
                if let Some(role) = role.filter(|role| role != "user") {
                    warn!(%role, "Ignoring text input with a non-user role");
                    return Ok(());
                }
                AgentInput::Text(text)
            }
            ClientMessage::ImageInput { image, mime_type } => AgentInput::Image {
                data: image,
                mime_type,
            },
        };
        self.agent_inputs.send(input).await.map_err(|_| agent_gone())
    }

    /// Translates one agent event. Returns `false` once the outbound queue is closed.
    pub async fn on_agent_event(&self, event: AgentEvent, now: Instant) -> bool {
        let mut shared = self.shared.lock().await;
        let msg = match event {
            AgentEvent::ConnectionStart { model } => {
                info!(%model, "Backend connected.");
                return !shared.closed;
            }
            AgentEvent::ResponseStart { response_id } => {
                shared.interrupted = false;
                ServerMessage::ResponseStart { response_id }
            }
            AgentEvent::Audio(frame) => {
                if shared.interrupted {
                    debug!("Dropping audio from an interrupted turn");
                    return !shared.closed;
                }
                ServerMessage::AudioStream {
                    audio: audio::encode(&frame),
                    format: audio::PCM_FORMAT.to_string(),
                    sample_rate: frame.sample_rate,
                    channels: frame.channels,
                }
            }
            AgentEvent::Transcript {
                role,
                delta,
                is_final,
            } => {
                if role == TranscriptRole::Assistant && shared.interrupted {
                    return !shared.closed;
                }
                match shared.transcripts.push(role, &delta, is_final, now) {
                    Some(flush) => transcript_message(flush),
                    None => return !shared.closed,
                }
            }
            AgentEvent::Interruption => {
                shared.interrupted = true;
                shared.transcripts.discard(TranscriptRole::Assistant);
                let discarded = self.outbound.discard_audio().await;
                info!(discarded, "Agent interrupted, cleared queued audio.");
                ServerMessage::Interruption
            }
            AgentEvent::ResponseComplete {
                response_id,
                stop_reason,
            } => ServerMessage::ResponseComplete {
                response_id,
                stop_reason,
            },
            AgentEvent::Usage(usage) => ServerMessage::Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_tokens: usage.total_tokens,
            },
            AgentEvent::ToolUse(tool_use) => ServerMessage::ToolUseStream {
                current_tool_use: CurrentToolUse {
                    tool_use_id: tool_use.id,
                    name: tool_use.name,
                    input: tool_use.input,
                },
            },
            AgentEvent::ToolResult(result) => ServerMessage::ToolResult {
                tool_result: ToolResultPayload {
                    tool_use_id: result.id,
                    name: result.name,
                    status: result.status,
                    content: result
                        .content
                        .into_iter()
                        .map(|text| TextBlock { text })
                        .collect(),
                },
            },
            AgentEvent::Error(message) => ServerMessage::Error { message },
        };
        self.outbound.push(msg).await
    }

    /// When the next pending transcript must be flushed, if any.
    pub async fn next_transcript_deadline(&self) -> Option<Instant> {
        self.shared.lock().await.transcripts.next_deadline()
    }

    /// Sends every transcript whose idle window has elapsed.
    pub async fn flush_transcripts(&self, now: Instant) -> bool {
        let mut shared = self.shared.lock().await;
        for flush in shared.transcripts.flush_expired(now) {
            if !self.outbound.push(transcript_message(flush)).await {
                return false;
            }
        }
        !shared.closed
    }

    /// Tells the client why the connection ends and stops accepting messages.
    ///
    /// Returns `false` if the relay was already closed.
    pub async fn close(&self, reason: &str) -> bool {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return false;
        }
        shared.closed = true;
        shared.transcripts.reset();
        self.outbound
            .push(ServerMessage::ConnectionClose {
                connection_id: self.connection_id,
                reason: reason.to_string(),
            })
            .await;
        self.outbound.close().await;
        true
    }
}

//! Gemini Live backend.
//!
//! Speaks the `BidiGenerateContent` WebSocket protocol: a setup message with
//! the system instruction, voice and tools, then realtime audio in and model
//! audio, transcriptions and tool calls out.

mod types;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bidi_core::{
    audio::{self, AudioConfig, GEMINI_LIVE_INPUT_SAMPLE_RATE, GEMINI_LIVE_OUTPUT_SAMPLE_RATE},
    event::{AgentEvent, AgentInput, ToolStatus, ToolUse, TranscriptRole, Usage},
    model::{RealtimeModel, SessionSetup, emit},
};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};
use types as gemini;

pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";
pub const DEFAULT_VOICE: &str = "Puck";

/// Connection settings for Gemini Live.
#[derive(Debug, Clone)]
pub struct GeminiLiveConfig {
    pub api_key: SecretString,
    pub model: String,
    pub voice: String,
}

/// A [`RealtimeModel`] backed by the Gemini Live API.
pub struct GeminiLiveModel {
    config: GeminiLiveConfig,
    audio: AudioConfig,
}

impl GeminiLiveModel {
    pub fn new(config: GeminiLiveConfig) -> Self {
        let audio = AudioConfig::mono(
            GEMINI_LIVE_INPUT_SAMPLE_RATE,
            GEMINI_LIVE_OUTPUT_SAMPLE_RATE,
            config.voice.clone(),
        );
        Self { config, audio }
    }
}

fn setup_message(model: &str, setup: &SessionSetup) -> gemini::ClientMessage {
    let function_declarations: Vec<gemini::FunctionDeclaration> = setup
        .tools
        .iter()
        .map(|tool| gemini::FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        })
        .collect();
    let tools = if function_declarations.is_empty() {
        vec![]
    } else {
        vec![gemini::Tool {
            function_declarations,
        }]
    };

    gemini::ClientMessage::Setup(gemini::BidiGenerateContentSetup {
        model: model.to_string(),
        generation_config: gemini::GenerationConfig {
            response_modalities: vec![gemini::ResponseModality::Audio],
            speech_config: gemini::SpeechConfig {
                voice_config: gemini::VoiceConfig {
                    prebuilt_voice_config: gemini::PrebuiltVoiceConfig {
                        voice_name: setup.audio.voice.clone(),
                    },
                },
            },
        },
        system_instruction: gemini::Content {
            role: None,
            parts: vec![gemini::Part {
                text: setup.system_prompt.clone(),
            }],
        },
        tools,
        input_audio_transcription: gemini::AudioTranscriptionConfig::default(),
        output_audio_transcription: gemini::AudioTranscriptionConfig::default(),
    })
}

/// Maps one agent input to the message that delivers it, if the backend accepts it.
fn client_message_for(input: AgentInput) -> Option<gemini::ClientMessage> {
    match input {
        AgentInput::Audio(frame) => Some(gemini::ClientMessage::RealtimeInput(
            gemini::BidiGenerateContentRealtimeInput {
                audio: Some(gemini::Blob {
                    mime_type: format!("audio/pcm;rate={}", frame.sample_rate),
                    data: audio::encode(&frame),
                }),
                ..Default::default()
            },
        )),
        AgentInput::Text(text) => Some(gemini::ClientMessage::ClientContent(
            gemini::BidiGenerateContentClientContent {
                turns: vec![gemini::Content {
                    role: Some("user".to_string()),
                    parts: vec![gemini::Part { text }],
                }],
                turn_complete: true,
            },
        )),
        AgentInput::Image { data, mime_type } => Some(gemini::ClientMessage::RealtimeInput(
            gemini::BidiGenerateContentRealtimeInput {
                video: Some(gemini::Blob { mime_type, data }),
                ..Default::default()
            },
        )),
        AgentInput::ToolResult(result) => {
            let response = match result.status {
                ToolStatus::Success => serde_json::json!({ "output": result.text() }),
                ToolStatus::Error => serde_json::json!({ "error": result.text() }),
            };
            Some(gemini::ClientMessage::ToolResponse(
                gemini::BidiGenerateContentToolResponse {
                    function_responses: vec![gemini::FunctionResponse {
                        id: result.id,
                        name: result.name,
                        response,
                    }],
                },
            ))
        }
    }
}

/// Turn-tracking translation from Gemini server messages to agent events.
#[derive(Debug, Default)]
struct EventTranslator {
    model: String,
    in_turn: bool,
    turns: u64,
    tool_calls: u64,
}

impl EventTranslator {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Default::default()
        }
    }

    fn response_id(&self) -> String {
        format!("turn-{}", self.turns)
    }

    fn end_turn(&mut self, stop_reason: &str, events: &mut Vec<AgentEvent>) {
        if self.in_turn {
            self.in_turn = false;
            events.push(AgentEvent::Transcript {
                role: TranscriptRole::Assistant,
                delta: String::new(),
                is_final: true,
            });
            events.push(AgentEvent::ResponseComplete {
                response_id: self.response_id(),
                stop_reason: stop_reason.to_string(),
            });
        }
    }

    fn translate(&mut self, message: gemini::ServerMessage) -> Vec<AgentEvent> {
        let mut events = Vec::new();

        if message.setup_complete.is_some() {
            events.push(AgentEvent::ConnectionStart {
                model: self.model.clone(),
            });
        }

        if let Some(content) = message.server_content {
            if let Some(transcription) = content.input_transcription {
                events.push(AgentEvent::Transcript {
                    role: TranscriptRole::User,
                    delta: transcription.text,
                    is_final: transcription.finished,
                });
            }
            if content.interrupted == Some(true) {
                events.push(AgentEvent::Interruption);
                self.end_turn("interrupted", &mut events);
            }
            if let Some(model_turn) = content.model_turn {
                if !self.in_turn {
                    self.in_turn = true;
                    self.turns += 1;
                    // The model answering closes the user's utterance.
                    events.push(AgentEvent::Transcript {
                        role: TranscriptRole::User,
                        delta: String::new(),
                        is_final: true,
                    });
                    events.push(AgentEvent::ResponseStart {
                        response_id: self.response_id(),
                    });
                }
                for part in model_turn.parts {
                    let Some(blob) = part.inline_data else {
                        continue;
                    };
                    match audio::decode(&blob.data, GEMINI_LIVE_OUTPUT_SAMPLE_RATE, audio::MONO) {
                        Ok(frame) => events.push(AgentEvent::Audio(frame)),
                        Err(e) => warn!(error = %e, "Dropping undecodable Gemini audio part"),
                    }
                }
            }
            if let Some(transcription) = content.output_transcription {
                events.push(AgentEvent::Transcript {
                    role: TranscriptRole::Assistant,
                    delta: transcription.text,
                    is_final: false,
                });
            }
            if content.turn_complete == Some(true) {
                self.end_turn("complete", &mut events);
            }
        }

        if let Some(tool_call) = message.tool_call {
            for call in tool_call.function_calls {
                self.tool_calls += 1;
                let id = if call.id.is_empty() {
                    format!("{}-{}", call.name, self.tool_calls)
                } else {
                    call.id
                };
                events.push(AgentEvent::ToolUse(ToolUse {
                    id,
                    name: call.name,
                    input: call.args,
                }));
            }
        }

        if let Some(usage) = message.usage_metadata {
            events.push(AgentEvent::Usage(Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.response_token_count,
                total_tokens: usage.total_token_count,
            }));
        }

        if message.go_away.is_some() {
            warn!("Gemini announced the session will end soon (goAway).");
        }

        events
    }
}

#[async_trait]
impl RealtimeModel for GeminiLiveModel {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn audio_config(&self) -> &AudioConfig {
        &self.audio
    }

    /// Runs the main loop for the Gemini Live connection.
    ///
    /// Inputs are held back until Gemini acknowledges the setup message.
    async fn run(
        self: Box<Self>,
        setup: SessionSetup,
        mut inputs: mpsc::Receiver<AgentInput>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let url = format!(
            "{}?key={}",
            GEMINI_LIVE_URL,
            self.config.api_key.expose_secret()
        );
        let (ws_stream, _) = connect_async(url)
            .await
            .context("Failed to connect to Gemini Live WebSocket")?;
        info!(model = %self.config.model, "Connected to Gemini Live WebSocket.");
        let (mut gemini_tx, mut gemini_rx) = ws_stream.split();

        let setup_msg = setup_message(&self.config.model, &setup);
        gemini_tx
            .send(WsMessage::Text(serde_json::to_string(&setup_msg)?.into()))
            .await?;

        let mut translator = EventTranslator::new(&self.config.model);
        let mut is_ready = false;
        loop {
            tokio::select! {
                maybe_input = inputs.recv(), if is_ready => {
                    let Some(input) = maybe_input else {
                        info!("Agent inputs closed, closing Gemini connection.");
                        let _ = gemini_tx.send(WsMessage::Close(None)).await;
                        return Ok(());
                    };
                    if let Some(message) = client_message_for(input) {
                        gemini_tx.send(WsMessage::Text(serde_json::to_string(&message)?.into())).await?;
                    }
                },
                maybe_msg = gemini_rx.next() => {
                    // Gemini delivers JSON in both text and binary frames.
                    let payload = match maybe_msg {
                        Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
                        Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                        Some(Ok(WsMessage::Close(close_frame))) => {
                            info!(?close_frame, "Gemini Live connection closed by server.");
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!("Error reading from Gemini WebSocket: {}", e);
                            return Err(e).context("Gemini Live WebSocket failed");
                        }
                        None => anyhow::bail!("Gemini Live WebSocket ended unexpectedly"),
                    };
                    let message = match serde_json::from_slice::<gemini::ServerMessage>(&payload) {
                        Ok(message) => message,
                        Err(e) => {
                            debug!(error = %e, "Skipping unparseable Gemini message");
                            continue;
                        }
                    };
                    if !is_ready && message.setup_complete.is_some() {
                        info!("Gemini session setup is complete. Ready for bidirectional streaming.");
                        is_ready = true;
                    }
                    for event in translator.translate(message) {
                        if !emit(&events, event).await {
                            return Ok(());
                        }
                    }
                },
            }
        }
    }
}

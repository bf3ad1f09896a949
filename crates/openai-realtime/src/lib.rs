//! OpenAI Realtime backend.
//!
//! Connects to the OpenAI Realtime WebSocket, configures a voice session with
//! server-side VAD and the agent's tools, and proxies audio, text and tool
//! results in, and speech, transcripts and tool calls out.

mod events;

use anyhow::{Context, Result};
use async_openai::types::realtime::{
    self as oai_realtime, ClientEvent as OAIClientEvent,
};
use async_trait::async_trait;
use bidi_core::{
    audio::{self, AudioConfig, OPENAI_REALTIME_PCM16_SAMPLE_RATE},
    event::{AgentEvent, AgentInput},
    model::{RealtimeModel, SessionSetup, emit},
};
use events::{EventTranslator, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};

pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";
pub const DEFAULT_VOICE: &str = "alloy";

/// Connection settings for the OpenAI Realtime API.
#[derive(Debug, Clone)]
pub struct OpenAIRealtimeConfig {
    pub api_key: SecretString,
    pub model: String,
    pub voice: String,
}

/// A [`RealtimeModel`] backed by the OpenAI Realtime API.
pub struct OpenAIRealtimeModel {
    config: OpenAIRealtimeConfig,
    audio: AudioConfig,
}

impl OpenAIRealtimeModel {
    pub fn new(config: OpenAIRealtimeConfig) -> Self {
        let audio = AudioConfig::mono(
            OPENAI_REALTIME_PCM16_SAMPLE_RATE,
            OPENAI_REALTIME_PCM16_SAMPLE_RATE,
            config.voice.clone(),
        );
        Self { config, audio }
    }
}

fn parse_voice(voice: &str) -> oai_realtime::RealtimeVoice {
    serde_json::from_value(serde_json::Value::String(voice.to_lowercase())).unwrap_or_else(|_| {
        warn!(%voice, "Unknown OpenAI voice, falling back to alloy");
        oai_realtime::RealtimeVoice::Alloy
    })
}

/// Builds the `session.update` event sent right after connecting.
fn session_update(model: &str, setup: &SessionSetup) -> OAIClientEvent {
    let tools = setup
        .tools
        .iter()
        .map(|tool| oai_realtime::ToolDefinition::Function {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        })
        .collect();

    let session = oai_realtime::SessionResource {
        model: Some(model.to_string()),
        modalities: Some(vec!["text".to_string(), "audio".to_string()]),
        instructions: Some(setup.system_prompt.clone()),
        voice: Some(parse_voice(&setup.audio.voice)),
        input_audio_format: Some(oai_realtime::AudioFormat::PCM16),
        output_audio_format: Some(oai_realtime::AudioFormat::PCM16),
        input_audio_transcription: Some(oai_realtime::AudioTranscription {
            model: Some("whisper-1".to_string()),
            ..Default::default()
        }),
        turn_detection: Some(oai_realtime::TurnDetection::ServerVAD {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            interrupt_response: Some(true),
            create_response: Some(true),
        }),
        tools: Some(tools),
        ..Default::default()
    };
    OAIClientEvent::SessionUpdate(oai_realtime::SessionUpdateEvent {
        session,
        event_id: None,
    })
}

fn conversation_item(item: oai_realtime::Item) -> OAIClientEvent {
    OAIClientEvent::ConversationItemCreate(oai_realtime::ConversationItemCreateEvent {
        item,
        event_id: None,
        previous_item_id: None,
    })
}

fn response_create() -> OAIClientEvent {
    OAIClientEvent::ResponseCreate(oai_realtime::ResponseCreateEvent {
        response: None,
        event_id: None,
    })
}

/// Maps one agent input to the client events that deliver it.
fn client_events_for(input: AgentInput) -> Vec<OAIClientEvent> {
    match input {
        AgentInput::Audio(frame) => vec![OAIClientEvent::InputAudioBufferAppend(
            oai_realtime::InputAudioBufferAppendEvent {
                audio: audio::encode(&frame),
                event_id: None,
            },
        )],
        AgentInput::Text(text) => {
            let item = oai_realtime::Item {
                r#type: Some(oai_realtime::ItemType::Message),
                role: Some(oai_realtime::ItemRole::User),
                content: Some(vec![oai_realtime::ItemContent {
                    r#type: oai_realtime::ItemContentType::InputText,
                    text: Some(text),
                    audio: None,
                    transcript: None,
                }]),
                id: None,
                status: None,
                call_id: None,
                name: None,
                arguments: None,
                output: None,
            };
            vec![conversation_item(item), response_create()]
        }
        AgentInput::Image { mime_type, .. } => {
            warn!(%mime_type, "OpenAI Realtime backend does not accept image input, dropping");
            vec![]
        }
        AgentInput::ToolResult(result) => {
            let item = oai_realtime::Item {
                r#type: Some(oai_realtime::ItemType::FunctionCallOutput),
                role: None,
                content: None,
                id: None,
                status: None,
                call_id: Some(result.id.clone()),
                name: None,
                arguments: None,
                output: Some(result.text()),
            };
            vec![conversation_item(item), response_create()]
        }
    }
}

#[async_trait]
impl RealtimeModel for OpenAIRealtimeModel {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn audio_config(&self) -> &AudioConfig {
        &self.audio
    }

    /// Runs the main loop for the OpenAI Realtime API connection.
    async fn run(
        self: Box<Self>,
        setup: SessionSetup,
        mut inputs: mpsc::Receiver<AgentInput>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let url = format!("{}?model={}", OPENAI_REALTIME_URL, self.config.model);
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.config.api_key.expose_secret()).parse()?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse()?);

        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to OpenAI Realtime WebSocket")?;
        let (mut openai_tx, mut openai_rx) = ws_stream.split();
        info!(model = %self.config.model, "Connected to OpenAI Realtime API.");

        let event = session_update(&self.config.model, &setup);
        openai_tx
            .send(WsMessage::Text(serde_json::to_string(&event)?.into()))
            .await?;

        let mut translator = EventTranslator::default();
        loop {
            tokio::select! {
                biased;
                // Input from the relay or the tool loop.
                maybe_input = inputs.recv() => {
                    let Some(input) = maybe_input else {
                        info!("Agent inputs closed, closing OpenAI connection.");
                        let _ = openai_tx.send(WsMessage::Close(None)).await;
                        return Ok(());
                    };
                    for event in client_events_for(input) {
                        openai_tx.send(WsMessage::Text(serde_json::to_string(&event)?.into())).await?;
                    }
                },
                // Output from the OpenAI server.
                maybe_msg = openai_rx.next() => {
                    match maybe_msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            let server_event = match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => event,
                                Err(e) => {
                                    debug!(error = %e, "Skipping unparseable OpenAI event");
                                    continue;
                                }
                            };
                            for event in translator.translate(server_event) {
                                if !emit(&events, event).await {
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(close_frame))) => {
                            info!(?close_frame, "OpenAI Realtime connection closed by server.");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e).context("Error reading from OpenAI Realtime WebSocket"),
                        None => anyhow::bail!("OpenAI Realtime WebSocket ended unexpectedly"),
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidi_core::{
        audio::AudioFrame,
        event::{ToolResult, ToolStatus},
        model::ToolSpec,
    };

    fn to_json(event: &OAIClientEvent) -> serde_json::Value {
        serde_json::to_value(event).unwrap()
    }

    #[test]
    fn test_session_update_carries_prompt_tools_and_voice() {
        let setup = SessionSetup {
            system_prompt: "Be brief.".into(),
            tools: vec![ToolSpec {
                name: "calculator".into(),
                description: "math".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            audio: AudioConfig::mono(24000, 24000, "shimmer"),
        };
        let json = to_json(&session_update(DEFAULT_MODEL, &setup));
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["instructions"], "Be brief.");
        assert_eq!(json["session"]["voice"], "shimmer");
        assert_eq!(json["session"]["tools"][0]["name"], "calculator");
        assert_eq!(json["session"]["tools"][0]["type"], "function");
    }

    #[test]
    fn test_audio_input_appends_to_buffer() {
        let frame = AudioFrame::new(vec![1, 2, 3], 24000);
        let events = client_events_for(AgentInput::Audio(frame.clone()));
        assert_eq!(events.len(), 1);
        let json = to_json(&events[0]);
        assert_eq!(json["type"], "input_audio_buffer.append");
        assert_eq!(json["audio"], audio::encode(&frame));
    }

    #[test]
    fn test_tool_result_is_sent_as_function_output_then_response() {
        let events = client_events_for(AgentInput::ToolResult(ToolResult {
            id: "call_1".into(),
            name: "calculator".into(),
            status: ToolStatus::Success,
            content: vec!["Result: 200".into()],
        }));
        assert_eq!(events.len(), 2);
        let item = to_json(&events[0]);
        assert_eq!(item["type"], "conversation.item.create");
        assert_eq!(item["item"]["type"], "function_call_output");
        assert_eq!(item["item"]["call_id"], "call_1");
        assert_eq!(item["item"]["output"], "Result: 200");
        assert_eq!(to_json(&events[1])["type"], "response.create");
    }

    #[test]
    fn test_image_input_is_dropped() {
        let events = client_events_for(AgentInput::Image {
            data: "AAAA".into(),
            mime_type: "image/png".into(),
        });
        assert!(events.is_empty());
    }

    #[test]
    fn test_unknown_voice_falls_back_to_alloy() {
        assert!(matches!(
            parse_voice("nobody"),
            oai_realtime::RealtimeVoice::Alloy
        ));
    }
}

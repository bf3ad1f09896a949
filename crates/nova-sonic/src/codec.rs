//! Nova Sonic event codec.
//!
//! Nova Sonic frames every message as `{"event": {"<name>": {...}}}`. Input
//! events are built here from agent inputs; output events are parsed and
//! translated into agent events. Nothing in this module touches the network.

use bidi_core::{
    audio::{self, NOVA_SONIC_PCM16_SAMPLE_RATE},
    event::{AgentEvent, AgentInput, ToolUse, TranscriptRole, Usage},
    model::SessionSetup,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_TOKENS: u32 = 1024;
const TOP_P: f32 = 0.9;
const TEMPERATURE: f32 = 0.7;

fn envelope(name: &str, body: Value) -> Value {
    let mut event = serde_json::Map::new();
    event.insert(name.to_string(), body);
    json!({ "event": event })
}

fn audio_media(sample_rate: u32) -> Value {
    json!({
        "mediaType": "audio/lpcm",
        "sampleRateHertz": sample_rate,
        "sampleSizeBits": 16,
        "channelCount": 1,
        "audioType": "SPEECH",
        "encoding": "base64",
    })
}

/// Input-side state for one Nova Sonic prompt.
///
/// A session carries one prompt. Microphone audio goes into a single
/// interactive audio content block opened with the prompt; text turns and tool
/// results each get their own short content block.
#[derive(Debug, Clone)]
pub struct PromptSession {
    prompt_name: String,
    audio_content_name: String,
    endpointing_sensitivity: String,
}

impl PromptSession {
    pub fn new(endpointing_sensitivity: impl Into<String>) -> Self {
        Self {
            prompt_name: Uuid::new_v4().to_string(),
            audio_content_name: Uuid::new_v4().to_string(),
            endpointing_sensitivity: endpointing_sensitivity.into(),
        }
    }

    pub fn prompt_name(&self) -> &str {
        &self.prompt_name
    }

    /// Events that open the session: configuration, system prompt and the audio input block.
    pub fn opening_events(&self, setup: &SessionSetup) -> Vec<Value> {
        let tools: Vec<Value> = setup
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpec": {
                        "name": tool.name,
                        "description": tool.description,
                        // Nova expects the schema as a JSON string.
                        "inputSchema": { "json": tool.input_schema.to_string() },
                    }
                })
            })
            .collect();

        let mut audio_output = audio_media(setup.audio.output_sample_rate);
        audio_output["voiceId"] = Value::String(setup.audio.voice.clone());

        let mut prompt_start = json!({
            "promptName": self.prompt_name,
            "textOutputConfiguration": { "mediaType": "text/plain" },
            "audioOutputConfiguration": audio_output,
        });
        if !tools.is_empty() {
            prompt_start["toolUseOutputConfiguration"] = json!({ "mediaType": "application/json" });
            prompt_start["toolConfiguration"] = json!({ "tools": tools });
        }

        let system_content = Uuid::new_v4().to_string();
        vec![
            envelope(
                "sessionStart",
                json!({
                    "inferenceConfiguration": {
                        "maxTokens": MAX_TOKENS,
                        "topP": TOP_P,
                        "temperature": TEMPERATURE,
                    },
                    "turnDetectionConfiguration": {
                        "endpointingSensitivity": self.endpointing_sensitivity,
                    },
                }),
            ),
            envelope("promptStart", prompt_start),
            self.content_start(
                &system_content,
                json!({
                    "type": "TEXT",
                    "interactive": false,
                    "role": "SYSTEM",
                    "textInputConfiguration": { "mediaType": "text/plain" },
                }),
            ),
            self.text_input(&system_content, &setup.system_prompt),
            self.content_end(&system_content),
            self.content_start(
                &self.audio_content_name,
                json!({
                    "type": "AUDIO",
                    "interactive": true,
                    "role": "USER",
                    "audioInputConfiguration": audio_media(setup.audio.input_sample_rate),
                }),
            ),
        ]
    }

    /// Events that deliver one agent input.
    pub fn events_for(&self, input: AgentInput) -> Vec<Value> {
        match input {
            AgentInput::Audio(frame) => vec![envelope(
                "audioInput",
                json!({
                    "promptName": self.prompt_name,
                    "contentName": self.audio_content_name,
                    "content": audio::encode(&frame),
                }),
            )],
            AgentInput::Text(text) => {
                let content = Uuid::new_v4().to_string();
                vec![
                    self.content_start(
                        &content,
                        json!({
                            "type": "TEXT",
                            "interactive": true,
                            "role": "USER",
                            "textInputConfiguration": { "mediaType": "text/plain" },
                        }),
                    ),
                    self.text_input(&content, &text),
                    self.content_end(&content),
                ]
            }
            AgentInput::Image { mime_type, .. } => {
                warn!(%mime_type, "Nova Sonic does not accept image input, dropping");
                vec![]
            }
            AgentInput::ToolResult(result) => {
                let content = Uuid::new_v4().to_string();
                let payload = json!({ "result": result.text(), "status": result.status });
                vec![
                    self.content_start(
                        &content,
                        json!({
                            "type": "TOOL",
                            "interactive": false,
                            "role": "TOOL",
                            "toolResultInputConfiguration": {
                                "toolUseId": result.id,
                                "type": "TEXT",
                                "textInputConfiguration": { "mediaType": "text/plain" },
                            },
                        }),
                    ),
                    envelope(
                        "toolResult",
                        json!({
                            "promptName": self.prompt_name,
                            "contentName": content,
                            "content": payload.to_string(),
                        }),
                    ),
                    self.content_end(&content),
                ]
            }
        }
    }

    /// Events that close the audio block, the prompt and the session.
    pub fn closing_events(&self) -> Vec<Value> {
        vec![
            self.content_end(&self.audio_content_name),
            envelope("promptEnd", json!({ "promptName": self.prompt_name })),
            envelope("sessionEnd", json!({})),
        ]
    }

    fn content_start(&self, content_name: &str, mut body: Value) -> Value {
        body["promptName"] = Value::String(self.prompt_name.clone());
        body["contentName"] = Value::String(content_name.to_string());
        envelope("contentStart", body)
    }

    fn text_input(&self, content_name: &str, text: &str) -> Value {
        envelope(
            "textInput",
            json!({
                "promptName": self.prompt_name,
                "contentName": content_name,
                "content": text,
            }),
        )
    }

    fn content_end(&self, content_name: &str) -> Value {
        envelope(
            "contentEnd",
            json!({ "promptName": self.prompt_name, "contentName": content_name }),
        )
    }
}

#[derive(Deserialize, Debug)]
struct OutputEnvelope {
    event: serde_json::Map<String, Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct ContentStart {
    role: String,
    r#type: String,
    additional_model_fields: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct ContentEnd {
    r#type: String,
    stop_reason: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct TextOutput {
    content: String,
    role: String,
}

#[derive(Deserialize, Debug)]
struct AudioOutput {
    content: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ToolUseOutput {
    tool_use_id: String,
    tool_name: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct UsageEvent {
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_tokens: u64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct AdditionalModelFields {
    generation_stage: String,
}

/// Translates Nova Sonic output events into agent events.
///
/// Transcripts come out as complete utterances, so every transcript is final.
/// Assistant text is reported once per utterance, from the final generation
/// stage; speculative previews are skipped.
#[derive(Debug, Default)]
pub struct OutputTranslator {
    text_role: Option<TranscriptRole>,
    speculative: bool,
    in_turn: bool,
    turns: u64,
    interrupted: bool,
}

impl OutputTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn response_id(&self) -> String {
        format!("turn-{}", self.turns)
    }

    fn start_turn(&mut self, events: &mut Vec<AgentEvent>) {
        if !self.in_turn {
            self.in_turn = true;
            self.interrupted = false;
            self.turns += 1;
            events.push(AgentEvent::ResponseStart {
                response_id: self.response_id(),
            });
        }
    }

    fn end_turn(&mut self, stop_reason: &str, events: &mut Vec<AgentEvent>) {
        if self.in_turn {
            self.in_turn = false;
            events.push(AgentEvent::ResponseComplete {
                response_id: self.response_id(),
                stop_reason: stop_reason.to_lowercase(),
            });
        }
    }

    fn interrupt(&mut self, events: &mut Vec<AgentEvent>) {
        if !self.interrupted {
            self.interrupted = true;
            events.push(AgentEvent::Interruption);
        }
    }

    /// Parses one raw output payload and translates it.
    pub fn translate_bytes(&mut self, bytes: &[u8]) -> Vec<AgentEvent> {
        match serde_json::from_slice::<OutputEnvelope>(bytes) {
            Ok(envelope) => self.translate(envelope.event),
            Err(e) => {
                debug!(error = %e, "Skipping unparseable Nova Sonic event");
                vec![]
            }
        }
    }

    fn translate(&mut self, event: serde_json::Map<String, Value>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        for (name, body) in event {
            match name.as_str() {
                "contentStart" => self.on_content_start(body, &mut events),
                "textOutput" => self.on_text_output(body, &mut events),
                "audioOutput" => match serde_json::from_value::<AudioOutput>(body) {
                    Ok(output) => {
                        match audio::decode(&output.content, NOVA_SONIC_PCM16_SAMPLE_RATE, audio::MONO) {
                            Ok(frame) => events.push(AgentEvent::Audio(frame)),
                            Err(e) => warn!(error = %e, "Dropping undecodable Nova Sonic audio"),
                        }
                    }
                    Err(e) => debug!(error = %e, "Malformed audioOutput"),
                },
                "toolUse" => match serde_json::from_value::<ToolUseOutput>(body) {
                    Ok(tool) => {
                        let input = serde_json::from_str(&tool.content)
                            .unwrap_or(Value::String(tool.content));
                        events.push(AgentEvent::ToolUse(ToolUse {
                            id: tool.tool_use_id,
                            name: tool.tool_name,
                            input,
                        }));
                    }
                    Err(e) => debug!(error = %e, "Malformed toolUse"),
                },
                "contentEnd" => {
                    let end: ContentEnd = serde_json::from_value(body).unwrap_or_default();
                    match end.stop_reason.as_str() {
                        "INTERRUPTED" => {
                            self.interrupt(&mut events);
                            self.end_turn(&end.stop_reason, &mut events);
                        }
                        "END_TURN" if end.r#type == "AUDIO" || end.r#type == "TEXT" => {
                            if !self.speculative {
                                self.end_turn(&end.stop_reason, &mut events);
                            }
                        }
                        _ => {}
                    }
                }
                "usageEvent" => {
                    let usage: UsageEvent = serde_json::from_value(body).unwrap_or_default();
                    events.push(AgentEvent::Usage(Usage {
                        input_tokens: usage.total_input_tokens,
                        output_tokens: usage.total_output_tokens,
                        total_tokens: usage.total_tokens,
                    }));
                }
                "completionEnd" => {
                    let reason = body
                        .get("stopReason")
                        .and_then(Value::as_str)
                        .unwrap_or("END_TURN")
                        .to_string();
                    self.end_turn(&reason, &mut events);
                }
                other => debug!(event = other, "Ignoring Nova Sonic event"),
            }
        }
        events
    }

    fn on_content_start(&mut self, body: Value, events: &mut Vec<AgentEvent>) {
        let start: ContentStart = serde_json::from_value(body).unwrap_or_default();
        let stage = start
            .additional_model_fields
            .as_deref()
            .and_then(|fields| serde_json::from_str::<AdditionalModelFields>(fields).ok())
            .map(|fields| fields.generation_stage)
            .unwrap_or_default();
        self.speculative = stage == "SPECULATIVE";

        if start.role == "ASSISTANT" {
            self.start_turn(events);
        }
        if start.r#type == "TEXT" {
            self.text_role = match start.role.as_str() {
                "USER" => Some(TranscriptRole::User),
                "ASSISTANT" => Some(TranscriptRole::Assistant),
                _ => None,
            };
        }
    }

    fn on_text_output(&mut self, body: Value, events: &mut Vec<AgentEvent>) {
        let output: TextOutput = serde_json::from_value(body).unwrap_or_default();

        // Barge-in arrives as a text block containing `{ "interrupted" : true }`.
        if let Ok(signal) = serde_json::from_str::<Value>(output.content.trim())
            && signal.get("interrupted").and_then(Value::as_bool) == Some(true)
        {
            self.interrupt(events);
            return;
        }

        let role = match output.role.as_str() {
            "USER" => Some(TranscriptRole::User),
            "ASSISTANT" => Some(TranscriptRole::Assistant),
            _ => self.text_role,
        };
        let Some(role) = role else {
            return;
        };
        if role == TranscriptRole::Assistant && self.speculative {
            return;
        }
        events.push(AgentEvent::Transcript {
            role,
            delta: output.content,
            is_final: true,
        });
    }
}

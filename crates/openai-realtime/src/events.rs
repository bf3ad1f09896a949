//! OpenAI Realtime server events and their translation into agent events.
//!
//! Only the events the relay acts on are modelled; everything else lands in
//! `ServerEvent::Other` and is ignored.

use bidi_core::{
    audio::{self, OPENAI_REALTIME_PCM16_SAMPLE_RATE},
    event::{AgentEvent, ToolUse, TranscriptRole, Usage},
};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::warn;

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub(crate) enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta { delta: String },
    #[serde(
        rename = "response.audio_transcript.delta",
        alias = "response.output_audio_transcript.delta"
    )]
    AudioTranscriptDelta { delta: String },
    #[serde(
        rename = "response.audio_transcript.done",
        alias = "response.output_audio_transcript.done"
    )]
    AudioTranscriptDone {},
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptionDelta { item_id: String, delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { item_id: String, transcript: String },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseInfo },
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Default)]
pub(crate) struct SessionInfo {
    pub model: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub(crate) struct ResponseInfo {
    pub id: Option<String>,
    pub status: Option<String>,
    pub usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub(crate) struct UsageInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ErrorDetail {
    pub message: String,
}

/// Stateful translation from OpenAI server events to agent events.
#[derive(Debug, Default)]
pub(crate) struct EventTranslator {
    /// Input items whose transcription arrived as deltas.
    streamed_items: HashSet<String>,
}

impl EventTranslator {
    pub(crate) fn translate(&mut self, event: ServerEvent) -> Vec<AgentEvent> {
        match event {
            ServerEvent::SessionCreated { session } => vec![AgentEvent::ConnectionStart {
                model: session.model.unwrap_or_default(),
            }],
            ServerEvent::ResponseCreated { response } => vec![AgentEvent::ResponseStart {
                response_id: response.id.unwrap_or_default(),
            }],
            ServerEvent::AudioDelta { delta } => {
                match audio::decode(&delta, OPENAI_REALTIME_PCM16_SAMPLE_RATE, audio::MONO) {
                    Ok(frame) => vec![AgentEvent::Audio(frame)],
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable OpenAI audio delta");
                        vec![]
                    }
                }
            }
            ServerEvent::AudioTranscriptDelta { delta } => vec![AgentEvent::Transcript {
                role: TranscriptRole::Assistant,
                delta,
                is_final: false,
            }],
            ServerEvent::AudioTranscriptDone {} => vec![AgentEvent::Transcript {
                role: TranscriptRole::Assistant,
                delta: String::new(),
                is_final: true,
            }],
            ServerEvent::InputTranscriptionDelta { item_id, delta } => {
                self.streamed_items.insert(item_id);
                vec![AgentEvent::Transcript {
                    role: TranscriptRole::User,
                    delta,
                    is_final: false,
                }]
            }
            ServerEvent::InputTranscriptionCompleted {
                item_id,
                transcript,
            } => {
                // Streamed items already delivered their text as deltas.
                let delta = if self.streamed_items.remove(&item_id) {
                    String::new()
                } else {
                    transcript
                };
                vec![AgentEvent::Transcript {
                    role: TranscriptRole::User,
                    delta,
                    is_final: true,
                }]
            }
            ServerEvent::SpeechStarted {} => vec![AgentEvent::Interruption],
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                let input = serde_json::from_str(&arguments)
                    .unwrap_or(serde_json::Value::String(arguments));
                vec![AgentEvent::ToolUse(ToolUse {
                    id: call_id,
                    name,
                    input,
                })]
            }
            ServerEvent::ResponseDone { response } => {
                let mut events = Vec::with_capacity(2);
                if let Some(usage) = response.usage {
                    events.push(AgentEvent::Usage(Usage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        total_tokens: usage.total_tokens,
                    }));
                }
                events.push(AgentEvent::ResponseComplete {
                    response_id: response.id.unwrap_or_default(),
                    stop_reason: response.status.unwrap_or_else(|| "completed".to_string()),
                });
                events
            }
            ServerEvent::Error { error } => vec![AgentEvent::Error(error.message)],
            ServerEvent::Other => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(translator: &mut EventTranslator, json: serde_json::Value) -> Vec<AgentEvent> {
        let event: ServerEvent = serde_json::from_value(json).unwrap();
        translator.translate(event)
    }

    #[test]
    fn test_unknown_events_are_ignored() {
        let mut t = EventTranslator::default();
        let events = translate(
            &mut t,
            serde_json::json!({"type": "rate_limits.updated", "rate_limits": []}),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_audio_delta_decodes_at_24khz() {
        let mut t = EventTranslator::default();
        let delta = audio::encode_i16(&[1, -1, 300]);
        let events = translate(
            &mut t,
            serde_json::json!({"type": "response.audio.delta", "delta": delta, "item_id": "i1"}),
        );
        match &events[..] {
            [AgentEvent::Audio(frame)] => {
                assert_eq!(frame.samples, vec![1, -1, 300]);
                assert_eq!(frame.sample_rate, 24000);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_ga_event_names_are_accepted() {
        let mut t = EventTranslator::default();
        let events = translate(
            &mut t,
            serde_json::json!({"type": "response.output_audio_transcript.delta", "delta": "Hi"}),
        );
        assert_eq!(
            events,
            vec![AgentEvent::Transcript {
                role: TranscriptRole::Assistant,
                delta: "Hi".into(),
                is_final: false
            }]
        );
    }

    #[test]
    fn test_completed_transcription_does_not_repeat_streamed_text() {
        let mut t = EventTranslator::default();
        translate(
            &mut t,
            serde_json::json!({"type": "conversation.item.input_audio_transcription.delta", "item_id": "a", "delta": "What is"}),
        );
        let events = translate(
            &mut t,
            serde_json::json!({"type": "conversation.item.input_audio_transcription.completed", "item_id": "a", "transcript": "What is"}),
        );
        assert_eq!(
            events,
            vec![AgentEvent::Transcript {
                role: TranscriptRole::User,
                delta: String::new(),
                is_final: true
            }]
        );

        let events = translate(
            &mut t,
            serde_json::json!({"type": "conversation.item.input_audio_transcription.completed", "item_id": "b", "transcript": "Thanks"}),
        );
        assert_eq!(
            events,
            vec![AgentEvent::Transcript {
                role: TranscriptRole::User,
                delta: "Thanks".into(),
                is_final: true
            }]
        );
    }

    #[test]
    fn test_function_call_becomes_tool_use() {
        let mut t = EventTranslator::default();
        let events = translate(
            &mut t,
            serde_json::json!({
                "type": "response.function_call_arguments.done",
                "call_id": "call_1",
                "name": "calculator",
                "arguments": "{\"expression\":\"25 * 8\"}"
            }),
        );
        assert_eq!(
            events,
            vec![AgentEvent::ToolUse(ToolUse {
                id: "call_1".into(),
                name: "calculator".into(),
                input: serde_json::json!({"expression": "25 * 8"}),
            })]
        );
    }

    #[test]
    fn test_response_done_reports_usage_then_completion() {
        let mut t = EventTranslator::default();
        let events = translate(
            &mut t,
            serde_json::json!({
                "type": "response.done",
                "response": {
                    "id": "resp_1",
                    "status": "cancelled",
                    "usage": {"total_tokens": 30, "input_tokens": 20, "output_tokens": 10}
                }
            }),
        );
        assert_eq!(
            events,
            vec![
                AgentEvent::Usage(Usage {
                    input_tokens: 20,
                    output_tokens: 10,
                    total_tokens: 30
                }),
                AgentEvent::ResponseComplete {
                    response_id: "resp_1".into(),
                    stop_reason: "cancelled".into()
                },
            ]
        );
    }

    #[test]
    fn test_speech_started_is_an_interruption() {
        let mut t = EventTranslator::default();
        let events = translate(
            &mut t,
            serde_json::json!({"type": "input_audio_buffer.speech_started", "audio_start_ms": 10, "item_id": "x"}),
        );
        assert_eq!(events, vec![AgentEvent::Interruption]);
    }
}

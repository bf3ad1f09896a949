use async_trait::async_trait;
use bidi_api::{
    bootstrap::{Backend, ModelAvailability, ModelFactory},
    config::Config,
    router::create_router,
    state::AppState,
};
use bidi_core::{
    RelayError,
    audio::{self, AudioConfig},
    event::{AgentEvent, AgentInput, ToolUse},
    model::{RealtimeModel, SessionSetup},
};
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, protocol::CloseFrame},
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Echoes audio back and turns text into a calculator call. "oops" reports a
/// recoverable error, "bye" ends the run and "fail" fails it.
struct Echo {
    audio: AudioConfig,
    dropped: Option<oneshot::Sender<()>>,
}

#[async_trait]
impl RealtimeModel for Echo {
    fn model_id(&self) -> &str {
        "echo"
    }

    fn audio_config(&self) -> &AudioConfig {
        &self.audio
    }

    async fn run(
        self: Box<Self>,
        _setup: SessionSetup,
        mut inputs: mpsc::Receiver<AgentInput>,
        events: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        let _guard = self.dropped;
        events
            .send(AgentEvent::ResponseStart {
                response_id: "r1".into(),
            })
            .await?;
        while let Some(input) = inputs.recv().await {
            match input {
                AgentInput::Audio(frame) => events.send(AgentEvent::Audio(frame)).await?,
                AgentInput::Text(text) if text == "fail" => anyhow::bail!("backend hung up"),
                AgentInput::Text(text) if text == "bye" => return Ok(()),
                AgentInput::Text(text) if text == "oops" => {
                    events
                        .send(AgentEvent::Error("no active response".into()))
                        .await?
                }
                AgentInput::Text(text) => {
                    events
                        .send(AgentEvent::ToolUse(ToolUse {
                            id: "t1".into(),
                            name: "calculator".into(),
                            input: json!({ "expression": text }),
                        }))
                        .await?
                }
                AgentInput::ToolResult(_) => {
                    events
                        .send(AgentEvent::ResponseComplete {
                            response_id: "r1".into(),
                            stop_reason: "complete".into(),
                        })
                        .await?
                }
                AgentInput::Image { .. } => {}
            }
        }
        Ok(())
    }
}

/// Serves `openai` with the echo model; every other backend is unavailable.
#[derive(Default)]
struct EchoFactory {
    dropped: Mutex<Option<oneshot::Sender<()>>>,
}

impl ModelFactory for EchoFactory {
    fn availability(&self) -> ModelAvailability {
        ModelAvailability {
            novasonic: false,
            gemini: false,
            openai: true,
        }
    }

    fn create(&self, backend: Backend) -> Result<Box<dyn RealtimeModel>, RelayError> {
        match backend {
            Backend::OpenAI => Ok(Box::new(Echo {
                audio: AudioConfig::mono(24000, 24000, "alloy"),
                dropped: self.dropped.lock().ok().and_then(|mut guard| guard.take()),
            })),
            other => Err(RelayError::BackendUnavailable(format!(
                "{other} requires {}",
                other.credential_hint()
            ))),
        }
    }
}

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        log_level: tracing::Level::DEBUG,
        system_prompt: "You are a test.".into(),
        outbound_queue_capacity: 64,
        transcript_idle: Duration::from_millis(200),
        openai_api_key: Some(SecretString::from("sk-test".to_string())),
        openai_model: "echo".into(),
        openai_voice: "alloy".into(),
        gemini_api_key: None,
        gemini_model: "models/test".into(),
        gemini_voice: "Puck".into(),
        aws_credentials_present: false,
        nova_sonic: nova_sonic::NovaSonicConfig::default(),
    }
}

async fn spawn_server(models: Arc<dyn ModelFactory>) -> SocketAddr {
    let state = Arc::new(AppState {
        config: Arc::new(test_config()),
        models,
    });
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    client
}

/// Reads the next JSON message, skipping pings.
async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text message, got {other:?}"),
        }
    }
}

/// Reads until the close frame, returning it with the message types seen on the way.
async fn read_until_close(client: &mut Client) -> (Option<CloseFrame>, Vec<String>) {
    let mut seen = vec![];
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                seen.push(value["type"].as_str().unwrap_or_default().to_string());
            }
            Some(Ok(Message::Close(frame))) => return (frame, seen),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return (None, seen),
        }
    }
}

#[tokio::test]
async fn test_audio_and_tool_events_reach_the_client_in_order() {
    let addr = spawn_server(Arc::new(EchoFactory::default())).await;
    let mut client = connect(addr, "/ws/openai?input_sample_rate=24000").await;

    let start = next_json(&mut client).await;
    assert_eq!(start["type"], "bidi_connection_start");
    assert_eq!(start["model"], "echo");
    assert_eq!(next_json(&mut client).await["type"], "bidi_response_start");

    let payloads: Vec<String> = (0..3i16)
        .map(|n| audio::encode_i16(&[n, n + 1, n + 2]))
        .collect();
    for payload in &payloads {
        let msg = json!({
            "type": "bidi_audio_input",
            "audio": payload,
            "format": "pcm",
            "sample_rate": 24000,
            "channels": 1
        });
        client.send(Message::text(msg.to_string())).await.unwrap();
    }
    for payload in &payloads {
        let msg = next_json(&mut client).await;
        assert_eq!(msg["type"], "bidi_audio_stream");
        assert_eq!(msg["audio"], payload.as_str());
        assert_eq!(msg["sample_rate"], 24000);
    }

    let text = json!({"type": "bidi_text_input", "text": "25 * 8", "role": "user"});
    client.send(Message::text(text.to_string())).await.unwrap();

    let tool_use = next_json(&mut client).await;
    assert_eq!(tool_use["type"], "tool_use_stream");
    assert_eq!(tool_use["current_tool_use"]["name"], "calculator");
    assert_eq!(tool_use["current_tool_use"]["toolUseId"], "t1");

    let tool_result = next_json(&mut client).await;
    assert_eq!(tool_result["type"], "tool_result");
    assert_eq!(tool_result["tool_result"]["toolUseId"], "t1");
    assert_eq!(tool_result["tool_result"]["status"], "success");
    assert_eq!(tool_result["tool_result"]["content"][0]["text"], "Result: 200");

    let complete = next_json(&mut client).await;
    assert_eq!(complete["type"], "bidi_response_complete");

    client.close(None).await.unwrap();
}

#[tokio::test]
async fn test_malformed_audio_does_not_end_the_session() {
    let addr = spawn_server(Arc::new(EchoFactory::default())).await;
    let mut client = connect(addr, "/ws/openai").await;
    assert_eq!(next_json(&mut client).await["type"], "bidi_connection_start");
    assert_eq!(next_json(&mut client).await["type"], "bidi_response_start");

    let bad = json!({"type": "bidi_audio_input", "audio": "%%%", "sample_rate": 24000});
    client.send(Message::text(bad.to_string())).await.unwrap();
    client.send(Message::text("not json")).await.unwrap();

    let good = audio::encode_i16(&[7, 8]);
    let msg = json!({"type": "bidi_audio_input", "audio": good, "sample_rate": 24000});
    client.send(Message::text(msg.to_string())).await.unwrap();

    let echoed = next_json(&mut client).await;
    assert_eq!(echoed["type"], "bidi_audio_stream");
    assert_eq!(echoed["audio"], good.as_str());
}

#[tokio::test]
async fn test_unknown_model_is_closed_with_1003() {
    let addr = spawn_server(Arc::new(EchoFactory::default())).await;
    let mut client = connect(addr, "/ws/claude").await;
    let (frame, seen) = read_until_close(&mut client).await;
    let frame = frame.expect("expected a close frame");
    assert_eq!(u16::from(frame.code), 1003);
    assert_eq!(frame.reason.as_str(), "Invalid model: claude");
    assert!(seen.is_empty());
}

#[tokio::test]
async fn test_mismatched_sample_rate_is_closed_with_1003() {
    let addr = spawn_server(Arc::new(EchoFactory::default())).await;
    let mut client = connect(addr, "/ws/openai?input_sample_rate=16000").await;
    let (frame, _) = read_until_close(&mut client).await;
    assert_eq!(u16::from(frame.expect("expected a close frame").code), 1003);
}

#[tokio::test]
async fn test_unavailable_backend_is_closed_with_1013() {
    let addr = spawn_server(Arc::new(EchoFactory::default())).await;
    let mut client = connect(addr, "/ws/gemini").await;
    let (frame, _) = read_until_close(&mut client).await;
    let frame = frame.expect("expected a close frame");
    assert_eq!(u16::from(frame.code), 1013);
    assert!(frame.reason.as_str().contains("GOOGLE_API_KEY"));
}

#[tokio::test]
async fn test_agent_failure_is_reported_and_closes_with_1011() {
    let addr = spawn_server(Arc::new(EchoFactory::default())).await;
    let mut client = connect(addr, "/ws/openai").await;
    let text = json!({"type": "bidi_text_input", "text": "fail"});
    client.send(Message::text(text.to_string())).await.unwrap();

    let (frame, seen) = read_until_close(&mut client).await;
    let frame = frame.expect("expected a close frame");
    assert_eq!(u16::from(frame.code), 1011);
    assert!(frame.reason.as_str().contains("backend hung up"));
    assert!(seen.iter().any(|t| t == "bidi_error"));
    assert_eq!(seen.last().map(String::as_str), Some("bidi_connection_close"));
}

#[tokio::test]
async fn test_recoverable_agent_error_then_clean_end_closes_normally() {
    let addr = spawn_server(Arc::new(EchoFactory::default())).await;
    let mut client = connect(addr, "/ws/openai").await;
    for text in ["oops", "bye"] {
        let msg = json!({"type": "bidi_text_input", "text": text});
        client.send(Message::text(msg.to_string())).await.unwrap();
    }

    let (frame, seen) = read_until_close(&mut client).await;
    let frame = frame.expect("expected a close frame");
    assert_eq!(u16::from(frame.code), 1000);
    assert_eq!(frame.reason.as_str(), "agent run ended");
    assert!(seen.iter().any(|t| t == "bidi_error"));
}

#[tokio::test]
async fn test_client_disconnect_cancels_the_agent_run() {
    let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
    let factory = EchoFactory {
        dropped: Mutex::new(Some(dropped_tx)),
    };
    let addr = spawn_server(Arc::new(factory)).await;
    let mut client = connect(addr, "/ws/openai").await;
    assert_eq!(next_json(&mut client).await["type"], "bidi_connection_start");

    client.close(None).await.unwrap();

    // The model's guard is dropped once its task is aborted.
    let dropped = timeout(Duration::from_secs(5), dropped_rx).await;
    assert!(matches!(dropped, Ok(Err(_))));
}

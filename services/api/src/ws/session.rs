//! Manages the WebSocket connection lifecycle for one relay session.
//!
//! Each connection runs three tasks: the inbound reader (socket to agent),
//! the event translator (agent events and the transcript timer to the
//! outbound queue) and the writer (outbound queue to socket). Whichever
//! finishes first ends the connection.

use super::{agent, outbound::OutboundQueue, protocol::ServerMessage, relay::Relay};
use crate::{bootstrap, state::AppState};
use anyhow::Result;
use axum::{
    extract::{
        Path, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use bidi_core::{RelayError, event::AgentEvent};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until, timeout},
};
use tracing::{Instrument, debug, error, info, instrument, warn};
use utoipa::IntoParams;
use uuid::Uuid;

const CLOSE_NORMAL: u16 = 1000;
/// How long queued messages may take to reach the client once the session ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type SocketSink = SplitSink<WebSocket, Message>;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ConnectParams {
    /// Capture rate of the client's microphone audio, checked against the backend.
    pub input_sample_rate: Option<u32>,
}

/// Why a session ended.
#[derive(Debug)]
enum Ending {
    ClientClosed,
    ClientError(String),
    AgentFinished,
    WriterFailed,
}

/// Opens a realtime voice session with the selected backend.
#[utoipa::path(
    get,
    path = "/ws/{model_name}",
    responses(
        (status = 101, description = "Switching to the relay WebSocket protocol"),
    ),
    params(
        ("model_name" = String, Path, description = "Backend to use: novasonic, gemini or openai"),
        ConnectParams
    )
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(model_name): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, model_name, params))
}

#[instrument(name = "ws_session", skip_all, fields(connection_id, model = %model_name))]
async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    model_name: String,
    params: ConnectParams,
) {
    let connection_id = Uuid::new_v4();
    tracing::Span::current().record("connection_id", tracing::field::display(connection_id));
    info!("New WebSocket connection.");

    let model = match bootstrap::bootstrap(
        state.models.as_ref(),
        &model_name,
        params.input_sample_rate,
    ) {
        Ok(model) => model,
        Err(e) => {
            warn!(error = %e, "Rejecting connection.");
            let _ = socket
                .send(close_message(e.close_code(), bootstrap::close_reason(&e)))
                .await;
            return;
        }
    };

    let audio = model.audio_config().clone();
    let transcript_mode = model.transcript_mode();
    let model_id = model.model_id().to_string();
    let (run, events) = match agent::start(model, state.config.system_prompt.clone()).await {
        Ok(started) => started,
        Err(e) => {
            error!("Failed to start agent run: {:?}", e);
            let err = RelayError::Transport(format!("{e:#}"));
            let _ = socket
                .send(close_message(err.close_code(), bootstrap::close_reason(&err)))
                .await;
            return;
        }
    };

    let outbound = Arc::new(OutboundQueue::new(state.config.outbound_queue_capacity));
    let relay = Arc::new(Relay::new(
        connection_id,
        model_id,
        &audio,
        transcript_mode,
        state.config.transcript_idle,
        run.inputs(),
        outbound.clone(),
    ));
    relay.start().await;

    let (socket_tx, socket_rx) = socket.split();
    let mut writer = tokio::spawn(write_outbound(socket_tx, outbound.clone()).in_current_span());
    let mut inbound = tokio::spawn(read_inbound(relay.clone(), socket_rx).in_current_span());
    let mut translator = tokio::spawn(translate_events(relay.clone(), events).in_current_span());

    let (ending, writer_finished) = tokio::select! {
        res = &mut inbound => {
            let ending = res.unwrap_or(Ending::ClientError("inbound task failed".into()));
            if matches!(ending, Ending::AgentFinished) {
                // Let the translator forward the agent's last events, including its error.
                let _ = timeout(DRAIN_TIMEOUT, &mut translator).await;
            }
            (ending, false)
        }
        _ = &mut translator => (Ending::AgentFinished, false),
        _ = &mut writer => (Ending::WriterFailed, true),
    };
    info!(?ending, "Ending session.");

    let (code, reason) = match &ending {
        Ending::ClientClosed | Ending::WriterFailed => (CLOSE_NORMAL, "client disconnected".to_string()),
        Ending::ClientError(message) => {
            let err = RelayError::Transport(message.clone());
            (err.close_code(), bootstrap::close_reason(&err))
        }
        Ending::AgentFinished => match run.failure() {
            Some(message) => {
                let err = RelayError::Transport(message);
                (err.close_code(), bootstrap::close_reason(&err))
            }
            None => (CLOSE_NORMAL, "agent run ended".to_string()),
        },
    };

    // The agent stops before the close message is queued.
    run.cancel();
    inbound.abort();
    translator.abort();
    relay.close(&reason).await;

    if writer_finished {
        return;
    }
    match timeout(DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(Some(mut sink))) => {
            if let Err(e) = sink.send(close_message(code, reason)).await {
                debug!("Could not send close frame: {}", e);
            }
        }
        Ok(_) => {}
        Err(_) => {
            let queued = outbound.queued().await;
            warn!(queued, "Client did not drain the outbound queue in time.");
            writer.abort();
        }
    }
    info!("WebSocket connection closed.");
}

/// Reads client frames until the client leaves or the agent stops listening.
async fn read_inbound(relay: Arc<Relay>, mut socket_rx: SplitStream<WebSocket>) -> Ending {
    while let Some(frame) = socket_rx.next().await {
        let result = match frame {
            Ok(Message::Text(text)) => relay.on_client_text(text.as_str()).await,
            Ok(Message::Binary(data)) => relay.on_client_binary(&data).await,
            Ok(Message::Close(_)) => {
                info!("Client sent close frame.");
                return Ending::ClientClosed;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => Ok(()),
            Err(e) => {
                error!("Error receiving from client WebSocket: {:?}", e);
                return Ending::ClientError(e.to_string());
            }
        };
        match result {
            Ok(()) => {}
            Err(e) if !e.is_fatal() => warn!(error = %e, "Dropping client frame."),
            Err(e) => {
                warn!(error = %e, "Agent no longer accepts input.");
                return Ending::AgentFinished;
            }
        }
    }
    Ending::ClientClosed
}

/// Turns agent events into outbound messages and flushes idle transcripts.
async fn translate_events(relay: Arc<Relay>, mut events: mpsc::Receiver<AgentEvent>) {
    loop {
        let deadline = relay.next_transcript_deadline().await;
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    debug!(kind = event.kind(), "Agent event.");
                    if !relay.on_agent_event(event, Instant::now()).await {
                        break;
                    }
                }
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                if !relay.flush_transcripts(Instant::now()).await {
                    break;
                }
            }
        }
    }
    debug!("Event translator finished.");
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

/// Sends queued messages in order. Hands the sink back once the queue is closed.
async fn write_outbound(mut socket_tx: SocketSink, outbound: Arc<OutboundQueue>) -> Option<SocketSink> {
    while let Some(msg) = outbound.pop().await {
        if let Err(e) = send_msg(&mut socket_tx, msg).await {
            warn!("Failed to write to client WebSocket: {:?}", e);
            return None;
        }
    }
    Some(socket_tx)
}

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(socket_tx: &mut SocketSink, msg: ServerMessage) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::TranscriptDelta;
    use bidi_core::{audio::AudioConfig, event::TranscriptRole, transcript::TranscriptMode};

    #[test]
    fn test_session_future_is_send() {
        fn assert_send<F: std::future::Future + Send>(
            _: impl Fn(WebSocket, Arc<AppState>, String, ConnectParams) -> F,
        ) {
        }
        assert_send(handle_socket);
    }

    #[tokio::test(start_paused = true)]
    async fn test_translator_flushes_transcript_after_idle_window() {
        let outbound = Arc::new(OutboundQueue::new(16));
        let (input_tx, _input_rx) = mpsc::channel(4);
        let relay = Arc::new(Relay::new(
            Uuid::new_v4(),
            "test",
            &AudioConfig::mono(16000, 24000, "v"),
            TranscriptMode::Coalesce,
            Duration::from_secs(1),
            input_tx,
            outbound.clone(),
        ));
        let (event_tx, event_rx) = mpsc::channel(8);
        let translator = tokio::spawn(translate_events(relay.clone(), event_rx));

        for delta in ["Hel", "lo ", "world"] {
            event_tx
                .send(AgentEvent::Transcript {
                    role: TranscriptRole::Assistant,
                    delta: delta.into(),
                    is_final: false,
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(outbound.queued().await, 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(outbound.queued().await, 1);
        assert_eq!(
            outbound.pop().await,
            Some(ServerMessage::TranscriptStream {
                delta: TranscriptDelta {
                    text: "Hello world".into()
                },
                text: "Hello world".into(),
                role: TranscriptRole::Assistant,
                is_final: false,
            })
        );

        drop(event_tx);
        translator.await.unwrap();
    }
}

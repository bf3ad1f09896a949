//! One agent run: the realtime model task plus the tool loop that serves its
//! tool calls through an in-process MCP client.

use anyhow::{Context, Result};
use bidi_core::{
    event::{AgentEvent, AgentInput, ToolResult, ToolStatus, ToolUse},
    model::{RealtimeModel, SessionSetup, ToolSpec},
    tools::Toolbox,
};
use rmcp::{
    ServiceExt,
    model::{CallToolRequestParam, RawContent},
    service::{RoleClient, RunningService},
};
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{Instrument, debug, error, info, warn};

const AGENT_CHANNEL_CAPACITY: usize = 64;

type ToolClient = RunningService<RoleClient, ()>;

/// Handle to a running agent. Cancelling (or dropping) it aborts every task
/// of the run, which also drops the backend connection.
pub struct AgentRun {
    inputs: mpsc::Sender<AgentInput>,
    tasks: Vec<JoinHandle<()>>,
    cancelled: AtomicBool,
    /// Set when the model task ends with an error.
    failure: Arc<OnceLock<String>>,
}

impl AgentRun {
    /// Sender for client input. Audio goes straight to the model task.
    pub fn inputs(&self) -> mpsc::Sender<AgentInput> {
        self.inputs.clone()
    }

    /// Aborts the run. Calling it again is a no-op.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        info!("Agent run cancelled.");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Why the model run failed, if it did. Error events the backend reported
    /// mid-session without ending the run are not failures.
    pub fn failure(&self) -> Option<String> {
        self.failure.get().cloned()
    }
}

impl Drop for AgentRun {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Starts the tool server, the model and the tool loop for one connection.
///
/// Returns the run handle and the stream of events for the relay.
pub async fn start(
    model: Box<dyn RealtimeModel>,
    system_prompt: String,
) -> Result<(AgentRun, mpsc::Receiver<AgentEvent>)> {
    let (server_transport, client_transport) = tokio::io::duplex(4096);

    // Spawn the tool server for this connection.
    let tool_server = tokio::spawn(
        async move {
            match Toolbox::new().serve(server_transport).await {
                Ok(service) => {
                    let _ = service.waiting().await;
                }
                Err(e) => error!("Tool server failed to start: {:?}", e),
            }
        }
        .in_current_span(),
    );
    let tool_client = match ().serve(client_transport).await {
        Ok(client) => client,
        Err(e) => {
            tool_server.abort();
            return Err(e).context("Failed to connect to the tool server");
        }
    };
    let tools = match tool_specs(&tool_client).await {
        Ok(tools) => tools,
        Err(e) => {
            tool_server.abort();
            return Err(e);
        }
    };

    let setup = SessionSetup {
        system_prompt,
        tools,
        audio: model.audio_config().clone(),
    };
    let (input_tx, input_rx) = mpsc::channel(AGENT_CHANNEL_CAPACITY);
    let (model_event_tx, model_event_rx) = mpsc::channel(AGENT_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(AGENT_CHANNEL_CAPACITY);

    let (result_tx, result_rx) = mpsc::unbounded_channel();

    let model_id = model.model_id().to_string();
    let error_tx = model_event_tx.clone();
    let failure = Arc::new(OnceLock::new());
    let model_failure = failure.clone();
    let model_task = tokio::spawn(
        async move {
            match model.run(setup, input_rx, model_event_tx).await {
                Ok(()) => info!(model = %model_id, "Model run finished."),
                Err(e) => {
                    error!(model = %model_id, "Model run failed: {:?}", e);
                    let message = format!("{e:#}");
                    let _ = model_failure.set(message.clone());
                    let _ = error_tx.send(AgentEvent::Error(message)).await;
                }
            }
        }
        .in_current_span(),
    );

    let tool_task =
        tokio::spawn(tool_loop(tool_client, model_event_rx, event_tx, result_tx).in_current_span());
    let result_task =
        tokio::spawn(forward_tool_results(result_rx, input_tx.clone()).in_current_span());

    let run = AgentRun {
        inputs: input_tx,
        tasks: vec![model_task, tool_task, result_task, tool_server],
        cancelled: AtomicBool::new(false),
        failure,
    };
    Ok((run, event_rx))
}

/// Lists the toolbox's tools in the shape realtime backends take.
async fn tool_specs(client: &ToolClient) -> Result<Vec<ToolSpec>> {
    client
        .list_all_tools()
        .await
        .context("Failed to list tools")?
        .into_iter()
        .map(|tool| {
            Ok(ToolSpec {
                name: tool.name.to_string(),
                description: tool.description.map(|d| d.into_owned()).unwrap_or_default(),
                input_schema: serde_json::to_value(&*tool.input_schema)?,
            })
        })
        .collect()
}

/// Forwards model events to the relay, executing tool calls one at a time.
///
/// Results go back to the model through `tool_results`, which never blocks,
/// so a full input queue cannot stall the model's event stream.
async fn tool_loop(
    tool_client: ToolClient,
    mut model_events: mpsc::Receiver<AgentEvent>,
    events: mpsc::Sender<AgentEvent>,
    tool_results: mpsc::UnboundedSender<ToolResult>,
) {
    while let Some(event) = model_events.recv().await {
        let AgentEvent::ToolUse(tool_use) = event else {
            if events.send(event).await.is_err() {
                break;
            }
            continue;
        };

        if events.send(AgentEvent::ToolUse(tool_use.clone())).await.is_err() {
            break;
        }
        let result = call_tool(&tool_client, &tool_use).await;
        if events.send(AgentEvent::ToolResult(result.clone())).await.is_err() {
            break;
        }
        if tool_results.send(result).is_err() {
            break;
        }
    }
    debug!("Tool loop finished.");
    let _ = tool_client.cancel().await;
}

/// Delivers tool results to the model in the order they were produced.
async fn forward_tool_results(
    mut results: mpsc::UnboundedReceiver<ToolResult>,
    inputs: mpsc::Sender<AgentInput>,
) {
    while let Some(result) = results.recv().await {
        if inputs.send(AgentInput::ToolResult(result)).await.is_err() {
            warn!("Model stopped before the tool result could be delivered.");
            break;
        }
    }
}

async fn call_tool(client: &ToolClient, tool_use: &ToolUse) -> ToolResult {
    let failed = |message: String| ToolResult {
        id: tool_use.id.clone(),
        name: tool_use.name.clone(),
        status: ToolStatus::Error,
        content: vec![message],
    };

    let arguments = match &tool_use.input {
        serde_json::Value::Object(map) => Some(map.clone()),
        serde_json::Value::Null => None,
        other => return failed(format!("Tool input must be a JSON object, got {other}")),
    };

    info!(tool = %tool_use.name, id = %tool_use.id, "Executing tool call.");
    match client
        .peer()
        .call_tool(CallToolRequestParam {
            name: tool_use.name.clone().into(),
            arguments,
        })
        .await
    {
        Ok(result) => {
            let content = result
                .content
                .unwrap_or_default()
                .into_iter()
                .filter_map(|content| match content.raw {
                    RawContent::Text(text_content) => Some(text_content.text),
                    _ => None,
                })
                .collect();
            let status = if result.is_error == Some(true) {
                ToolStatus::Error
            } else {
                ToolStatus::Success
            };
            ToolResult {
                id: tool_use.id.clone(),
                name: tool_use.name.clone(),
                status,
                content,
            }
        }
        Err(e) => {
            warn!(tool = %tool_use.name, "Tool call failed: {}", e);
            failed(format!("Tool call failed: {e}"))
        }
    }
}

//! Bedrock bidirectional stream transport for Nova Sonic.

use crate::{
    NovaSonicConfig,
    codec::{OutputTranslator, PromptSession},
};
use anyhow::{Context, Result, anyhow};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_bedrockruntime::{
    Client as BedrockClient,
    types::{
        BidirectionalInputPayloadPart, InvokeModelWithBidirectionalStreamInput,
        InvokeModelWithBidirectionalStreamOutput,
        error::InvokeModelWithBidirectionalStreamInputError,
    },
};
use aws_smithy_types::Blob;
use bidi_core::{
    event::{AgentEvent, AgentInput},
    model::{SessionSetup, emit},
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capacity of the queue of serialized events waiting for the request stream.
const REQUEST_QUEUE_CAPACITY: usize = 256;

fn chunk(event: &Value) -> InvokeModelWithBidirectionalStreamInput {
    InvokeModelWithBidirectionalStreamInput::Chunk(
        BidirectionalInputPayloadPart::builder()
            .bytes(Blob::new(event.to_string().into_bytes()))
            .build(),
    )
}

pub(crate) async fn run(
    config: &NovaSonicConfig,
    setup: SessionSetup,
    mut inputs: mpsc::Receiver<AgentInput>,
    events: mpsc::Sender<AgentEvent>,
) -> Result<()> {
    // Credentials come from the default chain: env vars, profile or role.
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .load()
        .await;
    let client = BedrockClient::new(&sdk_config);

    let session = PromptSession::new(config.endpointing_sensitivity.clone());
    let (request_tx, mut request_rx) = mpsc::channel::<Value>(REQUEST_QUEUE_CAPACITY);
    for event in session.opening_events(&setup) {
        request_tx
            .send(event)
            .await
            .context("Nova Sonic request queue closed before start")?;
    }

    let request_stream = async_stream::stream! {
        while let Some(event) = request_rx.recv().await {
            yield Ok::<_, InvokeModelWithBidirectionalStreamInputError>(chunk(&event));
        }
    };

    let mut output = client
        .invoke_model_with_bidirectional_stream()
        .model_id(&config.model_id)
        .body(request_stream.into())
        .send()
        .await
        .map_err(|e| anyhow!("Failed to open Nova Sonic stream: {e}"))?;
    info!(model = %config.model_id, region = %config.region, "Connected to Nova Sonic.");

    if !emit(
        &events,
        AgentEvent::ConnectionStart {
            model: config.model_id.clone(),
        },
    )
    .await
    {
        return Ok(());
    }

    let mut translator = OutputTranslator::new();
    loop {
        tokio::select! {
            maybe_input = inputs.recv() => {
                let Some(input) = maybe_input else {
                    info!("Agent inputs closed, ending Nova Sonic session.");
                    for event in session.closing_events() {
                        if request_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    return Ok(());
                };
                for event in session.events_for(input) {
                    request_tx
                        .send(event)
                        .await
                        .context("Nova Sonic request stream closed")?;
                }
            },
            received = output.body.recv() => {
                match received {
                    Ok(Some(InvokeModelWithBidirectionalStreamOutput::Chunk(part))) => {
                        let Some(bytes) = part.bytes() else {
                            continue;
                        };
                        for event in translator.translate_bytes(bytes.as_ref()) {
                            if !emit(&events, event).await {
                                return Ok(());
                            }
                        }
                    }
                    Ok(Some(other)) => debug!(?other, "Ignoring non-chunk Nova Sonic output"),
                    Ok(None) => {
                        info!("Nova Sonic stream ended.");
                        return Ok(());
                    }
                    Err(e) => return Err(anyhow!("Nova Sonic stream error: {e}")),
                }
            },
        }
    }
}

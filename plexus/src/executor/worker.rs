// Child side of the process-pool protocol.
//
// A worker subprocess registers the same plugins as its parent, then serves
// length-delimited MessagePack frames on stdin/stdout: one request in, one
// reply out. The parent guarantees a single in-flight call per worker, so
// the loop never multiplexes.

use std::collections::HashMap;
use std::sync::Arc;

use callscript::Value;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

use crate::context::{CallContext, LocalEffects};
use crate::errors::{PlexusError, PlexusResult};
use crate::registry::{Handler, PluginRegistry, Scope};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCall {
    pub request_id: String,
    pub plugin_name: String,
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
    pub state: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerFailure>,
    pub state: HashMap<String, Value>,
}

/// Serve loop for a worker-mode process. Register functions first, then
/// hand control here; returns when the parent closes stdin.
pub async fn run_worker(registry: Arc<PluginRegistry>) -> PlexusResult<()> {
    registry.mark_started();
    let mut reader = FramedRead::new(tokio::io::stdin(), LengthDelimitedCodec::new());
    let mut writer = FramedWrite::new(tokio::io::stdout(), LengthDelimitedCodec::new());

    while let Some(frame) = reader.next().await {
        let frame = frame?;
        let call: WorkerCall =
            rmp_serde::from_slice(&frame).map_err(|e| PlexusError::Codec(e.to_string()))?;
        debug!("worker serving '{}' ({})", call.function, call.request_id);
        let reply = serve_call(&registry, call).await;
        let bytes =
            rmp_serde::to_vec_named(&reply).map_err(|e| PlexusError::Codec(e.to_string()))?;
        writer.send(bytes.into()).await?;
    }
    Ok(())
}

async fn serve_call(registry: &Arc<PluginRegistry>, call: WorkerCall) -> WorkerReply {
    let ctx = CallContext::new(
        call.request_id.clone(),
        "worker",
        Scope::all(),
        false,
        0,
        call.state,
        Arc::new(LocalEffects),
    );

    let outcome = match registry.resolve(&call.function, Some(&call.plugin_name)) {
        Err(err) => Err(err),
        Ok(entry) => match entry.handler {
            Some(Handler::Sync(handler)) => handler(ctx.clone(), call.args, call.kwargs),
            Some(Handler::Async(handler)) => handler(ctx.clone(), call.args, call.kwargs).await,
            None => Err(PlexusError::Internal(format!(
                "'{}' has no local handler in this worker",
                call.function
            ))),
        },
    };

    let state = ctx.state_snapshot();
    match outcome {
        Ok(value) => WorkerReply {
            request_id: call.request_id,
            result: Some(value),
            error: None,
            state,
        },
        Err(err) => WorkerReply {
            request_id: call.request_id,
            result: None,
            error: Some(WorkerFailure {
                kind: err.kind_name().to_string(),
                message: err.to_string(),
            }),
            state,
        },
    }
}

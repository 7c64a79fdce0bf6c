//! `really worker`: the demo worker started by the pool

use anyhow::{Context, Result};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

use really_ipc::{GenericPayload, HandlerError};
use really_runtime::{worker_main, WorkerIdentity};

/// Serve jobs until the pool goes away
pub async fn run_worker() -> Result<()> {
    really_logging::init_worker_logging()?;
    worker_main(handle_job)
        .await
        .context("Worker stopped with an error")
}

/// Execute one demo job.
///
/// `action` selects the workload; every successful job answers with the
/// worker id and the reversed `message`.
pub async fn handle_job(
    payload: GenericPayload,
    identity: WorkerIdentity,
) -> Result<JsonValue, HandlerError> {
    match payload.get_str("action").unwrap_or("reverse") {
        "reverse" => {}
        "sleep" => {
            let ms = payload.get_u64("duration_ms").unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        "fail" => {
            return Err(HandlerError::with_details(
                format!("worker {} was asked to fail", identity.id),
                payload.get("message").cloned().unwrap_or(JsonValue::Null),
            ));
        }
        "panic" => panic!("worker {} was asked to panic", identity.id),
        other => return Err(HandlerError::failed(format!("unknown action: {}", other))),
    }

    let message = payload
        .get_str("message")
        .ok_or_else(|| HandlerError::failed("payload has no message"))?;

    Ok(json!({
        "worker": identity.id,
        "response": message.chars().rev().collect::<String>(),
    }))
}

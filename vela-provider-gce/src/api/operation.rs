//! Waiting on async operations
//!
//! Every mutating call returns an operation handle that moves through
//! PENDING/RUNNING to DONE. Completion is not success: a DONE operation can
//! carry an error payload, which is folded into the returned error along
//! with the caller's description of what was being attempted.

use std::time::Duration;

use vela_core::provider::{ProviderError, ProviderResult};

use super::client::ComputeApi;
use super::types::Operation;
use crate::util::name_from_self_link;

/// Delay between polls of an operation that is not yet DONE
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Wait for `op` to reach DONE, polling the endpoint matching its scope
///
/// `what` describes the operation for error messages (e.g. "Creating Disk").
pub async fn wait_for_operation(
    api: &dyn ComputeApi,
    project: &str,
    op: Operation,
    what: &str,
    timeout: Duration,
) -> ProviderResult<()> {
    let max_attempts = (timeout.as_secs() / POLL_INTERVAL.as_secs()).max(1);

    let mut op = op;
    for _ in 0..max_attempts {
        if op.is_done() {
            return finished(op, what);
        }

        tokio::time::sleep(POLL_INTERVAL).await;
        op = refresh(api, project, &op)
            .await
            .map_err(|e| ProviderError::remote(what, e))?;
    }

    if op.is_done() {
        return finished(op, what);
    }

    Err(ProviderError::remote(
        what,
        format!("operation {} timed out after {:?}", op.name, timeout),
    ))
}

/// Fold a DONE operation's error payload, if any, into a result
fn finished(op: Operation, what: &str) -> ProviderResult<()> {
    match op.error {
        None => Ok(()),
        Some(error) => {
            let messages: Vec<String> = error
                .errors
                .iter()
                .map(|e| {
                    if e.code.is_empty() {
                        e.message.clone()
                    } else {
                        format!("{}: {}", e.code, e.message)
                    }
                })
                .collect();
            let detail = if messages.is_empty() {
                op.status_message
                    .unwrap_or_else(|| "operation failed".to_string())
            } else {
                messages.join("; ")
            };
            Err(ProviderError::remote(what, detail))
        }
    }
}

/// Re-fetch the operation through the endpoint matching its scope
async fn refresh(
    api: &dyn ComputeApi,
    project: &str,
    op: &Operation,
) -> Result<Operation, super::client::ApiError> {
    if let Some(zone) = &op.zone {
        api.get_zone_operation(project, name_from_self_link(zone), &op.name)
            .await
    } else if let Some(region) = &op.region {
        api.get_region_operation(project, name_from_self_link(region), &op.name)
            .await
    } else {
        api.get_global_operation(project, &op.name).await
    }
}

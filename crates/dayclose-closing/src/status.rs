use dayclose_core::ClosingDate;
use dayclose_engine::{InvocationStatus, Runtime};
use tracing::warn;

use crate::collaborators::MetricsBackend;
use crate::error::Result;
use crate::types::{ClosingResult, ClosingStatus, ClosingStep, WorkflowState};
use crate::workflow::{SERVICE, STATE_NAME};

/// Read-only status of the closing instance for `date`.
///
/// Reads the persisted snapshot and, when a metrics run id is known, asks the
/// metrics backend for live progress. Nothing is journaled, so the answer is
/// fresh on every call, including while the instance is parked in a sleep.
pub async fn status(
    runtime: &Runtime,
    metrics: &dyn MetricsBackend,
    date: &ClosingDate,
) -> Result<ClosingStatus> {
    let key = date.format();
    let state: Option<WorkflowState> = runtime.state(SERVICE, &key, STATE_NAME)?;
    let invocation = runtime.invocation(SERVICE, &key)?;

    let metrics_progress = match state.as_ref().and_then(|s| s.metrics_run_id) {
        Some(run_id) => match metrics.get_metrics_progress(run_id).await {
            Ok(progress) => progress,
            Err(e) => {
                warn!(%run_id, "could not fetch metrics progress: {e}");
                None
            }
        },
        None => None,
    };

    let result = invocation
        .as_ref()
        .filter(|inv| inv.status == InvocationStatus::Completed)
        .and_then(|inv| inv.output.clone())
        .and_then(|output| serde_json::from_value::<ClosingResult>(output).ok());

    Ok(ClosingStatus {
        workflow_id: key,
        current_step: state
            .as_ref()
            .map_or(ClosingStep::Idle, |s| s.current_step),
        state,
        invocation_status: invocation.as_ref().map(|inv| inv.status),
        wake_at: invocation.as_ref().and_then(|inv| inv.wake_at),
        result,
        metrics_progress,
    })
}

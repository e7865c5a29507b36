use tracing::info;

use super::command::ControlCommand;
use super::registry::ControlRegistry;
use crate::error::ControlError;
use crate::session::RunId;

/// Body of a control-plane request, e.g. `{"run_id": "run_7", "command": "PAUSE"}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SteerRequest {
    pub run_id: String,
    #[serde(default)]
    pub command: Option<String>,
}

/// Acknowledgement returned to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SteerResponse {
    pub status: String,
    /// The command string as received, before fail-open parsing.
    pub received: String,
    pub applied: ControlCommand,
}

/// Handle a JSON control request and write the command to the run's channel.
///
/// A missing command means `PROCEED`; an unknown one is applied as `PROCEED`
/// but echoed back verbatim.
pub fn handle_steer(registry: &ControlRegistry, body: &str) -> Result<SteerResponse, ControlError> {
    let request: SteerRequest = serde_json::from_str(body)?;
    let run_id = RunId::new(request.run_id.as_str())
        .map_err(|_| ControlError::InvalidRunId(request.run_id.clone()))?;

    let received = request
        .command
        .unwrap_or_else(|| ControlCommand::Proceed.as_str().to_string());
    let applied = ControlCommand::parse_lossy(&received);
    registry.send(&run_id, applied);

    info!(run_id = %run_id, command = %received, "Control signal received");

    Ok(SteerResponse {
        status: "success".to_string(),
        received,
        applied,
    })
}

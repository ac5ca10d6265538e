//! Controller-side and liveness stages.

use super::{ExecCtx, StageFault, StageOutcome, malformed};
use crate::executor::FailureReason;
use nodeinit_shared::{FunctionId, RequestFrame};

/// Minimum protocol info: capabilities, security, reserved, basic class.
const PROTOCOL_INFO_LEN: usize = 4;

pub(crate) async fn empty_node(ctx: &ExecCtx<'_>) -> StageOutcome {
    if !ctx.node_id().is_assignable() {
        return Err(StageFault::Permanent(FailureReason::NodeRejected(format!(
            "node id {} is reserved",
            ctx.node_id()
        ))));
    }
    Ok(None)
}

pub(crate) async fn protocol_info(ctx: &ExecCtx<'_>) -> StageOutcome {
    let response = ctx
        .request(RequestFrame::new(FunctionId::ProtocolInfo))
        .await?;

    if response.payload.len() < PROTOCOL_INFO_LEN {
        return Err(malformed(format!(
            "protocol info too short: {} bytes",
            response.payload.len()
        )));
    }
    Ok(Some(response.payload))
}

/// Ask the controller whether it has flagged the node as failed. A flagged
/// node is retried; the controller clears the flag once the node answers.
pub(crate) async fn failed_check(ctx: &ExecCtx<'_>) -> StageOutcome {
    let response = ctx
        .request(RequestFrame::new(FunctionId::IsFailedNode))
        .await?;

    match response.status() {
        Some(0) => Ok(None),
        Some(_) => Err(StageFault::Retryable(FailureReason::ControllerMarkedFailed)),
        None => Err(malformed("empty failed-node response")),
    }
}

pub(crate) async fn ping(ctx: &ExecCtx<'_>) -> StageOutcome {
    ctx.request(RequestFrame::new(FunctionId::NoOperation))
        .await?;
    Ok(None)
}

/// Phase markers carry no traffic.
pub(crate) async fn marker(_ctx: &ExecCtx<'_>) -> StageOutcome {
    Ok(None)
}

//! Association discovery and lifeline setup.

use super::{ExecCtx, StageFault, StageOutcome, decode_nodes, encode_node, malformed};
use crate::executor::FailureReason;
use nodeinit_shared::frame::command_class;
use nodeinit_shared::{FunctionId, RequestFrame};

/// Group 1 reports unsolicited state changes to the controller.
const LIFELINE_GROUP: u8 = 1;

pub(crate) async fn associations(ctx: &ExecCtx<'_>) -> StageOutcome {
    if !ctx.supports(command_class::ASSOCIATION)? {
        return Ok(Some(vec![0]));
    }

    let response = ctx
        .request(RequestFrame::new(FunctionId::AssociationGroupingsGet))
        .await?;

    match response.status() {
        Some(_) => Ok(Some(response.payload)),
        None => Err(malformed("empty association groupings report")),
    }
}

/// Point the lifeline group at the controller.
///
/// Reads the group first and only sends `AssociationSet` when the controller
/// is missing, so a retry after a lost confirmation does not set it twice.
pub(crate) async fn set_lifeline(ctx: &ExecCtx<'_>) -> StageOutcome {
    if !ctx.supports(command_class::ASSOCIATION)? {
        return Ok(None);
    }

    if lifeline_present(ctx).await? {
        tracing::debug!(node_id = %ctx.node_id(), "Lifeline already set");
        return Ok(None);
    }

    let mut payload = vec![LIFELINE_GROUP];
    payload.extend_from_slice(&encode_node(ctx.controller_id));
    ctx.request(RequestFrame::with_payload(FunctionId::AssociationSet, payload))
        .await?;

    if lifeline_present(ctx).await? {
        tracing::info!(node_id = %ctx.node_id(), controller = %ctx.controller_id, "Lifeline set");
        Ok(None)
    } else {
        Err(StageFault::Retryable(FailureReason::Unconfirmed(format!(
            "group {} does not contain controller {}",
            LIFELINE_GROUP, ctx.controller_id
        ))))
    }
}

async fn lifeline_present(ctx: &ExecCtx<'_>) -> Result<bool, StageFault> {
    let response = ctx
        .request(RequestFrame::with_payload(
            FunctionId::AssociationGet,
            vec![LIFELINE_GROUP],
        ))
        .await?;
    let members = decode_nodes(&response.payload)?;
    Ok(members.contains(&ctx.controller_id))
}

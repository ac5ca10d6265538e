//! Dynamic stages re-run every session and on every heal.

use super::{ExecCtx, StageOutcome, decode_nodes, encode_node};
use nodeinit_shared::{FunctionId, RequestFrame};

pub(crate) async fn dynamic_values(ctx: &ExecCtx<'_>) -> StageOutcome {
    let response = ctx.request(RequestFrame::new(FunctionId::ValuesGet)).await?;
    Ok(Some(response.payload))
}

pub(crate) async fn delete_routes(ctx: &ExecCtx<'_>) -> StageOutcome {
    ctx.request(RequestFrame::new(FunctionId::DeleteReturnRoutes))
        .await?;
    Ok(None)
}

pub(crate) async fn return_routes(ctx: &ExecCtx<'_>) -> StageOutcome {
    ctx.request(RequestFrame::with_payload(
        FunctionId::AssignReturnRoute,
        encode_node(ctx.controller_id),
    ))
    .await?;
    Ok(None)
}

/// Ask the node to rediscover its neighbours and capture the new list.
pub(crate) async fn neighbors(ctx: &ExecCtx<'_>) -> StageOutcome {
    let response = ctx
        .request(RequestFrame::new(FunctionId::NeighborUpdate))
        .await?;
    let neighbors = decode_nodes(&response.payload)?;
    tracing::debug!(node_id = %ctx.node_id(), count = neighbors.len(), "Neighbor update complete");
    Ok(Some(response.payload))
}

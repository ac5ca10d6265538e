//! Static discovery stages. Results are persisted and skipped on resume.

use super::{ExecCtx, StageOutcome, malformed};
use crate::catalog::Stage;
use nodeinit_shared::frame::command_class;
use nodeinit_shared::{FunctionId, RequestFrame};

/// Manufacturer id, product type, product id: two bytes each.
const MANUFACTURER_LEN: usize = 6;

/// Node information frame: the list of supported command classes.
pub(crate) async fn details(ctx: &ExecCtx<'_>) -> StageOutcome {
    let response = ctx.request(RequestFrame::new(FunctionId::NodeInfo)).await?;

    if response.payload.is_empty() {
        return Err(malformed("node info lists no command classes"));
    }
    Ok(Some(response.payload))
}

pub(crate) async fn security_report(ctx: &ExecCtx<'_>) -> StageOutcome {
    if !ctx.supports(command_class::SECURITY)? {
        return Ok(Some(Vec::new()));
    }

    let response = ctx
        .request(RequestFrame::new(FunctionId::SecurityCommandsGet))
        .await?;
    Ok(Some(response.payload))
}

pub(crate) async fn manufacturer(ctx: &ExecCtx<'_>) -> StageOutcome {
    let response = ctx
        .request(RequestFrame::new(FunctionId::ManufacturerSpecificGet))
        .await?;

    if response.payload.len() != MANUFACTURER_LEN {
        return Err(malformed(format!(
            "manufacturer report has {} bytes, expected {}",
            response.payload.len(),
            MANUFACTURER_LEN
        )));
    }
    Ok(Some(response.payload))
}

/// Version query keyed by the device identity captured in `Manufacturer`.
pub(crate) async fn version(ctx: &ExecCtx<'_>) -> StageOutcome {
    let identity = ctx.prerequisite(Stage::Manufacturer)?.to_vec();

    if !ctx.supports(command_class::VERSION)? {
        return Ok(Some(Vec::new()));
    }

    let response = ctx
        .request(RequestFrame::with_payload(FunctionId::VersionGet, identity))
        .await?;

    if response.payload.is_empty() {
        return Err(malformed("empty version report"));
    }
    Ok(Some(response.payload))
}

pub(crate) async fn endpoints(ctx: &ExecCtx<'_>) -> StageOutcome {
    if !ctx.supports(command_class::MULTI_CHANNEL)? {
        // Single-endpoint device
        return Ok(Some(vec![0]));
    }

    let response = ctx
        .request(RequestFrame::new(FunctionId::MultiChannelEndpointGet))
        .await?;

    match response.status() {
        Some(_) => Ok(Some(response.payload)),
        None => Err(malformed("empty endpoint report")),
    }
}

pub(crate) async fn configuration(ctx: &ExecCtx<'_>) -> StageOutcome {
    if !ctx.supports(command_class::CONFIGURATION)? {
        return Ok(Some(Vec::new()));
    }

    let response = ctx
        .request(RequestFrame::new(FunctionId::ConfigurationGet))
        .await?;
    Ok(Some(response.payload))
}

//! Per-stage executor functions, grouped by concern.
//!
//! Every function takes an [`ExecCtx`] and returns a [`StageOutcome`], so
//! transport errors propagate with `?` and are classified in one place.

pub(super) mod association;
pub(super) mod discovery;
pub(super) mod protocol;
pub(super) mod routing;

use super::{ExecutionResult, FailureReason};
use crate::catalog::Stage;
use crate::session::NodeSession;
use crate::transport::NodeTransport;
use nodeinit_shared::{NodeId, RequestFrame, ResponseFrame, TransportError};
use std::time::Duration;

/// Headroom on top of the transport's own timeout before the executor gives
/// up on a transport that ignores it.
const TRANSPORT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub(crate) enum StageFault {
    Retryable(FailureReason),
    Permanent(FailureReason),
    Busy(FailureReason),
}

/// Captured data on success.
pub(crate) type StageOutcome = Result<Option<Vec<u8>>, StageFault>;

impl From<StageOutcome> for ExecutionResult {
    fn from(outcome: StageOutcome) -> Self {
        match outcome {
            Ok(captured) => ExecutionResult::Success(captured),
            Err(StageFault::Retryable(reason)) => ExecutionResult::Retryable(reason),
            Err(StageFault::Permanent(reason)) => ExecutionResult::PermanentFailure(reason),
            Err(StageFault::Busy(reason)) => ExecutionResult::Timeout(reason),
        }
    }
}

fn classify(err: TransportError) -> StageFault {
    match err {
        TransportError::NoResponse { timeout_ms } => {
            StageFault::Retryable(FailureReason::TransportTimeout { timeout_ms })
        }
        TransportError::Malformed(detail) => {
            StageFault::Retryable(FailureReason::MalformedResponse(detail))
        }
        TransportError::Busy => StageFault::Busy(FailureReason::NodeBusy),
        TransportError::Rejected(detail) => {
            StageFault::Permanent(FailureReason::NodeRejected(detail))
        }
    }
}

pub(crate) fn malformed(detail: impl Into<String>) -> StageFault {
    StageFault::Retryable(FailureReason::MalformedResponse(detail.into()))
}

pub(crate) struct ExecCtx<'a> {
    pub transport: &'a dyn NodeTransport,
    pub session: &'a NodeSession,
    pub controller_id: NodeId,
    pub timeout: Duration,
}

impl ExecCtx<'_> {
    pub fn node_id(&self) -> NodeId {
        self.session.node_id()
    }

    /// Send one request and validate that the response answers it.
    pub async fn request(&self, request: RequestFrame) -> Result<ResponseFrame, StageFault> {
        let node_id = self.node_id();
        let function = request.function;
        let timeout_ms = self.timeout.as_millis() as u64;

        tracing::trace!(node_id = %node_id, request = %request, "Sending request");

        let sent = self.transport.send(node_id, request, self.timeout);
        let response = match tokio::time::timeout(self.timeout + TRANSPORT_GRACE, sent).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                tracing::debug!(node_id = %node_id, function = %function, error = %err, "Request failed");
                return Err(classify(err));
            }
            Err(_) => {
                tracing::debug!(node_id = %node_id, function = %function, "Transport overran its timeout");
                return Err(StageFault::Retryable(FailureReason::TransportTimeout {
                    timeout_ms,
                }));
            }
        };

        if response.function != function {
            return Err(malformed(format!(
                "expected {} response, got {}",
                function, response.function
            )));
        }

        tracing::trace!(node_id = %node_id, response = %response, "Received response");
        Ok(response)
    }

    /// Stored result of an earlier static stage.
    pub fn prerequisite(&self, stage: Stage) -> Result<&[u8], StageFault> {
        self.session.static_result(stage).ok_or_else(|| {
            StageFault::Permanent(FailureReason::MissingPrerequisite(format!(
                "{} result not available",
                stage
            )))
        })
    }

    /// Whether the node advertised `class` in its node information frame.
    pub fn supports(&self, class: u8) -> Result<bool, StageFault> {
        Ok(self.prerequisite(Stage::Details)?.contains(&class))
    }
}

/// Node lists travel as big-endian u16 pairs.
pub(crate) fn encode_node(node: NodeId) -> [u8; 2] {
    node.get().to_be_bytes()
}

pub(crate) fn decode_nodes(payload: &[u8]) -> Result<Vec<NodeId>, StageFault> {
    if payload.len() % 2 != 0 {
        return Err(malformed(format!(
            "node list has odd length {}",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|pair| NodeId::new(u16::from_be_bytes([pair[0], pair[1]])))
        .collect())
}

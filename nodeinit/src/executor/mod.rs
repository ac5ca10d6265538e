//! Stage executor: performs one handshake step against one node.
//!
//! Dispatch is a closed `match` over [`Stage`]; each arm calls one async
//! function in `tasks`. Executors only read the session. Whatever a stage
//! captures travels back in [`ExecutionResult::Success`] and the scheduler
//! files it under that stage's key, so a retried stage can never leave
//! half-written data behind.

mod result;
mod tasks;

pub use result::{ExecutionResult, FailureReason};

use crate::catalog::{Reach, Stage, StageSpec};
use crate::runtime::options::StageTimeouts;
use crate::session::NodeSession;
use crate::transport::NodeTransport;
use nodeinit_shared::NodeId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tasks::{ExecCtx, association, discovery, protocol, routing};

pub struct StageExecutor {
    transport: Arc<dyn NodeTransport>,
    timeouts: StageTimeouts,
    controller_id: NodeId,
}

impl StageExecutor {
    pub fn new(
        transport: Arc<dyn NodeTransport>,
        timeouts: StageTimeouts,
        controller_id: NodeId,
    ) -> Self {
        Self {
            transport,
            timeouts,
            controller_id,
        }
    }

    pub fn timeout_for(&self, reach: Reach) -> Duration {
        match reach {
            Reach::Local => self.timeouts.local(),
            Reach::Routed => self.timeouts.routed(),
        }
    }

    /// Execute `spec.stage` for the node behind `session`.
    pub async fn execute(&self, session: &NodeSession, spec: &StageSpec) -> ExecutionResult {
        let ctx = ExecCtx {
            transport: self.transport.as_ref(),
            session,
            controller_id: self.controller_id,
            timeout: self.timeout_for(spec.reach),
        };

        let start = Instant::now();
        let outcome = match spec.stage {
            Stage::EmptyNode => protocol::empty_node(&ctx).await,
            Stage::ProtocolInfo => protocol::protocol_info(&ctx).await,
            Stage::FailedCheck => protocol::failed_check(&ctx).await,
            Stage::Ping => protocol::ping(&ctx).await,
            Stage::Details => discovery::details(&ctx).await,
            Stage::SecurityReport => discovery::security_report(&ctx).await,
            Stage::Manufacturer => discovery::manufacturer(&ctx).await,
            Stage::Version => discovery::version(&ctx).await,
            Stage::Endpoints => discovery::endpoints(&ctx).await,
            Stage::Associations => association::associations(&ctx).await,
            Stage::SetLifeline => association::set_lifeline(&ctx).await,
            Stage::Configuration => discovery::configuration(&ctx).await,
            Stage::StaticEnd | Stage::SessionStart | Stage::Done => protocol::marker(&ctx).await,
            Stage::DynamicValues => routing::dynamic_values(&ctx).await,
            Stage::DeleteRoutes => routing::delete_routes(&ctx).await,
            Stage::ReturnRoutes => routing::return_routes(&ctx).await,
            Stage::Neighbors => routing::neighbors(&ctx).await,
        };
        let result = ExecutionResult::from(outcome);

        tracing::debug!(
            node_id = %session.node_id(),
            stage = %spec.stage,
            outcome = result.label(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Stage executed"
        );

        result
    }
}

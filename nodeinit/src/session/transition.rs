//! Transition table.
//!
//! `plan` is a pure function of the session's position, the stage's flags and
//! the execution result. The scheduler applies whatever it returns.

use super::{NodeMode, NodeSession};
use crate::catalog::{Stage, StageCatalog, StageSpec};
use crate::executor::{ExecutionResult, FailureReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Move on to `to`. `skipped` is set when the current stage was given up.
    Advance {
        to: Stage,
        skipped: Option<FailureReason>,
    },
    /// Run the current stage again after backoff.
    Retry { attempt: u32 },
    /// Last stage of the walk is behind us.
    Complete { skipped: Option<FailureReason> },
    /// A mandatory stage cannot complete.
    Fail(FailureReason),
}

/// Decide what follows `result` for the session's current stage.
///
/// `max_attempts` is the number of times one stage may run before its
/// budget is exhausted.
pub fn plan(
    catalog: &StageCatalog,
    session: &NodeSession,
    spec: &StageSpec,
    result: &ExecutionResult,
    max_attempts: u32,
) -> Transition {
    let stage = spec.stage;
    let healing = session.mode() == NodeMode::Healing;

    let move_on = |skipped: Option<FailureReason>| {
        let next = if healing {
            catalog.next_heal(stage)
        } else {
            catalog.next_pending(stage, session.static_data())
        };
        match next {
            Some(to) => Transition::Advance { to, skipped },
            None => Transition::Complete { skipped },
        }
    };

    // Heal failures never fail the node.
    let give_up = |reason: FailureReason| {
        if spec.is_mandatory() && !healing {
            Transition::Fail(reason)
        } else {
            move_on(Some(reason))
        }
    };

    match result {
        ExecutionResult::Success(_) => move_on(None),
        ExecutionResult::Retryable(reason) | ExecutionResult::Timeout(reason) => {
            let attempts = session.attempt() + 1;
            if attempts < max_attempts {
                Transition::Retry { attempt: attempts }
            } else {
                give_up(FailureReason::RetryBudgetExhausted {
                    stage,
                    attempts,
                    last: Box::new(reason.clone()),
                })
            }
        }
        ExecutionResult::PermanentFailure(reason) => give_up(reason.clone()),
    }
}

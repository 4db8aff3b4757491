//! Action-level error taxonomy

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Kind of failure that ended an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// A declared input artifact was never produced
    Binding,
    /// The underlying operation failed
    Execution,
    /// An invoked action did not report within its bound
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Binding => write!(f, "BindingError"),
            FailureKind::Execution => write!(f, "ExecutionError"),
            FailureKind::Timeout => write!(f, "TimeoutError"),
        }
    }
}

/// Error raised by a single action
///
/// None of these are retried by the orchestrator; an operator re-trigger is
/// the recovery path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("BindingError: input artifact '{artifact}' was never produced")]
    Binding { artifact: String },

    #[error("ExecutionError: {0}")]
    Execution(String),

    #[error("TimeoutError: no job result after {0:?}")]
    Timeout(Duration),
}

impl ActionError {
    pub fn execution(reason: impl Into<String>) -> Self {
        ActionError::Execution(reason.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ActionError::Binding { .. } => FailureKind::Binding,
            ActionError::Execution(_) => FailureKind::Execution,
            ActionError::Timeout(_) => FailureKind::Timeout,
        }
    }
}

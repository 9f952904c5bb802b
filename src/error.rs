//! Terminal outcomes surfaced by the admission gate.
//!
//! Every variant maps to a stable code so callers can branch on the kind of
//! failure without parsing messages. `InternalFault` deliberately carries no
//! payload: whatever went wrong inside the guarded phase is logged, not
//! returned.

use std::time::Duration;

use crate::syntax::ParseError;
use crate::validator::Violation;

#[derive(Debug)]
pub enum GateError {
    /// Malformed source, reported before validation begins.
    Parse(ParseError),
    /// The static validator rejected the tree; the guard was never installed.
    Rejected(Vec<Violation>),
    /// A module resolution was refused by the live import guard.
    ImportBlocked { module: String, root: String },
    /// A guard was already installed when another install was attempted.
    Reentrancy,
    DeadlineExceeded { deadline: Duration },
    MemoryExceeded { ceiling: u64, observed: u64 },
    /// The concurrency cap was reached; the request was not queued.
    Overloaded { max_pending: usize },
    /// The limiter tripped the session's cancel token.
    Cancelled,
    InternalFault,
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            GateError::Parse(_) => "GATE_PARSE_ERROR",
            GateError::Rejected(_) => "GATE_REJECTED",
            GateError::ImportBlocked { .. } => "GATE_IMPORT_BLOCKED",
            GateError::Reentrancy => "GATE_REENTRANCY",
            GateError::DeadlineExceeded { .. } => "GATE_DEADLINE_EXCEEDED",
            GateError::MemoryExceeded { .. } => "GATE_MEMORY_EXCEEDED",
            GateError::Overloaded { .. } => "GATE_OVERLOADED",
            GateError::Cancelled => "GATE_CANCELLED",
            GateError::InternalFault => "GATE_INTERNAL_FAULT",
        }
    }

    /// Violations attached to a rejection, empty for every other kind.
    pub fn violations(&self) -> &[Violation] {
        match self {
            GateError::Rejected(violations) => violations,
            _ => &[],
        }
    }
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::Parse(err) => write!(f, "{}: {}", self.code(), err),
            GateError::Rejected(violations) => write!(
                f,
                "{}: {} policy violation(s)",
                self.code(),
                violations.len()
            ),
            GateError::ImportBlocked { module, root } => write!(
                f,
                "{}: import of '{}' blocked (root '{}' not allowed)",
                self.code(),
                module,
                root
            ),
            GateError::Reentrancy => {
                write!(f, "{}: an import guard is already installed", self.code())
            }
            GateError::DeadlineExceeded { deadline } => write!(
                f,
                "{}: guarded execution exceeded {} ms",
                self.code(),
                deadline.as_millis()
            ),
            GateError::MemoryExceeded { ceiling, observed } => write!(
                f,
                "{}: guarded execution grew {} bytes (ceiling {} bytes)",
                self.code(),
                observed,
                ceiling
            ),
            GateError::Overloaded { max_pending } => write!(
                f,
                "{}: more than {} guarded requests pending",
                self.code(),
                max_pending
            ),
            GateError::Cancelled => write!(f, "{}: guarded execution cancelled", self.code()),
            GateError::InternalFault => write!(f, "{}: internal fault", self.code()),
        }
    }
}

impl std::error::Error for GateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_fault_display_carries_no_detail() {
        let err = GateError::InternalFault;
        assert_eq!(err.to_string(), "GATE_INTERNAL_FAULT: internal fault");
        assert!(err.violations().is_empty());
    }

    #[test]
    fn gate_errors_survive_anyhow_round_trip() {
        let err = anyhow::Error::new(GateError::ImportBlocked {
            module: "os.path".to_string(),
            root: "os".to_string(),
        })
        .context("while loading namespace");
        let recovered = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<GateError>())
            .expect("gate error in chain");
        assert_eq!(recovered.code(), "GATE_IMPORT_BLOCKED");
    }
}

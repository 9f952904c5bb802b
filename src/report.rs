//! User-visible rendering of a gate result.
//!
//! A report carries the error kind, the matched pattern and the location, and
//! never any text produced inside the guarded phase.

use serde::Serialize;

use crate::error::GateError;
use crate::gate::GateResult;
use crate::policy::PolicySet;
use crate::syntax::Location;
use crate::validator::{Violation, ViolationKind};

pub const EXIT_ACCEPTED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_REJECTED: i32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Accepted,
    /// Parse error, static violation or blocked import.
    Rejected,
    /// Limits, overload, reentrancy or internal fault.
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReportError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReportViolation {
    pub kind: &'static str,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<&'static str>,
    pub line: usize,
    pub column: usize,
}

impl From<&Violation> for ReportViolation {
    fn from(violation: &Violation) -> Self {
        Self {
            kind: match violation.kind {
                ViolationKind::Import => "import",
                ViolationKind::Operation => "operation",
            },
            target: violation.target.clone(),
            pattern: violation.pattern.map(|pattern| pattern.as_str()),
            line: violation.location.line,
            column: violation.location.column,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct GateReport<T> {
    pub status: ReportStatus,
    pub policy_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<ReportViolation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<T>,
}

impl<T> GateReport<T> {
    pub fn from_result(result: GateResult<T>, policy: &PolicySet) -> Self {
        let policy_fingerprint = policy.fingerprint_hex();
        match result {
            Ok(output) => Self {
                status: ReportStatus::Accepted,
                policy_fingerprint,
                error: None,
                violations: Vec::new(),
                output: Some(output),
            },
            Err(err) => Self {
                status: status_of(&err),
                policy_fingerprint,
                error: Some(ReportError {
                    code: err.code(),
                    message: err.to_string(),
                    location: match &err {
                        GateError::Parse(parse) => Some(parse.location),
                        _ => None,
                    },
                }),
                violations: err.violations().iter().map(ReportViolation::from).collect(),
                output: None,
            },
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            ReportStatus::Accepted => EXIT_ACCEPTED,
            ReportStatus::Rejected => EXIT_REJECTED,
            ReportStatus::Failed => EXIT_FAILED,
        }
    }

    /// One line per finding, for terminals.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        match &self.error {
            None => out.push_str("accepted\n"),
            Some(error) => {
                out.push_str(&error.message);
                out.push('\n');
            }
        }
        for violation in &self.violations {
            out.push_str(&format!(
                "  {}:{} {} '{}'",
                violation.line, violation.column, violation.kind, violation.target
            ));
            if let Some(pattern) = violation.pattern {
                out.push_str(&format!(" via {}", pattern));
            }
            out.push('\n');
        }
        out.push_str(&format!("policy {}\n", self.policy_fingerprint));
        out
    }
}

fn status_of(err: &GateError) -> ReportStatus {
    match err {
        GateError::Parse(_) | GateError::Rejected(_) | GateError::ImportBlocked { .. } => {
            ReportStatus::Rejected
        }
        _ => ReportStatus::Failed,
    }
}

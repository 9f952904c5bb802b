//! Admission Gate
//!
//! This crate decides whether untrusted analysis source may be loaded at all,
//! and bounds the window in which it is.
//!
//! # Architecture
//!
//! Data flows one way: source text -> syntax tree -> verdict -> guarded
//! namespace -> analysis engine. The gate enforces four properties by
//! construction:
//!
//! 1. **Closed forbidden surface**: every call, attribute, subscript,
//!    container or computed-name route to a forbidden operation is rejected
//!    before anything is loaded.
//! 2. **Import backstop**: while a namespace is live, every module resolution
//!    goes through the import guard, which applies the same allowlist.
//! 3. **Single guard**: at most one guard is installed process-wide; it is
//!    released on every exit path.
//! 4. **Bounded window**: the guarded phase runs under a deadline and a
//!    memory ceiling; a breach returns control within a grace period.
//!
//! # Module Structure
//!
//! - `syntax`: parser boundary and the closed node set
//! - `policy`: import allowlist and forbidden-operation set
//! - `validator`: static pass producing a `ValidationVerdict`
//! - `guardian`: process-wide import guard and the session lock
//! - `limiter`: deadline, memory ceiling and optional syscall filter
//! - `namespace`: the structural namespace handed to engines
//! - `gate`: orchestration, `SandboxSession`, concurrency cap
//! - `engine`, `report`, `config`: collaborator interface, output, startup

pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod guardian;
pub mod limiter;
pub mod namespace;
pub mod policy;
pub mod report;
pub mod syntax;
pub mod validator;

pub use config::GateConfig;
pub use engine::{AnalysisEngine, Inventory, InventoryEngine};
pub use error::GateError;
pub use gate::{AdmissionGate, GateLimits, GateResult, GateStats, SandboxSession};
pub use guardian::{GuardHandle, ImportGuardian, ModuleRef};
pub use limiter::{
    run_bounded, CancelToken, Limits, MemoryProbe, Outcome, ProcessMemoryProbe, SyscallFilter,
};
pub use namespace::{ClassInfo, FunctionInfo, Namespace};
pub use policy::PolicySet;
pub use report::{GateReport, ReportStatus};
pub use syntax::{parse, Location, ParseError, SyntaxTree};
pub use validator::{validate, ReferencePattern, ValidationVerdict, Violation, ViolationKind};

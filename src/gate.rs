//! Admission gate: validate, then run the accepted tree inside one guarded
//! session.
//!
//! Validation runs unlocked and in parallel. The guarded phase (install,
//! load and run, release) is serialized process-wide by the guardian's
//! session lock; at most `max_pending` requests may wait for or occupy it,
//! later ones are turned away with [`GateError::Overloaded`]. The
//! [`SandboxSession`] owns the guard and releases it when dropped, so no exit
//! path returns with a guard still installed.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;

use crate::config::GateConfig;
use crate::engine::AnalysisEngine;
use crate::error::GateError;
use crate::guardian::{lock_session, GuardHandle, ImportGuardian};
use crate::limiter::{
    run_bounded, Limits, MemoryProbe, Outcome, ProcessMemoryProbe, SyscallFilter,
    DEFAULT_GRACE, DEFAULT_POLL_INTERVAL,
};
use crate::namespace::Namespace;
use crate::policy::PolicySet;
use crate::syntax::{parse, SyntaxTree};
use crate::validator::{validate, ValidationVerdict};

pub type GateResult<T> = std::result::Result<T, GateError>;

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_MEMORY_CEILING: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_PENDING: usize = 16;

thread_local! {
    /// Set on limiter workers; a nested admission from there can never get
    /// the session lock its own supervisor holds.
    static IN_GUARDED_PHASE: Cell<bool> = const { Cell::new(false) };
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateLimits {
    pub deadline: Duration,
    pub memory_ceiling: u64,
    pub poll_interval: Duration,
    pub grace: Duration,
    pub syscall_filter: SyscallFilter,
    pub max_pending: usize,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace: DEFAULT_GRACE,
            syscall_filter: SyscallFilter::Off,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl GateLimits {
    fn limits(&self, deadline: Duration, memory_ceiling: u64) -> Limits {
        Limits {
            deadline,
            memory_ceiling,
            poll_interval: self.poll_interval,
            grace: self.grace,
            syscall_filter: self.syscall_filter,
        }
    }
}

/// Counters for one gate. `installs == releases` whenever no session is open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub installs: u64,
    pub releases: u64,
    pub live: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub overloaded: u64,
}

#[derive(Default)]
struct Counters {
    installs: AtomicU64,
    releases: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    overloaded: AtomicU64,
}

pub struct AdmissionGate {
    policy: Arc<PolicySet>,
    limits: GateLimits,
    probe: Arc<dyn MemoryProbe>,
    pending: AtomicUsize,
    counters: Counters,
}

impl AdmissionGate {
    pub fn new(policy: Arc<PolicySet>, limits: GateLimits) -> Self {
        Self {
            policy,
            limits,
            probe: Arc::new(ProcessMemoryProbe),
            pending: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    /// Replace the process memory probe.
    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn from_config(config: &GateConfig) -> Result<Self> {
        let policy = PolicySet::new(
            config.allowed_modules.iter().cloned(),
            config.forbidden_operations.iter().cloned(),
        )?;
        log::info!(
            "gate: policy {} ({} allowed modules, {} forbidden operations)",
            policy.fingerprint_hex(),
            policy.allowed_modules().count(),
            policy.forbidden_operations().count()
        );
        Ok(Self::new(
            Arc::new(policy),
            GateLimits {
                deadline: config.deadline,
                memory_ceiling: config.memory_ceiling()?,
                poll_interval: config.poll_interval,
                grace: config.grace,
                syscall_filter: config.syscall_filter,
                max_pending: config.max_pending,
            },
        ))
    }

    pub fn policy(&self) -> &Arc<PolicySet> {
        &self.policy
    }

    pub fn limits(&self) -> &GateLimits {
        &self.limits
    }

    pub fn stats(&self) -> GateStats {
        let installs = self.counters.installs.load(Ordering::SeqCst);
        let releases = self.counters.releases.load(Ordering::SeqCst);
        GateStats {
            installs,
            releases,
            live: installs.saturating_sub(releases),
            admitted: self.counters.admitted.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            overloaded: self.counters.overloaded.load(Ordering::SeqCst),
        }
    }

    /// Validate `tree` and, if accepted, run `load_and_run` on its guarded
    /// namespace within `deadline` and `memory_ceiling` bytes of growth.
    pub fn admit<T, F>(
        &self,
        tree: SyntaxTree,
        deadline: Duration,
        memory_ceiling: u64,
        load_and_run: F,
    ) -> GateResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Namespace) -> Result<T> + Send + 'static,
    {
        if IN_GUARDED_PHASE.with(Cell::get) {
            log::warn!("gate: admission requested from inside a guarded phase");
            return Err(GateError::Reentrancy);
        }

        if let ValidationVerdict::Rejected(violations) = validate(&tree, &self.policy) {
            self.counters.rejected.fetch_add(1, Ordering::SeqCst);
            log::info!("gate: rejected with {} violation(s)", violations.len());
            return Err(GateError::Rejected(violations));
        }

        let _slot = self.reserve_slot()?;
        let _session_lock = lock_session();
        let session = SandboxSession::open(
            &self.policy,
            self.limits.limits(deadline, memory_ceiling),
            &self.counters,
        )?;
        let outcome = session.run(Arc::new(tree), self.probe.as_ref(), load_and_run);
        drop(session);

        match outcome {
            Outcome::Completed(value) => {
                self.counters.admitted.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
            Outcome::DeadlineExceeded { deadline } => Err(GateError::DeadlineExceeded { deadline }),
            Outcome::MemoryExceeded { ceiling, observed } => {
                Err(GateError::MemoryExceeded { ceiling, observed })
            }
            Outcome::Faulted(err) => Err(surface_fault(&err)),
        }
    }

    /// Parse `source` and admit the resulting tree.
    pub fn admit_source<T, F>(
        &self,
        source: &str,
        deadline: Duration,
        memory_ceiling: u64,
        load_and_run: F,
    ) -> GateResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Namespace) -> Result<T> + Send + 'static,
    {
        let tree = parse(source).map_err(GateError::Parse)?;
        self.admit(tree, deadline, memory_ceiling, load_and_run)
    }

    pub fn admit_with_defaults<T, F>(&self, tree: SyntaxTree, load_and_run: F) -> GateResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Namespace) -> Result<T> + Send + 'static,
    {
        self.admit(
            tree,
            self.limits.deadline,
            self.limits.memory_ceiling,
            load_and_run,
        )
    }

    /// Admit `source` and hand its namespace to `engine` for `target`.
    pub fn analyze<E: AnalysisEngine>(
        &self,
        source: &str,
        engine: Arc<E>,
        target: &str,
    ) -> GateResult<E::Output> {
        let target = target.to_string();
        self.admit_source(
            source,
            self.limits.deadline,
            self.limits.memory_ceiling,
            move |namespace| engine.analyze(namespace, &target),
        )
    }

    fn reserve_slot(&self) -> GateResult<PendingSlot<'_>> {
        let max_pending = self.limits.max_pending;
        let previous = self.pending.fetch_add(1, Ordering::SeqCst);
        if previous >= max_pending {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.counters.overloaded.fetch_add(1, Ordering::SeqCst);
            log::warn!("gate: overloaded, {} requests already pending", previous);
            return Err(GateError::Overloaded { max_pending });
        }
        Ok(PendingSlot {
            pending: &self.pending,
        })
    }
}

struct PendingSlot<'g> {
    pending: &'g AtomicUsize,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One guarded execution: the live guard plus the limits it runs under.
///
/// Only the gate opens sessions. Dropping the session releases the guard,
/// whatever state the run ended in.
pub struct SandboxSession<'g> {
    guard: Option<GuardHandle>,
    limits: Limits,
    deadline_at: Instant,
    counters: &'g Counters,
}

impl<'g> SandboxSession<'g> {
    fn open(policy: &Arc<PolicySet>, limits: Limits, counters: &'g Counters) -> GateResult<Self> {
        let guard = ImportGuardian::install(policy.clone())?;
        counters.installs.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "gate: session {} opened (deadline {} ms, ceiling {} bytes)",
            guard.generation(),
            limits.deadline.as_millis(),
            limits.memory_ceiling
        );
        Ok(Self {
            guard: Some(guard),
            deadline_at: Instant::now() + limits.deadline,
            limits,
            counters,
        })
    }

    pub fn generation(&self) -> u64 {
        self.guard.as_ref().map_or(0, GuardHandle::generation)
    }

    pub fn deadline_at(&self) -> Instant {
        self.deadline_at
    }

    pub fn memory_ceiling(&self) -> u64 {
        self.limits.memory_ceiling
    }

    fn run<T, F>(&self, tree: Arc<SyntaxTree>, probe: &dyn MemoryProbe, load_and_run: F) -> Outcome<T>
    where
        T: Send + 'static,
        F: FnOnce(&Namespace) -> Result<T> + Send + 'static,
    {
        let generation = self.generation();
        run_bounded(&self.limits, probe, move |cancel| {
            IN_GUARDED_PHASE.with(|flag| flag.set(true));
            let namespace = Namespace::load(tree, generation, cancel)?;
            load_and_run(&namespace)
        })
    }
}

impl Drop for SandboxSession<'_> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let generation = guard.generation();
            guard.release();
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
            log::info!("gate: session {} closed", generation);
        }
    }
}

/// Map a guarded-phase failure to what the caller may see. Gate signals
/// raised inside the run pass through; anything else is logged in full and
/// surfaced as a bare internal fault.
fn surface_fault(err: &anyhow::Error) -> GateError {
    let signal = err.chain().find_map(|cause| match cause.downcast_ref::<GateError>()? {
        GateError::ImportBlocked { module, root } => Some(GateError::ImportBlocked {
            module: module.clone(),
            root: root.clone(),
        }),
        GateError::Reentrancy => Some(GateError::Reentrancy),
        GateError::Cancelled => Some(GateError::Cancelled),
        _ => None,
    });
    signal.unwrap_or_else(|| {
        log::warn!("gate: internal fault in guarded phase: {:#}", err);
        GateError::InternalFault
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::mpsc;

    fn gate(max_pending: usize) -> AdmissionGate {
        AdmissionGate::new(
            Arc::new(PolicySet::default()),
            GateLimits {
                deadline: Duration::from_secs(5),
                max_pending,
                ..GateLimits::default()
            },
        )
    }

    #[test]
    fn nested_admission_is_reentrancy() {
        let gate = Arc::new(gate(4));
        let inner = gate.clone();
        let result = gate.admit_source("x = 1\n", Duration::from_secs(5), 1 << 30, move |_ns| {
            match inner.admit_source("y = 2\n", Duration::from_secs(1), 1 << 30, |_ns| Ok(())) {
                Err(GateError::Reentrancy) => Ok("refused"),
                other => Err(anyhow!("nested admission not refused: {:?}", other)),
            }
        });
        assert_eq!(result.expect("outer admission"), "refused");
        let stats = gate.stats();
        assert_eq!(stats.installs, 1);
        assert_eq!(stats.releases, 1);
    }

    #[test]
    fn requests_beyond_cap_are_overloaded() {
        let gate = Arc::new(gate(1));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (finish_tx, finish_rx) = mpsc::channel::<()>();

        let holder = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                gate.admit_source("x = 1\n", Duration::from_secs(5), 1 << 30, move |_ns| {
                    entered_tx.send(()).map_err(|e| anyhow!("signal: {}", e))?;
                    finish_rx
                        .recv_timeout(Duration::from_secs(4))
                        .map_err(|e| anyhow!("wait: {}", e))?;
                    Ok(())
                })
            })
        };
        entered_rx
            .recv_timeout(Duration::from_secs(4))
            .expect("first request entered guarded phase");

        let err = gate
            .admit_source("y = 2\n", Duration::from_secs(1), 1 << 30, |_ns| Ok(()))
            .expect_err("second request overloaded");
        assert!(matches!(err, GateError::Overloaded { max_pending: 1 }));

        finish_tx.send(()).expect("release holder");
        holder.join().expect("holder thread").expect("holder admitted");
        let stats = gate.stats();
        assert_eq!(stats.overloaded, 1);
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.installs, stats.releases);
    }

    #[test]
    fn rejected_source_never_counts_an_install() {
        let gate = gate(4);
        let err = gate
            .admit_source("eval('1')\n", Duration::from_secs(1), 1 << 30, |_ns| Ok(()))
            .expect_err("rejected");
        assert_eq!(err.code(), "GATE_REJECTED");
        assert_eq!(gate.stats().installs, 0);
        assert_eq!(gate.stats().rejected, 1);
    }
}

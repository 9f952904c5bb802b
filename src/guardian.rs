//! Import guardian: the runtime backstop for module resolution.
//!
//! The interception state is process-wide and lives in one private static.
//! It is only reachable through [`ImportGuardian::install`], which hands out
//! the single live [`GuardHandle`], and through the handle's release path.
//! Every install gets a fresh generation number; a resolution carrying any
//! other generation is refused, so a worker that outlives its session can
//! never resolve through the next session's guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::GateError;
use crate::policy::{module_root, PolicySet};

struct ActiveGuard {
    generation: u64,
    policy: Arc<PolicySet>,
    resolved: Vec<String>,
}

static ACTIVE: Mutex<Option<ActiveGuard>> = Mutex::new(None);
static GENERATION: AtomicU64 = AtomicU64::new(0);
static SESSION_LOCK: Mutex<()> = Mutex::new(());

/// Serializes guarded phases across the process.
///
/// Poisoning is ignored: the lock protects no data, and a panicking session
/// has already released its guard on unwind.
pub fn lock_session() -> MutexGuard<'static, ()> {
    SESSION_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

fn active() -> MutexGuard<'static, Option<ActiveGuard>> {
    ACTIVE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A module admitted by the live guard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModuleRef {
    pub path: String,
    pub root: String,
}

pub struct ImportGuardian;

impl ImportGuardian {
    /// Install the guard for `policy`.
    ///
    /// Fails with [`GateError::Reentrancy`] while another handle is live.
    pub fn install(policy: Arc<PolicySet>) -> Result<GuardHandle, GateError> {
        let mut slot = active();
        if let Some(existing) = slot.as_ref() {
            log::warn!(
                "guardian: install refused, generation {} still live",
                existing.generation
            );
            return Err(GateError::Reentrancy);
        }
        let generation = GENERATION.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = Some(ActiveGuard {
            generation,
            policy,
            resolved: Vec::new(),
        });
        log::debug!("guardian: installed generation {}", generation);
        Ok(GuardHandle {
            generation,
            released: false,
        })
    }

    /// Resolve `path` through the guard installed as `generation`.
    ///
    /// Blocked unless that exact guard is live and its allowlist admits the
    /// root of `path`.
    pub fn resolve(generation: u64, path: &str) -> Result<ModuleRef, GateError> {
        let root = module_root(path).to_string();
        let blocked = || GateError::ImportBlocked {
            module: path.to_string(),
            root: root.clone(),
        };
        let mut slot = active();
        let Some(guard) = slot.as_mut().filter(|guard| guard.generation == generation) else {
            log::warn!(
                "guardian: resolution of '{}' outside live guard (generation {})",
                path,
                generation
            );
            return Err(blocked());
        };
        if !guard.policy.allows_module(path) {
            log::info!(
                "guardian: blocked '{}' (generation {})",
                path,
                guard.generation
            );
            return Err(blocked());
        }
        guard.resolved.push(path.to_string());
        Ok(ModuleRef {
            path: path.to_string(),
            root,
        })
    }

    pub fn is_installed() -> bool {
        active().is_some()
    }
}

/// Ownership of the one live guard. Not `Clone`; dropping it releases.
#[derive(Debug)]
pub struct GuardHandle {
    generation: u64,
    released: bool,
}

impl GuardHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Paths resolved through this guard so far.
    pub fn resolved(&self) -> Vec<String> {
        active()
            .as_ref()
            .filter(|guard| guard.generation == self.generation)
            .map(|guard| guard.resolved.clone())
            .unwrap_or_default()
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut slot = active();
        if slot
            .as_ref()
            .is_some_and(|guard| guard.generation == self.generation)
        {
            *slot = None;
            log::debug!("guardian: released generation {}", self.generation);
        }
    }
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

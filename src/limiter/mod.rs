//! Resource limiter for the guarded window.
//!
//! The action runs on a dedicated worker thread while the calling thread
//! supervises it against a wall-clock deadline and a resident-memory ceiling.
//! A breach trips the action's [`CancelToken`]; the supervisor then waits at
//! most the grace period before returning. Threads cannot be killed, so a
//! worker that ignores cancellation is detached and its late result dropped.
//! Nothing the limiter owns is shared with the guard, which the caller tears
//! down after `run_bounded` returns.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

mod seccomp;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_GRACE: Duration = Duration::from_millis(250);

const WORKER_THREAD_NAME: &str = "gate-worker";

/// Whether the worker thread installs the syscall denylist before running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyscallFilter {
    #[default]
    Off,
    /// Install or fault: a run never proceeds unfiltered.
    Required,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub deadline: Duration,
    /// Allowed resident-set growth over the baseline, in bytes.
    pub memory_ceiling: u64,
    pub poll_interval: Duration,
    pub grace: Duration,
    pub syscall_filter: SyscallFilter,
}

impl Limits {
    pub fn new(deadline: Duration, memory_ceiling: u64) -> Self {
        Self {
            deadline,
            memory_ceiling,
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace: DEFAULT_GRACE,
            syscall_filter: SyscallFilter::Off,
        }
    }
}

#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    DeadlineExceeded { deadline: Duration },
    MemoryExceeded { ceiling: u64, observed: u64 },
    Faulted(anyhow::Error),
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }
}

/// Cooperative cancellation flag shared with the guarded action.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Source of the process's resident memory, in bytes.
pub trait MemoryProbe: Send + Sync {
    /// `None` when the platform offers no measurement.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads `/proc/self/statm` on Linux.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    #[cfg(target_os = "linux")]
    fn resident_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        Some(pages.saturating_mul(page_size as u64))
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_bytes(&self) -> Option<u64> {
        None
    }
}

/// Run `action` under `limits`.
pub fn run_bounded<T, F>(limits: &Limits, probe: &dyn MemoryProbe, action: F) -> Outcome<T>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> Result<T> + Send + 'static,
{
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let filter = limits.syscall_filter;
    let (tx, rx) = mpsc::sync_channel::<Result<T>>(1);

    let baseline = probe.resident_bytes();
    if baseline.is_none() {
        log::warn!(
            "limiter: memory probe unavailable, ceiling of {} bytes not enforced",
            limits.memory_ceiling
        );
    }

    let started = Instant::now();
    let spawned = thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                if filter == SyscallFilter::Required {
                    seccomp::install_thread_filter()?;
                }
                action(worker_cancel)
            }))
            .unwrap_or_else(|payload| {
                Err(anyhow!(
                    "limiter: guarded action panicked: {}",
                    panic_message(payload.as_ref())
                ))
            });
            // The supervisor may have given up; a closed channel is expected then.
            let _ = tx.send(result);
        });
    let worker = match spawned {
        Ok(worker) => worker,
        Err(err) => {
            return Outcome::Faulted(anyhow!(err).context("limiter: failed to spawn worker"))
        }
    };

    let breach = loop {
        let elapsed = started.elapsed();
        if elapsed >= limits.deadline {
            break Outcome::DeadlineExceeded {
                deadline: limits.deadline,
            };
        }
        let wait = limits.poll_interval.min(limits.deadline - elapsed);
        match rx.recv_timeout(wait) {
            Ok(result) => {
                let _ = worker.join();
                return match result {
                    Ok(value) => Outcome::Completed(value),
                    Err(err) => Outcome::Faulted(err),
                };
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                return Outcome::Faulted(anyhow!("limiter: worker exited without a result"));
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        if let (Some(baseline), Some(current)) = (baseline, probe.resident_bytes()) {
            let observed = current.saturating_sub(baseline);
            if observed > limits.memory_ceiling {
                break Outcome::MemoryExceeded {
                    ceiling: limits.memory_ceiling,
                    observed,
                };
            }
        }
    };

    cancel.cancel();
    match rx.recv_timeout(limits.grace) {
        Ok(_) | Err(mpsc::RecvTimeoutError::Disconnected) => {
            let _ = worker.join();
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            log::warn!(
                "limiter: worker ignored cancellation for {} ms, detaching",
                limits.grace.as_millis()
            );
        }
    }
    match &breach {
        Outcome::DeadlineExceeded { deadline } => {
            log::warn!("limiter: deadline of {} ms exceeded", deadline.as_millis())
        }
        Outcome::MemoryExceeded { ceiling, observed } => log::warn!(
            "limiter: memory grew {} bytes, ceiling {} bytes",
            observed,
            ceiling
        ),
        _ => {}
    }
    breach
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

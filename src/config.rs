use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::limiter::SyscallFilter;
use crate::policy::{DEFAULT_ALLOWED_MODULES, DEFAULT_FORBIDDEN_OPERATIONS};

const DEFAULT_DEADLINE_MS: u64 = 30_000;
const DEFAULT_MEMORY_CEILING_MB: u64 = 1024;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_GRACE_MS: u64 = 250;
const DEFAULT_MAX_PENDING: usize = 16;

const DEADLINE_MS_BOUNDS: (u64, u64) = (10, 600_000);
const MEMORY_CEILING_MB_BOUNDS: (u64, u64) = (16, 65_536);
const POLL_INTERVAL_MS_BOUNDS: (u64, u64) = (1, 1_000);
const GRACE_MS_BOUNDS: (u64, u64) = (0, 10_000);
const MAX_PENDING_BOUNDS: (u64, u64) = (1, 1_024);

#[derive(Debug, Deserialize, Default)]
struct GateConfigFile {
    policy: Option<PolicyConfigFile>,
    limits: Option<LimitsConfigFile>,
    concurrency: Option<ConcurrencyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    allowed_modules: Option<Vec<String>>,
    forbidden_operations: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitsConfigFile {
    deadline_ms: Option<u64>,
    memory_ceiling_mb: Option<u64>,
    poll_interval_ms: Option<u64>,
    grace_ms: Option<u64>,
    syscall_filter: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ConcurrencyConfigFile {
    max_pending: Option<usize>,
}

/// Resolved gate configuration: file (`GATE_CONFIG`), then environment,
/// then bounds checks.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub allowed_modules: Vec<String>,
    pub forbidden_operations: Vec<String>,
    pub deadline: Duration,
    pub memory_ceiling_mb: u64,
    pub poll_interval: Duration,
    pub grace: Duration,
    pub syscall_filter: SyscallFilter,
    pub max_pending: usize,
}

impl GateConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GATE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Memory ceiling in bytes.
    pub fn memory_ceiling(&self) -> Result<u64> {
        self.memory_ceiling_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| {
                anyhow!(
                    "limits.memory_ceiling_mb of {} overflows a byte count",
                    self.memory_ceiling_mb
                )
            })
    }

    fn from_file(file: GateConfigFile) -> Result<Self> {
        let policy = file.policy.unwrap_or_default();
        let limits = file.limits.unwrap_or_default();
        let syscall_filter = match limits.syscall_filter.as_deref() {
            Some(value) => parse_syscall_filter("limits.syscall_filter", value)?,
            None => SyscallFilter::Off,
        };
        Ok(Self {
            allowed_modules: policy.allowed_modules.unwrap_or_else(|| {
                DEFAULT_ALLOWED_MODULES
                    .iter()
                    .map(|name| name.to_string())
                    .collect()
            }),
            forbidden_operations: policy.forbidden_operations.unwrap_or_else(|| {
                DEFAULT_FORBIDDEN_OPERATIONS
                    .iter()
                    .map(|name| name.to_string())
                    .collect()
            }),
            deadline: Duration::from_millis(limits.deadline_ms.unwrap_or(DEFAULT_DEADLINE_MS)),
            memory_ceiling_mb: limits
                .memory_ceiling_mb
                .unwrap_or(DEFAULT_MEMORY_CEILING_MB),
            poll_interval: Duration::from_millis(
                limits.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            grace: Duration::from_millis(limits.grace_ms.unwrap_or(DEFAULT_GRACE_MS)),
            syscall_filter,
            max_pending: file
                .concurrency
                .and_then(|concurrency| concurrency.max_pending)
                .unwrap_or(DEFAULT_MAX_PENDING),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(modules) = std::env::var("GATE_ALLOWED_MODULES") {
            let parsed = split_csv(&modules);
            if !parsed.is_empty() {
                self.allowed_modules = parsed;
            }
        }
        if let Ok(operations) = std::env::var("GATE_FORBIDDEN_OPERATIONS") {
            let parsed = split_csv(&operations);
            if !parsed.is_empty() {
                self.forbidden_operations = parsed;
            }
        }
        if let Some(ms) = env_u64("GATE_DEADLINE_MS")? {
            self.deadline = Duration::from_millis(ms);
        }
        if let Some(mb) = env_u64("GATE_MEMORY_CEILING_MB")? {
            self.memory_ceiling_mb = mb;
        }
        if let Some(ms) = env_u64("GATE_POLL_INTERVAL_MS")? {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("GATE_GRACE_MS")? {
            self.grace = Duration::from_millis(ms);
        }
        if let Ok(filter) = std::env::var("GATE_SYSCALL_FILTER") {
            if !filter.trim().is_empty() {
                self.syscall_filter = parse_syscall_filter("GATE_SYSCALL_FILTER", &filter)?;
            }
        }
        if let Some(pending) = env_u64("GATE_MAX_PENDING")? {
            self.max_pending = pending as usize;
        }
        Ok(())
    }

    /// Bounds checks and policy-name normalization. Re-run after changing
    /// any field, e.g. for command-line overrides.
    pub fn validate(&mut self) -> Result<()> {
        check_bounds(
            "limits.deadline_ms",
            self.deadline.as_millis() as u64,
            DEADLINE_MS_BOUNDS,
        )?;
        check_bounds(
            "limits.memory_ceiling_mb",
            self.memory_ceiling_mb,
            MEMORY_CEILING_MB_BOUNDS,
        )?;
        check_bounds(
            "limits.poll_interval_ms",
            self.poll_interval.as_millis() as u64,
            POLL_INTERVAL_MS_BOUNDS,
        )?;
        check_bounds("limits.grace_ms", self.grace.as_millis() as u64, GRACE_MS_BOUNDS)?;
        check_bounds(
            "concurrency.max_pending",
            self.max_pending as u64,
            MAX_PENDING_BOUNDS,
        )?;
        if self.poll_interval > self.deadline {
            return Err(anyhow!(
                "limits.poll_interval_ms must not exceed limits.deadline_ms"
            ));
        }

        // Checked and de-duplicated by the policy constructor.
        let policy = crate::policy::PolicySet::new(
            self.allowed_modules.clone(),
            self.forbidden_operations.clone(),
        )?;
        self.allowed_modules = policy.allowed_modules().map(str::to_string).collect();
        self.forbidden_operations = policy.forbidden_operations().map(str::to_string).collect();
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<GateConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        _ => Ok(None),
    }
}

fn check_bounds(key: &str, value: u64, (min, max): (u64, u64)) -> Result<()> {
    if value < min || value > max {
        return Err(anyhow!(
            "{} must be within [{}, {}], got {}",
            key,
            min,
            max,
            value
        ));
    }
    Ok(())
}

fn parse_syscall_filter(key: &str, value: &str) -> Result<SyscallFilter> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" => Ok(SyscallFilter::Off),
        "required" => Ok(SyscallFilter::Required),
        other => Err(anyhow!(
            "{} must be \"off\" or \"required\", got \"{}\"",
            key,
            other
        )),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use admission_gate::config::GateConfig;
use admission_gate::SyscallFilter;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "GATE_CONFIG",
        "GATE_ALLOWED_MODULES",
        "GATE_FORBIDDEN_OPERATIONS",
        "GATE_DEADLINE_MS",
        "GATE_MEMORY_CEILING_MB",
        "GATE_POLL_INTERVAL_MS",
        "GATE_GRACE_MS",
        "GATE_SYSCALL_FILTER",
        "GATE_MAX_PENDING",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_apply_without_config() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = GateConfig::load().expect("load defaults");
    assert_eq!(cfg.deadline, Duration::from_millis(30_000));
    assert_eq!(cfg.memory_ceiling_mb, 1024);
    assert_eq!(cfg.memory_ceiling().expect("ceiling in bytes"), 1024 * 1024 * 1024);
    assert_eq!(cfg.poll_interval, Duration::from_millis(10));
    assert_eq!(cfg.grace, Duration::from_millis(250));
    assert_eq!(cfg.syscall_filter, SyscallFilter::Off);
    assert_eq!(cfg.max_pending, 16);
    assert!(cfg.allowed_modules.iter().any(|m| m == "math"));
    assert!(cfg.forbidden_operations.iter().any(|op| op == "eval"));
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "policy": {
            "allowed_modules": ["math", "re", "math"],
            "forbidden_operations": ["eval", "exec", "open"]
        },
        "limits": {
            "deadline_ms": 5000,
            "memory_ceiling_mb": 256,
            "grace_ms": 100,
            "syscall_filter": "required"
        },
        "concurrency": {
            "max_pending": 4
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("GATE_CONFIG", file.path());
    std::env::set_var("GATE_DEADLINE_MS", "750");
    std::env::set_var("GATE_FORBIDDEN_OPERATIONS", "eval, exec");

    let cfg = GateConfig::load().expect("load config");

    assert_eq!(cfg.allowed_modules, vec!["math", "re"]);
    assert_eq!(cfg.forbidden_operations, vec!["eval", "exec"]);
    assert_eq!(cfg.deadline, Duration::from_millis(750));
    assert_eq!(cfg.memory_ceiling_mb, 256);
    assert_eq!(cfg.poll_interval, Duration::from_millis(10));
    assert_eq!(cfg.grace, Duration::from_millis(100));
    assert_eq!(cfg.syscall_filter, SyscallFilter::Required);
    assert_eq!(cfg.max_pending, 4);

    clear_env();
}

#[test]
fn toml_config_is_detected_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[limits]
deadline_ms = 1200
poll_interval_ms = 5

[concurrency]
max_pending = 2
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("GATE_CONFIG", file.path());

    let cfg = GateConfig::load().expect("load toml config");
    assert_eq!(cfg.deadline, Duration::from_millis(1200));
    assert_eq!(cfg.poll_interval, Duration::from_millis(5));
    assert_eq!(cfg.max_pending, 2);

    clear_env();
}

#[test]
fn out_of_bounds_values_name_the_key() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("GATE_DEADLINE_MS", "5");
    let err = GateConfig::load().expect_err("deadline below minimum");
    assert!(
        err.to_string().contains("limits.deadline_ms"),
        "unexpected error: {err}"
    );
    clear_env();

    std::env::set_var("GATE_MAX_PENDING", "0");
    let err = GateConfig::load().expect_err("max_pending below minimum");
    assert!(err.to_string().contains("concurrency.max_pending"));
    clear_env();

    std::env::set_var("GATE_MEMORY_CEILING_MB", "lots");
    let err = GateConfig::load().expect_err("non-numeric ceiling");
    assert!(err.to_string().contains("GATE_MEMORY_CEILING_MB"));
    clear_env();

    std::env::set_var("GATE_SYSCALL_FILTER", "sometimes");
    let err = GateConfig::load().expect_err("unknown filter mode");
    assert!(err.to_string().contains("GATE_SYSCALL_FILTER"));
    clear_env();
}

#[test]
fn overrides_are_bounded_like_config_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut cfg = GateConfig::load().expect("load defaults");
    cfg.memory_ceiling_mb = u64::MAX / 1024;
    let err = cfg.memory_ceiling().expect_err("byte count overflows");
    assert!(err.to_string().contains("limits.memory_ceiling_mb"));
    let err = cfg.validate().expect_err("ceiling above maximum");
    assert!(err.to_string().contains("limits.memory_ceiling_mb"));

    let mut cfg = GateConfig::load().expect("load defaults");
    cfg.deadline = Duration::from_millis(u64::MAX);
    let err = cfg.validate().expect_err("deadline above maximum");
    assert!(err.to_string().contains("limits.deadline_ms"));

    let mut cfg = GateConfig::load().expect("load defaults");
    cfg.memory_ceiling_mb = 65_536;
    cfg.deadline = Duration::from_millis(600_000);
    cfg.validate().expect("upper bounds are inclusive");
    assert_eq!(cfg.memory_ceiling().expect("fits"), 65_536 * 1024 * 1024);
}

#[test]
fn invalid_policy_names_are_rejected_at_startup() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("GATE_ALLOWED_MODULES", "math,os.path");
    let err = GateConfig::load().expect_err("dotted module name");
    assert!(err.to_string().contains("allowed module"), "unexpected error: {err}");

    clear_env();
}

//! gatecheck - run submitted source through the admission gate
//!
//! Validates the file against the configured policy and, if accepted, loads
//! it inside a guarded session and prints an inventory of what was loaded.
//!
//! Exit status: 0 accepted, 2 rejected (parse error, violation, blocked
//! import), 1 anything else.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use admission_gate::{AdmissionGate, GateConfig, GateReport, InventoryEngine};

#[derive(Parser, Debug)]
#[command(
    name = "gatecheck",
    about = "Check untrusted analysis source against the admission gate"
)]
struct Args {
    /// Source file to check, or `-` for stdin
    #[arg(value_name = "FILE")]
    file: String,

    /// Function to report on once loaded
    #[arg(long, value_name = "NAME", default_value = "")]
    function: String,

    /// Emit the report as JSON
    #[arg(long)]
    json: bool,

    /// Override the configured deadline
    #[arg(long, value_name = "MS", env = "GATE_DEADLINE_MS")]
    deadline_ms: Option<u64>,

    /// Override the configured memory ceiling
    #[arg(long, value_name = "MB", env = "GATE_MEMORY_CEILING_MB")]
    memory_ceiling_mb: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = GateConfig::load()?;
    if let Some(ms) = args.deadline_ms {
        config.deadline = Duration::from_millis(ms);
    }
    if let Some(mb) = args.memory_ceiling_mb {
        config.memory_ceiling_mb = mb;
    }
    config
        .validate()
        .context("invalid --deadline-ms / --memory-ceiling-mb override")?;

    let source = read_source(&args.file)?;
    let gate = AdmissionGate::from_config(&config)?;
    let result = gate.analyze(&source, Arc::new(InventoryEngine), &args.function);
    let report = GateReport::from_result(result, gate.policy());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
        if let Some(inventory) = &report.output {
            println!("imports: {}", join(inventory.imports.iter().map(|m| m.path.as_str())));
            println!("functions: {}", join(inventory.functions.iter().map(String::as_str)));
            println!("classes: {}", join(inventory.classes.iter().map(String::as_str)));
            match &inventory.target {
                Some(target) => println!(
                    "target: {}({}) at {}",
                    target.qualified_name,
                    target.params.join(", "),
                    target.location
                ),
                None if !args.function.is_empty() => {
                    println!("target: {} not found", args.function)
                }
                None => {}
            }
        }
    }

    log::info!("gatecheck: {:?}, {:?}", report.status, gate.stats());
    std::process::exit(report.exit_code());
}

fn read_source(file: &str) -> Result<String> {
    if file == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("failed to read source from stdin")?;
        return Ok(source);
    }
    std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file))
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let joined = items.collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined
    }
}

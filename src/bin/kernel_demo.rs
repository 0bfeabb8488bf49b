//! kernel_demo - run scripted code units through the capability kernel
//!
//! Loads sandbox settings and grants, builds a small catalog of library and
//! program functions, then runs each scenario in the sandbox and prints its
//! outcome as JSON. Useful for checking a grant file before deploying it.

use anyhow::{anyhow, Result};
use clap::Parser;
use rand::RngCore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use capability_kernel::{
    CapabilityType, ExecutionOutcome, FunctionSecurityMetadata, Gate, Grant, Isolation,
    KernelError, KernelResult, KernelSettings, Sandbox, TrustedCatalog, Value, ViolationLog,
};

const PROGRAM_MODULE: &str = "__main__";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML settings file ([sandbox] knobs and [[grant]] entries).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Extra grant: `cap` or `cap=pattern[,pattern]`. Repeatable.
    #[arg(long = "grant", value_name = "GRANT")]
    grants: Vec<String>,
    /// Override isolation (thread|process).
    #[arg(long)]
    isolation: Option<String>,
    /// Override the timeout in milliseconds.
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,
    /// File the read scenario tries to open.
    #[arg(long, default_value = "/data/example.txt")]
    path: String,
}

type CodeUnit = Box<dyn FnOnce(&Gate) -> KernelResult<Value> + Send>;

fn scenario<F>(name: &'static str, unit: F) -> (&'static str, CodeUnit)
where
    F: FnOnce(&Gate) -> KernelResult<Value> + Send + 'static,
{
    (name, Box::new(unit))
}

#[derive(Serialize)]
struct ScenarioReport<'a> {
    scenario: &'a str,
    outcome: &'a ExecutionOutcome,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => KernelSettings::load(path)?,
        None => KernelSettings::default(),
    };
    for raw in &args.grants {
        settings.grants.push(Grant::parse(raw)?);
    }
    if let Some(raw) = &args.isolation {
        settings.sandbox.isolation = Isolation::parse(raw)?;
    }
    if let Some(ms) = args.timeout_ms {
        if ms == 0 {
            return Err(anyhow!("--timeout-ms must be >= 1"));
        }
        settings.sandbox.cpu_timeout = Duration::from_millis(ms);
    }
    settings.sandbox.validate()?;

    let audit = Arc::new(ViolationLog::new());
    let sandbox = Sandbox::new(Gate::new(demo_catalog()?, audit.clone()));
    let context = settings.root_context("demo")?;

    let path = args.path.clone();
    let scenarios = vec![
        scenario("read_file", move |gate| gate.call("main", &[Value::Str(path)])),
        scenario("random", |gate| gate.call("crypto.random_u64", &[])),
        scenario("unvetted_call", |gate| {
            gate.call("os.system", &[Value::str("id")])
        }),
        scenario("not_callable", |gate| gate.safe_call(&Value::Int(42), &[])),
        scenario("runaway_loop", |gate| loop {
            gate.safe_call(&Value::method(Value::str("spin"), "upper"), &[])?;
        }),
    ];

    for (name, unit) in scenarios {
        let outcome = sandbox.run(unit, context.clone(), &settings.sandbox);
        let report = ScenarioReport {
            scenario: name,
            outcome: &outcome,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    audit.verify_chain()?;
    log::info!(
        "{} violation(s) recorded; chain head {}",
        audit.len(),
        audit.head_hash_hex()
    );
    for v in audit.violations() {
        println!(
            "violation: {} on {} (resource: {})",
            v.capability_type,
            v.operation,
            v.resource.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn demo_catalog() -> Result<Arc<TrustedCatalog>> {
    TrustedCatalog::builder(PROGRAM_MODULE)
        .library(
            "fs",
            "fs.read_text",
            FunctionSecurityMetadata::requires(["file.read"]).with_resource_arg(0),
            read_text,
        )
        .library(
            "crypto",
            "crypto.random_u64",
            FunctionSecurityMetadata::requires(["crypto.random"]),
            |_, _| Ok(Value::Int((rand::thread_rng().next_u64() >> 1) as i64)),
        )
        .foreign("os", "os.system", |_, _| {
            Err(KernelError::failed("os.system must never run"))
        })
        .program("main", |gate, args| {
            let contents = gate.call("fs.read_text", args)?;
            gate.safe_call(&Value::method(contents, "len"), &[])
        })
        .build()
}

fn read_text(gate: &Gate, args: &[Value]) -> KernelResult<Value> {
    let path = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| KernelError::type_error("fs.read_text(path: str)"))?;
    gate.require_resource(&CapabilityType::new("file.read"), path, "fs.read_text")?;
    std::fs::read_to_string(path)
        .map(Value::Str)
        .map_err(|e| KernelError::failed(format!("fs.read_text: {path}: {e}")))
}

//! Portunus: an event-sourced tool-execution router.
//!
//! Portunus takes a declarative plan of tool calls and drives it to a
//! terminal outcome through pluggable dispatch adapters, under strict
//! capability and policy governance. Every state transition is recorded in
//! an append-only event log that supports replay, invariant checking, and
//! content-addressed export bundles.
//!
//! # Core Principles
//!
//! - **Event-sourced**: one append per state transition; the append is the
//!   commit. Runs can be replayed and verified after the fact.
//! - **Deterministic**: canonical JSON everywhere state crosses a boundary,
//!   so run digests are portable across stores and platforms.
//! - **Capability-governed**: adapters declare what they can do; the router
//!   refuses to dispatch past a missing capability or a denying policy.
//! - **No ambient state**: registries and stores are constructor-injected;
//!   nothing is process-wide.
//!
//! # Architecture
//!
//! - [`core::store`]: SQLite (WAL) append-only event store
//! - [`core::router`]: run orchestration state machine
//! - [`adapters`]: dispatch protocol, registry, and built-ins
//! - [`core::replay`]: view reconstruction and invariant checking
//! - [`core::export`]: portable bundles with digest verification
//!
//! # Examples
//!
//! ```bash
//! # Execute a request against a persistent store
//! portunus run --request request.json --db portunus.db
//!
//! # Replay a run and check invariants
//! portunus replay --db portunus.db --run-id <RUN_ID>
//!
//! # Move a run between stores
//! portunus export --db portunus.db --run-id <RUN_ID> --output run.bundle.json
//! portunus import --db other.db --bundle run.bundle.json
//! ```

pub mod adapters;
pub mod core;

use crate::adapters::{
    AdapterRegistry, Capability, FakeAdapter, NullAdapter, SubprocessAdapter, SubprocessConfig,
};
use crate::core::error::PortunusError;
use crate::core::event::RunStatus;
use crate::core::export::{self, Bundle, ImportMode, ImportOptions};
use crate::core::inspect;
use crate::core::replay;
use crate::core::router::{Request, Router};
use crate::core::store::{EventStore, RunFilter};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(
    name = "portunus",
    version = env!("CARGO_PKG_VERSION"),
    about = "Event-sourced tool-execution router with capability-governed dispatch"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a run request through the built-in adapter registry
    Run(RunCli),

    /// List runs in a store with summary counts
    Inspect(InspectCli),

    /// Replay a run and check ordering invariants
    Replay(ReplayCli),

    /// Export a run as a portable, digest-verified bundle
    Export(ExportCli),

    /// Import a bundle into a store
    Import(ImportCli),

    /// List built-in adapters and their capabilities
    Adapters(AdaptersCli),
}

#[derive(clap::Args, Debug)]
struct RunCli {
    /// Request JSON file ('-' reads stdin).
    #[clap(long)]
    request: String,
    /// SQLite store path; ':memory:' is ephemeral.
    #[clap(long, default_value = ":memory:")]
    db: String,
    /// Register a subprocess adapter with this command line.
    #[clap(long = "subprocess-cmd", num_args = 1.., value_name = "CMD")]
    subprocess_cmd: Option<Vec<String>>,
}

#[derive(clap::Args, Debug)]
struct InspectCli {
    #[clap(long)]
    db: String,
    /// Filter by run status.
    #[clap(long)]
    status: Option<String>,
    /// Lower bound (inclusive) on created_at.
    #[clap(long)]
    since: Option<String>,
    #[clap(long, default_value = "50")]
    limit: usize,
    #[clap(long, default_value = "0")]
    offset: usize,
}

#[derive(clap::Args, Debug)]
struct ReplayCli {
    #[clap(long)]
    db: String,
    #[clap(long)]
    run_id: String,
    /// Report violations without failing the check.
    #[clap(long)]
    no_strict: bool,
}

#[derive(clap::Args, Debug)]
struct ExportCli {
    #[clap(long)]
    db: String,
    #[clap(long)]
    run_id: String,
    /// Write the bundle here instead of stdout.
    #[clap(long)]
    output: Option<PathBuf>,
    /// Omit the provenance record.
    #[clap(long)]
    no_provenance: bool,
}

#[derive(clap::Args, Debug)]
struct ImportCli {
    #[clap(long)]
    db: String,
    /// Bundle JSON file ('-' reads stdin).
    #[clap(long)]
    bundle: String,
    #[clap(long, value_enum, default_value = "reject-on-conflict")]
    mode: ImportMode,
    #[clap(long)]
    no_verify_digest: bool,
    #[clap(long)]
    no_verify_replay: bool,
}

#[derive(clap::Args, Debug)]
struct AdaptersCli {
    /// Filter by capability.
    #[clap(long, value_enum)]
    capability: Option<Capability>,
    #[clap(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl ValueEnum for Capability {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Capability::DryRun,
            Capability::Apply,
            Capability::Timeout,
            Capability::External,
        ]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

fn read_input(path: &str) -> Result<String, PortunusError> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Registry the CLI runs with: null (default), fake, and optionally a
/// subprocess adapter built from `--subprocess-cmd`.
fn built_in_registry(
    subprocess_cmd: Option<Vec<String>>,
) -> Result<AdapterRegistry, PortunusError> {
    let mut registry = AdapterRegistry::new("null");
    registry.register(Arc::new(NullAdapter::default()))?;
    registry.register(Arc::new(FakeAdapter::new("fake")))?;
    if let Some(base_cmd) = subprocess_cmd {
        let adapter = SubprocessAdapter::new(SubprocessConfig::new(base_cmd))?;
        registry.register(Arc::new(adapter))?;
    }
    Ok(registry)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), PortunusError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| PortunusError::Config(format!("Unable to render output: {e}")))?;
    println!("{rendered}");
    Ok(())
}

pub fn run() -> Result<(), PortunusError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(run_cli) => {
            let raw = read_input(&run_cli.request)?;
            let request: Request = serde_json::from_str(&raw)
                .map_err(|e| PortunusError::Config(format!("Invalid request JSON: {e}")))?;
            let store = EventStore::open(&run_cli.db)?;
            let registry = built_in_registry(run_cli.subprocess_cmd)?;
            let mut router = Router::new(store, registry);
            let response = router.run(&request)?;
            print_json(&response)?;
        }
        Command::Inspect(inspect_cli) => {
            let store = EventStore::open(&inspect_cli.db)?;
            let filter = RunFilter {
                status: inspect_cli
                    .status
                    .as_deref()
                    .map(RunStatus::parse)
                    .transpose()?,
                since: inspect_cli.since,
                limit: Some(inspect_cli.limit),
                offset: inspect_cli.offset,
            };
            let report = inspect::inspect(&store, &filter)?;
            print_json(&report)?;
        }
        Command::Replay(replay_cli) => {
            let store = EventStore::open(&replay_cli.db)?;
            let report = replay::replay(&store, &replay_cli.run_id, !replay_cli.no_strict)?;
            print_json(&report)?;
        }
        Command::Export(export_cli) => {
            let store = EventStore::open(&export_cli.db)?;
            let bundle =
                export::export_run(&store, &export_cli.run_id, !export_cli.no_provenance)?;
            let rendered = export::bundle_to_canonical_json(&bundle)?;
            match export_cli.output {
                Some(path) => {
                    std::fs::write(&path, &rendered)?;
                    println!(
                        "{} Exported run {} to {}",
                        "✓".bright_green(),
                        export_cli.run_id,
                        path.display()
                    );
                }
                None => println!("{rendered}"),
            }
        }
        Command::Import(import_cli) => {
            let raw = read_input(&import_cli.bundle)?;
            let bundle: Bundle = serde_json::from_str(&raw)
                .map_err(|e| PortunusError::Config(format!("Invalid bundle JSON: {e}")))?;
            let mut store = EventStore::open(&import_cli.db)?;
            let outcome = export::import_bundle(
                &mut store,
                &bundle,
                &ImportOptions {
                    mode: import_cli.mode,
                    verify_digest: !import_cli.no_verify_digest,
                    verify_replay: !import_cli.no_verify_replay,
                },
            )?;
            print_json(&outcome)?;
        }
        Command::Adapters(adapters_cli) => {
            let registry = built_in_registry(None)?;
            let infos: Vec<_> = match adapters_cli.capability {
                Some(capability) => registry
                    .find_by_capability(capability)
                    .into_iter()
                    .filter_map(|id| registry.get(&id).ok())
                    .map(|a| crate::adapters::AdapterInfo::of(a.as_ref()))
                    .collect(),
                None => registry.list_adapters(),
            };
            match adapters_cli.format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "total": infos.len(),
                    "adapters": infos,
                    "default_adapter_id": registry.default_adapter_id(),
                }))?,
                OutputFormat::Text => {
                    for info in &infos {
                        let caps: Vec<&str> =
                            info.capabilities.iter().map(|c| c.as_str()).collect();
                        let marker = if info.adapter_id == registry.default_adapter_id() {
                            "●".bright_green()
                        } else {
                            "○".bright_black()
                        };
                        println!(
                            "  {} {} {} [{}]",
                            marker,
                            info.adapter_id.bright_white().bold(),
                            format!("({})", info.adapter_kind).bright_black(),
                            caps.join(", ").bright_cyan()
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

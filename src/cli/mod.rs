//! KN-012: CLI subcommands — init, validate, plan, deploy, status, wipe, completions.

use crate::core::config::{self, KilnConfig, Vars};
use crate::core::executor::{self, ExecuteConfig};
use crate::core::journal::Journal;
use crate::core::parser;
use crate::core::planner;
use crate::core::resolver;
use crate::core::store::{self, Backend};
use crate::core::types::{DeploymentPlan, EntryStatus, ExecutionReport, Module, PlanAction};
use crate::creators::{CommandCreator, Creator, SimulatedCreator};
use crate::tripwire::eventlog;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// File written after every successful deploy, keyed by `Module#id`.
pub const DEPLOYED_ADDRESSES: &str = "deployed_addresses.json";

#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    version,
    about = "Idempotent declarative contract deployment — journaled, resumable, reproducible"
)]
pub struct Cli {
    /// Log level or filter directives (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Emit diagnostics as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Journal storage backend.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendArg {
    #[default]
    Yaml,
    Sqlite,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Yaml => Backend::Yaml,
            BackendArg::Sqlite => Backend::Sqlite,
        }
    }
}

/// Options shared by every command that touches a deployment.
#[derive(clap::Args, Debug, Clone)]
pub struct Target {
    /// Path to kiln.toml
    #[arg(short, long, default_value = "kiln.toml")]
    pub config: PathBuf,

    /// Network name from kiln.toml
    #[arg(short, long)]
    pub network: String,

    /// State directory
    #[arg(long, default_value = "state")]
    pub state_dir: PathBuf,

    /// Journal backend
    #[arg(long, value_enum, default_value_t = BackendArg::Yaml)]
    pub backend: BackendArg,

    /// Use the offline simulated deployer and its own journal
    #[arg(long)]
    pub simulate: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new kiln project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate kiln.toml and module files without touching any network
    Validate {
        /// Path to kiln.toml
        #[arg(short, long, default_value = "kiln.toml")]
        config: PathBuf,

        /// Module files to check
        #[arg(short, long)]
        module: Vec<PathBuf>,
    },

    /// Show what a deploy would do against the journal
    Plan {
        /// Module file
        #[arg(short, long)]
        module: PathBuf,

        #[command(flatten)]
        target: Target,
    },

    /// Deploy a module, resuming from the journal
    Deploy {
        /// Module file
        #[arg(short, long)]
        module: PathBuf,

        #[command(flatten)]
        target: Target,
    },

    /// Show journal entries for every deployment in the state directory
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Journal backend
        #[arg(long, value_enum, default_value_t = BackendArg::Yaml)]
        backend: BackendArg,

        /// Restrict to one module
        #[arg(short, long)]
        module: Option<String>,
    },

    /// Forget a failed or interrupted journal entry (`Module#id`)
    Wipe {
        /// Entry key, e.g. ExchangeToken#exchange
        key: String,

        #[command(flatten)]
        target: Target,
    },

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { config, module } => cmd_validate(&config, &module),
        Commands::Plan { module, target } => cmd_plan(&module, &target),
        Commands::Deploy { module, target } => cmd_deploy(&module, &target),
        Commands::Status {
            state_dir,
            backend,
            module,
        } => cmd_status(&state_dir, backend.into(), module.as_deref()),
        Commands::Wipe { key, target } => cmd_wipe(&key, &target),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "kiln", &mut std::io::stdout());
            Ok(())
        }
    }
}

const CONFIG_TEMPLATE: &str = r#"[compiler]
version = "0.8.26"
optimizer = { enabled = true, runs = 200 }

[strategy]
kind = "basic"

[networks.localhost]
url = "http://127.0.0.1:8545"
chain_id = 31337
accounts = ["{{vars.PRIVATE_KEY}}"]

[deployer]
# Receives one JSON request on stdin; prints the deployed address last.
# command = "npx ts-node scripts/deploy.ts"
"#;

const MODULE_TEMPLATE: &str = r#"module: Example
contracts:
  token:
    contract: Token
    args: ["Example", "EXM"]
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("kiln.toml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let modules_dir = path.join("modules");
    let state_dir = path.join("state");
    for dir in [&modules_dir, &state_dir] {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
    }

    let module_path = modules_dir.join("Example.yaml");
    std::fs::write(&config_path, CONFIG_TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;
    if !module_path.exists() {
        std::fs::write(&module_path, MODULE_TEMPLATE)
            .map_err(|e| format!("cannot write {}: {}", module_path.display(), e))?;
    }

    println!("Initialized kiln project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}", module_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(config_path: &Path, modules: &[PathBuf]) -> Result<(), String> {
    let config = config::load_config(config_path).map_err(|e| e.to_string())?;
    let mut failures = 0usize;

    let errors = config::validate_config(&config);
    if errors.is_empty() {
        println!(
            "OK: {} ({} networks, strategy {})",
            config_path.display(),
            config.networks.len(),
            config.strategy.name()
        );
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        failures += errors.len();
    }

    for path in modules {
        let file = parser::parse_module_file(path).map_err(|e| e.to_string())?;
        let errors = parser::validate_module(&file);
        if !errors.is_empty() {
            for e in &errors {
                eprintln!("  ERROR: {}: {}", path.display(), e);
            }
            failures += errors.len();
            continue;
        }
        let module = file.into_module().map_err(|e| e.to_string())?;
        match resolver::build_execution_order(&module) {
            Ok(order) => println!(
                "OK: {} ({} contracts: {})",
                module.name,
                order.order.len(),
                order.order.join(" -> ")
            ),
            Err(e) => {
                eprintln!("  ERROR: {}: {}", path.display(), e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        return Err(format!("{} validation error(s)", failures));
    }
    Ok(())
}

/// Directory holding the journal, event log and address file for a chain.
pub fn deployment_dir(state_dir: &Path, chain_id: u64, simulate: bool) -> PathBuf {
    if simulate {
        state_dir.join(format!("chain-{}-simulated", chain_id))
    } else {
        state_dir.join(format!("chain-{}", chain_id))
    }
}

fn load_parts(module_path: &Path, target: &Target) -> Result<(KilnConfig, Module, PathBuf), String> {
    let config = config::load_config(&target.config).map_err(|e| e.to_string())?;
    let errors = config::validate_config(&config);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err("validation failed".to_string());
    }
    let module = parser::load_module(module_path).map_err(|e| e.to_string())?;
    let chain_id = config.chain_id(&target.network).map_err(|e| e.to_string())?;
    let dir = deployment_dir(&target.state_dir, chain_id, target.simulate);
    Ok((config, module, dir))
}

fn open_journal(dir: &Path, backend: Backend) -> Result<Journal, String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
    Journal::open(dir, backend).map_err(|e| e.to_string())
}

fn cmd_plan(module_path: &Path, target: &Target) -> Result<(), String> {
    let (_config, module, dir) = load_parts(module_path, target)?;
    let journal = if dir.exists() {
        Journal::open(&dir, target.backend.into()).map_err(|e| e.to_string())?
    } else {
        Journal::in_memory().map_err(|e| e.to_string())?
    };

    let order = resolver::build_execution_order(&module).map_err(|e| e.to_string())?;
    let plan = planner::plan(&module, &order, &journal).map_err(|e| e.to_string())?;
    print_plan(&plan, &target.network);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(plan: &DeploymentPlan, network: &str) {
    println!(
        "Planning: {} on {} ({} contracts)",
        plan.module,
        network,
        plan.steps.len()
    );
    println!();
    for step in &plan.steps {
        let symbol = match step.action {
            PlanAction::Create => "+",
            PlanAction::Retry => "~",
            PlanAction::Recover => "?",
            PlanAction::Reuse { .. } => " ",
        };
        println!("  {} {}", symbol, step.description);
    }
    println!();
    println!(
        "Plan: {} to deploy, {} to retry, {} to recover, {} reused.",
        plan.to_create, plan.to_retry, plan.to_recover, plan.reused
    );
}

fn cmd_deploy(module_path: &Path, target: &Target) -> Result<(), String> {
    let (config, module, dir) = load_parts(module_path, target)?;
    let env = config
        .target(&target.network, &Vars::from_env())
        .map_err(|e| e.to_string())?;

    let mut creator: Box<dyn Creator> = if target.simulate {
        Box::new(SimulatedCreator::new())
    } else {
        let command = config.deployer.command.clone().ok_or_else(|| {
            "no [deployer] command in kiln.toml (use --simulate for a rehearsal)".to_string()
        })?;
        let mut c = CommandCreator::new(command);
        if let Some(verify) = &config.deployer.verify_command {
            c = c.with_verify(verify.clone());
        }
        Box::new(c)
    };

    let journal = open_journal(&dir, target.backend.into())?;
    let log = eventlog::event_log_path(&dir);
    let mut cfg = ExecuteConfig {
        module: &module,
        journal: &journal,
        creator: creator.as_mut(),
        target: &env,
        event_log: Some(&log),
    };

    let report = executor::execute(&mut cfg).map_err(|e| e.to_string())?;
    write_deployed_addresses(&dir, &report)?;
    print_report(&report, &target.network);
    Ok(())
}

fn print_report(report: &ExecutionReport, network: &str) {
    println!("{} on {}:", report.module, network);
    for (name, result) in &report.outputs {
        println!("  {} = {}", name, result);
    }
    println!();
    println!(
        "Deploy complete: {} deployed, {} reused ({:.1}s).",
        report.created,
        report.reused,
        report.total_duration.as_secs_f64()
    );
}

/// Merge a module's results into `deployed_addresses.json`.
///
/// The read-merge-write runs under `deployed_addresses.json.lock` so
/// concurrent deploys into one directory keep each other's entries.
pub fn write_deployed_addresses(dir: &Path, report: &ExecutionReport) -> Result<(), String> {
    let path = dir.join(DEPLOYED_ADDRESSES);
    let lock = store::lock_path(&path);
    let _held = store::FileLock::exclusive(&lock)
        .map_err(|e| format!("cannot lock {}: {}", lock.display(), e))?;

    let mut addresses: IndexMap<String, String> = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| format!("invalid {}: {}", path.display(), e))?
    } else {
        IndexMap::new()
    };

    for (id, result) in &report.results {
        addresses.insert(format!("{}#{}", report.module, id), result.clone());
    }

    let json = serde_json::to_string_pretty(&addresses)
        .map_err(|e| format!("JSON serialize error: {}", e))?;
    store::write_atomic(&path, &format!("{}\n", json))
        .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
    Ok(())
}

fn cmd_status(state_dir: &Path, backend: Backend, module_filter: Option<&str>) -> Result<(), String> {
    let entries = std::fs::read_dir(state_dir)
        .map_err(|e| format!("cannot read state dir {}: {}", state_dir.display(), e))?;

    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("chain-"))
        })
        .collect();
    dirs.sort();

    let mut found = false;
    for dir in &dirs {
        let journal = Journal::open(dir, backend).map_err(|e| e.to_string())?;
        let entries = journal.entries(module_filter).map_err(|e| e.to_string())?;
        if entries.is_empty() {
            continue;
        }
        found = true;

        let name = dir.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        println!("Deployment: {}", name);
        println!("  Entries: {}", entries.len());
        for e in &entries {
            let detail = match e.status {
                EntryStatus::Completed => e.result.clone().unwrap_or_default(),
                EntryStatus::Failed => e.error.clone().unwrap_or_default(),
                EntryStatus::Pending => "interrupted".to_string(),
            };
            println!(
                "    {}: {} [{}] {} (attempts {})",
                e.key(),
                e.status,
                e.kind,
                detail,
                e.attempts
            );
        }
        println!();
    }

    if !found {
        println!("No journal entries found. Run `kiln deploy` first.");
    }
    Ok(())
}

/// Split `Module#id` into its parts.
pub fn parse_entry_key(key: &str) -> Result<(&str, &str), String> {
    match key.split_once('#') {
        Some((module, id)) if !module.is_empty() && !id.is_empty() => Ok((module, id)),
        _ => Err(format!("expected Module#id, got '{}'", key)),
    }
}

fn cmd_wipe(key: &str, target: &Target) -> Result<(), String> {
    let (module, id) = parse_entry_key(key)?;
    let config = config::load_config(&target.config).map_err(|e| e.to_string())?;
    let chain_id = config.chain_id(&target.network).map_err(|e| e.to_string())?;
    let dir = deployment_dir(&target.state_dir, chain_id, target.simulate);
    if !dir.exists() {
        return Err(format!("no deployment at {}", dir.display()));
    }

    let journal = Journal::open(&dir, target.backend.into()).map_err(|e| e.to_string())?;
    let removed = journal.wipe(module, id).map_err(|e| e.to_string())?;
    println!(
        "Wiped {} ({}, {} attempt(s))",
        removed.key(),
        removed.status,
        removed.attempts
    );
    Ok(())
}

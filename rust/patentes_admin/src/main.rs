//! patentes-admin - inspect and edit family/capability assignments.
//!
//! Reads run against a JSON snapshot (`--snapshot`, loaded into memory) or a
//! redb database (`--db`). Writes need `--db`.
//!
//! ```bash
//! patentes-admin --db perms.redb import seed.json
//! patentes-admin --db perms.redb effective u1
//! patentes-admin --snapshot seed.json check u1 DeleteUser
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use patentes_core::{
    parse_engine_config, CapabilityId, EngineConfig, FamilyId, GraphSnapshot, GraphStore,
    MemoryGraphStore, PermissionEngine, UserId,
};
use patentes_store::RedbGraphStore;

#[derive(Parser)]
#[command(name = "patentes-admin")]
#[command(about = "Inspect and edit hierarchical permission assignments")]
#[command(version)]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(long, global = true, env = "PATENTES_CONFIG")]
    config: Option<PathBuf>,

    /// redb database file
    #[arg(long, global = true, env = "PATENTES_DB")]
    db: Option<PathBuf>,

    /// Graph snapshot (JSON), served from memory
    #[arg(long, global = true, env = "PATENTES_SNAPSHOT", conflicts_with = "db")]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a snapshot into the database
    Import {
        #[arg(value_name = "SNAPSHOT")]
        file: PathBuf,
    },
    /// Print a user's effective permissions as JSON
    Effective { user: String },
    /// Exit 0 if the user holds the capability, 1 otherwise
    Check { user: String, capability: String },
    /// Report whether adding PARENT -> CHILD would close a cycle
    WouldCycle { parent: String, child: String },
    /// Add a parent/child family edge
    Link { parent: String, child: String },
    /// Remove a parent/child family edge
    Unlink { parent: String, child: String },
    /// List edges that close a cycle in the stored graph
    Audit,
}

impl Commands {
    fn writes(&self) -> bool {
        matches!(
            self,
            Commands::Import { .. } | Commands::Link { .. } | Commands::Unlink { .. }
        )
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = parse_engine_config(&raw)
        .with_context(|| format!("parsing config {}", path.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn load_snapshot(path: &Path) -> anyhow::Result<GraphSnapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    GraphSnapshot::from_json(&raw).with_context(|| format!("parsing snapshot {}", path.display()))
}

fn run<S: GraphStore>(engine: &PermissionEngine<S>, command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Import { .. } => bail!("import requires --db"),
        Commands::Effective { user } => {
            let perms = engine.get_effective_permissions(&UserId::new(user))?;
            println!("{}", serde_json::to_string_pretty(&perms.sorted())?);
        }
        Commands::Check { user, capability } => {
            let granted =
                engine.user_has_capability(&UserId::new(user), &CapabilityId::new(capability))?;
            println!("{}", if granted { "granted" } else { "denied" });
            if !granted {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::WouldCycle { parent, child } => {
            let cycle = engine.would_create_cycle(&FamilyId::new(parent), &FamilyId::new(child))?;
            println!("{}", cycle);
        }
        Commands::Link { parent, child } => {
            engine.add_family_edge(&FamilyId::new(parent), &FamilyId::new(child))?;
        }
        Commands::Unlink { parent, child } => {
            engine.remove_family_edge(&FamilyId::new(parent), &FamilyId::new(child))?;
        }
        Commands::Audit => {
            let cycles = engine.audit_cycles()?;
            for (from, to) in &cycles {
                println!("{} -> {}", from, to);
            }
            if cycles.is_empty() {
                info!("no cycles found");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("patentes=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match (&cli.db, &cli.snapshot) {
        (Some(db), _) => {
            let store = RedbGraphStore::open(db)
                .with_context(|| format!("opening database {}", db.display()))?;
            if let Commands::Import { file } = &cli.command {
                store.import_snapshot(&load_snapshot(file)?)?;
                info!(db = %db.display(), "import complete");
                return Ok(ExitCode::SUCCESS);
            }
            let engine = PermissionEngine::new(Arc::new(store), &config);
            run(&engine, cli.command)
        }
        (None, Some(snapshot)) => {
            if cli.command.writes() {
                bail!("write commands require --db");
            }
            let store = MemoryGraphStore::from_snapshot(&load_snapshot(snapshot)?);
            let engine = PermissionEngine::new(Arc::new(store), &config);
            run(&engine, cli.command)
        }
        (None, None) => bail!("one of --db or --snapshot is required"),
    }
}

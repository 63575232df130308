//! hierepo: developer tool for the hierepo workspace layer.
//!
//! Works on an in-memory repository persisted as a JSON snapshot. Every
//! command loads the snapshot, runs through a `WorkspaceManager`, prints the
//! events it observes and saves the snapshot again.
//!
//! # Usage
//!
//! ```bash
//! # Create an empty repository with two workspaces
//! hierepo --snapshot repo.json init --workspace default --workspace staging
//!
//! # Apply a JSON change script as one change log
//! hierepo --snapshot repo.json apply changes.json
//!
//! # Version a node and copy it into another workspace
//! hierepo --snapshot repo.json checkin /docs
//! hierepo --snapshot repo.json -w staging copy --from default /docs /docs
//!
//! # Print the content tree
//! hierepo --snapshot repo.json show /
//! ```

mod script;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hierepo_core::{
    EventBundle, InMemoryRepositoryService, InternalEventListener, ItemId, Operation, Path,
    SessionInfo, WorkspaceConfig, WorkspaceManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

type Manager = WorkspaceManager<InMemoryRepositoryService>;

#[derive(Parser, Debug)]
#[command(name = "hierepo")]
#[command(author = "Hierepo Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Inspect and modify a snapshot-backed content repository")]
struct Cli {
    /// Repository snapshot file
    #[arg(short, long, default_value = "repository.json")]
    snapshot: PathBuf,

    /// Workspace configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace to open
    #[arg(short, long, default_value = "default")]
    workspace: String,

    /// User the session acts as
    #[arg(short, long, default_value = "admin")]
    user: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty repository snapshot
    Init {
        /// Workspaces to create
        #[arg(long = "workspace", default_value = "default")]
        workspaces: Vec<String>,
        /// Replace an existing snapshot
        #[arg(long)]
        force: bool,
    },

    /// Print the tree below a node
    Show {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Apply a JSON change script as one change log
    Apply { script: PathBuf },

    /// Check in a versionable node
    Checkin { path: String },

    /// Check out a versionable node
    Checkout { path: String },

    /// Copy a subtree, optionally from another workspace
    Copy {
        /// Source workspace (default: the opened workspace)
        #[arg(long)]
        from: Option<String>,
        source: String,
        dest: String,
    },
}

/// Settings shared by all commands
struct Session {
    snapshot: PathBuf,
    config: WorkspaceConfig,
    workspace: String,
    user: String,
}

impl Session {
    async fn open(&self) -> Result<(Arc<InMemoryRepositoryService>, Manager)> {
        let service = InMemoryRepositoryService::load_snapshot(&self.snapshot)
            .with_context(|| format!("Failed to load snapshot {:?}", self.snapshot))?;
        let service = Arc::new(service);
        let info = Arc::new(SessionInfo::new(self.user.clone(), self.workspace.clone()));
        let manager = WorkspaceManager::new(service.clone(), info, self.config.clone())
            .await
            .with_context(|| format!("Failed to open workspace '{}'", self.workspace))?;
        manager.add_event_listener(Arc::new(EventPrinter));
        Ok((service, manager))
    }

    async fn close(&self, service: &InMemoryRepositoryService, manager: Manager) -> Result<()> {
        manager.dispose().await;
        service
            .save_snapshot(&self.snapshot)
            .await
            .with_context(|| format!("Failed to save snapshot {:?}", self.snapshot))?;
        debug!("snapshot saved to {:?}", self.snapshot);
        Ok(())
    }
}

/// Prints every committed event on stdout
struct EventPrinter;

impl InternalEventListener for EventPrinter {
    fn on_event(&self, bundle: &EventBundle<'_>) {
        let origin = if bundle.is_local() { "local" } else { "external" };
        for event in bundle.events() {
            match &event.user_id {
                Some(user) => println!("  [{}] {} (by {})", origin, event, user),
                None => println!("  [{}] {}", origin, event),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => WorkspaceConfig::load(path)?,
        None => WorkspaceConfig::default(),
    };
    let session = Session {
        snapshot: cli.snapshot,
        config,
        workspace: cli.workspace,
        user: cli.user,
    };

    match cli.command {
        Commands::Init { workspaces, force } => cmd_init(&session, &workspaces, force).await,
        Commands::Show { path } => cmd_show(&session, &path).await,
        Commands::Apply { script } => cmd_apply(&session, &script).await,
        Commands::Checkin { path } => {
            let node = script::node(&parse_path(&path)?)?;
            cmd_execute(&session, Operation::Checkin { node }).await
        }
        Commands::Checkout { path } => {
            let node = script::node(&parse_path(&path)?)?;
            cmd_execute(&session, Operation::Checkout { node }).await
        }
        Commands::Copy { from, source, dest } => {
            let operation = copy_operation(&session, from, &source, &dest)?;
            cmd_execute(&session, operation).await
        }
    }
}

fn parse_path(literal: &str) -> Result<Path> {
    Path::parse(literal).with_context(|| format!("Invalid path '{}'", literal))
}

fn copy_operation(session: &Session, from: Option<String>, source: &str, dest: &str) -> Result<Operation> {
    let dest = parse_path(dest)?;
    let dest_parent = dest
        .parent()
        .with_context(|| format!("Cannot copy onto {}", dest))?;
    let dest_name = dest
        .name()
        .cloned()
        .with_context(|| format!("Cannot copy onto {}", dest))?;
    Ok(Operation::Copy {
        workspace: from.unwrap_or_else(|| session.workspace.clone()),
        source: script::node(&parse_path(source)?)?,
        dest_parent: script::node(&dest_parent)?,
        dest_name,
    })
}

async fn cmd_init(session: &Session, workspaces: &[String], force: bool) -> Result<()> {
    if session.snapshot.exists() && !force {
        anyhow::bail!(
            "{:?} already exists; pass --force to replace it",
            session.snapshot
        );
    }
    let names: Vec<&str> = workspaces.iter().map(String::as_str).collect();
    let service = InMemoryRepositoryService::with_workspaces(&names);
    service
        .save_snapshot(&session.snapshot)
        .await
        .with_context(|| format!("Failed to write snapshot {:?}", session.snapshot))?;
    println!("Initialized repository at {:?}", session.snapshot);
    println!("  Workspaces: {}", workspaces.join(", "));
    Ok(())
}

async fn cmd_apply(session: &Session, script_path: &std::path::Path) -> Result<()> {
    let data = std::fs::read_to_string(script_path)
        .with_context(|| format!("Failed to read script {:?}", script_path))?;
    let steps = script::parse(&data)?;

    let (service, manager) = session.open().await?;
    let log = script::change_log(&steps, manager.id_factory())?;
    info!("applying {} steps to workspace '{}'", log.len(), session.workspace);
    println!("Applying {} steps...", log.len());
    let result = manager
        .execute_change_log(&log)
        .await
        .context("Change script was rejected; nothing was applied");
    if result.is_ok() {
        session.close(&service, manager).await?;
        println!("Done.");
    } else {
        manager.dispose().await;
    }
    result
}

async fn cmd_execute(session: &Session, operation: Operation) -> Result<()> {
    let (service, manager) = session.open().await?;
    println!("Executing {}...", operation.kind());
    let result = manager
        .execute(&operation)
        .await
        .with_context(|| format!("{} failed", operation.kind()));
    if result.is_ok() {
        session.close(&service, manager).await?;
        println!("Done.");
    } else {
        manager.dispose().await;
    }
    result
}

async fn cmd_show(session: &Session, path: &str) -> Result<()> {
    let (_service, manager) = session.open().await?;
    let result = print_tree(&manager, &parse_path(path)?).await;
    manager.dispose().await;
    result
}

/// Depth-first listing: one line per node, properties indented below it
async fn print_tree(manager: &Manager, path: &Path) -> Result<()> {
    let start: ItemId = script::node(path)?.into();
    let mut pending = vec![(start, 0usize)];
    while let Some((id, depth)) = pending.pop() {
        let state = manager
            .item_state(&id)
            .await
            .with_context(|| format!("Failed to load {}", id))?;
        let Some(node) = state.as_node() else {
            continue;
        };
        let indent = "  ".repeat(depth);
        let label = state
            .path()
            .map(|p| p.to_string())
            .unwrap_or_else(|| id.to_string());
        println!("{}{} [{}]", indent, label, node.primary_type);

        let node_id = id.owning_node().clone();
        for name in &node.property_names {
            let property_id = manager.id_factory().create_property_id(&node_id, name.clone());
            let property = manager.item_state(&property_id.into()).await?;
            if let Some(data) = property.as_property() {
                let values: Vec<String> = data.values.iter().map(|v| v.to_string()).collect();
                if data.multi_valued {
                    println!("{}  - {} = [{}]", indent, name, values.join(", "));
                } else {
                    println!("{}  - {} = {}", indent, name, values.join(", "));
                }
            }
        }
        for child in node.children.iter().rev() {
            pending.push((child.id.clone().into(), depth + 1));
        }
    }
    Ok(())
}

//! Itemvault CLI
//!
//! Inspects and edits a memory-backend snapshot through the same router and
//! transaction manager the kernel uses.
//!
//! # Usage
//! ```bash
//! itemvault --snapshot vault.json items
//! itemvault --snapshot vault.json tree <ITEM>
//! itemvault --snapshot vault.json get <ITEM> ViewPoint/Report/last/data
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use itemvault_core::backend::MemoryBackend;
use itemvault_core::cluster::{ClusterPath, ItemId, Property};
use itemvault_core::config::StorageConfig;
use itemvault_core::router::{ClusterEntry, StorageRouter};
use itemvault_core::transaction::TransactionManager;

/// Backend id the snapshot is registered under
const SNAPSHOT_BACKEND: &str = "snapshot";

/// Itemvault - inspect item cluster trees
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Snapshot file holding the stored objects
    #[arg(short, long, value_name = "FILE", default_value = "itemvault.json")]
    snapshot: PathBuf,

    /// Storage configuration (.toml or .json)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List every item in the snapshot
    Items,

    /// List the children of a path (cluster types when no path is given)
    Ls {
        item: ItemId,
        #[arg(default_value = "")]
        path: String,
    },

    /// Print the object stored at a path
    Get { item: ItemId, path: String },

    /// Print the cluster tree below a path
    Tree {
        item: ItemId,
        #[arg(default_value = "")]
        path: String,
    },

    /// Set a property, creating the item if needed
    Set {
        item: ItemId,
        name: String,
        value: String,
    },

    /// Recursively remove everything below a path
    Rm { item: ItemId, path: String },
}

/// Router and transaction manager over one snapshot file
struct Vault {
    backend: Arc<MemoryBackend>,
    tm: TransactionManager,
}

impl Vault {
    fn open(snapshot: &Path, config: StorageConfig) -> anyhow::Result<Self> {
        let backend = if snapshot.exists() {
            MemoryBackend::load_snapshot(SNAPSHOT_BACKEND, snapshot)
                .with_context(|| format!("loading snapshot {}", snapshot.display()))?
        } else {
            info!(path = %snapshot.display(), "Snapshot not found, starting empty");
            MemoryBackend::new(SNAPSHOT_BACKEND)
        };
        let backend = Arc::new(backend);
        let router = StorageRouter::builder()
            .config(config)
            .backend(backend.clone())
            .build()?;
        Ok(Self {
            backend,
            tm: TransactionManager::new(router),
        })
    }

    fn save(&self, snapshot: &Path) -> anyhow::Result<()> {
        self.backend
            .save_snapshot(snapshot)
            .with_context(|| format!("saving snapshot {}", snapshot.display()))
    }

    fn describe(&self, item: &ItemId, path: &str) -> anyhow::Result<String> {
        let text = match self.tm.get(item, path, None)? {
            ClusterEntry::Object(object) => serde_json::to_string_pretty(object.as_ref())?,
            ClusterEntry::History(mut history) => {
                let events = history.values()?;
                serde_json::to_string_pretty(&events)?
            }
            ClusterEntry::Jobs(mut jobs) => {
                let jobs = jobs.values()?;
                serde_json::to_string_pretty(&jobs)?
            }
        };
        Ok(text)
    }

    fn tree(&self, item: &ItemId, path: &str) -> anyhow::Result<String> {
        let mut out = String::new();
        if path.trim_matches('/').is_empty() {
            for cluster in self.tm.get_cluster_contents(item, "", None)? {
                self.walk(item, &ClusterPath::parse(&cluster)?, 0, &mut out)?;
            }
        } else {
            self.walk(item, &ClusterPath::parse(path)?, 0, &mut out)?;
        }
        Ok(out)
    }

    fn walk(&self, item: &ItemId, path: &ClusterPath, depth: usize, out: &mut String) -> anyhow::Result<()> {
        let label = path
            .last()
            .map(str::to_string)
            .unwrap_or_else(|| path.cluster_type().to_string());
        writeln!(out, "{}{}", "  ".repeat(depth), label)?;
        for child in self.tm.get_cluster_contents(item, &path.to_string(), None)? {
            self.walk(item, &path.child(child)?, depth + 1, out)?;
        }
        Ok(())
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => StorageConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => StorageConfig::default(),
    };
    let vault = Vault::open(&cli.snapshot, config)?;

    match cli.command {
        Commands::Items => {
            for item in vault.backend.items() {
                println!("{}", item);
            }
        }
        Commands::Ls { item, path } => {
            for name in vault.tm.get_cluster_contents(&item, &path, None)? {
                println!("{}", name);
            }
        }
        Commands::Get { item, path } => {
            println!("{}", vault.describe(&item, &path)?);
        }
        Commands::Tree { item, path } => {
            print!("{}", vault.tree(&item, &path)?);
        }
        Commands::Set { item, name, value } => {
            vault.tm.put(&item, Property::new(name, value).into(), None)?;
            vault.save(&cli.snapshot)?;
        }
        Commands::Rm { item, path } => {
            vault.tm.remove_cluster(&item, &path, None)?;
            vault.save(&cli.snapshot)?;
        }
    }

    vault.tm.close()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    run(cli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use itemvault_core::cluster::{Event, Outcome};
    use itemvault_core::remote_map::History;

    fn seeded(dir: &Path) -> (PathBuf, ItemId) {
        let snapshot = dir.join("vault.json");
        let vault = Vault::open(&snapshot, StorageConfig::default()).unwrap();
        let item = ItemId::new();
        vault.tm.put(&item, Property::new("Name", "widget").into(), None).unwrap();
        vault.tm.put(&item, Outcome::new("Report", 0, 0, "<r/>").into(), None).unwrap();
        let mut history = History::new(Arc::new(vault.tm.clone()), item, None);
        history.add_event(Event::new("alice", "Admin", "Create", "Done")).unwrap();
        vault.save(&snapshot).unwrap();
        (snapshot, item)
    }

    #[test]
    fn test_tree_walks_every_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let (snapshot, item) = seeded(dir.path());
        let vault = Vault::open(&snapshot, StorageConfig::default()).unwrap();

        let tree = vault.tree(&item, "").unwrap();
        assert_eq!(
            tree,
            "Property\n  Name\nOutcome\n  Report\n    0\n      0\nAuditTrail\n  0\n"
        );
    }

    #[test]
    fn test_describe_virtual_history() {
        let dir = tempfile::tempdir().unwrap();
        let (snapshot, item) = seeded(dir.path());
        let vault = Vault::open(&snapshot, StorageConfig::default()).unwrap();

        let text = vault.describe(&item, "AuditTrail").unwrap();
        assert!(text.contains("alice"));
        assert!(vault.describe(&item, "Property/Missing").is_err());
    }

    #[test]
    fn test_rm_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (snapshot, item) = seeded(dir.path());
        let item_arg = item.to_string();
        let cli = Cli::parse_from([
            "itemvault",
            "--snapshot",
            snapshot.to_str().unwrap(),
            "rm",
            item_arg.as_str(),
            "Outcome",
        ]);
        run(cli).unwrap();

        let vault = Vault::open(&snapshot, StorageConfig::default()).unwrap();
        assert_eq!(
            vault.tm.get_cluster_contents(&item, "", None).unwrap(),
            vec!["Property", "AuditTrail"]
        );
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hoard_core::{CancelToken, Store, StoreConfig};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod output;

use output::{
    FsckOutput, GcOutput, InitOutput, NodeInfo, NodesOutput, OutputWriter, RemoveNodeOutput,
};

/// Hoard - A content-addressed backup store
#[derive(Parser)]
#[command(name = "hoard")]
#[command(about = "Content-addressed backup store with self-healing enumeration", long_about = None)]
#[command(version)]
struct Cli {
    /// Store root directory
    #[arg(short, long, global = true, env = "HOARD_ROOT")]
    root: Option<PathBuf>,

    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Log at debug level (HOARD_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store
    Init {
        /// Hex characters of a digest used to pick its shard
        #[arg(long, default_value_t = hoard_core::DEFAULT_SPLIT_AT)]
        split_at: usize,
    },

    /// Check both tables, quarantining anything invalid
    Fsck {
        /// Skip rehashing blob content
        #[arg(long)]
        quick: bool,
    },

    /// Move blobs not reachable from any node to the trash
    Gc {
        /// Dry run - show what would be removed without removing
        #[arg(long)]
        dry_run: bool,
    },

    /// Output blob content to stdout
    Cat {
        /// Digest of the blob
        digest: String,
    },

    /// List node records
    Nodes,

    /// Move a node record to the trash
    RmNode {
        /// Record path, as printed by `nodes`
        item: String,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("HOARD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("hoard={},hoard_core={}", level, level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let output = OutputWriter::new(cli.json);
    if let Err(e) = run(cli, &output) {
        output.write_error(&e, 1);
        std::process::exit(1);
    }
}

fn run(cli: Cli, output: &OutputWriter) -> Result<()> {
    let root = cli
        .root
        .context("No store root: pass --root or set HOARD_ROOT")?;

    match cli.command {
        Commands::Init { split_at } => cmd_init(&root, split_at, output),
        Commands::Fsck { quick } => cmd_fsck(&root, quick, output),
        Commands::Gc { dry_run } => cmd_gc(&root, dry_run, output),
        Commands::Cat { digest } => cmd_cat(&root, &digest),
        Commands::Nodes => cmd_nodes(&root, output),
        Commands::RmNode { item } => cmd_rm_node(&root, &item, output),
    }
}

fn open_store(root: &Path) -> Result<Store> {
    Store::open(root).with_context(|| format!("Failed to open store at {}", root.display()))
}

/// Open the store, refusing to continue while it needs fsck.
fn open_consistent(root: &Path) -> Result<Store> {
    let store = open_store(root)?;
    store
        .ensure_consistent()
        .with_context(|| format!("Store at {} needs fsck", root.display()))?;
    Ok(store)
}

fn cmd_init(root: &Path, split_at: usize, output: &OutputWriter) -> Result<()> {
    let config = StoreConfig {
        split_at,
        ..StoreConfig::default()
    };

    Store::init(root, config)
        .with_context(|| format!("Failed to initialize store at {}", root.display()))?;

    let data = InitOutput {
        success: true,
        result_code: 0,
        root: root.display().to_string(),
        algorithm: config.algorithm.as_str().to_string(),
        split_at,
    };
    output.write(&data, || {
        format!(
            "Initialized hoard store at {}\nAlgorithm: {}\n",
            root.display(),
            config.algorithm.as_str()
        )
    })
}

fn cmd_fsck(root: &Path, quick: bool, output: &OutputWriter) -> Result<()> {
    let store = open_store(root)?;

    let report = store
        .fsck(&CancelToken::new(), !quick)
        .with_context(|| "Failed to run fsck")?;

    let data = FsckOutput::from(&report);
    output.write(&data, || {
        let mut text = format!(
            "Scanned {} blobs and {} nodes\n",
            report.blobs, report.nodes
        );
        for digest in &report.corrupt_blobs {
            text.push_str(&format!("Quarantined corrupt blob {}\n", digest));
        }
        for item in &report.dangling_nodes {
            text.push_str(&format!("Node {} points at a missing tree\n", item));
        }
        if report.stale_staged > 0 {
            text.push_str(&format!(
                "Moved {} abandoned staged writes to the trash\n",
                report.stale_staged
            ));
        }
        for error in &report.errors {
            text.push_str(&format!("Error: {}\n", error));
        }
        text
    })?;

    if !report.is_ok() {
        anyhow::bail!("fsck could not scan the whole store");
    }
    Ok(())
}

fn cmd_gc(root: &Path, dry_run: bool, output: &OutputWriter) -> Result<()> {
    let store = open_consistent(root)?;

    let stats = store
        .gc(&CancelToken::new(), dry_run)
        .with_context(|| "Failed to run garbage collection")?;

    let data = GcOutput {
        success: true,
        result_code: 0,
        dry_run,
        blobs_scanned: stats.blobs_scanned,
        nodes_scanned: stats.nodes_scanned,
        orphans: stats.orphans,
        bytes_freed: stats.bytes_freed,
        dangling: stats.dangling,
    };
    output.write(&data, || {
        if dry_run {
            format!(
                "Dry run - no blobs removed\nWould remove {} blobs\nWould free {} bytes\n",
                stats.orphans, stats.bytes_freed
            )
        } else {
            format!(
                "Removed {} blobs\nFreed {} bytes\n",
                stats.orphans, stats.bytes_freed
            )
        }
    })
}

fn cmd_cat(root: &Path, digest: &str) -> Result<()> {
    let store = open_consistent(root)?;

    let mut blob = store
        .cas()
        .open(digest)
        .with_context(|| format!("Failed to open blob {}", digest))?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    io::copy(&mut blob, &mut handle).with_context(|| format!("Failed to output blob {}", digest))?;

    Ok(())
}

fn cmd_nodes(root: &Path, output: &OutputWriter) -> Result<()> {
    let store = open_consistent(root)?;

    let nodes: Vec<NodeInfo> = store
        .nodes()
        .enumerate(&CancelToken::new())
        .collect_all()
        .with_context(|| "Failed to list nodes")?
        .into_iter()
        .map(|entry| NodeInfo {
            item: entry.item,
            entry: entry.node.entry,
            comment: entry.node.comment,
        })
        .collect();

    let data = NodesOutput {
        success: true,
        result_code: 0,
        nodes,
    };
    output.write(&data, || {
        if data.nodes.is_empty() {
            return "No nodes\n".to_string();
        }
        data.nodes
            .iter()
            .map(|n| format!("{} -> {}\n", n.item, n.entry))
            .collect()
    })
}

fn cmd_rm_node(root: &Path, item: &str, output: &OutputWriter) -> Result<()> {
    let store = open_consistent(root)?;

    store
        .nodes()
        .remove(item)
        .with_context(|| format!("Failed to remove node: {}", item))?;

    let data = RemoveNodeOutput {
        success: true,
        result_code: 0,
        item: item.to_string(),
    };
    output.write(&data, || format!("Removed node: {}\n", item))
}

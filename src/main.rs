//! # Memory Defrag CLI (`memdefrag`)
//!
//! The `memdefrag` binary finds near-duplicate records in a memory store,
//! shows what merging them would do, and commits approved merges behind a
//! verified backup.
//!
//! ## Usage
//!
//! ```bash
//! memdefrag --config ./config/memdefrag.toml <command>
//! memdefrag --store ./data/memory.db <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memdefrag init` | Create an empty SQLite memory store |
//! | `memdefrag analyze` | Cluster near-duplicates and print recommendations |
//! | `memdefrag preview` | Show what merging the selected clusters would change |
//! | `memdefrag optimize` | Back up the store, then merge the selected clusters |
//! | `memdefrag backup <action>` | Create, list, verify, restore, delete or prune backups |
//! | `memdefrag check` | Store integrity check plus backup checksum verification |
//! | `memdefrag stats` | Record counts, size, age range and top tags |
//!
//! Cluster numbers are the 1-based positions printed by `analyze`. Every
//! command re-analyzes the store, so numbers refer to the current contents.
//!
//! ## Examples
//!
//! ```bash
//! # Look for duplicates
//! memdefrag analyze --show 5
//!
//! # See what merging the two largest clusters would do
//! memdefrag preview --cluster 1 --cluster 2
//!
//! # Merge every cluster, keeping an audit trail
//! memdefrag optimize --all
//!
//! # Undo a merge
//! memdefrag backup restore 3f1c…
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use memory_defrag::config::{self, Config};
use memory_defrag::migrate;
use memory_defrag::models::{AnalysisResult, Cluster, OptimizationRequest};
use memory_defrag::progress::ProgressMode;
use memory_defrag::session::Session;
use memory_defrag::stats::{format_bytes, print_statistics};

/// Memory Defrag: deduplicate embedding-backed memory stores.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file, or `--store` to name the store directly.
#[derive(Parser)]
#[command(
    name = "memdefrag",
    about = "Memory Defrag — find and safely merge near-duplicate memories",
    version,
    long_about = "Memory Defrag clusters records whose embeddings are near-identical, \
    synthesizes one consolidated record per cluster, and commits approved merges to \
    SQLite or collection stores after taking a checksummed backup."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/memdefrag.toml")]
    config: PathBuf,

    /// Store to operate on. Overrides `[store].path`; when the config file
    /// does not exist, every other setting takes its default.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Analysis progress on stderr: `auto`, `off`, `human` or `json`.
    #[arg(long, global = true, default_value = "auto", value_parser = parse_progress)]
    progress: ProgressMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty SQLite memory store.
    ///
    /// Idempotent: existing tables and rows are left alone.
    Init,

    /// Cluster near-duplicate records and print the findings.
    Analyze {
        /// Number of clusters to print in detail.
        #[arg(long, default_value_t = 10)]
        show: usize,
    },

    /// Show what merging the selected clusters would change. Writes nothing.
    Preview {
        #[command(flatten)]
        selection: Selection,
    },

    /// Back up the store, then merge the selected clusters.
    Optimize {
        #[command(flatten)]
        selection: Selection,

        /// Validate and report without taking a backup or writing.
        #[arg(long)]
        dry_run: bool,

        /// Do not record optimization_date, merged_count, merged_ids and
        /// original_content_hash on the surviving record.
        #[arg(long)]
        no_audit_trail: bool,

        /// Keep only the survivor's own metadata instead of the union.
        #[arg(long)]
        no_preserve_metadata: bool,
    },

    /// Manage store backups.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Run the store's integrity check and verify every backup checksum.
    Check,

    /// Show store statistics.
    Stats,
}

/// Which clusters of the current analysis to act on.
#[derive(clap::Args)]
struct Selection {
    /// 1-based cluster number as printed by `analyze`. Repeatable.
    #[arg(long = "cluster", required_unless_present = "all")]
    clusters: Vec<usize>,

    /// Every cluster found.
    #[arg(long, conflicts_with = "clusters")]
    all: bool,
}

#[derive(Subcommand)]
enum BackupAction {
    /// Take a backup of the store now.
    Create,
    /// List backups whose files still exist.
    List,
    /// Recompute a backup's checksum and compare it with the catalog.
    Verify { id: Uuid },
    /// Replace the live store with a backup.
    Restore { id: Uuid },
    /// Delete a backup file and its catalog entry.
    Delete { id: Uuid },
    /// Delete all but the most recent backups.
    Cleanup {
        /// Number of backups to keep. Defaults to `[backup].keep_last`.
        #[arg(long)]
        keep_last: Option<usize>,
    },
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    match s {
        "auto" => Ok(ProgressMode::default_for_tty()),
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!(
            "invalid progress mode '{}': expected auto, off, human or json",
            other
        )),
    }
}

fn resolve_config(cli: &Cli) -> Result<Config> {
    match &cli.store {
        Some(store) if !cli.config.exists() => Ok(Config::minimal(store.clone())),
        Some(store) => {
            let mut cfg = config::load_config(&cli.config)?;
            cfg.store.path = store.clone();
            Ok(cfg)
        }
        None => config::load_config(&cli.config),
    }
}

/// Map 1-based cluster numbers to cluster ids.
fn select_clusters(analysis: &AnalysisResult, selection: &Selection) -> Result<Vec<Uuid>> {
    if analysis.clusters.is_empty() {
        bail!("No duplicate clusters found; nothing to select.");
    }
    if selection.all {
        return Ok(analysis.clusters.iter().map(|c| c.id).collect());
    }
    selection
        .clusters
        .iter()
        .map(|&n| match n.checked_sub(1).and_then(|i| analysis.clusters.get(i)) {
            Some(cluster) => Ok(cluster.id),
            None => bail!(
                "Cluster {} does not exist (analysis found {}).",
                n,
                analysis.clusters.len()
            ),
        })
        .collect()
}

fn snippet(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > max {
        format!("{}…", line.chars().take(max).collect::<String>())
    } else {
        line.to_string()
    }
}

fn print_cluster(number: usize, cluster: &Cluster) {
    println!(
        "  #{:<3} {} records  similarity {:.3} ({})  saves {}%",
        number,
        cluster.members.len(),
        cluster.similarity,
        cluster.label(),
        cluster.savings_percent()
    );
    for member in &cluster.members {
        println!(
            "        {}  {}  {}",
            member.timestamp.format("%Y-%m-%d"),
            member.id,
            snippet(&member.content, 60)
        );
    }
}

fn print_analysis(analysis: &AnalysisResult, show: usize) {
    println!("Analysis");
    println!("========");
    println!();
    println!("  Records:     {}", analysis.total_records);
    println!("  Clusters:    {}", analysis.clusters.len());
    println!("  Duplicates:  {}", analysis.total_duplicates());
    println!("  Savings:     {}%", analysis.potential_savings_percent);

    if !analysis.clusters.is_empty() && show > 0 {
        println!();
        for (i, cluster) in analysis.clusters.iter().take(show).enumerate() {
            print_cluster(i + 1, cluster);
        }
        if analysis.clusters.len() > show {
            println!("  … {} more", analysis.clusters.len() - show);
        }
    }

    if !analysis.recommendations.is_empty() {
        println!();
        println!("  Recommendations:");
        for rec in &analysis.recommendations {
            println!("    [{:?}] {}: {}", rec.impact, rec.title, rec.description);
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("memory_defrag=info"));
    fmt().with_writer(std::io::stderr).with_env_filter(filter).init();

    let cfg = resolve_config(&cli)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg.store.path)
            .await
            .with_context(|| format!("Failed to initialize {}", cfg.store.path.display()))?;
        println!("Store initialized at {}.", cfg.store.path.display());
        return Ok(());
    }

    let session = Session::open(&cfg).await?;
    let reporter = cli.progress.reporter();

    match cli.command {
        Commands::Init => {}
        Commands::Analyze { show } => {
            let analysis = session.analyze(&*reporter).await?;
            print_analysis(&analysis, show);
        }
        Commands::Preview { selection } => {
            let analysis = session.analyze(&*reporter).await?;
            let request = OptimizationRequest::approve(select_clusters(&analysis, &selection)?);
            let preview = session.preview(&analysis, &request)?;
            println!(
                "Preview: {} records -> {} ({}% fewer)",
                preview.records_before, preview.records_after, preview.savings_percent
            );
            for change in &preview.changes {
                println!();
                println!(
                    "  cluster {}: {} -> {}",
                    change.cluster_id, change.records_before, change.records_after
                );
                for old in &change.old_contents {
                    println!("    - {}", snippet(old, 70));
                }
                println!("    + {}", change.new_content.replace('\n', "\n      "));
            }
        }
        Commands::Optimize {
            selection,
            dry_run,
            no_audit_trail,
            no_preserve_metadata,
        } => {
            let analysis = session.analyze(&*reporter).await?;
            let request = OptimizationRequest {
                preserve_metadata: !no_preserve_metadata,
                create_audit_trail: !no_audit_trail,
                dry_run,
                ..OptimizationRequest::approve(select_clusters(&analysis, &selection)?)
            };
            let report = session.optimize(&analysis, &request).await?;
            if report.dry_run {
                println!("Dry run: nothing was written.");
            }
            println!("  clusters merged:  {}", report.clusters_merged);
            println!("  records before:   {}", report.records_before);
            println!("  records after:    {}", report.records_after);
            println!("  records removed:  {}", report.records_removed);
            if let Some(backup) = &report.backup {
                println!("  backup:           {}", backup.id);
            }
            if let Some(err) = &report.maintenance_error {
                println!("  maintenance:      failed ({})", err);
            }
            if !report.dry_run {
                println!("ok");
            }
        }
        Commands::Backup { action } => match action {
            BackupAction::Create => {
                let backup = session.backup().await?;
                println!(
                    "Backup {} created: {} records, {}",
                    backup.id,
                    backup.record_count,
                    format_bytes(backup.size_bytes)
                );
            }
            BackupAction::List => {
                let backups = session.backups().list_backups()?;
                if backups.is_empty() {
                    println!("No backups.");
                } else {
                    println!(
                        "{:<36}  {:<20}  {:>8}  {:>10}",
                        "ID", "CREATED", "RECORDS", "SIZE"
                    );
                    for b in backups {
                        println!(
                            "{:<36}  {:<20}  {:>8}  {:>10}",
                            b.id,
                            b.created_at.format("%Y-%m-%d %H:%M:%S"),
                            b.record_count,
                            format_bytes(b.size_bytes)
                        );
                    }
                }
            }
            BackupAction::Verify { id } => {
                let backup = session.backups().verify_backup(id).await?;
                println!("Backup {} verified (sha256 {}).", backup.id, backup.checksum);
            }
            BackupAction::Restore { id } => {
                let backup = session.restore(id).await?;
                println!(
                    "Restored backup {} ({} records).",
                    backup.id, backup.record_count
                );
            }
            BackupAction::Delete { id } => {
                let backup = session.backups().delete_backup(id)?;
                println!("Deleted backup {}.", backup.id);
            }
            BackupAction::Cleanup { keep_last } => {
                let keep = keep_last.unwrap_or(cfg.backup.keep_last);
                let removed = session.backups().cleanup_old_backups(keep)?;
                println!("Removed {} backup(s), kept {}.", removed.len(), keep);
            }
        },
        Commands::Check => {
            session.integrity_check().await?;
            println!("Store integrity: ok");
            let mut failed = 0usize;
            for backup in session.backups().list_backups()? {
                match session.backups().verify_backup(backup.id).await {
                    Ok(_) => println!("  backup {}: ok", backup.id),
                    Err(e) => {
                        failed += 1;
                        println!("  backup {}: {}", backup.id, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} backup(s) failed verification", failed);
            }
        }
        Commands::Stats => {
            let stats = session.statistics().await?;
            print_statistics(&cfg.store.path.display().to_string(), &stats);
        }
    }

    session.close().await;
    Ok(())
}

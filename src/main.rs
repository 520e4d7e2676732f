//! ALFA Vault Store - CLI
//!
//! Command-line interface for vault operations.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

use alfa_vault_store::{ImportEvent, SourceFile, StoreConfig, Vault, VaultKey};

#[derive(Parser)]
#[command(name = "alfa-vault")]
#[command(author = "Karen Tonoyan")]
#[command(version = alfa_vault_store::VERSION)]
#[command(about = "ALFA Vault Store - encrypted local object store")]
struct Cli {
    /// Storage root
    #[arg(short, long, default_value = "./vault")]
    root: PathBuf,

    /// JSON store configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unlock pattern
    #[arg(short, long)]
    pattern: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vault for this pattern (no-op if it exists)
    Init,

    /// Import files; directories are walked recursively
    Import {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// List stored files
    List,

    /// Decrypt a file to disk
    Export {
        /// File ID
        id: Uuid,

        /// Output path
        output: PathBuf,
    },

    /// Delete a file
    Delete {
        /// File ID
        id: Uuid,
    },

    /// Stage files for a later process-pending
    Stage {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Import all staged batches
    ProcessPending,

    /// Re-wrap the vault under a new pattern
    ChangePattern {
        /// New unlock pattern
        new_pattern: String,
    },

    /// Check container randomness and decrypt every file
    SelfTest,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };

    let vault = Vault::open(&cli.root, config)
        .with_context(|| format!("opening vault root {}", cli.root.display()))?;
    let key = VaultKey::from_pattern(cli.pattern.as_bytes())?;

    match cli.command {
        Commands::Init => {
            let index = vault.init(&key)?;
            println!("Vault {} ready ({} files)", key.fingerprint(), index.live_files().count());
        }

        Commands::Import { paths } => {
            let sources = collect_sources(&paths)?;
            let total = sources.len();
            println!("Importing {} file(s)...", total);

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_ctrl_c.cancel();
                }
            });

            let mut done = 0usize;
            let summary = vault
                .import_files(&key, sources, cancel, |event| {
                    done += 1;
                    match event {
                        ImportEvent::Imported(item) => {
                            println!("[{}/{}] {} {}", done, total, item.file_id, item.filename)
                        }
                        ImportEvent::Failed { reason } => println!(
                            "[{}/{}] failed: {}",
                            done,
                            total,
                            reason.as_deref().unwrap_or("unknown")
                        ),
                    }
                })
                .await?;

            print!("{} imported, {} failed", summary.imported, summary.failed);
            if let Some(reason) = summary.failure_reason {
                print!(" ({})", reason);
            }
            if summary.cancelled {
                print!(" - cancelled");
            }
            println!();
        }

        Commands::List => {
            let files = vault.list_files(&key)?;
            if files.is_empty() {
                println!("No files in vault");
            } else {
                println!("{:<36}  {:>12}  {:<24}  Name", "ID", "Size", "Type");
                for file in files {
                    println!(
                        "{:<36}  {:>12}  {:<24}  {}",
                        file.file_id, file.original_size, file.mime_type, file.filename
                    );
                }
            }
        }

        Commands::Export { id, output } => {
            let len = vault.export_file(&key, &id, &output)?;
            println!("Exported {} bytes to {}", len, output.display());
        }

        Commands::Delete { id } => {
            vault.delete_file(&key, &id)?;
            println!("Deleted {}", id);
        }

        Commands::Stage { paths } => {
            let files: Vec<PathBuf> = collect_sources(&paths)?.into_iter().map(|s| s.path).collect();
            let manifest = vault.stage_import(&key, &files)?;
            println!("Staged batch {} ({} files)", manifest.batch_id, manifest.items.len());
        }

        Commands::ProcessPending => {
            let result = vault
                .process_pending_imports(&key, |done, total| println!("[{}/{}]", done, total))
                .await?;
            println!(
                "{} imported, {} failed, {} batch(es) cleaned{}",
                result.imported,
                result.failed,
                result.batches_cleaned,
                result
                    .failure_reason
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            );
        }

        Commands::ChangePattern { new_pattern } => {
            let new_key = VaultKey::from_pattern(new_pattern.as_bytes())?;
            vault.change_key(&key, &new_key)?;
            println!("Pattern changed, vault is now {}", new_key.fingerprint());
        }

        Commands::SelfTest => {
            let report = vault.self_test(&key)?;
            for container in &report.containers {
                println!(
                    "{}  {} bytes  {}",
                    container.path.display(),
                    container.size,
                    if container.looks_random { "ok" } else { "NOT RANDOM" }
                );
            }
            for id in &report.unreadable {
                println!("unreadable: {}", id);
            }
            if !report.is_healthy() {
                return Err(anyhow!("self-test failed"));
            }
            println!("Self-test passed");
        }
    }

    Ok(())
}

/// Expand files and directories into import sources
fn collect_sources(paths: &[PathBuf]) -> Result<Vec<SourceFile>> {
    let mut sources = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    sources.push(source(entry.path())?);
                }
            }
        } else {
            sources.push(source(path)?);
        }
    }
    Ok(sources)
}

fn source(path: &Path) -> Result<SourceFile> {
    SourceFile::from_path(path).with_context(|| format!("reading {}", path.display()))
}

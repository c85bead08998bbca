use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use datakeep::{AtomicFileStore, BackupPolicy, BackupRotation, PersistError, VersionedEnvelope};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dataset-tool")]
#[command(about = "Maintenance tooling for datakeep data files and their backups")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show format, schema version and compatibility of a data file.
    Inspect {
        file: PathBuf,
        #[arg(long)]
        current_version: Option<u32>,
    },
    /// List backups of a data file, newest first.
    Backups { file: PathBuf },
    /// Replace a data file with its newest backup. The current file is
    /// quarantined first.
    Restore { file: PathBuf },
    /// Delete all but the newest `keep` backups.
    Prune {
        file: PathBuf,
        #[arg(long, default_value_t = 5)]
        keep: usize,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Inspect {
            file,
            current_version,
        } => inspect(&file, current_version).await,
        Command::Backups { file } => list_backups(&file).await,
        Command::Restore { file } => restore(&file).await,
        Command::Prune { file, keep } => prune(&file, keep).await,
    }
}

async fn inspect(file: &Path, current_version: Option<u32>) -> Result<()> {
    let store = AtomicFileStore::default();
    let bytes = match store.read(file).await {
        Ok(bytes) => bytes,
        Err(PersistError::Corrupted { reason, .. }) => {
            println!("File: {}", file.display());
            println!("Format: unreadable ({})", reason);
            return Err(anyhow!("'{}' is not loadable", file.display()));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read '{}'", file.display()));
        }
    };

    println!("File: {}", file.display());
    println!("Size: {} bytes", bytes.len());
    println!(
        "Backups: {}",
        BackupRotation::default().count(file).await
    );

    let Ok(raw) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        println!("Format: not JSON (binary or corrupt)");
        return Ok(());
    };

    let (stored_version, _) = VersionedEnvelope::detect(raw);
    if stored_version == datakeep::persist::LEGACY_VERSION {
        println!("Format: JSON without version envelope (treated as version 0)");
    } else {
        println!("Format: versioned JSON envelope");
    }
    println!("Stored schema version: {}", stored_version);

    let Some(current_version) = current_version else {
        return Ok(());
    };
    println!("Current schema version: {}", current_version);
    if stored_version > current_version {
        println!("Compatibility: FAILED (written by a newer version)");
        return Err(anyhow!(
            "stored schema {} > current {}",
            stored_version,
            current_version
        ));
    }
    if stored_version < current_version {
        println!("Compatibility: OK (migration required)");
    } else {
        println!("Compatibility: OK");
    }
    Ok(())
}

async fn list_backups(file: &Path) -> Result<()> {
    let backups = BackupRotation::default()
        .list(file)
        .await
        .with_context(|| format!("Failed to list backups of '{}'", file.display()))?;

    if backups.is_empty() {
        println!("No backups of '{}'", file.display());
        return Ok(());
    }

    println!("Backups of '{}' (newest first):", file.display());
    for backup in &backups {
        let modified: DateTime<Local> = backup.modified.into();
        println!(
            "  [{}] {}  modified {}",
            backup.age,
            backup.file_name(),
            modified.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn restore(file: &Path) -> Result<()> {
    let rotation = BackupRotation::default();
    let latest = rotation
        .latest(file)
        .await?
        .ok_or_else(|| anyhow!("No backups of '{}' to restore from", file.display()))?;

    if let Some(quarantined) = AtomicFileStore::default().quarantine(file).await {
        println!("Quarantined current file as '{}'", quarantined.display());
    }

    if !rotation.restore(file).await? {
        return Err(anyhow!("Backup of '{}' disappeared during restore", file.display()));
    }
    println!("Restored '{}' from '{}'", file.display(), latest.file_name());
    Ok(())
}

async fn prune(file: &Path, keep: usize) -> Result<()> {
    if keep == 0 {
        return Err(anyhow!("--keep must be at least 1"));
    }
    let rotation = BackupRotation::new(BackupPolicy {
        max_backups: keep,
        ..BackupPolicy::default()
    });
    let removed = rotation.cleanup(file).await;
    println!(
        "Removed {} backup(s) of '{}', {} kept",
        removed,
        file.display(),
        rotation.count(file).await
    );
    Ok(())
}

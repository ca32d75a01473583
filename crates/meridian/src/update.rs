//! Pre-update snapshots and rollback.
//!
//! The updater itself is an external collaborator; this module owns the
//! safety rails around it: snapshot the data directory before any update,
//! and restore the newest snapshot on rollback. Run these with the runtime
//! stopped.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use meridian_protocol::DataDir;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Report whether a newer version is advertised. The release feed adapter
/// is external; it surfaces the latest version via `MERIDIAN_LATEST_VERSION`.
pub fn check() -> Result<()> {
    match advertised_latest() {
        Some(latest) if latest != VERSION => {
            println!("update available: {VERSION} -> {latest}");
            Ok(())
        }
        Some(_) => {
            println!("up to date ({VERSION})");
            Ok(())
        }
        None => {
            println!("up to date ({VERSION}); no release feed configured");
            Ok(())
        }
    }
}

fn advertised_latest() -> Option<String> {
    std::env::var("MERIDIAN_LATEST_VERSION")
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Snapshot, then hand off to the external updater.
pub async fn update(data_dir: &DataDir) -> Result<()> {
    let snapshot = snapshot(data_dir)?;
    println!("backup written to {}", snapshot.display());
    // The apply step belongs to the external updater; nothing to do here.
    info!(snapshot = %snapshot.display(), "pre-update snapshot complete");
    Ok(())
}

/// Copy every persistent file into `backups/pre-update-<version>-<ts>/`.
pub fn snapshot(data_dir: &DataDir) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let dest = data_dir
        .backups_dir()
        .join(format!("pre-update-{VERSION}-{stamp}"));
    fs::create_dir_all(&dest)
        .with_context(|| format!("failed to create backup dir {}", dest.display()))?;

    for entry in fs::read_dir(data_dir.root())? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if !is_persistent_file(&path) {
            continue;
        }
        let name = entry.file_name();
        fs::copy(&path, dest.join(&name))
            .with_context(|| format!("failed to back up {}", path.display()))?;
    }
    Ok(dest)
}

/// Restore the most recent snapshot into the data directory.
pub fn rollback(data_dir: &DataDir) -> Result<()> {
    let latest = latest_snapshot(data_dir)?;
    for entry in fs::read_dir(&latest)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        fs::copy(&path, data_dir.root().join(entry.file_name()))
            .with_context(|| format!("failed to restore {}", path.display()))?;
    }
    println!("restored from {}", latest.display());
    Ok(())
}

fn latest_snapshot(data_dir: &DataDir) -> Result<PathBuf> {
    let mut snapshots: Vec<PathBuf> = fs::read_dir(data_dir.backups_dir())
        .context("no backups directory")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("pre-update-"))
                    .unwrap_or(false)
        })
        .collect();
    if snapshots.is_empty() {
        bail!("no pre-update backups found");
    }
    // Timestamped names sort chronologically.
    snapshots.sort();
    Ok(snapshots.pop().unwrap_or_default())
}

fn is_persistent_file(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    name.ends_with(".db")
        || name.ends_with(".db-wal")
        || name.ends_with(".db-shm")
        || name == "secrets.vault"
        || name == "config.toml"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(data_dir: &DataDir) {
        fs::write(data_dir.primary_db(), b"primary").unwrap();
        fs::write(data_dir.sentinel_db(), b"sentinel").unwrap();
        fs::write(data_dir.secrets_vault(), b"{}").unwrap();
        fs::write(data_dir.root().join("scratch.tmp"), b"junk").unwrap();
    }

    #[test]
    fn snapshot_copies_persistent_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = DataDir::new(dir.path());
        data_dir.ensure().unwrap();
        seed(&data_dir);

        let dest = snapshot(&data_dir).unwrap();
        assert!(dest.join("meridian.db").is_file());
        assert!(dest.join("sentinel.db").is_file());
        assert!(dest.join("secrets.vault").is_file());
        assert!(!dest.join("scratch.tmp").exists());
        let name = dest.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(&format!("pre-update-{VERSION}-")));
    }

    #[test]
    fn rollback_restores_latest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = DataDir::new(dir.path());
        data_dir.ensure().unwrap();
        seed(&data_dir);

        snapshot(&data_dir).unwrap();
        fs::write(data_dir.primary_db(), b"corrupted").unwrap();

        rollback(&data_dir).unwrap();
        assert_eq!(fs::read(data_dir.primary_db()).unwrap(), b"primary");
    }

    #[test]
    fn rollback_without_backups_fails() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = DataDir::new(dir.path());
        data_dir.ensure().unwrap();
        assert!(rollback(&data_dir).is_err());
    }
}

//! Data-directory layout.
//!
//! Everything Meridian persists lives under one directory:
//!
//! ```text
//! <data-dir>/
//!   meridian.db        primary partition (jobs, conversations, messages)
//!   journal.db         memory pipeline staging
//!   sentinel.db        decision memory
//!   audit-YYYY-MM.db   one partition per active month
//!   secrets.vault      sealed secrets
//!   workspace/         gear-visible files
//!   gear-packages/     installed gears
//!   backups/           pre-update snapshots
//! ```

use std::path::{Path, PathBuf};

/// Resolved data directory with helpers for each well-known path.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location: `$MERIDIAN_HOME`, else `~/.meridian`.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        if let Some(root) = explicit {
            return Self::new(root);
        }
        if let Ok(home) = std::env::var("MERIDIAN_HOME") {
            return Self::new(home);
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".meridian"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn primary_db(&self) -> PathBuf {
        self.root.join("meridian.db")
    }

    pub fn journal_db(&self) -> PathBuf {
        self.root.join("journal.db")
    }

    pub fn sentinel_db(&self) -> PathBuf {
        self.root.join("sentinel.db")
    }

    /// `month` is a `YYYY-MM` key.
    pub fn audit_db(&self, month: &str) -> PathBuf {
        self.root.join(format!("audit-{month}.db"))
    }

    pub fn secrets_vault(&self) -> PathBuf {
        self.root.join("secrets.vault")
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.root.join("workspace")
    }

    pub fn gear_packages_dir(&self) -> PathBuf {
        self.root.join("gear-packages")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create the directory skeleton.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.workspace_dir())?;
        std::fs::create_dir_all(self.gear_packages_dir())?;
        std::fs::create_dir_all(self.backups_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

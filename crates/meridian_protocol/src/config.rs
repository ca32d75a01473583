//! Runtime configuration.
//!
//! Loaded from `<data-dir>/config.toml` merged over defaults. Every
//! recognized key has an explicit default; unknown keys are rejected so a
//! typo never silently disables a policy.

use crate::defaults;
use crate::error::ProtocolError;
use crate::types::{ActionType, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeridianConfig {
    /// Worker count in the pool.
    pub workers: usize,
    /// Root for gear filesystem operations. Defaults to `<data-dir>/workspace`
    /// when unset.
    pub workspace_path: Option<PathBuf>,
    /// Default hosts for `network_get` approval.
    pub allowlisted_domains: Vec<String>,
    /// Hard reject threshold for `financial_transaction`.
    pub max_transaction_amount_usd: f64,
    /// Dedup hash window.
    pub dedup_window_ms: i64,
    /// External HTTP session lifetime (consumed by the API front-end).
    pub session_duration_hours: u64,
    /// Approval memoization for scheduled tasks.
    pub approval_cache_ttl_ms: u64,
    pub approval_cache_max_entries: usize,
    /// Fixed at sha-256 in v1; any other value is a config error.
    pub audit_chain_algorithm: String,
    /// Decision memory cap (oldest evicted beyond this).
    pub decision_memory_cap: i64,
    /// The shell gear is disabled unless explicitly enabled.
    pub shell_enabled: bool,
    /// Inline gear output cap before spilling to a workspace file.
    pub max_output_bytes: usize,
    /// Fetch capability body cap.
    pub max_fetch_bytes: usize,
    /// Per-action-type verdict overrides. Only ever tighten defaults.
    pub policies: HashMap<ActionType, Verdict>,
}

impl Default for MeridianConfig {
    fn default() -> Self {
        Self {
            workers: defaults::DEFAULT_WORKERS,
            workspace_path: None,
            allowlisted_domains: Vec::new(),
            max_transaction_amount_usd: defaults::DEFAULT_MAX_TRANSACTION_AMOUNT_USD,
            dedup_window_ms: defaults::DEFAULT_DEDUP_WINDOW_MS,
            session_duration_hours: defaults::DEFAULT_SESSION_DURATION_HOURS,
            approval_cache_ttl_ms: defaults::DEFAULT_APPROVAL_CACHE_TTL_MS,
            approval_cache_max_entries: defaults::DEFAULT_APPROVAL_CACHE_MAX_ENTRIES,
            audit_chain_algorithm: defaults::AUDIT_CHAIN_ALGORITHM.to_string(),
            decision_memory_cap: defaults::DEFAULT_DECISION_MEMORY_CAP,
            shell_enabled: false,
            max_output_bytes: defaults::DEFAULT_MAX_OUTPUT_BYTES,
            max_fetch_bytes: defaults::DEFAULT_MAX_FETCH_BYTES,
            policies: HashMap::new(),
        }
    }
}

impl MeridianConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ProtocolError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ProtocolError::ConfigRead {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        let config: Self = toml::from_str(&raw).map_err(|e| ProtocolError::ConfigParse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.audit_chain_algorithm != defaults::AUDIT_CHAIN_ALGORITHM {
            return Err(ProtocolError::UnsupportedChainAlgorithm(
                self.audit_chain_algorithm.clone(),
            ));
        }
        Ok(())
    }

    /// The effective workspace root given a data directory.
    pub fn workspace_root(&self, data_dir: &Path) -> PathBuf {
        self.workspace_path
            .clone()
            .unwrap_or_else(|| data_dir.join("workspace"))
    }

    /// The subset the policy engine consumes.
    pub fn policy_config(&self, data_dir: &Path) -> PolicyConfig {
        PolicyConfig {
            workspace_root: self.workspace_root(data_dir),
            allowlisted_domains: self.allowlisted_domains.clone(),
            max_transaction_amount_usd: self.max_transaction_amount_usd,
            policies: self.policies.clone(),
        }
    }
}

/// The information the policy engine is allowed to see. Deliberately excludes
/// user messages, history, and conversation identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    pub workspace_root: PathBuf,
    pub allowlisted_domains: Vec<String>,
    pub max_transaction_amount_usd: f64,
    pub policies: HashMap<ActionType, Verdict>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/workspace"),
            allowlisted_domains: Vec::new(),
            max_transaction_amount_usd: defaults::DEFAULT_MAX_TRANSACTION_AMOUNT_USD,
            policies: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = MeridianConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.dedup_window_ms, 5_000);
        assert_eq!(config.audit_chain_algorithm, "sha-256");
        assert!(!config.shell_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeridianConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.workers, MeridianConfig::default().workers);
    }

    #[test]
    fn parses_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "workers = 2\nallowlisted_domains = [\"api.example.com\"]\nmax_transaction_amount_usd = 500.0\n",
        )
        .unwrap();
        let config = MeridianConfig::load(&path).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.allowlisted_domains, vec!["api.example.com"]);
        assert_eq!(config.max_transaction_amount_usd, 500.0);
        // untouched keys keep defaults
        assert_eq!(config.dedup_window_ms, 5_000);
    }

    #[test]
    fn rejects_unknown_chain_algorithm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "audit_chain_algorithm = \"md5\"\n").unwrap();
        assert!(MeridianConfig::load(&path).is_err());
    }

    #[test]
    fn workspace_root_defaults_under_data_dir() {
        let config = MeridianConfig::default();
        let root = config.workspace_root(Path::new("/data"));
        assert_eq!(root, PathBuf::from("/data/workspace"));
    }
}

//! Gear manifests: the declarative capability contract.

use serde::{Deserialize, Serialize};

/// Network/filesystem/shell permissions a gear declares up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GearPermissions {
    pub network: NetworkPermissions,
    pub filesystem: FilesystemPermissions,
    /// Shell access must be declared and is still gated by configuration.
    pub shell: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPermissions {
    /// Hosts this gear may reach in addition to the configured allowlist.
    pub domains: Vec<String>,
    /// Allowed URL schemes. HTTPS only unless declared otherwise.
    pub protocols: Vec<String>,
}

impl Default for NetworkPermissions {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            protocols: vec!["https".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FilesystemPermissions {
    /// Workspace-relative globs the gear may read.
    pub read: Vec<String>,
    /// Workspace-relative globs the gear may write or delete.
    pub write: Vec<String>,
}

/// Resource limits enforced by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GearResources {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u8,
    pub timeout_ms: u64,
}

impl Default for GearResources {
    fn default() -> Self {
        Self {
            max_memory_mb: 256,
            max_cpu_percent: 50,
            timeout_ms: meridian_protocol::defaults::EXECUTE_TIMEOUT_MS,
        }
    }
}

/// The manifest shipped with every gear package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GearManifest {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    pub actions: Vec<String>,
    #[serde(default)]
    pub permissions: GearPermissions,
    #[serde(default)]
    pub resources: GearResources,
}

impl GearManifest {
    pub fn new(id: impl Into<String>, actions: &[&str]) -> Self {
        Self {
            id: id.into(),
            version: None,
            actions: actions.iter().map(|a| a.to_string()).collect(),
            permissions: GearPermissions::default(),
            resources: GearResources::default(),
        }
    }

    pub fn supports(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_https_only_no_filesystem() {
        let manifest = GearManifest::new("sample", &["run"]);
        assert_eq!(manifest.permissions.network.protocols, vec!["https"]);
        assert!(manifest.permissions.network.domains.is_empty());
        assert!(manifest.permissions.filesystem.read.is_empty());
        assert!(!manifest.permissions.shell);
        assert!(manifest.supports("run"));
        assert!(!manifest.supports("fly"));
    }

    #[test]
    fn manifest_parses_from_json() {
        let raw = r#"{
            "id": "file-manager",
            "actions": ["read", "write", "delete", "list"],
            "permissions": {
                "filesystem": {"read": ["**/*"], "write": ["**/*"]}
            },
            "resources": {"timeout_ms": 60000}
        }"#;
        let manifest: GearManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.id, "file-manager");
        assert_eq!(manifest.resources.timeout_ms, 60_000);
        assert_eq!(manifest.resources.max_memory_mb, 256);
        assert_eq!(manifest.permissions.filesystem.write, vec!["**/*"]);
    }
}

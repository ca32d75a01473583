//! The sealed secrets vault.
//!
//! `secrets.vault` is a JSON document with base64-encoded values and a
//! per-gear ACL. Misses return `None` - a gear cannot distinguish "no such
//! secret" from "not yours to read".

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct VaultDocument {
    /// Secret name -> base64 value.
    #[serde(default)]
    secrets: HashMap<String, String>,
    /// Gear id -> secret names it may read. A `*` entry grants all.
    #[serde(default)]
    acl: HashMap<String, Vec<String>>,
}

/// In-memory view of the vault, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct SecretsVault {
    document: VaultDocument,
}

impl SecretsVault {
    /// Load from disk; a missing file yields an empty vault.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e),
        };
        let document: VaultDocument = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self { document })
    }

    /// Look up a secret on behalf of a gear. ACL denial and plain misses
    /// both return `None`; denials are logged.
    pub fn get(&self, gear_id: &str, name: &str) -> Option<String> {
        let allowed = self
            .document
            .acl
            .get(gear_id)
            .map(|names| names.iter().any(|n| n == name || n == "*"))
            .unwrap_or(false);
        if !allowed {
            if self.document.secrets.contains_key(name) {
                warn!(gear = gear_id, secret = name, "vault access denied by acl");
            }
            return None;
        }
        let encoded = self.document.secrets.get(name)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        String::from_utf8(bytes).ok()
    }

    #[cfg(test)]
    pub fn for_tests(secrets: &[(&str, &str)], acl: &[(&str, &[&str])]) -> Self {
        let document = VaultDocument {
            secrets: secrets
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        base64::engine::general_purpose::STANDARD.encode(value),
                    )
                })
                .collect(),
            acl: acl
                .iter()
                .map(|(gear, names)| {
                    (
                        gear.to_string(),
                        names.iter().map(|n| n.to_string()).collect(),
                    )
                })
                .collect(),
        };
        Self { document }
    }
}

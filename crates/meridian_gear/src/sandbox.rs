//! URL, path, and size policy enforcement.
//!
//! Deny by default: a URL must pass scheme, allowlist, and resolved-address
//! checks; a path must resolve inside the workspace and match the manifest
//! globs with no parent-directory segments.

use crate::manifest::GearManifest;
use globset::{Glob, GlobSet, GlobSetBuilder};
use meridian_protocol::defaults;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::net::lookup_host;
use url::Url;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("protocol '{0}' is not permitted")]
    ProtocolBlocked(String),

    #[error("host '{0}' is not allowlisted")]
    HostBlocked(String),

    #[error("host '{host}' resolves to a private or reserved address {addr}")]
    PrivateAddress { host: String, addr: IpAddr },

    #[error("dns resolution failed for '{host}': {source}")]
    DnsFailure {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path '{0}' escapes the workspace")]
    PathEscape(String),

    #[error("path '{0}' does not match the manifest's permitted globs")]
    PathNotPermitted(String),

    #[error("invalid glob in manifest: {0}")]
    InvalidGlob(#[from] globset::Error),

    #[error("response body exceeds the {limit} byte limit")]
    BodyTooLarge { limit: usize },
}

/// Per-gear sandbox policy assembled from configuration plus the manifest.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub workspace_root: PathBuf,
    pub allowlisted_domains: Vec<String>,
    pub max_fetch_bytes: usize,
    pub max_output_bytes: usize,
}

impl SandboxPolicy {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            allowlisted_domains: Vec::new(),
            max_fetch_bytes: defaults::DEFAULT_MAX_FETCH_BYTES,
            max_output_bytes: defaults::DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_allowlist(mut self, domains: Vec<String>) -> Self {
        self.allowlisted_domains = domains;
        self
    }

    /// Validate scheme and host against policy + manifest, then resolve the
    /// host and reject private or reserved addresses. Resolution happens
    /// after the allowlist check so a rebinding name cannot smuggle an
    /// internal address through.
    pub async fn check_url(&self, raw: &str, manifest: &GearManifest) -> Result<Url, SandboxError> {
        let url = Url::parse(raw).map_err(|e| SandboxError::InvalidUrl(e.to_string()))?;

        let scheme = url.scheme().to_lowercase();
        if !manifest
            .permissions
            .network
            .protocols
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&scheme))
        {
            return Err(SandboxError::ProtocolBlocked(scheme));
        }

        let host = url
            .host_str()
            .ok_or_else(|| SandboxError::InvalidUrl("url has no host".to_string()))?
            .to_lowercase();

        if !self.host_allowed(&host, manifest) {
            return Err(SandboxError::HostBlocked(host));
        }

        // Literal IP hosts skip DNS but still face the address check.
        if let Ok(addr) = host.parse::<IpAddr>() {
            if is_blocked_address(addr) {
                return Err(SandboxError::PrivateAddress { host, addr });
            }
            return Ok(url);
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = lookup_host((host.as_str(), port))
            .await
            .map_err(|source| SandboxError::DnsFailure {
                host: host.clone(),
                source,
            })?;
        for addr in addrs {
            if is_blocked_address(addr.ip()) {
                return Err(SandboxError::PrivateAddress {
                    host: host.clone(),
                    addr: addr.ip(),
                });
            }
        }

        Ok(url)
    }

    fn host_allowed(&self, host: &str, manifest: &GearManifest) -> bool {
        self.allowlisted_domains
            .iter()
            .chain(manifest.permissions.network.domains.iter())
            .any(|domain| {
                let domain = domain.to_lowercase();
                host == domain || host.ends_with(&format!(".{domain}"))
            })
    }

    /// Resolve a workspace path for reading or writing. Relative paths are
    /// joined to the workspace root; absolute paths must already live under
    /// it. Parent-directory segments are rejected outright.
    pub fn resolve_path(
        &self,
        raw: &str,
        manifest: &GearManifest,
        write: bool,
    ) -> Result<PathBuf, SandboxError> {
        let candidate = Path::new(raw);
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(SandboxError::PathEscape(raw.to_string()));
        }

        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace_root.join(candidate)
        };

        let relative = absolute
            .strip_prefix(&self.workspace_root)
            .map_err(|_| SandboxError::PathEscape(raw.to_string()))?;

        let globs = if write {
            &manifest.permissions.filesystem.write
        } else {
            &manifest.permissions.filesystem.read
        };
        if !build_globset(globs)?.is_match(relative) {
            return Err(SandboxError::PathNotPermitted(raw.to_string()));
        }

        Ok(absolute)
    }
}

fn build_globset(globs: &[String]) -> Result<GlobSet, SandboxError> {
    let mut builder = GlobSetBuilder::new();
    for glob in globs {
        builder.add(Glob::new(glob)?);
    }
    Ok(builder.build()?)
}

/// Private, loopback, link-local, and otherwise non-routable addresses are
/// never reachable from a gear.
pub fn is_blocked_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // Carrier-grade NAT, 100.64.0.0/10.
                || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
                // Documentation ranges.
                || (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)
                || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
                || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7 and link-local fe80::/10.
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().map(|v4| is_blocked_address(IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}

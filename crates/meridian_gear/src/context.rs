//! The capability context: a gear's only authority.
//!
//! Every operation goes through the sandbox policy. Log and progress events
//! are structured tracing events tagged with the execution correlation id.

use crate::manifest::GearManifest;
use crate::sandbox::{SandboxError, SandboxPolicy};
use crate::vault::SecretsVault;
use async_trait::async_trait;
use meridian_protocol::{CreateJob, ErrorCode, ErrorInfo};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Seam back into the job queue for `create_sub_job`. Implemented by the
/// orchestrator; gears only see this trait.
#[async_trait]
pub trait SubJobSpawner: Send + Sync {
    /// Create a job with `source = sub-job` and `parent_id` set. Returns the
    /// new job id.
    async fn spawn_sub_job(&self, parent_job_id: &str, options: CreateJob)
        -> Result<String, ErrorInfo>;
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: u16,
    pub body: String,
}

/// Constrained capability interface handed to a gear for one execution.
pub struct CapabilityContext {
    gear_id: String,
    manifest: GearManifest,
    policy: SandboxPolicy,
    vault: Arc<SecretsVault>,
    correlation_id: String,
    job_id: Option<String>,
    spawner: Option<Arc<dyn SubJobSpawner>>,
    http: reqwest::Client,
}

impl CapabilityContext {
    pub fn new(
        manifest: GearManifest,
        policy: SandboxPolicy,
        vault: Arc<SecretsVault>,
        correlation_id: impl Into<String>,
        job_id: Option<String>,
        spawner: Option<Arc<dyn SubJobSpawner>>,
    ) -> Self {
        Self {
            gear_id: manifest.id.clone(),
            manifest,
            policy,
            vault,
            correlation_id: correlation_id.into(),
            job_id,
            spawner,
            http: reqwest::Client::new(),
        }
    }

    pub fn gear_id(&self) -> &str {
        &self.gear_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn workspace_root(&self) -> &std::path::Path {
        &self.policy.workspace_root
    }

    /// Policy-guarded HTTP fetch. The URL must pass the scheme, allowlist,
    /// and resolved-address checks; the body is capped.
    pub async fn fetch(&self, url: &str, opts: FetchOptions) -> Result<FetchResult, SandboxError> {
        let url = self.policy.check_url(url, &self.manifest).await?;

        let method = opts
            .method
            .as_deref()
            .unwrap_or("GET")
            .parse::<reqwest::Method>()
            .map_err(|_| SandboxError::InvalidUrl("bad method".to_string()))?;
        let timeout = opts.timeout.unwrap_or(Duration::from_secs(30));

        let mut request = self.http.request(method, url).timeout(timeout);
        for (name, value) in &opts.headers {
            request = request.header(name, value);
        }
        if let Some(body) = opts.body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SandboxError::InvalidUrl(e.to_string()))?;
        let status = response.status().as_u16();
        if let Some(length) = response.content_length() {
            if length as usize > self.policy.max_fetch_bytes {
                return Err(SandboxError::BodyTooLarge {
                    limit: self.policy.max_fetch_bytes,
                });
            }
        }
        let body = response
            .text()
            .await
            .map_err(|e| SandboxError::InvalidUrl(e.to_string()))?;
        if body.len() > self.policy.max_fetch_bytes {
            return Err(SandboxError::BodyTooLarge {
                limit: self.policy.max_fetch_bytes,
            });
        }

        Ok(FetchResult { status, body })
    }

    pub async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let resolved = self.policy.resolve_path(path, &self.manifest, false)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| SandboxError::PathNotPermitted(format!("{}: {e}", resolved.display())))
    }

    pub async fn write_file(&self, path: &str, contents: &str) -> Result<PathBuf, SandboxError> {
        let resolved = self.policy.resolve_path(path, &self.manifest, true)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::PathNotPermitted(e.to_string()))?;
        }
        tokio::fs::write(&resolved, contents)
            .await
            .map_err(|e| SandboxError::PathNotPermitted(format!("{}: {e}", resolved.display())))?;
        Ok(resolved)
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        let resolved = self.policy.resolve_path(path, &self.manifest, true)?;
        tokio::fs::remove_file(&resolved)
            .await
            .map_err(|e| SandboxError::PathNotPermitted(format!("{}: {e}", resolved.display())))
    }

    pub async fn list_files(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        let resolved = self.policy.resolve_path(path, &self.manifest, false)?;
        let mut entries = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| SandboxError::PathNotPermitted(format!("{}: {e}", resolved.display())))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SandboxError::PathNotPermitted(e.to_string()))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Vault lookup under the gear's ACL. A miss is `None`, not an error.
    pub fn get_secret(&self, name: &str) -> Option<String> {
        self.vault.get(&self.gear_id, name)
    }

    /// Structured log event tagged with the execution correlation id.
    pub fn log(&self, message: &str) {
        info!(
            gear = %self.gear_id,
            correlation_id = %self.correlation_id,
            job_id = self.job_id.as_deref().unwrap_or(""),
            "{message}"
        );
    }

    pub fn progress(&self, percent: u8, message: &str) {
        info!(
            gear = %self.gear_id,
            correlation_id = %self.correlation_id,
            progress = percent.min(100),
            "{message}"
        );
    }

    /// Create a sub-job owned by this execution's job.
    pub async fn create_sub_job(&self, mut options: CreateJob) -> Result<String, ErrorInfo> {
        let parent = self.job_id.as_deref().ok_or_else(|| {
            ErrorInfo::new(ErrorCode::Validation, "no parent job for sub-job creation")
        })?;
        let spawner = self.spawner.as_ref().ok_or_else(|| {
            ErrorInfo::new(ErrorCode::PermissionDenied, "sub-job creation is not wired")
        })?;
        options.source = meridian_protocol::JobSource::SubJob;
        options.parent_id = Some(parent.to_string());
        spawner.spawn_sub_job(parent, options).await
    }

    /// Map a sandbox violation onto the error taxonomy.
    pub fn sandbox_error_info(err: &SandboxError) -> ErrorInfo {
        let code = match err {
            SandboxError::BodyTooLarge { .. } => ErrorCode::SizeLimitExceeded,
            _ => ErrorCode::PermissionDenied,
        };
        ErrorInfo::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_manifest() -> GearManifest {
        let mut m = GearManifest::new("file-manager", &["read", "write", "delete", "list"]);
        m.permissions.filesystem.read = vec!["**/*".to_string()];
        m.permissions.filesystem.write = vec!["**/*".to_string()];
        m
    }

    fn context(workspace: &std::path::Path) -> CapabilityContext {
        CapabilityContext::new(
            file_manifest(),
            SandboxPolicy::new(workspace),
            Arc::new(SecretsVault::for_tests(
                &[("token", "tok-1")],
                &[("file-manager", &["token"])],
            )),
            "corr-1",
            Some("job-1".to_string()),
            None,
        )
    }

    #[tokio::test]
    async fn file_roundtrip_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let written = ctx.write_file("notes/a.txt", "hello").await.unwrap();
        assert!(written.starts_with(dir.path()));
        assert_eq!(ctx.read_file("notes/a.txt").await.unwrap(), "hello");
        assert_eq!(ctx.list_files("notes").await.unwrap(), vec!["a.txt"]);
        ctx.delete_file("notes/a.txt").await.unwrap();
        assert!(ctx.read_file("notes/a.txt").await.is_err());
    }

    #[tokio::test]
    async fn escape_attempts_fail() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        assert!(matches!(
            ctx.read_file("../outside.txt").await.unwrap_err(),
            SandboxError::PathEscape(_)
        ));
        assert!(matches!(
            ctx.write_file("/etc/motd", "x").await.unwrap_err(),
            SandboxError::PathEscape(_)
        ));
    }

    #[tokio::test]
    async fn secrets_respect_acl() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        assert_eq!(ctx.get_secret("token").as_deref(), Some("tok-1"));
        assert_eq!(ctx.get_secret("missing"), None);
    }

    #[tokio::test]
    async fn sub_job_requires_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let err = ctx
            .create_sub_job(CreateJob::user_message("child task"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
    }
}

//! Workspace file operations: read, write, delete, list.

use crate::context::CapabilityContext;
use crate::manifest::GearManifest;
use crate::runtime::Gear;
use async_trait::async_trait;
use meridian_protocol::{ErrorCode, ErrorInfo};
use serde_json::{json, Value};
use std::collections::HashMap;

pub struct FileManagerGear {
    manifest: GearManifest,
}

impl Default for FileManagerGear {
    fn default() -> Self {
        Self::new()
    }
}

impl FileManagerGear {
    pub fn new() -> Self {
        let mut manifest = GearManifest::new("file-manager", &["read", "write", "delete", "list"]);
        manifest.permissions.filesystem.read = vec!["**/*".to_string()];
        manifest.permissions.filesystem.write = vec!["**/*".to_string()];
        Self { manifest }
    }
}

fn required_str<'a>(
    parameters: &'a HashMap<String, Value>,
    key: &str,
) -> Result<&'a str, ErrorInfo> {
    parameters
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorInfo::new(ErrorCode::Validation, format!("missing '{key}' parameter")))
}

#[async_trait]
impl Gear for FileManagerGear {
    fn manifest(&self) -> &GearManifest {
        &self.manifest
    }

    async fn execute(
        &self,
        action: &str,
        parameters: &HashMap<String, Value>,
        ctx: &CapabilityContext,
    ) -> Result<Value, ErrorInfo> {
        match action {
            "read" => {
                let path = required_str(parameters, "path")?;
                let contents = ctx
                    .read_file(path)
                    .await
                    .map_err(|e| CapabilityContext::sandbox_error_info(&e))?;
                Ok(json!({"path": path, "contents": contents}))
            }
            "write" => {
                let path = required_str(parameters, "path")?;
                let contents = required_str(parameters, "contents")?;
                let written = ctx
                    .write_file(path, contents)
                    .await
                    .map_err(|e| CapabilityContext::sandbox_error_info(&e))?;
                Ok(json!({"path": written.display().to_string(), "bytes": contents.len()}))
            }
            "delete" => {
                let path = required_str(parameters, "path")?;
                ctx.delete_file(path)
                    .await
                    .map_err(|e| CapabilityContext::sandbox_error_info(&e))?;
                Ok(json!({"path": path, "deleted": true}))
            }
            "list" => {
                let path = parameters
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or(".");
                let entries = ctx
                    .list_files(path)
                    .await
                    .map_err(|e| CapabilityContext::sandbox_error_info(&e))?;
                Ok(json!({"path": path, "entries": entries}))
            }
            other => Err(ErrorInfo::new(
                ErrorCode::Validation,
                format!("file-manager does not support action {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxPolicy;
    use crate::vault::SecretsVault;
    use std::sync::Arc;

    fn ctx(workspace: &std::path::Path) -> CapabilityContext {
        CapabilityContext::new(
            FileManagerGear::new().manifest.clone(),
            SandboxPolicy::new(workspace),
            Arc::new(SecretsVault::default()),
            "corr-fm",
            None,
            None,
        )
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[tokio::test]
    async fn read_write_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let gear = FileManagerGear::new();
        let ctx = ctx(dir.path());

        gear.execute(
            "write",
            &params(&[("path", "notes.txt"), ("contents", "remember this")]),
            &ctx,
        )
        .await
        .unwrap();

        let read = gear
            .execute("read", &params(&[("path", "notes.txt")]), &ctx)
            .await
            .unwrap();
        assert_eq!(read["contents"], "remember this");

        let listed = gear.execute("list", &HashMap::new(), &ctx).await.unwrap();
        assert_eq!(listed["entries"][0], "notes.txt");

        gear.execute("delete", &params(&[("path", "notes.txt")]), &ctx)
            .await
            .unwrap();
        let err = gear
            .execute("read", &params(&[("path", "notes.txt")]), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn escape_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let gear = FileManagerGear::new();
        let err = gear
            .execute("read", &params(&[("path", "../secrets")]), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
    }
}

//! The shell gear. Disabled by default; critical risk when enabled.
//!
//! Output is captured with a per-invocation timeout clamped to [1s, 5min]
//! and capped at 5 MiB; overflow is spilled to `shell-output/<ts>.txt` in
//! the workspace. Shell decisions are never written to sentinel memory.

use crate::context::CapabilityContext;
use crate::manifest::GearManifest;
use crate::runtime::Gear;
use async_trait::async_trait;
use chrono::Utc;
use meridian_protocol::defaults::{
    SHELL_OUTPUT_CAP_BYTES, SHELL_TIMEOUT_MAX_MS, SHELL_TIMEOUT_MIN_MS,
};
use meridian_protocol::{ErrorCode, ErrorInfo};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

pub struct ShellGear {
    manifest: GearManifest,
    enabled: bool,
    output_cap: usize,
}

impl ShellGear {
    pub fn new(enabled: bool) -> Self {
        let mut manifest = GearManifest::new("shell", &["execute"]);
        manifest.permissions.shell = true;
        manifest.resources.timeout_ms = SHELL_TIMEOUT_MAX_MS;
        Self {
            manifest,
            enabled,
            output_cap: SHELL_OUTPUT_CAP_BYTES,
        }
    }

    #[cfg(test)]
    fn with_output_cap(mut self, cap: usize) -> Self {
        self.output_cap = cap;
        self
    }

    fn clamp_timeout(parameters: &HashMap<String, Value>) -> Duration {
        let requested = parameters
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(SHELL_TIMEOUT_MAX_MS);
        Duration::from_millis(requested.clamp(SHELL_TIMEOUT_MIN_MS, SHELL_TIMEOUT_MAX_MS))
    }
}

#[async_trait]
impl Gear for ShellGear {
    fn manifest(&self) -> &GearManifest {
        &self.manifest
    }

    async fn execute(
        &self,
        action: &str,
        parameters: &HashMap<String, Value>,
        ctx: &CapabilityContext,
    ) -> Result<Value, ErrorInfo> {
        if action != "execute" {
            return Err(ErrorInfo::new(
                ErrorCode::Validation,
                format!("shell gear does not support action {action}"),
            ));
        }
        if !self.enabled {
            return Err(ErrorInfo::new(
                ErrorCode::PermissionDenied,
                "shell gear is disabled",
            ));
        }
        let command = parameters
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorInfo::new(ErrorCode::Validation, "missing 'command' parameter"))?;

        let timeout = Self::clamp_timeout(parameters);
        ctx.log(&format!("shell: {command}"));

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(ctx.workspace_root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ErrorInfo::internal(format!("spawn failed: {e}")))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let wait = async {
            if let Some(pipe) = stdout_pipe.as_mut() {
                pipe.read_to_end(&mut stdout)
                    .await
                    .map_err(|e| ErrorInfo::internal(format!("stdout read: {e}")))?;
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_end(&mut stderr)
                    .await
                    .map_err(|e| ErrorInfo::internal(format!("stderr read: {e}")))?;
            }
            child
                .wait()
                .await
                .map_err(|e| ErrorInfo::internal(format!("wait failed: {e}")))
        };

        let status = match tokio::time::timeout(timeout, wait).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(command, ?timeout, "shell command timed out");
                return Err(ErrorInfo::new(
                    ErrorCode::Timeout,
                    format!("shell command exceeded {timeout:?}"),
                ));
            }
        };

        let mut output = json!({
            "exitCode": status.code(),
            "stdout": String::from_utf8_lossy(&stdout),
            "stderr": String::from_utf8_lossy(&stderr),
        });

        let total = stdout.len() + stderr.len();
        if total > self.output_cap {
            let spill_dir = ctx.workspace_root().join("shell-output");
            tokio::fs::create_dir_all(&spill_dir)
                .await
                .map_err(|e| ErrorInfo::internal(format!("spill dir: {e}")))?;
            let path = spill_dir.join(format!("{}.txt", Utc::now().timestamp_millis()));
            let mut contents = stdout;
            contents.extend_from_slice(&stderr);
            tokio::fs::write(&path, &contents)
                .await
                .map_err(|e| ErrorInfo::internal(format!("spill write: {e}")))?;
            output = json!({
                "exitCode": status.code(),
                "spilled": true,
                "path": path.display().to_string(),
                "bytes": total,
            });
        }

        Ok(output)
    }
}

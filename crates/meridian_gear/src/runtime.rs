//! The gear hosting runtime.
//!
//! Looks up the target gear, builds its capability context, executes the
//! action under a timeout, stamps `_provenance` on the result, and spills
//! oversized outputs to the workspace.

use crate::context::{CapabilityContext, SubJobSpawner};
use crate::manifest::GearManifest;
use crate::sandbox::SandboxPolicy;
use crate::vault::SecretsVault;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use meridian_protocol::defaults;
use meridian_protocol::{ErrorCode, ErrorInfo};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One step dispatch to a gear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub gear: String,
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// The gear's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub duration_ms: i64,
    pub step_id: String,
}

/// A hosted action plugin. The capability context is its only authority.
#[async_trait]
pub trait Gear: Send + Sync {
    fn manifest(&self) -> &GearManifest;

    async fn execute(
        &self,
        action: &str,
        parameters: &HashMap<String, Value>,
        ctx: &CapabilityContext,
    ) -> Result<Value, ErrorInfo>;
}

/// Registry and dispatcher for hosted gears.
pub struct GearRuntime {
    gears: RwLock<HashMap<String, Arc<dyn Gear>>>,
    policy: SandboxPolicy,
    vault: Arc<SecretsVault>,
    spawner: RwLock<Option<Arc<dyn SubJobSpawner>>>,
}

impl GearRuntime {
    pub fn new(policy: SandboxPolicy, vault: SecretsVault) -> Self {
        Self {
            gears: RwLock::new(HashMap::new()),
            policy,
            vault: Arc::new(vault),
            spawner: RwLock::new(None),
        }
    }

    pub async fn register(&self, gear: Arc<dyn Gear>) {
        let id = gear.manifest().id.clone();
        info!(gear = %id, "registered gear");
        self.gears.write().await.insert(id, gear);
    }

    /// Wire the sub-job seam. Done once at startup by the orchestrator.
    pub async fn set_spawner(&self, spawner: Arc<dyn SubJobSpawner>) {
        *self.spawner.write().await = Some(spawner);
    }

    /// The capabilities advertised to the planner.
    pub async fn capabilities(&self) -> Vec<meridian_protocol::GearCapability> {
        let gears = self.gears.read().await;
        let mut capabilities = Vec::new();
        for gear in gears.values() {
            let manifest = gear.manifest();
            for action in &manifest.actions {
                capabilities.push(meridian_protocol::GearCapability {
                    gear: manifest.id.clone(),
                    action: action.clone(),
                    description: None,
                });
            }
        }
        capabilities.sort_by(|a, b| (&a.gear, &a.action).cmp(&(&b.gear, &b.action)));
        capabilities
    }

    /// Execute one request end to end. Never returns Err - failures are
    /// carried in the response envelope so the pipeline can aggregate them.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecuteResponse {
        let started = Instant::now();
        let step_id = request.step_id.clone();
        let outcome = self.execute_inner(request).await;
        let duration_ms = started.elapsed().as_millis() as i64;
        match outcome {
            Ok(result) => ExecuteResponse {
                result: Some(result),
                error: None,
                duration_ms,
                step_id,
            },
            Err(error) => ExecuteResponse {
                result: None,
                error: Some(error),
                duration_ms,
                step_id,
            },
        }
    }

    async fn execute_inner(&self, request: ExecuteRequest) -> Result<Value, ErrorInfo> {
        let gear = {
            let gears = self.gears.read().await;
            gears.get(&request.gear).cloned()
        }
        .ok_or_else(|| {
            ErrorInfo::new(ErrorCode::NotFound, format!("no such gear: {}", request.gear))
        })?;

        let manifest = gear.manifest().clone();
        if !manifest.supports(&request.action) {
            return Err(ErrorInfo::new(
                ErrorCode::Validation,
                format!("gear {} does not support action {}", request.gear, request.action),
            ));
        }

        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let spawner = self.spawner.read().await.clone();
        let ctx = CapabilityContext::new(
            manifest.clone(),
            self.policy.clone(),
            Arc::clone(&self.vault),
            correlation_id.clone(),
            request.job_id.clone(),
            spawner,
        );

        let timeout = Duration::from_millis(
            manifest
                .resources
                .timeout_ms
                .min(defaults::EXECUTE_TIMEOUT_MS),
        );
        let result = match tokio::time::timeout(
            timeout,
            gear.execute(&request.action, &request.parameters, &ctx),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(gear = %request.gear, action = %request.action, "gear execution timed out");
                return Err(ErrorInfo::new(
                    ErrorCode::Timeout,
                    format!("gear {} timed out after {timeout:?}", request.gear),
                ));
            }
        };

        let result = self.spill_if_oversized(result, &request).await?;
        Ok(self.stamp_provenance(result, &request, &correlation_id))
    }

    /// The runtime, not the gear, adds the provenance envelope.
    fn stamp_provenance(&self, result: Value, request: &ExecuteRequest, correlation_id: &str) -> Value {
        let provenance = json!({
            "source": format!("gear:{}", request.gear),
            "action": request.action,
            "correlationId": correlation_id,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        });
        match result {
            Value::Object(mut map) => {
                map.insert("_provenance".to_string(), provenance);
                Value::Object(map)
            }
            other => json!({ "value": other, "_provenance": provenance }),
        }
    }

    /// Outputs over the cap are written to a workspace file and referenced
    /// by path.
    async fn spill_if_oversized(
        &self,
        result: Value,
        request: &ExecuteRequest,
    ) -> Result<Value, ErrorInfo> {
        let rendered = result.to_string();
        if rendered.len() <= self.policy.max_output_bytes {
            return Ok(result);
        }

        let spill_dir = self.policy.workspace_root.join("gear-output");
        tokio::fs::create_dir_all(&spill_dir)
            .await
            .map_err(|e| ErrorInfo::internal(format!("spill dir: {e}")))?;
        let file = spill_dir.join(format!(
            "{}-{}-{}.json",
            request.gear,
            request.step_id,
            Utc::now().timestamp_millis()
        ));
        tokio::fs::write(&file, rendered.as_bytes())
            .await
            .map_err(|e| ErrorInfo::internal(format!("spill write: {e}")))?;
        info!(path = %file.display(), bytes = rendered.len(), "gear output spilled");
        Ok(json!({
            "spilled": true,
            "path": file.display().to_string(),
            "bytes": rendered.len(),
        }))
    }
}

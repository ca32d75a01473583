//! Policy-guarded HTTP fetch.

use crate::context::{CapabilityContext, FetchOptions};
use crate::manifest::GearManifest;
use crate::runtime::Gear;
use async_trait::async_trait;
use meridian_protocol::{ErrorCode, ErrorInfo};
use serde_json::{json, Value};
use std::collections::HashMap;

pub struct HttpGear {
    manifest: GearManifest,
}

impl HttpGear {
    /// `domains` extends the configured allowlist for this gear.
    pub fn new(domains: Vec<String>) -> Self {
        let mut manifest = GearManifest::new("http", &["fetch"]);
        manifest.permissions.network.domains = domains;
        Self { manifest }
    }
}

#[async_trait]
impl Gear for HttpGear {
    fn manifest(&self) -> &GearManifest {
        &self.manifest
    }

    async fn execute(
        &self,
        action: &str,
        parameters: &HashMap<String, Value>,
        ctx: &CapabilityContext,
    ) -> Result<Value, ErrorInfo> {
        if action != "fetch" {
            return Err(ErrorInfo::new(
                ErrorCode::Validation,
                format!("http gear does not support action {action}"),
            ));
        }
        let url = parameters
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorInfo::new(ErrorCode::Validation, "missing 'url' parameter"))?;

        let opts = FetchOptions {
            method: parameters
                .get("method")
                .and_then(Value::as_str)
                .map(str::to_string),
            body: parameters
                .get("body")
                .and_then(Value::as_str)
                .map(str::to_string),
            headers: Vec::new(),
            timeout: None,
        };

        let result = ctx
            .fetch(url, opts)
            .await
            .map_err(|e| CapabilityContext::sandbox_error_info(&e))?;
        Ok(json!({"status": result.status, "body": result.body}))
    }
}

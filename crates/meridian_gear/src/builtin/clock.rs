//! Current-time lookup.

use crate::context::CapabilityContext;
use crate::manifest::GearManifest;
use crate::runtime::Gear;
use async_trait::async_trait;
use chrono::{FixedOffset, SecondsFormat, Utc};
use meridian_protocol::{ErrorCode, ErrorInfo};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Largest UTC offset in minutes (UTC+14:00 / UTC-14:00).
const MAX_OFFSET_MINUTES: i64 = 14 * 60;

pub struct ClockGear {
    manifest: GearManifest,
}

impl Default for ClockGear {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockGear {
    pub fn new() -> Self {
        Self {
            manifest: GearManifest::new("clock", &["now"]),
        }
    }
}

#[async_trait]
impl Gear for ClockGear {
    fn manifest(&self) -> &GearManifest {
        &self.manifest
    }

    async fn execute(
        &self,
        action: &str,
        parameters: &HashMap<String, Value>,
        _ctx: &CapabilityContext,
    ) -> Result<Value, ErrorInfo> {
        if action != "now" {
            return Err(ErrorInfo::new(
                ErrorCode::Validation,
                format!("clock gear does not support action {action}"),
            ));
        }

        let now = Utc::now();
        let mut result = json!({
            "utc": now.to_rfc3339_opts(SecondsFormat::Secs, true),
            "unixMillis": now.timestamp_millis(),
        });

        if let Some(offset) = parameters.get("offset_minutes").and_then(Value::as_i64) {
            let offset = offset.clamp(-MAX_OFFSET_MINUTES, MAX_OFFSET_MINUTES);
            if let Some(zone) = FixedOffset::east_opt((offset * 60) as i32) {
                result["local"] = json!(now
                    .with_timezone(&zone)
                    .to_rfc3339_opts(SecondsFormat::Secs, false));
                result["offsetMinutes"] = json!(offset);
            }
        }

        Ok(result)
    }
}

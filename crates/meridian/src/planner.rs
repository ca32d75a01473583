//! The planner registration seam.
//!
//! Model-provider adapters live outside the core; they implement
//! `meridian_axis::Planner` and are registered here. Until one is wired the
//! runtime answers planning requests with `SCOUT_UNREACHABLE`, which fails
//! the job and schedules a retry per the error policy.

use async_trait::async_trait;
use meridian_axis::{PlanOutcome, PlanRequest, Planner};
use meridian_protocol::{ErrorCode, ErrorInfo};

pub struct UnconfiguredPlanner;

#[async_trait]
impl Planner for UnconfiguredPlanner {
    async fn plan(&self, _request: PlanRequest) -> Result<PlanOutcome, ErrorInfo> {
        Err(ErrorInfo::new(
            ErrorCode::ScoutUnreachable,
            "no planner provider is configured",
        ))
    }
}

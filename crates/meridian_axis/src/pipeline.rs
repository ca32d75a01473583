//! Drives one claimed job through planning, validation, approval, and
//! execution.
//!
//! Write-ahead audit rule: for every state transition that crosses a
//! component boundary the audit entry is committed before the CAS. If the
//! audit write fails the transition does not happen; if the CAS misses the
//! audit entry stays as a record of the attempt.
//!
//! Information barrier: the validation payload carries the plan and nothing
//! else - no user message, no history, no conversation id.

use crate::error::AxisError;
use crate::queue::{JobQueue, TransitionUpdate};
use crate::router::Router;
use crate::scout::{PlanOutcome, PlanRequest};
use meridian_audit::{AuditLog, WriteAudit};
use meridian_gear::{ExecuteResponse, GearRuntime, SubJobSpawner};
use meridian_protocol::defaults::{EXECUTE_TIMEOUT_MS, VALIDATE_TIMEOUT_MS};
use meridian_protocol::{
    plan_signature, ActionType, AuditActor, ChatMessage, ChatRole, ComponentId, CreateJob,
    Decision, DecisionVerdict, ErrorCode, ErrorInfo, ExecutionPlan, Job, JobResult, JobSource,
    JobStatus, MessageKind, RiskLevel, StepOutcome, ValidationResult, Verdict,
};
use meridian_sentinel::{decision_scope, ApprovalCache, DecisionMemory};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How much conversation history is replayed to the planner.
const HISTORY_LIMIT: i64 = 20;

/// How a needs-approval plan was resolved without asking the user.
enum MemoisedApproval {
    /// Every approval-gated step holds a live memoised allow (or the plan
    /// shape has a cached approval).
    Approved(&'static str),
    /// Some step holds a memoised deny for this scope.
    Denied(String),
    /// Nothing memoised; pause for the user.
    Ask,
}

pub struct PipelineProcessor {
    queue: JobQueue,
    router: Router,
    audit: AuditLog,
    journal: crate::journal::JournalStore,
    gears: Arc<GearRuntime>,
    decisions: DecisionMemory,
    approvals: Arc<ApprovalCache>,
}

impl PipelineProcessor {
    pub fn new(
        queue: JobQueue,
        router: Router,
        audit: AuditLog,
        journal: crate::journal::JournalStore,
        gears: Arc<GearRuntime>,
        decisions: DecisionMemory,
        approvals: Arc<ApprovalCache>,
    ) -> Self {
        Self {
            queue,
            router,
            audit,
            journal,
            gears,
            decisions,
            approvals,
        }
    }

    /// Drive a job claimed into `planning` to a terminal state (or to
    /// `awaiting_approval`, which an external acceptor resolves). Errors
    /// other than cancellation fail the job.
    pub async fn drive(&self, job: Job, cancel: &CancellationToken) -> Result<(), AxisError> {
        let job_id = job.id.clone();
        match self.drive_inner(job, Vec::new(), cancel).await {
            Ok(()) => Ok(()),
            Err(AxisError::Cancelled) => Err(AxisError::Cancelled),
            // The job moved under us - another actor owns it now.
            Err(err @ AxisError::Conflict(_)) => Err(err),
            Err(err) => {
                self.fail_job(&job_id, &err).await?;
                Err(err)
            }
        }
    }

    async fn drive_inner(
        &self,
        job: Job,
        mut revision_notes: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<(), AxisError> {
        loop {
            if cancel.is_cancelled() {
                return Err(AxisError::Cancelled);
            }

            // Step 1-2: history + capabilities, then ask the planner.
            let outcome = self.request_plan(&job, &revision_notes, cancel).await?;

            let plan = match outcome {
                PlanOutcome::Text { text } => {
                    return self.complete_fast(&job, text).await;
                }
                PlanOutcome::Plan { mut plan } => {
                    plan.job_id = job.id.clone();
                    plan
                }
            };

            // Step 4: into validation, plan attached atomically.
            self.audit_before(&job.id, "job.validating", RiskLevel::Low, None)
                .await?;
            if !self
                .queue
                .transition(
                    &job.id,
                    JobStatus::Planning,
                    JobStatus::Validating,
                    TransitionUpdate::with_plan(plan.clone()),
                )
                .await?
            {
                return self.bail_on_cas_miss(&job.id).await;
            }

            let validation = self.request_validation(&plan, &job.id, cancel).await?;

            match validation.verdict {
                Verdict::Approved => {
                    self.audit_before(
                        &job.id,
                        "job.executing",
                        validation.overall_risk,
                        Some(json!({"planId": plan.id})),
                    )
                    .await?;
                    if !self
                        .queue
                        .transition(
                            &job.id,
                            JobStatus::Validating,
                            JobStatus::Executing,
                            TransitionUpdate::with_validation(validation.clone()),
                        )
                        .await?
                    {
                        return self.bail_on_cas_miss(&job.id).await;
                    }
                    return self.execute_plan(&job, &plan, cancel).await;
                }
                Verdict::NeedsRevision => {
                    self.audit_before(
                        &job.id,
                        "job.revision",
                        RiskLevel::Low,
                        Some(json!({"suggestions": validation.suggested_revisions})),
                    )
                    .await?;
                    if !self
                        .queue
                        .transition(
                            &job.id,
                            JobStatus::Validating,
                            JobStatus::Planning,
                            TransitionUpdate::with_validation(validation.clone()),
                        )
                        .await?
                    {
                        return self.bail_on_cas_miss(&job.id).await;
                    }
                    revision_notes = validation.suggested_revisions.clone();
                    info!(job_id = %job.id, "plan needs revision, redriving planner");
                    continue;
                }
                Verdict::NeedsUserApproval => {
                    match self.resolve_memoised_approval(&job, &plan, &validation).await? {
                        MemoisedApproval::Approved(via) => {
                            self.audit_before(
                                &job.id,
                                "job.executing",
                                validation.overall_risk,
                                Some(json!({"planId": plan.id, "approval": via})),
                            )
                            .await?;
                            if !self
                                .queue
                                .transition(
                                    &job.id,
                                    JobStatus::Validating,
                                    JobStatus::Executing,
                                    TransitionUpdate::with_validation(validation),
                                )
                                .await?
                            {
                                return self.bail_on_cas_miss(&job.id).await;
                            }
                            info!(job_id = %job.id, via, "approval memoised, executing");
                            return self.execute_plan(&job, &plan, cancel).await;
                        }
                        MemoisedApproval::Denied(scope) => {
                            let error = ErrorInfo::new(
                                ErrorCode::PlanRejected,
                                format!("denied by memoised decision for {scope}"),
                            );
                            self.audit_before(
                                &job.id,
                                "job.failed",
                                validation.overall_risk,
                                Some(json!({"deniedScope": scope})),
                            )
                            .await?;
                            self.queue
                                .transition(
                                    &job.id,
                                    JobStatus::Validating,
                                    JobStatus::Failed,
                                    TransitionUpdate {
                                        validation: Some(validation),
                                        error: Some(error),
                                        ..Default::default()
                                    },
                                )
                                .await?;
                            return Ok(());
                        }
                        MemoisedApproval::Ask => {}
                    }

                    self.audit_before(
                        &job.id,
                        "job.awaiting_approval",
                        validation.overall_risk,
                        Some(json!({"planId": plan.id})),
                    )
                    .await?;
                    if !self
                        .queue
                        .transition(
                            &job.id,
                            JobStatus::Validating,
                            JobStatus::AwaitingApproval,
                            TransitionUpdate::with_validation(validation),
                        )
                        .await?
                    {
                        return self.bail_on_cas_miss(&job.id).await;
                    }
                    // The status-change broadcast is the approval-request
                    // event; an external acceptor resumes the job.
                    info!(job_id = %job.id, "awaiting user approval");
                    return Ok(());
                }
                Verdict::Rejected => {
                    let reason = validation
                        .reasoning
                        .clone()
                        .unwrap_or_else(|| "plan rejected by policy".to_string());
                    let error = ErrorInfo::new(ErrorCode::PlanRejected, reason.clone());
                    self.audit_before(
                        &job.id,
                        "job.failed",
                        validation.overall_risk,
                        Some(json!({"reason": reason})),
                    )
                    .await?;
                    self.queue
                        .transition(
                            &job.id,
                            JobStatus::Validating,
                            JobStatus::Failed,
                            TransitionUpdate {
                                validation: Some(validation),
                                error: Some(error),
                                ..Default::default()
                            },
                        )
                        .await?;
                    return Ok(());
                }
            }
        }
    }

    /// Redrive execution for a job an external acceptor approved
    /// (`awaiting_approval -> executing` already happened).
    pub async fn resume_approved(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AxisError> {
        let job = self.queue.get_job(job_id).await?;
        if job.status != JobStatus::Executing {
            return Err(AxisError::Conflict(format!(
                "job {job_id} is {}, not executing",
                job.status
            )));
        }
        let plan = job
            .plan
            .clone()
            .ok_or_else(|| AxisError::Internal(format!("job {job_id} has no plan")))?;
        // The user said yes; remember it before running anything.
        self.record_approval(&job, &plan).await;
        match self.execute_plan(&job, &plan, cancel).await {
            Ok(()) => Ok(()),
            Err(AxisError::Cancelled) => Err(AxisError::Cancelled),
            Err(err) => {
                self.fail_job(job_id, &err).await?;
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    async fn request_plan(
        &self,
        job: &Job,
        revision_notes: &[String],
        cancel: &CancellationToken,
    ) -> Result<PlanOutcome, AxisError> {
        let mut messages = match &job.conversation_id {
            Some(conversation_id) => {
                self.queue
                    .recent_messages(conversation_id, HISTORY_LIMIT)
                    .await?
            }
            None => Vec::new(),
        };
        messages.push(ChatMessage {
            role: ChatRole::User,
            content: job.content.clone(),
        });
        if !revision_notes.is_empty() {
            messages.push(ChatMessage {
                role: ChatRole::User,
                content: format!("Revise the plan: {}", revision_notes.join("; ")),
            });
        }

        let request = PlanRequest {
            messages,
            tools: self.gears.capabilities().await,
        };
        let reply = self
            .router
            .request_to(
                ComponentId::Scout,
                MessageKind::PlanRequest,
                serde_json::to_value(&request)?,
                Some(&job.id),
                Duration::from_millis(EXECUTE_TIMEOUT_MS),
                cancel,
            )
            .await?;
        Ok(serde_json::from_value(reply.payload)?)
    }

    async fn complete_fast(&self, job: &Job, text: String) -> Result<(), AxisError> {
        if let Some(conversation_id) = &job.conversation_id {
            self.queue
                .add_message(conversation_id, ChatRole::Assistant, &text)
                .await?;
        }
        self.audit_before(&job.id, "job.completed", RiskLevel::Low, Some(json!({"path": "fast"})))
            .await?;
        self.queue
            .transition(
                &job.id,
                JobStatus::Planning,
                JobStatus::Completed,
                TransitionUpdate::with_result(JobResult::Fast { text }),
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Approval memoization
    // ------------------------------------------------------------------

    /// Try to resolve a needs-approval plan without the user: first the
    /// approval cache (scheduled jobs, keyed by plan shape), then sentinel
    /// decision memory (every approval-gated step must hold a live allow; a
    /// deny anywhere rejects the plan). Shell steps are never memoised and
    /// always fall through to the user.
    async fn resolve_memoised_approval(
        &self,
        job: &Job,
        plan: &ExecutionPlan,
        validation: &ValidationResult,
    ) -> Result<MemoisedApproval, AxisError> {
        if job.source == JobSource::Schedule
            && self.approvals.get(&plan_signature(plan)) == Some(Verdict::Approved)
        {
            return Ok(MemoisedApproval::Approved("approval_cache"));
        }

        let mut examined = false;
        let mut all_allowed = true;
        for step_verdict in validation
            .step_verdicts
            .iter()
            .filter(|sv| sv.verdict == Verdict::NeedsUserApproval)
        {
            examined = true;
            if step_verdict.action_type == ActionType::ShellExecute {
                all_allowed = false;
                continue;
            }
            let step = match plan.steps.iter().find(|s| s.id == step_verdict.step_id) {
                Some(step) => step,
                None => {
                    all_allowed = false;
                    continue;
                }
            };
            let scope = decision_scope(step_verdict.action_type, step);
            match self
                .decisions
                .lookup(step_verdict.action_type.as_str(), &scope)
                .await?
            {
                Some(decision) if decision.verdict == DecisionVerdict::Deny => {
                    return Ok(MemoisedApproval::Denied(scope));
                }
                Some(_) => {}
                None => all_allowed = false,
            }
        }

        if examined && all_allowed {
            Ok(MemoisedApproval::Approved("decision_memory"))
        } else {
            Ok(MemoisedApproval::Ask)
        }
    }

    /// Persist a user approval: the plan shape into the approval cache for
    /// scheduled re-runs, and a per-step allow into decision memory. Shell
    /// steps are skipped. Memo failures are logged, never fatal.
    async fn record_approval(&self, job: &Job, plan: &ExecutionPlan) {
        if job.source == JobSource::Schedule {
            self.approvals.put(plan_signature(plan), Verdict::Approved);
        }
        let validation = match &job.validation {
            Some(validation) => validation,
            None => return,
        };
        for step_verdict in validation
            .step_verdicts
            .iter()
            .filter(|sv| sv.verdict == Verdict::NeedsUserApproval)
        {
            if step_verdict.action_type == ActionType::ShellExecute {
                continue;
            }
            let step = match plan.steps.iter().find(|s| s.id == step_verdict.step_id) {
                Some(step) => step,
                None => continue,
            };
            let decision = Decision {
                action_type: step_verdict.action_type.as_str().to_string(),
                scope: decision_scope(step_verdict.action_type, step),
                verdict: DecisionVerdict::Allow,
                expires_at: None,
                metadata: HashMap::new(),
            };
            if let Err(e) = self.decisions.record(&decision).await {
                warn!(job_id = %job.id, error = %e, "failed to memoise approval decision");
            }
        }
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    async fn request_validation(
        &self,
        plan: &ExecutionPlan,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult, AxisError> {
        // The plan only. Nothing else crosses this boundary.
        let reply = self
            .router
            .request_to(
                ComponentId::Sentinel,
                MessageKind::ValidateRequest,
                json!({ "plan": plan }),
                Some(job_id),
                Duration::from_millis(VALIDATE_TIMEOUT_MS),
                cancel,
            )
            .await?;
        Ok(serde_json::from_value(reply.payload)?)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    async fn execute_plan(
        &self,
        job: &Job,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<(), AxisError> {
        let mut outcomes: Vec<StepOutcome> = Vec::with_capacity(plan.steps.len());

        for step in &plan.steps {
            if cancel.is_cancelled() {
                return Err(AxisError::Cancelled);
            }

            let entry = self
                .queue
                .step_started(&job.id, &step.id, &step.gear, &step.action)
                .await?;
            self.audit
                .write(
                    WriteAudit::new(AuditActor::Gear, "step.started", step.risk_level)
                        .job(&job.id)
                        .target(format!("gear:{}", step.gear))
                        .details(json!({"stepId": step.id, "action": step.action})),
                )
                .await?;

            let response = self.dispatch_step(job, step, cancel).await;

            match response {
                Ok(response) => {
                    if let Some(error) = response.error {
                        self.queue.step_finished(entry, false, Some(&error)).await?;
                        self.audit
                            .write(
                                WriteAudit::new(AuditActor::Gear, "step.failed", step.risk_level)
                                    .job(&job.id)
                                    .target(format!("gear:{}", step.gear))
                                    .details(json!({"stepId": step.id, "code": error.code})),
                            )
                            .await?;

                        if error.code == ErrorCode::NeedsReplan || error.retriable {
                            return self.replan(job, &error, cancel).await;
                        }

                        outcomes.push(StepOutcome {
                            step_id: step.id.clone(),
                            result: None,
                            error: Some(error.clone()),
                            duration_ms: response.duration_ms,
                        });
                        return Err(AxisError::Handler(error));
                    }

                    self.queue.step_finished(entry, true, None).await?;
                    self.audit
                        .write(
                            WriteAudit::new(AuditActor::Gear, "step.completed", step.risk_level)
                                .job(&job.id)
                                .target(format!("gear:{}", step.gear))
                                .details(json!({"stepId": step.id})),
                        )
                        .await?;
                    outcomes.push(StepOutcome {
                        step_id: step.id.clone(),
                        result: response.result,
                        error: None,
                        duration_ms: response.duration_ms,
                    });
                }
                Err(AxisError::Cancelled) => {
                    self.queue.step_finished(entry, false, None).await?;
                    return Err(AxisError::Cancelled);
                }
                Err(err) => {
                    let info = err.to_error_info();
                    self.queue.step_finished(entry, false, Some(&info)).await?;
                    if info.retriable {
                        return self.replan(job, &info, cancel).await;
                    }
                    return Err(err);
                }
            }
        }

        // Step 7: respond and complete.
        let result = JobResult::Full {
            steps: outcomes.clone(),
        };
        if let Some(conversation_id) = &job.conversation_id {
            let summary = serde_json::to_string(&result)?;
            self.queue
                .add_message(conversation_id, ChatRole::Assistant, &summary)
                .await?;
        }
        self.audit_before(
            &job.id,
            "job.completed",
            RiskLevel::Low,
            Some(json!({"path": "full", "steps": outcomes.len()})),
        )
        .await?;
        if !self
            .queue
            .transition(
                &job.id,
                JobStatus::Executing,
                JobStatus::Completed,
                TransitionUpdate::with_result(result),
            )
            .await?
        {
            return self.bail_on_cas_miss(&job.id).await;
        }

        if !plan.journal_skip {
            self.journal
                .stage(
                    meridian_protocol::MemoryKind::Episodic,
                    json!({
                        "jobId": job.id,
                        "content": job.content,
                        "steps": outcomes.len(),
                    }),
                    Some(&job.id),
                )
                .await?;
        }
        Ok(())
    }

    async fn dispatch_step(
        &self,
        job: &Job,
        step: &meridian_protocol::ExecutionStep,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResponse, AxisError> {
        let reply = self
            .router
            .request_to(
                ComponentId::GearRuntime,
                MessageKind::ExecuteRequest,
                json!({
                    "gear": step.gear,
                    "action": step.action,
                    "parameters": step.parameters,
                    "step_id": step.id,
                }),
                Some(&job.id),
                Duration::from_millis(EXECUTE_TIMEOUT_MS),
                cancel,
            )
            .await?;
        Ok(serde_json::from_value(reply.payload)?)
    }

    async fn replan(
        &self,
        job: &Job,
        error: &ErrorInfo,
        cancel: &CancellationToken,
    ) -> Result<(), AxisError> {
        self.audit_before(
            &job.id,
            "job.replan",
            RiskLevel::Low,
            Some(json!({"code": error.code})),
        )
        .await?;
        match self
            .queue
            .transition(
                &job.id,
                JobStatus::Executing,
                JobStatus::Planning,
                TransitionUpdate::default(),
            )
            .await
        {
            Ok(true) => {
                // Redrive the whole pipeline from planning with the error
                // surfaced to the planner.
                let job = self.queue.get_job(&job.id).await?;
                warn!(job_id = %job.id, code = %error.code, "step requested replan");
                let notes = vec![format!("previous execution failed: {}", error.message)];
                Box::pin(self.drive_inner(job, notes, cancel)).await
            }
            Ok(false) => self.bail_on_cas_miss(&job.id).await,
            Err(err) => Err(err),
        }
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    /// Write-ahead audit: called before every CAS that crosses a component
    /// boundary. Audit failure aborts the transition.
    async fn audit_before(
        &self,
        job_id: &str,
        action: &str,
        risk: RiskLevel,
        details: Option<serde_json::Value>,
    ) -> Result<(), AxisError> {
        let mut write = WriteAudit::new(AuditActor::Axis, action, risk).job(job_id);
        if let Some(details) = details {
            write = write.details(details);
        }
        self.audit.write(write).await?;
        Ok(())
    }

    /// A CAS miss means another actor (cancel, another worker) moved the
    /// job. If it reached a terminal state that is a clean exit; anything
    /// else is a conflict worth surfacing.
    async fn bail_on_cas_miss(&self, job_id: &str) -> Result<(), AxisError> {
        let job = self.queue.get_job(job_id).await?;
        if job.status.is_terminal() {
            info!(job_id, status = %job.status, "job finished elsewhere");
            return Ok(());
        }
        Err(AxisError::Conflict(format!(
            "job {job_id} moved to {} under us",
            job.status
        )))
    }

    async fn fail_job(&self, job_id: &str, err: &AxisError) -> Result<(), AxisError> {
        let info = err.to_error_info();
        loop {
            let job = self.queue.get_job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(());
            }
            if !job.status.can_transition(JobStatus::Failed) {
                // pending / awaiting_approval cannot fail directly.
                return Ok(());
            }
            self.audit_before(
                job_id,
                "job.failed",
                RiskLevel::Low,
                Some(json!({"code": info.code})),
            )
            .await?;
            if self
                .queue
                .transition(
                    job_id,
                    job.status,
                    JobStatus::Failed,
                    TransitionUpdate::with_error(info.clone()),
                )
                .await?
            {
                return Ok(());
            }
        }
    }
}

/// Sub-job seam implementation handed to the gear runtime.
pub struct QueueSpawner {
    queue: JobQueue,
}

impl QueueSpawner {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }
}

#[async_trait::async_trait]
impl SubJobSpawner for QueueSpawner {
    async fn spawn_sub_job(
        &self,
        parent_job_id: &str,
        mut options: CreateJob,
    ) -> Result<String, ErrorInfo> {
        options.source = meridian_protocol::JobSource::SubJob;
        options.parent_id = Some(parent_job_id.to_string());
        self.queue
            .create_job(options)
            .await
            .map(|job| job.id)
            .map_err(|e| e.to_error_info())
    }
}

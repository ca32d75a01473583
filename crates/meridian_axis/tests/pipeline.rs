//! End-to-end pipeline scenarios over a real on-disk store.

use async_trait::async_trait;
use meridian_audit::{AuditFilter, AuditLog};
use meridian_axis::{
    GearRuntimeHandler, JobQueue, JournalStore, MessageHandler, PipelineProcessor, PlanOutcome,
    PlanRequest, Planner, Router, ScoutHandler, SentinelHandler, TransitionUpdate, WorkerPool,
};
use meridian_db::Store;
use meridian_gear::builtin::FileManagerGear;
use meridian_gear::{CapabilityContext, Gear, GearManifest, GearRuntime, SandboxPolicy, SecretsVault};
use meridian_protocol::{
    ComponentId, CreateJob, Decision, DecisionVerdict, ErrorCode, ErrorInfo, ExecutionPlan,
    ExecutionStep, JobResult, JobSource, JobStatus, Message, PolicyConfig, RiskLevel, Verdict,
};
use meridian_sentinel::{ApprovalCache, DecisionMemory};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------
// Test doubles
// ----------------------------------------------------------------------

/// Planner returning a scripted sequence of outcomes.
struct ScriptedPlanner {
    outcomes: Mutex<Vec<PlanOutcome>>,
}

impl ScriptedPlanner {
    fn new(outcomes: Vec<PlanOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
        })
    }

    fn text(text: &str) -> Arc<Self> {
        Self::new(vec![PlanOutcome::Text { text: text.into() }])
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _request: PlanRequest) -> Result<PlanOutcome, ErrorInfo> {
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            return Err(ErrorInfo::new(ErrorCode::ScoutUnreachable, "script exhausted"));
        }
        Ok(outcomes.remove(0))
    }
}

/// Asserts the information barrier: validation payloads carry the plan only.
struct BarrierCheckingSentinel {
    inner: SentinelHandler,
}

#[async_trait]
impl MessageHandler for BarrierCheckingSentinel {
    async fn handle(&self, message: Message) -> Result<Message, ErrorInfo> {
        let keys: Vec<&str> = message
            .payload
            .as_object()
            .map(|map| map.keys().map(String::as_str).collect())
            .unwrap_or_default();
        assert_eq!(keys, vec!["plan"], "validation payload must carry the plan only");
        let rendered = message.payload.to_string();
        assert!(
            !rendered.contains("conversation"),
            "conversation data leaked into validation"
        );
        self.inner.handle(message).await
    }
}

/// A gear whose first execution asks for a replan, then succeeds.
struct FlakyGear {
    manifest: GearManifest,
    calls: Mutex<u32>,
}

impl FlakyGear {
    fn new() -> Self {
        Self {
            manifest: GearManifest::new("flaky", &["read"]),
            calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Gear for FlakyGear {
    fn manifest(&self) -> &GearManifest {
        &self.manifest
    }

    async fn execute(
        &self,
        _action: &str,
        _parameters: &HashMap<String, Value>,
        _ctx: &CapabilityContext,
    ) -> Result<Value, ErrorInfo> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if *calls == 1 {
            Err(ErrorInfo::new(ErrorCode::NeedsReplan, "transient environment change"))
        } else {
            Ok(json!({"ok": true, "attempt": *calls}))
        }
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct Harness {
    _dir: tempfile::TempDir,
    workspace: PathBuf,
    queue: JobQueue,
    audit: AuditLog,
    decisions: DecisionMemory,
    pipeline: Arc<PipelineProcessor>,
}

async fn harness(planner: Arc<dyn Planner>) -> Harness {
    harness_with(planner, 500.0, |_runtime| {}).await
}

async fn harness_with<F>(
    planner: Arc<dyn Planner>,
    max_transaction_amount_usd: f64,
    extra_gears: F,
) -> Harness
where
    F: FnOnce(&mut Vec<Arc<dyn Gear>>),
{
    let dir = tempfile::tempdir().unwrap();
    let data_dir = meridian_protocol::DataDir::new(dir.path());
    data_dir.ensure().unwrap();
    let workspace = data_dir.workspace_dir();

    let store = Store::new(data_dir);
    let queue = JobQueue::open(&store, 5_000).await.unwrap();
    let audit = AuditLog::new(store.clone());
    let journal = JournalStore::open(&store).await.unwrap();
    let decisions = DecisionMemory::open(store.clone(), 64).await.unwrap();
    let approvals = Arc::new(ApprovalCache::new(Duration::from_secs(60), 32));

    let runtime = GearRuntime::new(SandboxPolicy::new(&workspace), SecretsVault::default());
    let mut gears: Vec<Arc<dyn Gear>> = vec![Arc::new(FileManagerGear::new())];
    extra_gears(&mut gears);
    for gear in gears {
        runtime.register(gear).await;
    }
    let runtime = Arc::new(runtime);

    let policy = PolicyConfig {
        workspace_root: workspace.clone(),
        allowlisted_domains: vec![],
        max_transaction_amount_usd,
        policies: HashMap::new(),
    };

    let router = Router::new();
    router.register(ComponentId::Scout, Arc::new(ScoutHandler::new(planner)));
    router.register(
        ComponentId::Sentinel,
        Arc::new(BarrierCheckingSentinel {
            inner: SentinelHandler::new(policy),
        }),
    );
    router.register(
        ComponentId::GearRuntime,
        Arc::new(GearRuntimeHandler::new(Arc::clone(&runtime))),
    );

    let pipeline = Arc::new(PipelineProcessor::new(
        queue.clone(),
        router,
        audit.clone(),
        journal,
        runtime,
        decisions.clone(),
        approvals,
    ));

    Harness {
        _dir: dir,
        workspace,
        queue,
        audit,
        decisions,
        pipeline,
    }
}

fn step(id: &str, gear: &str, action: &str, params: Value, risk: RiskLevel) -> ExecutionStep {
    let parameters = match params {
        Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    };
    ExecutionStep {
        id: id.into(),
        gear: gear.into(),
        action: action.into(),
        parameters,
        risk_level: risk,
        description: None,
    }
}

async fn claimed_job(harness: &Harness, content: &str, conversation: Option<&str>) -> String {
    let mut options = CreateJob::user_message(content).with_user("u1");
    if let Some(conversation) = conversation {
        options = options.with_conversation(conversation);
    }
    let job = harness.queue.create_job(options).await.unwrap();
    harness.queue.claim_job("w1").await.unwrap().unwrap();
    job.id
}

async fn drive(harness: &Harness, job_id: &str) -> Result<(), meridian_axis::AxisError> {
    let job = harness.queue.get_job(job_id).await.unwrap();
    harness.pipeline.drive(job, &CancellationToken::new()).await
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn fast_path_completes_with_text() {
    let harness = harness(ScriptedPlanner::text("It is 09:00 in Tokyo.")).await;
    let conversation = harness.queue.create_conversation("c1").await.unwrap();
    let job_id = claimed_job(&harness, "What time is it in Tokyo?", Some(&conversation.id)).await;

    drive(&harness, &job_id).await.unwrap();

    let job = harness.queue.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    match job.result.unwrap() {
        JobResult::Fast { text } => assert!(text.contains("Tokyo")),
        other => panic!("expected fast result, got {other:?}"),
    }

    // One assistant message stored.
    let messages = harness.queue.recent_messages(&conversation.id, 10).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].content.contains("Tokyo"));

    // Exactly one job.completed audit entry.
    let completed = harness
        .audit
        .query(
            &AuditFilter {
                action: Some("job.completed".into()),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].job_id.as_deref(), Some(job_id.as_str()));
}

#[tokio::test]
async fn full_path_low_risk_executes_and_completes() {
    let planner = ScriptedPlanner::new(vec![]);
    let harness = harness(planner.clone()).await;
    std::fs::write(harness.workspace.join("notes.txt"), "the contents").unwrap();

    let notes_path = harness.workspace.join("notes.txt").display().to_string();
    let plan = ExecutionPlan::new(
        "placeholder",
        vec![step(
            "s1",
            "file-manager",
            "read",
            json!({"path": notes_path}),
            RiskLevel::Low,
        )],
    );
    planner.outcomes.lock().unwrap().push(PlanOutcome::Plan { plan });

    let job_id = claimed_job(&harness, "read my notes", None).await;
    drive(&harness, &job_id).await.unwrap();

    let job = harness.queue.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let validation = job.validation.unwrap();
    assert_eq!(validation.verdict, Verdict::Approved);
    assert!(validation.divergences.is_empty());

    match job.result.unwrap() {
        JobResult::Full { steps } => {
            assert_eq!(steps.len(), 1);
            let result = steps[0].result.as_ref().unwrap();
            assert_eq!(result["contents"], "the contents");
            assert_eq!(result["_provenance"]["source"], "gear:file-manager");
        }
        other => panic!("expected full result, got {other:?}"),
    }
}

#[tokio::test]
async fn approval_flow_pauses_then_resumes() {
    let planner = ScriptedPlanner::new(vec![]);
    let harness = harness(planner.clone()).await;
    std::fs::write(harness.workspace.join("a.tmp"), "scratch").unwrap();

    let tmp_path = harness.workspace.join("a.tmp").display().to_string();
    let plan = ExecutionPlan::new(
        "placeholder",
        vec![step(
            "s1",
            "file-manager",
            "delete",
            json!({"path": tmp_path}),
            RiskLevel::High,
        )],
    );
    planner.outcomes.lock().unwrap().push(PlanOutcome::Plan { plan });

    let job_id = claimed_job(&harness, "clean up the temp file", None).await;
    drive(&harness, &job_id).await.unwrap();

    let job = harness.queue.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::AwaitingApproval);
    assert_eq!(job.validation.as_ref().unwrap().verdict, Verdict::NeedsUserApproval);
    // Paused jobs hold no worker.
    assert!(job.worker_id.is_none());

    // External acceptor approves.
    let moved = harness
        .queue
        .transition(
            &job_id,
            JobStatus::AwaitingApproval,
            JobStatus::Executing,
            TransitionUpdate::default(),
        )
        .await
        .unwrap();
    assert!(moved);

    harness
        .pipeline
        .resume_approved(&job_id, &CancellationToken::new())
        .await
        .unwrap();

    let job = harness.queue.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!harness.workspace.join("a.tmp").exists());
}

#[tokio::test]
async fn approval_memoises_a_decision_for_the_next_run() {
    let planner = ScriptedPlanner::new(vec![]);
    let harness = harness(planner.clone()).await;
    std::fs::write(harness.workspace.join("a.tmp"), "scratch").unwrap();
    let tmp_path = harness.workspace.join("a.tmp").display().to_string();

    let delete_plan = || {
        ExecutionPlan::new(
            "placeholder",
            vec![step(
                "s1",
                "file-manager",
                "delete",
                json!({"path": tmp_path.clone()}),
                RiskLevel::High,
            )],
        )
    };

    // First run pauses; the user approves; the allow is memoised on resume.
    planner.outcomes.lock().unwrap().push(PlanOutcome::Plan { plan: delete_plan() });
    let first = claimed_job(&harness, "clean up", None).await;
    drive(&harness, &first).await.unwrap();
    assert_eq!(
        harness.queue.get_job(&first).await.unwrap().status,
        JobStatus::AwaitingApproval
    );
    harness
        .queue
        .transition(
            &first,
            JobStatus::AwaitingApproval,
            JobStatus::Executing,
            TransitionUpdate::default(),
        )
        .await
        .unwrap();
    harness
        .pipeline
        .resume_approved(&first, &CancellationToken::new())
        .await
        .unwrap();

    // The same shape again runs straight through without pausing.
    std::fs::write(harness.workspace.join("a.tmp"), "scratch again").unwrap();
    planner.outcomes.lock().unwrap().push(PlanOutcome::Plan { plan: delete_plan() });
    let second = claimed_job(&harness, "clean up again", None).await;
    drive(&harness, &second).await.unwrap();

    let job = harness.queue.get_job(&second).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!harness.workspace.join("a.tmp").exists());

    let entries = harness
        .audit
        .query(
            &AuditFilter {
                job_id: Some(second.clone()),
                action: Some("job.executing".into()),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].details.as_ref().unwrap()["approval"],
        "decision_memory"
    );
}

#[tokio::test]
async fn memoised_deny_rejects_the_plan() {
    let planner = ScriptedPlanner::new(vec![]);
    let harness = harness(planner.clone()).await;
    std::fs::write(harness.workspace.join("b.tmp"), "scratch").unwrap();
    let tmp_path = harness.workspace.join("b.tmp").display().to_string();

    harness
        .decisions
        .record(&Decision {
            action_type: "delete_files".into(),
            scope: tmp_path.clone(),
            verdict: DecisionVerdict::Deny,
            expires_at: None,
            metadata: HashMap::new(),
        })
        .await
        .unwrap();

    let plan = ExecutionPlan::new(
        "placeholder",
        vec![step(
            "s1",
            "file-manager",
            "delete",
            json!({"path": tmp_path}),
            RiskLevel::High,
        )],
    );
    planner.outcomes.lock().unwrap().push(PlanOutcome::Plan { plan });

    let job_id = claimed_job(&harness, "try the denied delete", None).await;
    drive(&harness, &job_id).await.unwrap();

    let job = harness.queue.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::PlanRejected);
    assert!(error.message.contains("denied"));
    // The file was never touched.
    assert!(harness.workspace.join("b.tmp").exists());
}

#[tokio::test]
async fn scheduled_job_reuses_a_cached_approval() {
    let planner = ScriptedPlanner::new(vec![]);
    let harness = harness(planner.clone()).await;
    std::fs::write(harness.workspace.join("s.tmp"), "scratch").unwrap();
    let tmp_path = harness.workspace.join("s.tmp").display().to_string();

    let delete_plan = || {
        ExecutionPlan::new(
            "placeholder",
            vec![step(
                "s1",
                "file-manager",
                "delete",
                json!({"path": tmp_path.clone()}),
                RiskLevel::High,
            )],
        )
    };
    let scheduled = |content: &str| {
        let mut options = CreateJob::user_message(content).with_user("scheduler");
        options.source = JobSource::Schedule;
        options
    };

    // First tick pauses for approval; the approved plan shape is cached.
    planner.outcomes.lock().unwrap().push(PlanOutcome::Plan { plan: delete_plan() });
    let first = harness.queue.create_job(scheduled("nightly cleanup")).await.unwrap();
    harness.queue.claim_job("w1").await.unwrap().unwrap();
    drive(&harness, &first.id).await.unwrap();
    assert_eq!(
        harness.queue.get_job(&first.id).await.unwrap().status,
        JobStatus::AwaitingApproval
    );
    harness
        .queue
        .transition(
            &first.id,
            JobStatus::AwaitingApproval,
            JobStatus::Executing,
            TransitionUpdate::default(),
        )
        .await
        .unwrap();
    harness
        .pipeline
        .resume_approved(&first.id, &CancellationToken::new())
        .await
        .unwrap();

    // The next tick hits the approval cache first.
    std::fs::write(harness.workspace.join("s.tmp"), "scratch again").unwrap();
    planner.outcomes.lock().unwrap().push(PlanOutcome::Plan { plan: delete_plan() });
    let second = harness
        .queue
        .create_job(scheduled("nightly cleanup, next tick"))
        .await
        .unwrap();
    harness.queue.claim_job("w1").await.unwrap().unwrap();
    drive(&harness, &second.id).await.unwrap();

    assert_eq!(
        harness.queue.get_job(&second.id).await.unwrap().status,
        JobStatus::Completed
    );
    let entries = harness
        .audit
        .query(
            &AuditFilter {
                job_id: Some(second.id.clone()),
                action: Some("job.executing".into()),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].details.as_ref().unwrap()["approval"],
        "approval_cache"
    );
}

#[tokio::test]
async fn over_limit_transaction_fails_with_plan_rejected() {
    let planner = ScriptedPlanner::new(vec![]);
    let harness = harness_with(planner.clone(), 500.0, |_| {}).await;

    let plan = ExecutionPlan::new(
        "placeholder",
        vec![step(
            "s1",
            "payment",
            "charge",
            json!({"amount": 1000, "currency": "USD"}),
            RiskLevel::Critical,
        )],
    );
    planner.outcomes.lock().unwrap().push(PlanOutcome::Plan { plan });

    let job_id = claimed_job(&harness, "pay the invoice", None).await;
    drive(&harness, &job_id).await.unwrap();

    let job = harness.queue.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().code, ErrorCode::PlanRejected);
}

#[tokio::test]
async fn replan_redrives_the_planner_once() {
    let planner = ScriptedPlanner::new(vec![]);
    let harness = harness_with(planner.clone(), 500.0, |gears| {
        gears.push(Arc::new(FlakyGear::new()));
    })
    .await;

    // First plan hits the flaky gear with a workspace read (auto-approved);
    // after the replan the planner answers directly.
    let cache_path = harness.workspace.join("cache.json").display().to_string();
    let plan = ExecutionPlan::new(
        "placeholder",
        vec![step("s1", "flaky", "read", json!({"path": cache_path}), RiskLevel::Low)],
    );
    {
        let mut outcomes = planner.outcomes.lock().unwrap();
        outcomes.push(PlanOutcome::Plan { plan });
        outcomes.push(PlanOutcome::Text {
            text: "did it without the flaky gear".into(),
        });
    }

    let job_id = claimed_job(&harness, "do the flaky thing", None).await;
    drive(&harness, &job_id).await.unwrap();

    let job = harness.queue.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.replan_count, 1);
    match job.result.unwrap() {
        JobResult::Fast { text } => assert!(text.contains("without the flaky")),
        other => panic!("expected fast result after replan, got {other:?}"),
    }
}

#[tokio::test]
async fn planner_failure_fails_the_job_with_scout_code() {
    // Empty script: the planner errors immediately.
    let harness = harness(ScriptedPlanner::new(vec![])).await;
    let job_id = claimed_job(&harness, "anything", None).await;

    let err = drive(&harness, &job_id).await.unwrap_err();
    assert!(matches!(err, meridian_axis::AxisError::Handler(_)));

    let job = harness.queue.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().code, ErrorCode::ScoutUnreachable);
}

#[tokio::test]
async fn worker_pool_drains_the_queue_end_to_end() {
    let harness = harness(ScriptedPlanner::new(vec![
        PlanOutcome::Text { text: "one".into() },
        PlanOutcome::Text { text: "two".into() },
    ]))
    .await;

    let a = harness
        .queue
        .create_job(CreateJob::user_message("first").with_user("u1"))
        .await
        .unwrap();
    let b = harness
        .queue
        .create_job(CreateJob::user_message("second").with_user("u1"))
        .await
        .unwrap();

    let mut pool = WorkerPool::new(harness.queue.clone(), Arc::clone(&harness.pipeline), 2);
    pool.start();

    // Wait for both jobs to reach a terminal state.
    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(10);
    loop {
        let a_done = harness.queue.get_job(&a.id).await.unwrap().status.is_terminal();
        let b_done = harness.queue.get_job(&b.id).await.unwrap().status.is_terminal();
        if a_done && b_done {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
    }
    pool.stop().await;

    assert_eq!(
        harness.queue.get_job(&a.id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(
        harness.queue.get_job(&b.id).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn audit_trail_precedes_every_transition() {
    let planner = ScriptedPlanner::new(vec![]);
    let harness = harness(planner.clone()).await;
    std::fs::write(harness.workspace.join("notes.txt"), "x").unwrap();

    let notes_path = harness.workspace.join("notes.txt").display().to_string();
    let plan = ExecutionPlan::new(
        "placeholder",
        vec![step("s1", "file-manager", "read", json!({"path": notes_path}), RiskLevel::Low)],
    );
    planner.outcomes.lock().unwrap().push(PlanOutcome::Plan { plan });

    let job_id = claimed_job(&harness, "read it", None).await;
    drive(&harness, &job_id).await.unwrap();

    let entries = harness
        .audit
        .query(
            &AuditFilter {
                job_id: Some(job_id.clone()),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert!(actions.contains(&"job.validating"));
    assert!(actions.contains(&"job.executing"));
    assert!(actions.contains(&"step.started"));
    assert!(actions.contains(&"step.completed"));
    assert!(actions.contains(&"job.completed"));

    // And the chain over those writes verifies.
    let verification = harness.audit.verify_chain(None).await.unwrap();
    assert!(verification.valid);
    assert_eq!(verification.entries_checked, entries.len());
}

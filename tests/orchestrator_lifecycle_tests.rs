//! Orchestrator runs against scripted agents, validators and backlog

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use soda_hub::client::{ClaimOptions, CoordinationClient};
use soda_hub::config::HubConfig;
use soda_hub::hub::{start_hub, NewWorkItem};
use soda_hub::orchestrator::{
    AgentInstruction, AgentReport, BacklogSink, Collaborators, FailureReason, LifecycleEvent,
    LifecycleEventHandler, Orchestrator, OrchestratorSettings, OrchestratorSnapshot,
    ProcessManager, RunEvent, RunHandle, RunPhase, RunResult, SpawnOutcome, SpawnRequest,
    ValidationReport, Validator,
};
use soda_hub::Priority;

/// The agent's end of a spawned run
struct AgentSide {
    events: mpsc::Sender<RunEvent>,
    instructions: mpsc::Receiver<AgentInstruction>,
}

impl AgentSide {
    async fn report_completed(&self) {
        self.events
            .send(RunEvent::Report(AgentReport::Completed { summary: None }))
            .await
            .unwrap();
    }

    async fn exit(&self, code: i32) {
        self.events
            .send(RunEvent::Exited { code: Some(code) })
            .await
            .unwrap();
    }
}

#[derive(Default)]
struct ScriptedProcesses {
    agents: Mutex<HashMap<String, AgentSide>>,
    terminated: Mutex<Vec<String>>,
}

impl ScriptedProcesses {
    /// Wait until `agent_id` has been spawned and take its end
    async fn agent(&self, agent_id: &str) -> AgentSide {
        for _ in 0..500 {
            if let Some(side) = self.agents.lock().unwrap().remove(agent_id) {
                return side;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{agent_id} was never spawned");
    }

    fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessManager for ScriptedProcesses {
    async fn spawn(&self, agent_id: &str, _workspace: &Path, _task: &str) -> anyhow::Result<RunHandle> {
        let (events_tx, events) = mpsc::channel(16);
        let (instructions, instructions_rx) = mpsc::channel(16);
        self.agents.lock().unwrap().insert(
            agent_id.to_string(),
            AgentSide {
                events: events_tx,
                instructions: instructions_rx,
            },
        );
        Ok(RunHandle {
            events,
            instructions,
        })
    }

    async fn terminate(&self, agent_id: &str) -> anyhow::Result<()> {
        self.terminated.lock().unwrap().push(agent_id.to_string());
        Ok(())
    }
}

/// Hands out queued verdicts, passing once the script runs out
#[derive(Default)]
struct ScriptedValidator {
    verdicts: Mutex<VecDeque<ValidationReport>>,
}

impl ScriptedValidator {
    fn failing(times: usize) -> Self {
        let verdicts = (0..times)
            .map(|attempt| ValidationReport::fail(vec![format!("test failure {attempt}")]))
            .collect();
        Self {
            verdicts: Mutex::new(verdicts),
        }
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(&self, _workspace: &Path) -> ValidationReport {
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(ValidationReport::pass)
    }
}

/// Holds every verdict until the test hands one over
struct GatedValidator {
    verdicts: AsyncMutex<mpsc::UnboundedReceiver<ValidationReport>>,
}

impl GatedValidator {
    fn new() -> (Self, mpsc::UnboundedSender<ValidationReport>) {
        let (verdicts_tx, verdicts) = mpsc::unbounded_channel();
        (
            Self {
                verdicts: AsyncMutex::new(verdicts),
            },
            verdicts_tx,
        )
    }
}

#[async_trait]
impl Validator for GatedValidator {
    async fn validate(&self, _workspace: &Path) -> ValidationReport {
        self.verdicts
            .lock()
            .await
            .recv()
            .await
            .unwrap_or_else(ValidationReport::pass)
    }
}

#[derive(Default)]
struct RecordingEvents {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingEvents {
    fn pings(&self) -> Vec<(String, u64)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                LifecycleEvent::Pinged {
                    agent_id,
                    idle_seconds,
                } => Some((agent_id.clone(), *idle_seconds)),
                _ => None,
            })
            .collect()
    }
}

impl LifecycleEventHandler for RecordingEvents {
    fn handle_event(&self, event: LifecycleEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct RecordingBacklog {
    updates: Mutex<Vec<(String, String, bool)>>,
}

#[async_trait]
impl BacklogSink for RecordingBacklog {
    async fn set_status(&self, item: &NewWorkItem, status: &str, result: &RunResult) -> anyhow::Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((item.id.clone(), status.to_string(), result.succeeded));
        Ok(())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    hub: CoordinationClient,
    processes: Arc<ScriptedProcesses>,
    backlog: Arc<RecordingBacklog>,
    events: Arc<RecordingEvents>,
}

impl Harness {
    fn backlog_updates(&self) -> Vec<(String, String, bool)> {
        self.backlog.updates.lock().unwrap().clone()
    }
}

async fn harness(settings: OrchestratorSettings, validator: impl Validator + 'static) -> Harness {
    let (hub, _task) = start_hub(&HubConfig::default()).unwrap();
    let orchestrator_client = CoordinationClient::connect_local(hub.clone()).await.unwrap();
    let observer = CoordinationClient::connect_local(hub).await.unwrap();

    let processes = Arc::new(ScriptedProcesses::default());
    let backlog = Arc::new(RecordingBacklog::default());
    let events = Arc::new(RecordingEvents::default());
    let collaborators = Collaborators::new(processes.clone(), Arc::new(validator), backlog.clone())
        .with_event_handler(events.clone());
    let (orchestrator, _task) =
        Orchestrator::start(settings, Arc::new(orchestrator_client), collaborators)
            .await
            .unwrap();

    Harness {
        orchestrator,
        hub: observer,
        processes,
        backlog,
        events,
    }
}

fn settings(max_concurrent: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        max_concurrent,
        max_retries: 3,
        default_deadline: Duration::from_secs(600),
        ..OrchestratorSettings::default()
    }
}

fn request(item_id: &str) -> SpawnRequest {
    SpawnRequest::new(NewWorkItem::new(item_id, "1"), format!("implement {item_id}"))
}

async fn wait_until(
    orchestrator: &Orchestrator,
    condition: impl Fn(&OrchestratorSnapshot) -> bool,
) -> OrchestratorSnapshot {
    for _ in 0..500 {
        let snapshot = orchestrator.snapshot().await.unwrap();
        if condition(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

fn archived_phase(snapshot: &OrchestratorSnapshot, agent_id: &str) -> Option<RunPhase> {
    snapshot
        .archived
        .iter()
        .find(|record| record.agent_id == agent_id)
        .map(|record| record.phase)
}

#[tokio::test]
async fn test_completion_admits_the_next_queued_request() {
    let h = harness(settings(1), ScriptedValidator::default()).await;

    let first = h
        .orchestrator
        .spawn(request("S1").with_priority(Priority::High))
        .await
        .unwrap();
    assert_eq!(
        first,
        SpawnOutcome::Admitted {
            agent_id: "agent-1".to_string()
        }
    );
    let second = h
        .orchestrator
        .spawn(request("S2").with_priority(Priority::High))
        .await
        .unwrap();
    assert_eq!(
        second,
        SpawnOutcome::Queued {
            position: 1,
            priority: Priority::High
        }
    );

    let item = h.hub.get_work("S1").await.unwrap();
    assert_eq!(item.claimed_by.as_deref(), Some("agent-1"));

    let agent = h.processes.agent("agent-1").await;
    wait_until(&h.orchestrator, |snapshot| {
        snapshot.find("agent-1").map(|record| record.phase) == Some(RunPhase::Running)
    })
    .await;
    agent.report_completed().await;

    let snapshot = wait_until(&h.orchestrator, |snapshot| {
        archived_phase(snapshot, "agent-1") == Some(RunPhase::Completed)
            && snapshot.active.len() == 1
    })
    .await;
    assert_eq!(snapshot.active[0].agent_id, "agent-2");
    assert_eq!(snapshot.active[0].work_item.id, "S2");
    assert!(snapshot.queued.is_empty());

    let item = h.hub.get_work("S1").await.unwrap();
    assert_eq!(item.status, "done");
    assert_eq!(item.progress, 100);
    assert!(item.claimed_by.is_none());
    let status = h.hub.workflow_status("S1").await.unwrap().unwrap();
    assert_eq!(status.status, "done");
    assert_eq!(status.actor, "agent-1");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h
        .backlog
        .updates
        .lock()
        .unwrap()
        .contains(&("S1".to_string(), "done".to_string(), true)));
}

#[tokio::test]
async fn test_higher_priority_is_admitted_first() {
    let h = harness(settings(1), ScriptedValidator::default()).await;

    h.orchestrator.spawn(request("busy")).await.unwrap();
    h.orchestrator
        .spawn(request("low").with_priority(Priority::Low))
        .await
        .unwrap();
    h.orchestrator
        .spawn(request("medium").with_priority(Priority::Medium))
        .await
        .unwrap();
    let outcome = h
        .orchestrator
        .spawn(request("high").with_priority(Priority::High))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SpawnOutcome::Queued {
            position: 1,
            priority: Priority::High
        }
    );

    let agent = h.processes.agent("agent-1").await;
    agent.exit(1).await;

    let snapshot = wait_until(&h.orchestrator, |snapshot| {
        snapshot.active.first().map(|record| record.work_item.id.as_str()) == Some("high")
    })
    .await;
    let queued: Vec<_> = snapshot
        .queued
        .iter()
        .map(|entry| (entry.position, entry.item_id.as_str()))
        .collect();
    assert_eq!(queued, vec![(1, "medium"), (2, "low")]);
}

#[tokio::test]
async fn test_validation_failures_are_retried_until_the_bound() {
    let h = harness(settings(2), ScriptedValidator::failing(3)).await;
    h.orchestrator.spawn(request("R1")).await.unwrap();
    let mut agent = h.processes.agent("agent-1").await;

    agent.report_completed().await;
    for expected in 1..=2 {
        match agent.instructions.recv().await {
            Some(AgentInstruction::Retry { attempt, issues }) => {
                assert_eq!(attempt, expected);
                assert_eq!(issues.len(), 1);
            }
            other => panic!("expected a retry, got {other:?}"),
        }
        agent.report_completed().await;
    }

    let snapshot = wait_until(&h.orchestrator, |snapshot| {
        archived_phase(snapshot, "agent-1") == Some(RunPhase::Failed)
    })
    .await;
    let record = snapshot.find("agent-1").unwrap();
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.errors.len(), 3);
    assert_eq!(record.failure_reason, Some(FailureReason::ValidationExhausted));

    let item = h.hub.get_work("R1").await.unwrap();
    assert!(item.claimed_by.is_none());
    assert_eq!(item.status, "available");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.processes.terminated(), vec!["agent-1".to_string()]);
}

#[tokio::test]
async fn test_success_on_the_last_allowed_attempt_completes() {
    let h = harness(settings(1), ScriptedValidator::failing(2)).await;
    h.orchestrator.spawn(request("R2")).await.unwrap();
    let mut agent = h.processes.agent("agent-1").await;

    agent.report_completed().await;
    for _ in 0..2 {
        assert!(matches!(
            agent.instructions.recv().await,
            Some(AgentInstruction::Retry { .. })
        ));
        agent.report_completed().await;
    }

    let snapshot = wait_until(&h.orchestrator, |snapshot| {
        archived_phase(snapshot, "agent-1") == Some(RunPhase::Completed)
    })
    .await;
    assert_eq!(snapshot.find("agent-1").unwrap().retry_count, 2);
}

#[tokio::test]
async fn test_exit_codes_fail_runs_and_reopen_items() {
    let h = harness(settings(2), ScriptedValidator::default()).await;
    h.orchestrator.spawn(request("E0")).await.unwrap();
    h.orchestrator.spawn(request("E2")).await.unwrap();

    h.processes.agent("agent-1").await.exit(0).await;
    h.processes.agent("agent-2").await.exit(2).await;

    let snapshot = wait_until(&h.orchestrator, |snapshot| snapshot.archived.len() == 2).await;
    assert_eq!(
        snapshot.find("agent-1").unwrap().failure_reason,
        Some(FailureReason::ExitedWithoutCompletion)
    );
    assert_eq!(
        snapshot.find("agent-2").unwrap().failure_reason,
        Some(FailureReason::ProcessError { code: Some(2) })
    );

    // Another agent can pick the work up again
    let reclaimed = h
        .hub
        .claim_work("E0", "dev-human", ClaimOptions::default())
        .await
        .unwrap();
    assert_eq!(reclaimed.claimed_by.as_deref(), Some("dev-human"));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_expiry_fails_the_run() {
    let h = harness(settings(1), ScriptedValidator::default()).await;
    h.orchestrator
        .spawn(request("T1").with_deadline(Duration::from_secs(30)))
        .await
        .unwrap();
    let _agent = h.processes.agent("agent-1").await;

    tokio::time::sleep(Duration::from_secs(31)).await;

    let snapshot = wait_until(&h.orchestrator, |snapshot| !snapshot.archived.is_empty()).await;
    assert_eq!(
        snapshot.find("agent-1").unwrap().failure_reason,
        Some(FailureReason::Timeout)
    );
    assert!(h.hub.get_work("T1").await.unwrap().claimed_by.is_none());
}

#[tokio::test]
async fn test_progress_reports_reach_the_hub() {
    let h = harness(settings(1), ScriptedValidator::default()).await;
    h.orchestrator.spawn(request("P1")).await.unwrap();
    let agent = h.processes.agent("agent-1").await;

    agent
        .events
        .send(RunEvent::Report(AgentReport::Progress {
            percent: 60,
            notes: Some("tests written".to_string()),
        }))
        .await
        .unwrap();

    for _ in 0..500 {
        let item = h.hub.get_work("P1").await.unwrap();
        if item.progress == 60 {
            assert_eq!(item.notes.as_deref(), Some("tests written"));
            assert_eq!(item.claimed_by.as_deref(), Some("agent-1"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("progress never reached the hub");
}

#[tokio::test]
async fn test_out_of_band_completion_report() {
    let h = harness(settings(1), ScriptedValidator::default()).await;
    h.orchestrator.spawn(request("O1")).await.unwrap();
    let _agent = h.processes.agent("agent-1").await;
    wait_until(&h.orchestrator, |snapshot| {
        snapshot.find("agent-1").map(|record| record.phase) == Some(RunPhase::Running)
    })
    .await;

    assert!(!h.orchestrator.report_completion("agent-9").await.unwrap());
    assert!(h.orchestrator.report_completion("agent-1").await.unwrap());

    wait_until(&h.orchestrator, |snapshot| {
        archived_phase(snapshot, "agent-1") == Some(RunPhase::Completed)
    })
    .await;
    // The agent never exited on its own, so its process is stopped
    for _ in 0..100 {
        if !h.processes.terminated().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.processes.terminated(), vec!["agent-1".to_string()]);
}

#[tokio::test]
async fn test_claimed_item_is_not_run_twice() {
    let h = harness(settings(1), ScriptedValidator::default()).await;
    h.hub
        .claim_work("C1", "dev-human", ClaimOptions::in_epic("1"))
        .await
        .unwrap();

    h.orchestrator.spawn(request("C1")).await.unwrap();
    let snapshot = wait_until(&h.orchestrator, |snapshot| !snapshot.archived.is_empty()).await;
    assert!(matches!(
        snapshot.find("agent-1").unwrap().failure_reason,
        Some(FailureReason::ClaimConflict { .. })
    ));
    assert_eq!(
        h.hub.get_work("C1").await.unwrap().claimed_by.as_deref(),
        Some("dev-human")
    );
    assert!(h.processes.terminated().is_empty());
    // The item belongs to someone else, so the backlog is left alone
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.backlog_updates().is_empty());
}

#[tokio::test]
async fn test_shutdown_fails_active_runs_and_releases_claims() {
    let h = harness(settings(1), ScriptedValidator::default()).await;
    h.orchestrator.spawn(request("D1")).await.unwrap();
    h.orchestrator.spawn(request("D2")).await.unwrap();
    let mut agent = h.processes.agent("agent-1").await;
    wait_until(&h.orchestrator, |snapshot| {
        snapshot.find("agent-1").map(|record| record.phase) == Some(RunPhase::Running)
    })
    .await;

    h.orchestrator.shutdown().await.unwrap();

    assert_eq!(agent.instructions.recv().await, Some(AgentInstruction::Stop));

    assert_eq!(h.processes.terminated(), vec!["agent-1".to_string()]);
    assert!(h.hub.get_work("D1").await.unwrap().claimed_by.is_none());
    // Queued requests were never claimed
    assert!(h.hub.get_work("D2").await.is_err());
    assert!(h.orchestrator.snapshot().await.is_err());
}

#[tokio::test]
async fn test_out_of_range_deadline_fails_the_run_and_keeps_serving() {
    let h = harness(settings(1), ScriptedValidator::default()).await;
    h.orchestrator
        .spawn(request("X1").with_deadline(Duration::MAX))
        .await
        .unwrap();

    let snapshot = wait_until(&h.orchestrator, |snapshot| !snapshot.archived.is_empty()).await;
    assert!(matches!(
        snapshot.find("agent-1").unwrap().failure_reason,
        Some(FailureReason::SpawnError { .. })
    ));
    // Rejected before the claim, so the hub never heard of it
    assert!(h.hub.get_work("X1").await.is_err());

    let outcome = h.orchestrator.spawn(request("X2")).await.unwrap();
    assert_eq!(
        outcome,
        SpawnOutcome::Admitted {
            agent_id: "agent-2".to_string()
        }
    );
    h.processes.agent("agent-2").await;
}

#[tokio::test(start_paused = true)]
async fn test_quiet_agents_are_pinged_then_time_out() {
    let settings = OrchestratorSettings {
        staleness: Duration::from_secs(10),
        sweep_interval: Duration::from_secs(5),
        default_deadline: Duration::from_secs(60),
        ..settings(1)
    };
    let h = harness(settings, ScriptedValidator::default()).await;
    h.orchestrator.spawn(request("Q1")).await.unwrap();
    let mut agent = h.processes.agent("agent-1").await;
    wait_until(&h.orchestrator, |snapshot| {
        snapshot.find("agent-1").map(|record| record.phase) == Some(RunPhase::Running)
    })
    .await;

    assert_eq!(agent.instructions.recv().await, Some(AgentInstruction::Ping));
    let pings = h.events.pings();
    assert!(!pings.is_empty());
    assert_eq!(pings[0].0, "agent-1");
    assert!(pings[0].1 >= 10);

    // Pings never end a run; the deadline does
    let snapshot = h.orchestrator.snapshot().await.unwrap();
    assert_eq!(snapshot.find("agent-1").unwrap().phase, RunPhase::Running);
    tokio::time::sleep(Duration::from_secs(60)).await;
    let snapshot = wait_until(&h.orchestrator, |snapshot| !snapshot.archived.is_empty()).await;
    assert_eq!(
        snapshot.find("agent-1").unwrap().failure_reason,
        Some(FailureReason::Timeout)
    );
}

/// Report completion, then exit while the validator is still working
async fn exit_during_validation(h: &Harness, code: i32) {
    let agent = h.processes.agent("agent-1").await;
    wait_until(&h.orchestrator, |snapshot| {
        snapshot.find("agent-1").map(|record| record.phase) == Some(RunPhase::Running)
    })
    .await;
    agent.report_completed().await;
    wait_until(&h.orchestrator, |snapshot| {
        snapshot.find("agent-1").map(|record| record.phase) == Some(RunPhase::Validating)
    })
    .await;

    agent.exit(code).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = h.orchestrator.snapshot().await.unwrap();
    assert_eq!(snapshot.find("agent-1").unwrap().phase, RunPhase::Validating);
}

#[tokio::test]
async fn test_exit_during_validation_waits_for_a_passing_verdict() {
    let (validator, verdicts) = GatedValidator::new();
    let h = harness(settings(1), validator).await;
    h.orchestrator.spawn(request("V1")).await.unwrap();

    exit_during_validation(&h, 0).await;
    verdicts.send(ValidationReport::pass()).unwrap();

    let snapshot = wait_until(&h.orchestrator, |snapshot| {
        archived_phase(snapshot, "agent-1") == Some(RunPhase::Completed)
    })
    .await;
    assert_eq!(snapshot.find("agent-1").unwrap().failure_reason, None);
    assert_eq!(h.hub.get_work("V1").await.unwrap().status, "done");
}

#[tokio::test]
async fn test_exit_during_validation_then_failing_verdict_is_a_process_error() {
    let (validator, verdicts) = GatedValidator::new();
    let h = harness(settings(1), validator).await;
    h.orchestrator.spawn(request("V2")).await.unwrap();

    exit_during_validation(&h, 3).await;
    verdicts
        .send(ValidationReport::fail(vec!["lint failed".to_string()]))
        .unwrap();

    let snapshot = wait_until(&h.orchestrator, |snapshot| {
        archived_phase(snapshot, "agent-1") == Some(RunPhase::Failed)
    })
    .await;
    let record = snapshot.find("agent-1").unwrap();
    assert_eq!(
        record.failure_reason,
        Some(FailureReason::ProcessError { code: Some(3) })
    );
    assert_eq!(record.errors, vec!["lint failed".to_string()]);
    assert!(h.hub.get_work("V2").await.unwrap().claimed_by.is_none());
}

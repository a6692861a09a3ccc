//! Orchestrator actor
//!
//! One task owns every [`RunRecord`], the pending queue and the deadline
//! timers. Process spawns, validations, terminations and backlog writes run
//! in their own tasks and report back as [`Command`]s, so admission is never
//! blocked behind them. Hub calls go through the shared
//! [`CoordinationClient`] and are awaited in place.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::lifecycle::{phase_machine, PhaseEvent, PhaseMachine, RunPhase};
use super::queue::PendingQueue;
use super::traits::{AgentInstruction, AgentReport, LifecycleEvent, RunEvent, RunHandle, ValidationReport};
use super::types::{
    FailureReason, OrchestratorSnapshot, QueuedEntry, RunRecord, RunResult, SpawnOutcome,
    SpawnRequest,
};
use super::{Collaborators, OrchestratorSettings};
use crate::client::{ClaimOptions, CoordinationClient, Transition};
use crate::hub::HubEvent;
use crate::observability::hub_metrics;
use crate::scheduler::{sleep_until_deadline, DeadlineScheduler, TimerId};

/// Upper bound on how long shutdown waits for terminations
const SHUTDOWN_TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);

pub(super) enum Command {
    Spawn {
        request: SpawnRequest,
        reply: oneshot::Sender<SpawnOutcome>,
    },
    Spawned {
        agent_id: String,
        result: anyhow::Result<RunHandle>,
    },
    Run {
        agent_id: String,
        event: RunEvent,
    },
    Validated {
        agent_id: String,
        attempt: u32,
        report: ValidationReport,
    },
    ReportCompletion {
        agent_id: String,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<OrchestratorSnapshot>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Spawn { .. } => "Spawn",
            Command::Spawned { .. } => "Spawned",
            Command::Run { .. } => "Run",
            Command::Validated { .. } => "Validated",
            Command::ReportCompletion { .. } => "ReportCompletion",
            Command::Snapshot { .. } => "Snapshot",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

struct ActiveRun {
    record: RunRecord,
    machine: PhaseMachine,
    task: String,
    instructions: Option<mpsc::Sender<AgentInstruction>>,
    deadline: Option<TimerId>,
    deadline_generation: u64,
    run_deadline: Duration,
    holds_claim: bool,
    claimed_status: String,
    /// Exit observed while validating, resolved once the verdict is in
    deferred_exit: Option<Option<i32>>,
    validation_attempt: u32,
    started: Instant,
    last_activity: Instant,
}

impl ActiveRun {
    fn phase(&self) -> RunPhase {
        self.machine.inner().phase()
    }

    fn apply(&mut self, event: PhaseEvent) -> RunPhase {
        self.machine.handle(&event);
        self.record.phase = self.phase();
        self.record.phase
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.record.last_activity = Utc::now();
    }

    fn record_failed_validation(&mut self, issues: &[String]) {
        self.record.retry_count += 1;
        self.record.errors.extend(issues.iter().cloned());
    }
}

fn exit_reason(code: Option<i32>) -> FailureReason {
    match code {
        Some(0) => FailureReason::ExitedWithoutCompletion,
        code => FailureReason::ProcessError { code },
    }
}

pub(super) struct OrchestratorActor {
    settings: OrchestratorSettings,
    client: Arc<CoordinationClient>,
    collaborators: Collaborators,
    active: HashMap<String, ActiveRun>,
    queue: PendingQueue<SpawnRequest>,
    archive: Vec<RunRecord>,
    timers: DeadlineScheduler<(String, u64)>,
    commands: mpsc::UnboundedSender<Command>,
    next_agent: u64,
}

impl OrchestratorActor {
    pub(super) fn new(
        settings: OrchestratorSettings,
        client: Arc<CoordinationClient>,
        collaborators: Collaborators,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            settings,
            client,
            collaborators,
            active: HashMap::new(),
            queue: PendingQueue::new(),
            archive: Vec::new(),
            timers: DeadlineScheduler::new(),
            commands,
            next_agent: 0,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(
            max_concurrent = self.settings.max_concurrent,
            max_retries = self.settings.max_retries,
            "Lifecycle orchestrator started"
        );

        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let client = self.client.clone();
        let mut hub_events_open = true;

        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown { done }) => {
                            self.shutdown().await;
                            let _ = done.send(());
                            break;
                        }
                        Some(command) => self.on_command(command).await,
                        None => break,
                    }
                }

                _ = sleep_until_deadline(deadline) => {
                    self.on_deadlines(Instant::now()).await;
                }

                _ = sweep.tick() => self.sweep(),

                event = client.next_event(), if hub_events_open => {
                    match event {
                        Some(event) => self.on_hub_event(event),
                        None => hub_events_open = false,
                    }
                }
            }

            self.fill_slots().await;
        }

        info!("Lifecycle orchestrator stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Spawn { request, reply } => {
                let outcome = self.on_spawn_request(request).await;
                let _ = reply.send(outcome);
            }
            Command::Spawned { agent_id, result } => self.on_spawned(agent_id, result).await,
            Command::Run { agent_id, event } => self.on_run_event(&agent_id, event).await,
            Command::Validated {
                agent_id,
                attempt,
                report,
            } => self.on_validated(&agent_id, attempt, report).await,
            Command::ReportCompletion { agent_id, reply } => {
                let accepted = self.on_completion_reported(&agent_id);
                let _ = reply.send(accepted);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    async fn on_spawn_request(&mut self, request: SpawnRequest) -> SpawnOutcome {
        if self.active.len() < self.settings.max_concurrent && self.queue.is_empty() {
            let agent_id = self.admit(request).await;
            return SpawnOutcome::Admitted { agent_id };
        }

        let priority = request.priority;
        let item_id = request.work_item.id.clone();
        let position = self.queue.push(priority, request);
        self.emit(LifecycleEvent::Queued {
            item_id,
            position,
            priority,
        });
        SpawnOutcome::Queued { position, priority }
    }

    /// Admit queued requests while there are free slots
    async fn fill_slots(&mut self) {
        while self.active.len() < self.settings.max_concurrent {
            let Some((_, request)) = self.queue.pop() else {
                break;
            };
            self.admit(request).await;
        }
    }

    async fn admit(&mut self, request: SpawnRequest) -> String {
        self.next_agent += 1;
        let agent_id = format!("agent-{}", self.next_agent);
        let workspace: PathBuf = request
            .workspace
            .clone()
            .unwrap_or_else(|| self.settings.workspace_root.join(&agent_id));
        let now = Utc::now();

        let mut run = ActiveRun {
            record: RunRecord {
                agent_id: agent_id.clone(),
                work_item: request.work_item.clone(),
                priority: request.priority,
                phase: RunPhase::Spawning,
                retry_count: 0,
                errors: Vec::new(),
                workspace: workspace.clone(),
                start_time: now,
                last_activity: now,
                end_time: None,
                failure_reason: None,
            },
            machine: phase_machine(&agent_id),
            task: request.task,
            instructions: None,
            deadline: None,
            deadline_generation: 0,
            run_deadline: request.deadline.unwrap_or(self.settings.default_deadline),
            holds_claim: false,
            claimed_status: self.settings.available_label.clone(),
            deferred_exit: None,
            validation_attempt: 0,
            started: Instant::now(),
            last_activity: Instant::now(),
        };
        hub_metrics().record_run_admitted();
        self.emit(LifecycleEvent::Admitted {
            agent_id: agent_id.clone(),
            item_id: request.work_item.id.clone(),
            priority: request.priority,
        });

        if Instant::now().checked_add(run.run_deadline).is_none() {
            let message = format!(
                "run deadline of {}s is out of range",
                run.run_deadline.as_secs()
            );
            self.active.insert(agent_id.clone(), run);
            self.fail(&agent_id, FailureReason::SpawnError { message }).await;
            return agent_id;
        }

        let options = ClaimOptions {
            epic_id: Some(request.work_item.epic_id.clone()),
            project: Some(
                request
                    .work_item
                    .project
                    .clone()
                    .unwrap_or_else(|| self.settings.project.clone()),
            ),
            timeout: None,
        };
        match self
            .client
            .claim_work(&request.work_item.id, &agent_id, options)
            .await
        {
            Ok(item) => {
                run.holds_claim = true;
                run.claimed_status = item.status;
            }
            Err(e) => {
                self.active.insert(agent_id.clone(), run);
                self.fail(
                    &agent_id,
                    FailureReason::ClaimConflict {
                        message: e.to_string(),
                    },
                )
                .await;
                return agent_id;
            }
        }

        arm_deadline(&mut self.timers, &agent_id, &mut run);
        let task = run.task.clone();
        self.active.insert(agent_id.clone(), run);

        let process_manager = self.collaborators.process_manager.clone();
        let commands = self.commands.clone();
        let spawn_id = agent_id.clone();
        tokio::spawn(async move {
            let result = process_manager.spawn(&spawn_id, &workspace, &task).await;
            let _ = commands.send(Command::Spawned {
                agent_id: spawn_id,
                result,
            });
        });

        agent_id
    }

    async fn on_spawned(&mut self, agent_id: String, result: anyhow::Result<RunHandle>) {
        let Some(run) = self.active.get_mut(&agent_id) else {
            if result.is_ok() {
                // The run ended while its process was starting
                debug!(agent_id = %agent_id, "Terminating process of a finished run");
                self.terminate_in_background(agent_id);
            }
            return;
        };

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(
                    &agent_id,
                    FailureReason::SpawnError {
                        message: format!("{e:#}"),
                    },
                )
                .await;
                return;
            }
        };

        run.instructions = Some(handle.instructions);
        run.touch();
        if run.apply(PhaseEvent::Started) == RunPhase::Running {
            self.emit(LifecycleEvent::Running {
                agent_id: agent_id.clone(),
            });
        }

        let commands = self.commands.clone();
        let mut events = handle.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if commands
                    .send(Command::Run {
                        agent_id: agent_id.clone(),
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    async fn on_run_event(&mut self, agent_id: &str, event: RunEvent) {
        let Some(run) = self.active.get_mut(agent_id) else {
            debug!(agent_id = %agent_id, ?event, "Event for inactive run ignored");
            return;
        };
        run.touch();

        match event {
            RunEvent::Output(line) => {
                debug!(agent_id = %agent_id, output = %line, "Agent output");
            }
            RunEvent::Report(AgentReport::Progress { percent, notes }) => {
                if !run.holds_claim {
                    return;
                }
                let item_id = run.record.work_item.id.clone();
                let status = run.claimed_status.clone();
                if let Err(e) = self
                    .client
                    .update_status(&item_id, agent_id, &status, percent, notes)
                    .await
                {
                    warn!(agent_id = %agent_id, item_id = %item_id, error = %e, "Failed to forward progress");
                }
            }
            RunEvent::Report(AgentReport::Completed { summary }) => {
                debug!(agent_id = %agent_id, summary = ?summary, "Agent reported completion");
                self.on_completion_reported(agent_id);
            }
            RunEvent::Exited { code } => self.on_exit(agent_id, code).await,
        }
    }

    /// Move a running agent to validating and start the validator.
    /// Returns whether the report was accepted.
    fn on_completion_reported(&mut self, agent_id: &str) -> bool {
        let Some(run) = self.active.get_mut(agent_id) else {
            return false;
        };
        if run.phase() != RunPhase::Running {
            debug!(agent_id = %agent_id, phase = ?run.phase(), "Completion report ignored");
            return false;
        }

        run.apply(PhaseEvent::CompletionReported);
        run.validation_attempt += 1;
        let attempt = run.validation_attempt;
        let workspace = run.record.workspace.clone();
        self.emit(LifecycleEvent::Validating {
            agent_id: agent_id.to_string(),
            attempt,
        });

        let validator = self.collaborators.validator.clone();
        let commands = self.commands.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            let report = validator.validate(&workspace).await;
            let _ = commands.send(Command::Validated {
                agent_id,
                attempt,
                report,
            });
        });
        true
    }

    async fn on_exit(&mut self, agent_id: &str, code: Option<i32>) {
        let Some(run) = self.active.get_mut(agent_id) else {
            return;
        };
        run.instructions = None;
        match run.phase() {
            RunPhase::Validating => {
                debug!(agent_id = %agent_id, code = ?code, "Exit during validation deferred");
                run.deferred_exit = Some(code);
            }
            RunPhase::Spawning | RunPhase::Running => {
                self.fail(agent_id, exit_reason(code)).await;
            }
            RunPhase::Completed | RunPhase::Failed => {}
        }
    }

    async fn on_validated(&mut self, agent_id: &str, attempt: u32, report: ValidationReport) {
        let Some(run) = self.active.get_mut(agent_id) else {
            return;
        };
        if run.phase() != RunPhase::Validating || attempt != run.validation_attempt {
            debug!(agent_id = %agent_id, attempt = attempt, "Stale validation verdict ignored");
            return;
        }

        if report.passed {
            self.complete(agent_id).await;
            return;
        }

        run.record_failed_validation(&report.issues);
        if let Some(code) = run.deferred_exit {
            // Nobody left to retry
            self.fail(agent_id, exit_reason(code)).await;
            return;
        }
        if run.record.retry_count >= self.settings.max_retries {
            self.fail(agent_id, FailureReason::ValidationExhausted).await;
            return;
        }

        let attempt = run.record.retry_count;
        run.apply(PhaseEvent::RetryRequested);
        arm_deadline(&mut self.timers, agent_id, run);
        let instruction = AgentInstruction::Retry {
            attempt,
            issues: report.issues.clone(),
        };
        if let Some(instructions) = &run.instructions {
            if let Err(e) = instructions.try_send(instruction) {
                warn!(agent_id = %agent_id, error = %e, "Could not deliver retry instruction");
            }
        }
        self.emit(LifecycleEvent::RetryRequested {
            agent_id: agent_id.to_string(),
            attempt,
            issues: report.issues,
        });
    }

    /// Validation passed: write the completion to the hub and the backlog
    async fn complete(&mut self, agent_id: &str) {
        let Some(mut run) = self.active.remove(agent_id) else {
            return;
        };
        if let Some(timer) = run.deadline.take() {
            self.timers.cancel(timer);
        }
        run.apply(PhaseEvent::ValidationPassed);
        run.record.end_time = Some(Utc::now());

        let item_id = run.record.work_item.id.clone();
        let completion = self.settings.completion_label.clone();
        let notes = format!(
            "validated after {} retr{}",
            run.record.retry_count,
            if run.record.retry_count == 1 { "y" } else { "ies" }
        );
        if run.holds_claim {
            if let Err(e) = self
                .client
                .update_status(&item_id, agent_id, &completion, 100, Some(notes.clone()))
                .await
            {
                warn!(agent_id = %agent_id, item_id = %item_id, error = %e, "Failed to record completion status");
            }
            if let Err(e) = self.client.release_work(&item_id, agent_id).await {
                warn!(agent_id = %agent_id, item_id = %item_id, error = %e, "Failed to release completed item");
            }
        }

        let transition = Transition::new(
            item_id.clone(),
            run.claimed_status.clone(),
            completion.clone(),
            agent_id,
            self.settings.role.clone(),
        )
        .with_notes(notes);
        if let Err(e) = self.client.publish_transition(transition).await {
            warn!(agent_id = %agent_id, item_id = %item_id, error = %e, "Failed to publish completion");
        }

        // Out-of-band completions can leave the process behind
        run.instructions = None;
        self.terminate_in_background(agent_id.to_string());

        hub_metrics().record_run_completed();
        self.record_in_backlog(&run.record, completion);
        self.emit(LifecycleEvent::Completed {
            agent_id: agent_id.to_string(),
            item_id,
            runtime_seconds: run.started.elapsed().as_secs(),
        });
        self.archive.push(run.record);
    }

    /// Terminal failure: free the claim and the slot, stop the process
    async fn fail(&mut self, agent_id: &str, reason: FailureReason) {
        let Some(mut run) = self.active.remove(agent_id) else {
            return;
        };
        if let Some(timer) = run.deadline.take() {
            self.timers.cancel(timer);
        }
        run.apply(PhaseEvent::Fail(reason.clone()));
        run.record.failure_reason = Some(reason.clone());
        run.record.end_time = Some(Utc::now());

        let item_id = run.record.work_item.id.clone();
        let mut status = None;
        if run.holds_claim {
            status = Some(match self.client.release_work(&item_id, agent_id).await {
                Ok(item) => item.status,
                Err(e) => {
                    debug!(agent_id = %agent_id, item_id = %item_id, error = %e, "Claim was not released");
                    self.settings.available_label.clone()
                }
            });
        }

        let process_started = !matches!(
            reason,
            FailureReason::ClaimConflict { .. } | FailureReason::SpawnError { .. }
        );
        if process_started {
            self.terminate_in_background(agent_id.to_string());
        }

        hub_metrics().record_run_failed();
        // Without a claim the hub's status belongs to someone else
        if let Some(status) = status {
            self.record_in_backlog(&run.record, status);
        }
        self.emit(LifecycleEvent::Failed {
            agent_id: agent_id.to_string(),
            item_id,
            reason: reason.to_string(),
        });
        self.archive.push(run.record);
    }

    async fn on_deadlines(&mut self, now: Instant) {
        for (agent_id, generation) in self.timers.pop_expired(now) {
            let current = self
                .active
                .get_mut(&agent_id)
                .filter(|run| run.deadline_generation == generation);
            let Some(run) = current else {
                continue;
            };
            run.deadline = None;
            warn!(agent_id = %agent_id, phase = ?run.phase(), "Run deadline expired");
            self.fail(&agent_id, FailureReason::Timeout).await;
        }
    }

    /// Ping running agents that have been quiet for too long
    fn sweep(&mut self) {
        for (agent_id, run) in &self.active {
            if run.phase() != RunPhase::Running {
                continue;
            }
            let idle = run.last_activity.elapsed();
            if idle < self.settings.staleness {
                continue;
            }
            if let Some(instructions) = &run.instructions {
                if instructions.try_send(AgentInstruction::Ping).is_ok() {
                    self.collaborators
                        .events
                        .handle_event(LifecycleEvent::Pinged {
                            agent_id: agent_id.clone(),
                            idle_seconds: idle.as_secs(),
                        });
                }
            }
        }
    }

    fn on_hub_event(&mut self, event: HubEvent) {
        if let HubEvent::ItemReleased {
            item_id, claimant, ..
        } = &event
        {
            if let Some(run) = self.active.get_mut(claimant) {
                if run.record.work_item.id == *item_id {
                    warn!(agent_id = %claimant, item_id = %item_id, "Hub released a claim held by an active run");
                    run.holds_claim = false;
                }
            }
        }
        debug!(kind = %event.kind(), project = %event.project(), item_id = ?event.item_id(), "Hub event");
    }

    fn snapshot(&self) -> OrchestratorSnapshot {
        let mut active: Vec<RunRecord> = self
            .active
            .values()
            .map(|run| run.record.clone())
            .collect();
        active.sort_by(|a, b| {
            (a.start_time, a.agent_id.len(), &a.agent_id).cmp(&(
                b.start_time,
                b.agent_id.len(),
                &b.agent_id,
            ))
        });
        let queued = self
            .queue
            .iter()
            .enumerate()
            .map(|(index, (priority, request))| QueuedEntry {
                position: index + 1,
                priority,
                item_id: request.work_item.id.clone(),
            })
            .collect();
        OrchestratorSnapshot {
            active,
            queued,
            archived: self.archive.clone(),
        }
    }

    async fn shutdown(&mut self) {
        info!(
            active = self.active.len(),
            queued = self.queue.len(),
            "Shutting down lifecycle orchestrator"
        );

        for (priority, request) in self.queue.drain() {
            info!(item_id = %request.work_item.id, priority = %priority, "Dropping queued spawn request");
        }

        let agent_ids: Vec<String> = self.active.keys().cloned().collect();
        for agent_id in &agent_ids {
            let Some(mut run) = self.active.remove(agent_id) else {
                continue;
            };
            if let Some(timer) = run.deadline.take() {
                self.timers.cancel(timer);
            }
            if let Some(instructions) = run.instructions.take() {
                let _ = instructions.try_send(AgentInstruction::Stop);
            }
            run.apply(PhaseEvent::Fail(FailureReason::Shutdown));
            run.record.failure_reason = Some(FailureReason::Shutdown);
            run.record.end_time = Some(Utc::now());
            if run.holds_claim {
                if let Err(e) = self
                    .client
                    .release_work(&run.record.work_item.id, agent_id)
                    .await
                {
                    debug!(agent_id = %agent_id, error = %e, "Claim was not released at shutdown");
                }
            }
            self.archive.push(run.record);
        }

        let process_manager = self.collaborators.process_manager.clone();
        let terminations = join_all(
            agent_ids
                .iter()
                .map(|agent_id| process_manager.terminate(agent_id)),
        );
        match timeout(SHUTDOWN_TERMINATE_TIMEOUT, terminations).await {
            Ok(results) => {
                for (agent_id, result) in agent_ids.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(agent_id = %agent_id, error = %e, "Agent did not terminate cleanly");
                    }
                }
            }
            Err(_) => warn!("Timeout waiting for agents to terminate"),
        }

        self.client.disconnect().await;
    }

    fn terminate_in_background(&self, agent_id: String) {
        let process_manager = self.collaborators.process_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = process_manager.terminate(&agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to terminate agent process");
            }
        });
    }

    fn record_in_backlog(&self, record: &RunRecord, status: String) {
        let backlog = self.collaborators.backlog.clone();
        let item = record.work_item.clone();
        let result = RunResult::from_record(record);
        tokio::spawn(async move {
            if let Err(e) = backlog.set_status(&item, &status, &result).await {
                warn!(item_id = %item.id, error = %e, "Failed to update backlog");
            }
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        self.collaborators.events.handle_event(event);
    }
}

fn arm_deadline(
    timers: &mut DeadlineScheduler<(String, u64)>,
    agent_id: &str,
    run: &mut ActiveRun,
) {
    if let Some(timer) = run.deadline.take() {
        timers.cancel(timer);
    }
    run.deadline_generation += 1;
    match Instant::now().checked_add(run.run_deadline) {
        Some(at) => {
            run.deadline = Some(timers.schedule(at, (agent_id.to_string(), run.deadline_generation)));
        }
        None => warn!(agent_id = %agent_id, "Run deadline out of range, not armed"),
    }
}

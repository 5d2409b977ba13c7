//! # Task Executor
//!
//! Runs phases. Every execution goes through the same primitive: claim the
//! task's lease with an update guarded on the revision that was read, run
//! exactly one phase, write the task back under the lease, then publish what
//! changed. A task that cannot be
//! claimed is skipped; a write-back that finds its lease gone (the task was
//! cancelled meanwhile) is discarded.
//!
//! ```text
//! poll_and_execute ──► list_runnable ──► execute_phase (per task)
//!                                            │
//!                      claim ─► skill / child / event ─► finish ─► publish
//! ```

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;

use super::coordinator::ChildCoordinator;
use super::events::{BusEvent, EventBus, TaskEvent, TaskEventKind};
use super::machine::{StateChange, TaskEngine, TaskResult};
use super::skill::{SkillContext, SkillInvoker};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::kata::PhaseAction;
use crate::state::{Resumption, ResumptionKind, Task, TaskState};

/// Summary of one poll cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    /// Tasks that looked runnable when the cycle started
    pub runnable: usize,
    /// Phases executed
    pub executed: usize,
    /// Tasks another execution got to first
    pub skipped: usize,
    /// Per-task infrastructure errors: (task id, message)
    pub errors: Vec<(String, String)>,
}

/// What one claimed execution produced, before write-back
struct Step {
    result: TaskResult,
    /// Child spawned during this step; canceled if the write-back is rejected
    spawned_child: Option<String>,
}

impl Step {
    fn done(result: TaskResult) -> Self {
        Self {
            result,
            spawned_child: None,
        }
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    engine: TaskEngine,
    coordinator: ChildCoordinator,
    skills: Arc<dyn SkillInvoker>,
    config: EngineConfig,
}

impl TaskExecutor {
    pub fn new(engine: TaskEngine, skills: Arc<dyn SkillInvoker>, config: EngineConfig) -> Self {
        Self {
            coordinator: ChildCoordinator::new(engine.clone()),
            engine,
            skills,
            config,
        }
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub fn coordinator(&self) -> &ChildCoordinator {
        &self.coordinator
    }

    /// Claim a task and execute its current phase.
    ///
    /// Returns `Ok(None)` when there was nothing to do: the task is terminal,
    /// another execution holds it, it is still gated by backoff, or it is
    /// blocked with nothing to resume it.
    #[tracing::instrument(skip(self), fields(kata = tracing::field::Empty))]
    pub async fn execute_phase(&self, task_id: &str) -> Result<Option<TaskResult>> {
        let task = self.engine.get(task_id)?;
        if task.is_terminal() {
            tracing::debug!(state = %task.state, "Task is terminal, nothing to execute");
            return Ok(None);
        }
        let kata_label = format!("{} v{}", task.kata_name, task.kata_version);
        tracing::Span::current().record("kata", kata_label.as_str());

        let (claim_to, resumption) = match task.state {
            TaskState::Pending | TaskState::Running => (TaskState::Running, None),
            TaskState::Waiting | TaskState::WaitingForEvent => {
                let resumption = match self.engine.tasks().resumption(task_id)? {
                    Some(r) => r,
                    None => {
                        tracing::debug!(state = %task.state, "Task is blocked, nothing to resume it yet");
                        return Ok(None);
                    }
                };
                if task.waiting_on.as_deref() != Some(resumption.source.as_str()) {
                    tracing::debug!(source = %resumption.source, "Discarding stale resumption");
                    self.engine.tasks().discard_resumption(task_id)?;
                    return Ok(None);
                }
                let to = match resumption.kind {
                    ResumptionKind::Event => TaskState::Running,
                    // Stays waiting until the child outcome is known
                    ResumptionKind::Child => TaskState::Waiting,
                };
                (to, Some(resumption))
            }
            _ => return Ok(None),
        };

        let token = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        if !self
            .engine
            .tasks()
            .claim(task_id, task.state, claim_to, task.revision, &token, now)?
        {
            tracing::debug!("Task not claimable, skipping");
            return Ok(None);
        }

        let mut task = task;
        task.revision += 1;
        let mut changes = Vec::new();
        task.started_at.get_or_insert(now);
        if task.state != claim_to {
            let from = task.state;
            task.state = claim_to;
            task.updated_at = now;
            changes.push(StateChange { from, to: claim_to });
        }

        let consume = resumption.is_some();
        let step = match self.step(&mut task, resumption, &mut changes).await {
            Ok(step) => step,
            Err(e) => {
                // Never leave a claimed task without a write-back
                tracing::error!(task_id, "Phase execution failed internally: {}", e);
                let diagnostic = format!("internal error: {}", e);
                self.engine.fail(&mut task, diagnostic.clone(), &mut changes);
                Step::done(TaskResult::failure(&task, diagnostic))
            }
        };

        let finished = match self.engine.tasks().finish(&task, &token, consume) {
            Ok(finished) => finished,
            Err(e) => {
                if let Err(release) = self.engine.tasks().release_lease(task_id, &token) {
                    tracing::warn!(task_id, "Failed to release lease: {}", release);
                }
                if let Some(child_id) = step.spawned_child {
                    self.cancel_orphan(&child_id, task_id).await;
                }
                return Err(e.into());
            }
        };
        if !finished {
            tracing::info!(task_id, "Task was canceled during execution, result discarded");
            if let Some(child_id) = step.spawned_child {
                self.cancel_orphan(&child_id, task_id).await;
            }
            return Ok(None);
        }
        task.revision += 1;

        self.engine.publish_changes(&task, &changes).await;
        self.engine
            .publish(TaskEvent::new(TaskEventKind::KataTaskExecuted, &task).with_error(step.result.error.clone()))
            .await;

        if task.is_terminal() {
            self.coordinator.notify_parent(&task)?;
        }

        let mut result = step.result;
        result.state = task.state;
        tracing::info!(
            task_id,
            phase = %task.current_phase,
            state = %task.state,
            success = result.success,
            "Phase executed"
        );
        Ok(Some(result))
    }

    async fn step(
        &self,
        task: &mut Task,
        resumption: Option<Resumption>,
        changes: &mut Vec<StateChange>,
    ) -> Result<Step> {
        let kata = match self.engine.kata_for(task)? {
            Some(kata) => kata,
            None => {
                let diagnostic = format!(
                    "kata {} v{} is not registered",
                    task.kata_name, task.kata_version
                );
                self.engine.fail(task, diagnostic.clone(), changes);
                return Ok(Step::done(TaskResult::failure(task, diagnostic)));
            }
        };
        let phase = match kata.phase(&task.current_phase) {
            Some(phase) => phase.clone(),
            None => {
                let diagnostic = format!(
                    "phase '{}' does not exist in kata {}",
                    task.current_phase,
                    kata.key()
                );
                self.engine.fail(task, diagnostic.clone(), changes);
                return Ok(Step::done(TaskResult::failure(task, diagnostic)));
            }
        };

        if let Some(resumption) = resumption {
            return match resumption.kind {
                ResumptionKind::Child => {
                    let (result, spawned_child) = self
                        .coordinator
                        .resume(task, &kata, &phase, &resumption, changes)
                        .await?;
                    Ok(Step {
                        result,
                        spawned_child,
                    })
                }
                ResumptionKind::Event => Ok(Step::done(
                    self.engine
                        .resume_event(task, &phase, &resumption, changes)?,
                )),
            };
        }

        match &phase.action {
            None => {
                let next = self.engine.apply_transition(task, &phase, changes)?;
                Ok(Step::done(TaskResult::success(task, None, next)))
            }
            Some(PhaseAction::RunSkill { skill }) => {
                let context = SkillContext::for_task(task);
                match self.skills.invoke(skill, context).await {
                    Ok(output) => {
                        task.variables.insert(phase.name.clone(), output.clone());
                        let next = self.engine.apply_transition(task, &phase, changes)?;
                        Ok(Step::done(TaskResult::success(task, Some(output), next)))
                    }
                    Err(e) => {
                        let error = format!("skill '{}' failed: {}", skill, e);
                        self.engine
                            .handle_failure(task, &kata, &phase, &error, changes)?;
                        Ok(Step::done(TaskResult::failure(task, error)))
                    }
                }
            }
            Some(PhaseAction::SpawnKata { kata: child, version }) => {
                match self
                    .coordinator
                    .spawn_child(task, child, *version, None, changes)
                    .await
                {
                    Ok(child_id) => Ok(Step {
                        result: TaskResult::success(task, None, None),
                        spawned_child: Some(child_id),
                    }),
                    Err(EngineError::KataNotFound(key)) => {
                        let error = format!("cannot spawn kata {}: not registered", key);
                        self.engine
                            .handle_failure(task, &kata, &phase, &error, changes)?;
                        Ok(Step::done(TaskResult::failure(task, error)))
                    }
                    Err(e) => Err(e),
                }
            }
            Some(PhaseAction::AwaitEvent { event }) => {
                task.waiting_on = Some(event.clone());
                self.engine
                    .transition(task, TaskState::WaitingForEvent, changes)?;
                tracing::info!(task_id = %task.id, event = %event, "Task waiting for event");
                Ok(Step::done(TaskResult::success(task, None, None)))
            }
        }
    }

    async fn cancel_orphan(&self, child_id: &str, parent_id: &str) {
        if let Err(e) = self.engine.cancel(child_id).await {
            tracing::warn!(child_id, "Failed to cancel orphaned child: {}", e);
        }
        if let Err(e) = self.engine.tasks().discard_resumption(parent_id) {
            tracing::warn!(task_id = parent_id, "Failed to drop resumption: {}", e);
        }
    }

    /// One poll cycle: execute one phase of every runnable task
    #[tracing::instrument(skip(self))]
    pub async fn poll_and_execute(&self) -> Result<PollReport> {
        if let Err(e) = self.coordinator.sweep_finished_children() {
            tracing::warn!("Child sweep failed: {}", e);
        }

        let runnable = self.engine.tasks().list_runnable(Utc::now())?;
        let mut report = PollReport {
            runnable: runnable.len(),
            ..Default::default()
        };
        if runnable.is_empty() {
            return Ok(report);
        }

        let ids: Vec<String> = runnable.into_iter().map(|t| t.id).collect();

        if self.config.max_concurrent_dispatch <= 1 {
            for id in ids {
                let outcome = self.execute_phase(&id).await;
                record(&mut report, id, outcome);
            }
        } else {
            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_dispatch));
            let mut handles = Vec::with_capacity(ids.len());

            for id in ids {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| anyhow::anyhow!("Dispatch semaphore closed: {}", e))?;
                let executor = self.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit; // Held until the phase is written back
                    let outcome = executor.execute_phase(&id).await;
                    (id, outcome)
                }));
            }

            for joined in futures::future::join_all(handles).await {
                match joined {
                    Ok((id, outcome)) => record(&mut report, id, outcome),
                    Err(e) => report
                        .errors
                        .push((String::new(), format!("dispatch task panicked: {}", e))),
                }
            }
        }

        tracing::info!(
            runnable = report.runnable,
            executed = report.executed,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Poll cycle finished"
        );
        Ok(report)
    }

    /// Queue an event resumption for every task waiting on the topic.
    ///
    /// Returns the ids of the tasks woken.
    pub fn deliver_event(&self, event: &BusEvent) -> Result<Vec<String>> {
        let mut woken = Vec::new();
        for task in self.engine.tasks().list_waiting_for_event(&event.topic)? {
            if let Some(target) = &event.task_id {
                if target != &task.id {
                    continue;
                }
            }
            self.engine.tasks().enqueue_resumption(&Resumption::event(
                &task.id,
                &event.topic,
                event.payload.clone(),
            ))?;
            woken.push(task.id);
        }

        if !woken.is_empty() {
            tracing::info!(topic = %event.topic, tasks = woken.len(), "Event delivered");
        }
        Ok(woken)
    }

    /// Deliver an event and execute the woken tasks right away
    pub async fn deliver_and_execute(&self, event: &BusEvent) -> Result<Vec<TaskResult>> {
        let mut results = Vec::new();
        for task_id in self.deliver_event(event)? {
            if let Some(result) = self.execute_phase(&task_id).await? {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.config.poll_interval().as_secs(),
            max_concurrent = self.config.max_concurrent_dispatch,
            "Executor started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_and_execute().await {
                        tracing::error!("Poll cycle failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Executor stopped");
    }

    /// Wake waiting tasks from external events published on the bus
    pub fn listen_for_events(&self, bus: Arc<dyn EventBus>) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let executor = self.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if TaskEventKind::is_engine_topic(&event.topic) {
                            continue;
                        }
                        if let Err(e) = executor.deliver_and_execute(&event).await {
                            tracing::error!(topic = %event.topic, "Failed to deliver event: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event listener lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn record(report: &mut PollReport, id: String, outcome: Result<Option<TaskResult>>) {
    match outcome {
        Ok(Some(_)) => report.executed += 1,
        Ok(None) => report.skipped += 1,
        Err(e) => {
            tracing::error!(task_id = %id, "Execution failed: {}", e);
            report.errors.push((id, e.to_string()));
        }
    }
}

//! # Task Engine
//!
//! Owns the task state machine: spawning, variable merges, cancellation and
//! every state change a phase execution produces. Transitions are applied to
//! an in-memory [`Task`] and recorded as [`StateChange`]s; the executor
//! persists the task under its lease and only then publishes the changes.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::events::{EventBus, TaskEvent, TaskEventKind};
use super::retry::{DefaultRetryPolicies, RetryDecision};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::kata::{CompiledKata, KataKey, Phase, Transition};
use crate::state::{
    KataDb, KataStore, Resumption, ResumptionOutcome, Task, TaskState, TaskStore,
    VariablesUpdate,
};

/// Outcome of one phase execution
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Phase the task will execute next, if it advanced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_phase: Option<String>,
    /// Task state after the execution
    pub state: TaskState,
}

impl TaskResult {
    pub fn success(task: &Task, output: Option<Value>, next_phase: Option<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            success: true,
            output,
            error: None,
            next_phase,
            state: task.state,
        }
    }

    pub fn failure(task: &Task, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            success: false,
            output: None,
            error: Some(error.into()),
            next_phase: None,
            state: task.state,
        }
    }
}

/// One applied edge of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: TaskState,
    pub to: TaskState,
}

/// The state machine and its stores
#[derive(Clone)]
pub struct TaskEngine {
    katas: KataStore,
    tasks: TaskStore,
    bus: Arc<dyn EventBus>,
    retry: DefaultRetryPolicies,
}

impl TaskEngine {
    pub fn new(db: &KataDb, bus: Arc<dyn EventBus>, config: &EngineConfig) -> Self {
        Self {
            katas: KataStore::new(db),
            tasks: TaskStore::new(db),
            bus,
            retry: config.retry_policies(),
        }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn katas(&self) -> &KataStore {
        &self.katas
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn retry_policies(&self) -> &DefaultRetryPolicies {
        &self.retry
    }

    /// Load a task or fail with `TaskNotFound`
    pub fn get(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .load(task_id)?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    /// The compiled kata a task is bound to
    pub fn kata_for(&self, task: &Task) -> Result<Option<CompiledKata>> {
        Ok(self.katas.load(&task.kata_name, task.kata_version)?)
    }

    /// Create a `pending` task at the kata's initial phase
    pub async fn spawn(
        &self,
        kata_name: &str,
        kata_version: u32,
        variables: Option<Map<String, Value>>,
    ) -> Result<Task> {
        self.spawn_task(kata_name, kata_version, variables.unwrap_or_default(), None, None)
            .await
    }

    /// Spawn a task as the child of `parent`, gated until `run_after`
    pub(crate) async fn spawn_child(
        &self,
        parent: &Task,
        kata_name: &str,
        kata_version: u32,
        run_after: Option<chrono::DateTime<Utc>>,
    ) -> Result<Task> {
        self.spawn_task(
            kata_name,
            kata_version,
            parent.variables.clone(),
            Some(parent.id.clone()),
            run_after,
        )
        .await
    }

    async fn spawn_task(
        &self,
        kata_name: &str,
        kata_version: u32,
        variables: Map<String, Value>,
        parent: Option<String>,
        run_after: Option<chrono::DateTime<Utc>>,
    ) -> Result<Task> {
        let kata = self
            .katas
            .load(kata_name, kata_version)?
            .ok_or_else(|| EngineError::KataNotFound(KataKey::new(kata_name, kata_version)))?;

        let mut task = Task::new(&kata, variables, parent);
        task.run_after = run_after;
        self.tasks.insert(&task)?;

        tracing::info!(
            task_id = %task.id,
            kata = %kata.key(),
            parent = ?task.parent_task_id,
            "Task spawned"
        );

        self.publish(TaskEvent::new(TaskEventKind::Created, &task)).await;
        self.publish(TaskEvent::new(TaskEventKind::KataTaskSpawned, &task))
            .await;
        Ok(task)
    }

    /// Shallow merge into a non-terminal task that is not mid-execution
    pub async fn update_variables(&self, task_id: &str, partial: Map<String, Value>) -> Result<Task> {
        match self.tasks.update_variables(task_id, partial)? {
            VariablesUpdate::Updated(task) => Ok(task),
            VariablesUpdate::Terminal(state) => Err(EngineError::TaskTerminal {
                task_id: task_id.to_string(),
                state,
            }),
            VariablesUpdate::Busy => Err(EngineError::TaskBusy {
                task_id: task_id.to_string(),
            }),
            VariablesUpdate::NotFound => Err(EngineError::TaskNotFound(task_id.to_string())),
        }
    }

    /// Operator cancellation; permitted from any non-terminal state.
    ///
    /// Does not interrupt an in-flight phase: that execution loses its lease
    /// and its result is discarded when it tries to write back.
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        // The state can move under us between load and the guarded update
        // (a claim in progress), so re-read a few times.
        for _ in 0..3 {
            let task = self.get(task_id)?;
            if task.is_terminal() {
                return Err(EngineError::TaskTerminal {
                    task_id: task_id.to_string(),
                    state: task.state,
                });
            }

            if self.tasks.cancel(task_id, task.state, Utc::now())? {
                let canceled = self.get(task_id)?;
                tracing::info!(task_id, previous = %task.state, "Task canceled");
                self.publish(TaskEvent::state_changed(&canceled, task.state))
                    .await;

                if let Some(parent_id) = &canceled.parent_task_id {
                    let parent = self.tasks.load(parent_id)?;
                    if parent.map_or(false, |p| p.state == TaskState::Waiting) {
                        self.tasks.enqueue_resumption(&Resumption::child(
                            parent_id,
                            &canceled.id,
                            ResumptionOutcome::Canceled,
                            Value::Null,
                        ))?;
                    }
                }
                return Ok(canceled);
            }
        }

        Err(EngineError::TaskBusy {
            task_id: task_id.to_string(),
        })
    }

    /// Apply one edge, rejecting anything outside the state machine
    pub fn transition(
        &self,
        task: &mut Task,
        to: TaskState,
        changes: &mut Vec<StateChange>,
    ) -> Result<()> {
        let from = task.state;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                task_id: task.id.clone(),
                from,
                to,
            });
        }

        let now = Utc::now();
        task.state = to;
        task.updated_at = now;
        if to.is_terminal() {
            task.completed_at = Some(now);
            task.run_after = None;
        }
        changes.push(StateChange { from, to });
        Ok(())
    }

    /// Follow the phase's terminal directive after a successful action
    pub fn apply_transition(
        &self,
        task: &mut Task,
        phase: &Phase,
        changes: &mut Vec<StateChange>,
    ) -> Result<Option<String>> {
        task.attempt = 0;
        task.run_after = None;
        task.waiting_on = None;

        match &phase.transition {
            Transition::Next(next) => {
                self.transition(task, TaskState::Running, changes)?;
                task.current_phase = next.clone();
                Ok(Some(next.clone()))
            }
            Transition::Complete => {
                self.transition(task, TaskState::Completed, changes)?;
                Ok(None)
            }
        }
    }

    /// Consult the retry policy after a failed skill call
    pub fn handle_failure(
        &self,
        task: &mut Task,
        kata: &CompiledKata,
        phase: &Phase,
        error: &str,
        changes: &mut Vec<StateChange>,
    ) -> Result<RetryDecision> {
        let policy = self.retry.resolve(kata, phase);
        let decision = policy.decide(task.attempt + 1);

        match &decision {
            RetryDecision::Retry { attempt, delay } => {
                tracing::warn!(
                    task_id = %task.id,
                    phase = %phase.name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Phase failed, scheduling retry: {}",
                    error
                );
                task.attempt = *attempt;
                task.run_after = Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
                self.transition(task, TaskState::Pending, changes)?;
            }
            RetryDecision::Exhausted { attempts } => {
                tracing::error!(
                    task_id = %task.id,
                    phase = %phase.name,
                    attempts,
                    "Phase failed, no attempts left: {}",
                    error
                );
                task.attempt = *attempts;
                self.fail(task, error.to_string(), changes);
            }
        }
        Ok(decision)
    }

    /// Resume a task woken by an external event
    pub fn resume_event(
        &self,
        task: &mut Task,
        phase: &Phase,
        resumption: &Resumption,
        changes: &mut Vec<StateChange>,
    ) -> Result<TaskResult> {
        if task.state == TaskState::WaitingForEvent {
            self.transition(task, TaskState::Running, changes)?;
        }
        task.variables
            .insert(phase.name.clone(), resumption.payload.clone());
        let next = self.apply_transition(task, phase, changes)?;

        tracing::info!(task_id = %task.id, event = %resumption.source, "Task resumed by event");
        Ok(TaskResult::success(
            task,
            Some(resumption.payload.clone()),
            next,
        ))
    }

    /// Mark a task failed, whatever non-terminal state it is in
    pub fn fail(&self, task: &mut Task, error: String, changes: &mut Vec<StateChange>) {
        if task.is_terminal() {
            return;
        }
        if !task.state.can_transition_to(TaskState::Failed) {
            // waiting_for_event and pending only fail by way of running
            let from = task.state;
            task.state = TaskState::Running;
            changes.push(StateChange {
                from,
                to: TaskState::Running,
            });
        }

        let from = task.state;
        let now = Utc::now();
        task.state = TaskState::Failed;
        task.error = Some(error);
        task.run_after = None;
        task.completed_at = Some(now);
        task.updated_at = now;
        changes.push(StateChange {
            from,
            to: TaskState::Failed,
        });
    }

    /// Publish `task.state_changed` for every change, plus the terminal event
    pub async fn publish_changes(&self, task: &Task, changes: &[StateChange]) {
        for change in changes {
            let mut event = TaskEvent::state_changed(task, change.from);
            event.state = Some(change.to);
            self.publish(event).await;

            match change.to {
                TaskState::Completed => {
                    self.publish(TaskEvent::new(TaskEventKind::Completed, task))
                        .await
                }
                TaskState::Failed => {
                    self.publish(
                        TaskEvent::new(TaskEventKind::Failed, task).with_error(task.error.clone()),
                    )
                    .await
                }
                _ => {}
            }
        }
    }

    pub async fn publish(&self, event: TaskEvent) {
        if let Err(e) = self.bus.publish(event.to_bus_event()).await {
            tracing::warn!(task_id = %event.task_id, "Failed to publish {}: {}", event.kind.topic(), e);
        }
    }
}

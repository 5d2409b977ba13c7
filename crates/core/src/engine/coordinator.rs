//! # Child Coordination
//!
//! A `spawn kata` phase parks its task in `waiting` behind a child task.
//! When the child reaches a terminal state a child resumption is queued for
//! the parent, which the next poll cycle picks up like any other runnable
//! task. Failed children are re-spawned under the parent phase's retry
//! policy; the parent stays `waiting` throughout.

use chrono::Utc;
use serde_json::{json, Value};

use super::machine::{StateChange, TaskEngine, TaskResult};
use super::retry::RetryDecision;
use crate::error::{EngineError, Result};
use crate::kata::{CompiledKata, Phase, PhaseAction};
use crate::state::{Resumption, ResumptionOutcome, Task, TaskState};

#[derive(Clone)]
pub struct ChildCoordinator {
    engine: TaskEngine,
}

impl ChildCoordinator {
    pub fn new(engine: TaskEngine) -> Self {
        Self { engine }
    }

    /// Spawn the child for the parent's current phase and park the parent.
    ///
    /// Returns the child id so the caller can cancel it if the parent's
    /// write-back is rejected.
    pub async fn spawn_child(
        &self,
        parent: &mut Task,
        kata_name: &str,
        kata_version: u32,
        run_after: Option<chrono::DateTime<Utc>>,
        changes: &mut Vec<StateChange>,
    ) -> Result<String> {
        let child = self
            .engine
            .spawn_child(parent, kata_name, kata_version, run_after)
            .await?;

        parent.waiting_on = Some(child.id.clone());
        if parent.state != TaskState::Waiting {
            self.engine.transition(parent, TaskState::Waiting, changes)?;
        }

        tracing::info!(
            task_id = %parent.id,
            child_id = %child.id,
            phase = %parent.current_phase,
            "Task waiting on child"
        );
        Ok(child.id)
    }

    /// Continue a parent whose child finished.
    ///
    /// Returns the phase result and, when the child was re-spawned, the new
    /// child's id.
    pub async fn resume(
        &self,
        parent: &mut Task,
        kata: &CompiledKata,
        phase: &Phase,
        resumption: &Resumption,
        changes: &mut Vec<StateChange>,
    ) -> Result<(TaskResult, Option<String>)> {
        match resumption.outcome {
            ResumptionOutcome::Completed => {
                self.engine.transition(parent, TaskState::Running, changes)?;
                parent
                    .variables
                    .insert(phase.name.clone(), resumption.payload.clone());
                let next = self.engine.apply_transition(parent, phase, changes)?;

                tracing::info!(task_id = %parent.id, child_id = %resumption.source, "Child completed, parent resumed");
                Ok((
                    TaskResult::success(parent, Some(resumption.payload.clone()), next),
                    None,
                ))
            }
            ResumptionOutcome::Canceled => {
                let error = format!("child task {} was canceled", resumption.source);
                self.engine.fail(parent, error.clone(), changes);
                Ok((TaskResult::failure(parent, error), None))
            }
            ResumptionOutcome::Failed => {
                let reason = resumption
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                let error = format!("child task {} failed: {}", resumption.source, reason);
                self.retry_child(parent, kata, phase, error, changes).await
            }
        }
    }

    async fn retry_child(
        &self,
        parent: &mut Task,
        kata: &CompiledKata,
        phase: &Phase,
        error: String,
        changes: &mut Vec<StateChange>,
    ) -> Result<(TaskResult, Option<String>)> {
        let (child_kata, child_version) = match &phase.action {
            Some(PhaseAction::SpawnKata { kata, version }) => (kata.clone(), *version),
            _ => {
                let diagnostic = format!(
                    "phase '{}' received a child resumption but does not spawn a kata",
                    phase.name
                );
                self.engine.fail(parent, diagnostic.clone(), changes);
                return Ok((TaskResult::failure(parent, diagnostic), None));
            }
        };

        let policy = self.engine.retry_policies().resolve(kata, phase);
        match policy.decide(parent.attempt + 1) {
            RetryDecision::Retry { attempt, delay } => {
                let run_after =
                    Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                parent.attempt = attempt;
                parent.updated_at = Utc::now();

                tracing::warn!(
                    task_id = %parent.id,
                    phase = %phase.name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "{}; spawning a new child",
                    error
                );

                match self
                    .spawn_child(parent, &child_kata, child_version, Some(run_after), changes)
                    .await
                {
                    Ok(child_id) => Ok((TaskResult::failure(parent, error), Some(child_id))),
                    Err(EngineError::KataNotFound(key)) => {
                        let error = format!("{}; kata {} is no longer registered", error, key);
                        self.engine.fail(parent, error.clone(), changes);
                        Ok((TaskResult::failure(parent, error), None))
                    }
                    Err(e) => Err(e),
                }
            }
            RetryDecision::Exhausted { attempts } => {
                tracing::error!(task_id = %parent.id, phase = %phase.name, attempts, "{}", error);
                parent.attempt = attempts;
                self.engine.fail(parent, error.clone(), changes);
                Ok((TaskResult::failure(parent, error), None))
            }
        }
    }

    /// Queue a child resumption for the parent of a task that just finished
    pub fn notify_parent(&self, child: &Task) -> Result<bool> {
        let parent_id = match &child.parent_task_id {
            Some(id) => id,
            None => return Ok(false),
        };
        match self.engine.tasks().load(parent_id)? {
            Some(parent) if parent.state == TaskState::Waiting => {}
            _ => return Ok(false),
        }

        let resumption = match child.state {
            TaskState::Completed => Resumption::child(
                parent_id,
                &child.id,
                ResumptionOutcome::Completed,
                Value::Object(child.variables.clone()),
            ),
            TaskState::Failed => Resumption::child(
                parent_id,
                &child.id,
                ResumptionOutcome::Failed,
                json!({ "error": child.error }),
            ),
            TaskState::Canceled => Resumption::child(
                parent_id,
                &child.id,
                ResumptionOutcome::Canceled,
                Value::Null,
            ),
            _ => return Ok(false),
        };

        self.engine.tasks().enqueue_resumption(&resumption)?;
        tracing::debug!(task_id = %parent_id, child_id = %child.id, outcome = ?resumption.outcome, "Parent notified");
        Ok(true)
    }

    /// Re-queue wake-ups for waiting parents whose child already finished.
    ///
    /// Covers a crash between a child's final write and its parent
    /// notification.
    pub fn sweep_finished_children(&self) -> Result<usize> {
        let tasks = self.engine.tasks();
        let mut requeued = 0;

        for parent in tasks.list_by_state(TaskState::Waiting)? {
            let child_id = match &parent.waiting_on {
                Some(id) => id,
                None => continue,
            };
            if tasks.resumption(&parent.id)?.is_some() {
                continue;
            }

            match tasks.load(child_id)? {
                Some(child) if child.is_terminal() => {
                    if self.notify_parent(&child)? {
                        requeued += 1;
                    }
                }
                Some(_) => {}
                None => {
                    tasks.enqueue_resumption(&Resumption::child(
                        &parent.id,
                        child_id,
                        ResumptionOutcome::Failed,
                        json!({ "error": "child task record is missing" }),
                    ))?;
                    requeued += 1;
                }
            }
        }

        if requeued > 0 {
            tracing::warn!(requeued, "Re-queued missed child resumptions");
        }
        Ok(requeued)
    }
}

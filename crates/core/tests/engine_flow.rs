//! End-to-end task flows: registry, engine and executor against one
//! in-memory database, with scripted skills.

use kata_core::engine::{EventBus, TaskEventKind};
use kata_core::{
    BroadcastEventBus, BusEvent, EngineConfig, EngineError, KataDb, KataRegistry, KataStore,
    SkillRegistry, Task, TaskEngine, TaskExecutor, TaskState,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const FINANCE_AUDIT: &str = r#"
kata finance-audit v1
initial gather

phase gather
  run skill ledger.fetch
  next analyze

phase analyze
  run skill ledger.analyze
  next alert

phase alert
  run skill notify.send
  complete
"#;

struct Harness {
    bus: Arc<BroadcastEventBus>,
    engine: TaskEngine,
    executor: TaskExecutor,
}

fn harness(skills: SkillRegistry, config: EngineConfig, sources: &[&str]) -> Harness {
    let db = KataDb::open_in_memory().unwrap();
    let bus = Arc::new(BroadcastEventBus::new(1024));
    let registry = KataRegistry::new(KataStore::new(&db));
    for source in sources {
        registry.register(source).unwrap();
    }

    let engine = TaskEngine::new(&db, bus.clone(), &config);
    let executor = TaskExecutor::new(engine.clone(), Arc::new(skills), config);
    Harness {
        bus,
        engine,
        executor,
    }
}

fn drain(rx: &mut broadcast::Receiver<BusEvent>) -> Vec<BusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count(events: &[BusEvent], topic: &str, task_id: &str) -> usize {
    events
        .iter()
        .filter(|e| e.topic == topic && e.task_id.as_deref() == Some(task_id))
        .count()
}

async fn run_to_end(h: &Harness, task_id: &str, max_ticks: usize) -> Task {
    for _ in 0..max_ticks {
        let task = h.engine.get(task_id).unwrap();
        if task.is_terminal() {
            return task;
        }
        h.executor.poll_and_execute().await.unwrap();
    }
    h.engine.get(task_id).unwrap()
}

#[tokio::test]
async fn finance_audit_runs_to_completion() {
    let skills = SkillRegistry::new()
        .with_fn("ledger.fetch", |ctx| async move {
            Ok(json!({ "account": ctx.variables["account"].clone(), "entries": 12 }))
        })
        .with_fn("ledger.analyze", |ctx| async move {
            let entries = ctx.variables["gather"]["entries"].as_u64().unwrap_or(0);
            Ok(json!({ "anomalies": entries / 6 }))
        })
        .with_fn("notify.send", |_| async { Ok(json!({ "sent": true })) });
    let h = harness(skills, EngineConfig::default(), &[FINANCE_AUDIT]);
    let mut rx = h.bus.subscribe();

    let mut vars = Map::new();
    vars.insert("account".to_string(), json!("acme"));
    let task = h.engine.spawn("finance-audit", 1, Some(vars)).await.unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.current_phase, "gather");

    let phases: Vec<String> = {
        let mut seen = Vec::new();
        while let Some(result) = h.executor.execute_phase(&task.id).await.unwrap() {
            assert!(result.success);
            seen.push(result.next_phase.unwrap_or_default());
        }
        seen
    };
    assert_eq!(phases, vec!["analyze", "alert", ""]);

    let done = h.engine.get(&task.id).unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.variables["account"], "acme");
    assert_eq!(done.variables["gather"]["entries"], 12);
    assert_eq!(done.variables["analyze"]["anomalies"], 2);
    assert_eq!(done.variables["alert"]["sent"], true);
    let keys: Vec<&str> = done.variables.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["account", "gather", "analyze", "alert"]);

    let events = drain(&mut rx);
    assert_eq!(count(&events, "task.created", &task.id), 1);
    assert_eq!(count(&events, "kata.task_spawned", &task.id), 1);
    assert_eq!(count(&events, "kata.task_executed", &task.id), 3);
    assert_eq!(count(&events, "task.completed", &task.id), 1);
    assert_eq!(count(&events, "task.failed", &task.id), 0);

    let transitions: Vec<(String, String)> = events
        .iter()
        .filter_map(|e| e.task_event())
        .filter(|e| e.kind == TaskEventKind::StateChanged)
        .map(|e| {
            (
                e.previous_state.unwrap().to_string(),
                e.state.unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            ("pending".to_string(), "running".to_string()),
            ("running".to_string(), "running".to_string()),
            ("running".to_string(), "running".to_string()),
            ("running".to_string(), "completed".to_string()),
        ]
    );
}

#[tokio::test]
async fn skill_failure_without_retry_fails_task() {
    let skills = SkillRegistry::new()
        .with_fn("ledger.fetch", |_| async { Err(anyhow::anyhow!("ledger offline")) });
    let h = harness(skills, EngineConfig::default(), &[FINANCE_AUDIT]);
    let mut rx = h.bus.subscribe();

    let task = h.engine.spawn("finance-audit", 1, None).await.unwrap();
    let result = h.executor.execute_phase(&task.id).await.unwrap().unwrap();

    assert!(!result.success);
    assert_eq!(result.state, TaskState::Failed);
    assert!(result.error.as_deref().unwrap().contains("ledger offline"));

    let failed = h.engine.get(&task.id).unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert!(failed.error.as_deref().unwrap().contains("ledger offline"));
    assert_eq!(failed.current_phase, "gather");

    let events = drain(&mut rx);
    assert_eq!(count(&events, "task.failed", &task.id), 1);
    let failed_event = events
        .iter()
        .find(|e| e.topic == "task.failed")
        .and_then(|e| e.task_event())
        .unwrap();
    assert!(failed_event.error.unwrap().contains("ledger offline"));

    // Terminal: further executions are no-ops
    assert!(h.executor.execute_phase(&task.id).await.unwrap().is_none());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn flaky_skill_succeeds_within_retry_budget() {
    let calls = Arc::new(AtomicU32::new(0));
    let skills = {
        let calls = calls.clone();
        SkillRegistry::new().with_fn("flaky", move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(anyhow::anyhow!("attempt {} failed", n))
                } else {
                    Ok(json!({ "attempt": n }))
                }
            }
        })
    };
    let source = "kata flaky v1\ninitial call\nphase call\n run skill flaky\n retry 3 fixed 0ms\n complete\n";
    let h = harness(skills, EngineConfig::default(), &[source]);
    let task = h.engine.spawn("flaky", 1, None).await.unwrap();

    let first = h.executor.execute_phase(&task.id).await.unwrap().unwrap();
    assert!(!first.success);
    assert_eq!(first.state, TaskState::Pending);
    let pending = h.engine.get(&task.id).unwrap();
    assert_eq!(pending.attempt, 1);
    assert!(pending.error.is_none());

    let done = run_to_end(&h, &task.id, 5).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.variables["call"]["attempt"], 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_exhaust_into_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let skills = {
        let calls = calls.clone();
        SkillRegistry::new().with_fn("broken", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("still broken")) }
        })
    };
    let source = "kata broken v1\nretry 2 linear 0ms\ninitial call\nphase call\n run skill broken\n complete\n";
    let h = harness(skills, EngineConfig::default(), &[source]);
    let task = h.engine.spawn("broken", 1, None).await.unwrap();

    let done = run_to_end(&h, &task.id, 5).await;
    assert_eq!(done.state, TaskState::Failed);
    assert_eq!(done.attempt, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn backoff_delay_gates_the_next_attempt() {
    let skills =
        SkillRegistry::new().with_fn("down", |_| async { Err(anyhow::anyhow!("unavailable")) });
    let source = "kata slow v1\ninitial call\nphase call\n run skill down\n retry 3 fixed 1m\n complete\n";
    let h = harness(skills, EngineConfig::default(), &[source]);
    let task = h.engine.spawn("slow", 1, None).await.unwrap();

    h.executor.execute_phase(&task.id).await.unwrap().unwrap();
    let pending = h.engine.get(&task.id).unwrap();
    assert_eq!(pending.state, TaskState::Pending);
    assert!(pending.run_after.unwrap() > chrono::Utc::now());

    // Not runnable until the delay passes
    assert!(h.executor.execute_phase(&task.id).await.unwrap().is_none());
    assert_eq!(h.executor.poll_and_execute().await.unwrap().runnable, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executions_run_a_phase_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let skills = {
        let calls = calls.clone();
        SkillRegistry::new().with_fn("slow", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Value::Null)
            }
        })
    };
    let source = "kata once v1\ninitial a\nphase a\n run skill slow\n complete\n";
    let h = harness(skills, EngineConfig::default(), &[source]);
    let task = h.engine.spawn("once", 1, None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let executor = h.executor.clone();
        let id = task.id.clone();
        handles.push(tokio::spawn(async move { executor.execute_phase(&id).await }));
    }

    let mut executed = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            executed += 1;
        }
    }

    assert_eq!(executed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.get(&task.id).unwrap().state, TaskState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_executors_advance_each_phase_once() {
    const PHASES: usize = 30;
    let mut source = String::from("kata chain v1\ninitial p0\n");
    for i in 0..PHASES {
        source.push_str(&format!("phase p{}\n run skill step\n", i));
        if i + 1 < PHASES {
            source.push_str(&format!(" next p{}\n", i + 1));
        } else {
            source.push_str(" complete\n");
        }
    }

    let invocations: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
    let skills = {
        let invocations = invocations.clone();
        SkillRegistry::new().with_fn("step", move |ctx| {
            *invocations.lock().unwrap().entry(ctx.phase).or_default() += 1;
            async { Ok(json!(true)) }
        })
    };
    let h = harness(skills, EngineConfig::default(), &[source.as_str()]);
    let task = h.engine.spawn("chain", 1, None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..24 {
        let executor = h.executor.clone();
        let engine = h.engine.clone();
        let id = task.id.clone();
        handles.push(tokio::spawn(async move {
            let mut advanced = 0;
            while !engine.get(&id).unwrap().is_terminal() {
                if executor.execute_phase(&id).await.unwrap().is_some() {
                    advanced += 1;
                }
                tokio::task::yield_now().await;
            }
            advanced
        }));
    }

    let mut advanced = 0;
    for handle in handles {
        advanced += handle.await.unwrap();
    }

    let done = h.engine.get(&task.id).unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.attempt, 0);
    assert_eq!(advanced, PHASES);

    let invocations = invocations.lock().unwrap();
    assert_eq!(invocations.len(), PHASES);
    for (phase, count) in invocations.iter() {
        assert_eq!(*count, 1, "phase {} ran {} times", phase, count);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_executors_respect_retry_budget() {
    let calls = Arc::new(AtomicU32::new(0));
    let skills = {
        let calls = calls.clone();
        SkillRegistry::new().with_fn("down", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("still down")) }
        })
    };
    let source = "kata budget v1\ninitial a\nphase a\n run skill down\n retry 4 fixed 0ms\n complete\n";
    let h = harness(skills, EngineConfig::default(), &[source]);
    let task = h.engine.spawn("budget", 1, None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let executor = h.executor.clone();
        let engine = h.engine.clone();
        let id = task.id.clone();
        handles.push(tokio::spawn(async move {
            while !engine.get(&id).unwrap().is_terminal() {
                executor.execute_phase(&id).await.unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(h.engine.get(&task.id).unwrap().state, TaskState::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn bounded_concurrent_dispatch_executes_every_task() {
    let skills = SkillRegistry::new().with_fn("x", |_| async { Ok(json!(1)) });
    let config = EngineConfig {
        max_concurrent_dispatch: 3,
        ..EngineConfig::default()
    };
    let h = harness(
        skills,
        config,
        &["kata k v1\ninitial a\nphase a\n run skill x\n complete\n"],
    );

    let mut ids = Vec::new();
    for _ in 0..7 {
        ids.push(h.engine.spawn("k", 1, None).await.unwrap().id);
    }

    let report = h.executor.poll_and_execute().await.unwrap();
    assert_eq!(report.runnable, 7);
    assert_eq!(report.executed, 7);
    assert!(report.errors.is_empty());
    for id in ids {
        assert_eq!(h.engine.get(&id).unwrap().state, TaskState::Completed);
    }
}

const PARENT: &str = r#"
kata month-end v1
initial delegate

phase delegate
  spawn kata finance-audit v1
  next report

phase report
  run skill report.write
  complete
"#;

#[tokio::test]
async fn parent_waits_for_child_and_merges_its_variables() {
    let skills = SkillRegistry::new()
        .with_fn("ledger.fetch", |_| async { Ok(json!({ "entries": 3 })) })
        .with_fn("ledger.analyze", |_| async { Ok(json!({ "anomalies": 0 })) })
        .with_fn("notify.send", |_| async { Ok(Value::Null) })
        .with_fn("report.write", |ctx| async move {
            Ok(json!({ "entries": ctx.variables["delegate"]["gather"]["entries"].clone() }))
        });
    let h = harness(skills, EngineConfig::default(), &[FINANCE_AUDIT, PARENT]);

    let mut vars = Map::new();
    vars.insert("period".to_string(), json!("2026-09"));
    let parent = h.engine.spawn("month-end", 1, Some(vars)).await.unwrap();

    h.executor.execute_phase(&parent.id).await.unwrap().unwrap();
    let waiting = h.engine.get(&parent.id).unwrap();
    assert_eq!(waiting.state, TaskState::Waiting);

    let children = h.engine.tasks().list_children(&parent.id).unwrap();
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(waiting.waiting_on.as_deref(), Some(child.id.as_str()));
    assert_eq!(child.parent_task_id.as_deref(), Some(parent.id.as_str()));
    assert_eq!(child.variables["period"], "2026-09");

    // Waiting parents are not picked up while the child is still running
    assert!(h.executor.execute_phase(&parent.id).await.unwrap().is_none());

    let done = run_to_end(&h, &parent.id, 10).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(h.engine.get(&child.id).unwrap().state, TaskState::Completed);
    assert_eq!(done.variables["delegate"]["gather"]["entries"], 3);
    assert_eq!(done.variables["report"]["entries"], 3);
}

#[tokio::test]
async fn failed_child_fails_parent_without_retry() {
    let skills = SkillRegistry::new()
        .with_fn("ledger.fetch", |_| async { Err(anyhow::anyhow!("no ledger")) })
        .with_fn("report.write", |_| async { Ok(Value::Null) });
    let h = harness(skills, EngineConfig::default(), &[FINANCE_AUDIT, PARENT]);
    let parent = h.engine.spawn("month-end", 1, None).await.unwrap();

    let done = run_to_end(&h, &parent.id, 10).await;
    assert_eq!(done.state, TaskState::Failed);
    let error = done.error.unwrap();
    assert!(error.contains("no ledger"), "unexpected error: {}", error);
    assert_eq!(h.engine.tasks().list_children(&parent.id).unwrap().len(), 1);
}

#[tokio::test]
async fn failed_child_is_respawned_under_retry_policy() {
    let calls = Arc::new(AtomicU32::new(0));
    let skills = {
        let calls = calls.clone();
        SkillRegistry::new().with_fn("work", move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Err(anyhow::anyhow!("first child fails"))
                } else {
                    Ok(json!(n))
                }
            }
        })
    };
    let child = "kata job v1\ninitial work\nphase work\n run skill work\n complete\n";
    let parent = "kata batch v1\ninitial run\nphase run\n spawn kata job v1\n retry 2 fixed 0ms\n complete\n";
    let h = harness(skills, EngineConfig::default(), &[child, parent]);
    let task = h.engine.spawn("batch", 1, None).await.unwrap();

    let done = run_to_end(&h, &task.id, 12).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.variables["run"]["work"], 2);

    let children = h.engine.tasks().list_children(&task.id).unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].state, TaskState::Failed);
    assert_eq!(children[1].state, TaskState::Completed);
}

#[tokio::test]
async fn canceled_child_fails_parent() {
    let skills = SkillRegistry::new().with_fn("report.write", |_| async { Ok(Value::Null) });
    let h = harness(skills, EngineConfig::default(), &[FINANCE_AUDIT, PARENT]);
    let parent = h.engine.spawn("month-end", 1, None).await.unwrap();
    h.executor.execute_phase(&parent.id).await.unwrap().unwrap();

    let child = h.engine.tasks().list_children(&parent.id).unwrap().remove(0);
    h.engine.cancel(&child.id).await.unwrap();

    let done = run_to_end(&h, &parent.id, 4).await;
    assert_eq!(done.state, TaskState::Failed);
    assert!(done.error.unwrap().contains("canceled"));
}

const APPROVAL: &str = r#"
kata payout v1
initial approve

phase approve
  await event payout.approved
  next pay

phase pay
  run skill bank.transfer
  complete
"#;

#[tokio::test]
async fn event_wait_resumes_on_delivery() {
    let skills = SkillRegistry::new().with_fn("bank.transfer", |ctx| async move {
        Ok(json!({ "approved_by": ctx.variables["approve"]["by"].clone() }))
    });
    let h = harness(skills, EngineConfig::default(), &[APPROVAL]);
    let task = h.engine.spawn("payout", 1, None).await.unwrap();
    let bystander = h.engine.spawn("payout", 1, None).await.unwrap();

    h.executor.poll_and_execute().await.unwrap();
    for id in [&task.id, &bystander.id] {
        let waiting = h.engine.get(id).unwrap();
        assert_eq!(waiting.state, TaskState::WaitingForEvent);
        assert_eq!(waiting.waiting_on.as_deref(), Some("payout.approved"));
    }
    assert_eq!(h.executor.poll_and_execute().await.unwrap().runnable, 0);

    // Targeted delivery wakes only the named task
    let event = BusEvent::external("payout.approved", json!({ "by": "cfo" })).for_task(task.id.clone());
    assert_eq!(h.executor.deliver_event(&event).unwrap(), vec![task.id.clone()]);

    let done = run_to_end(&h, &task.id, 4).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.variables["approve"]["by"], "cfo");
    assert_eq!(done.variables["pay"]["approved_by"], "cfo");
    assert_eq!(
        h.engine.get(&bystander.id).unwrap().state,
        TaskState::WaitingForEvent
    );
}

#[tokio::test]
async fn bus_listener_wakes_waiting_tasks() {
    let skills = SkillRegistry::new().with_fn("bank.transfer", |_| async { Ok(Value::Null) });
    let h = harness(skills, EngineConfig::default(), &[APPROVAL]);
    let task = h.engine.spawn("payout", 1, None).await.unwrap();
    h.executor.execute_phase(&task.id).await.unwrap().unwrap();

    let mut rx = h.bus.subscribe();
    let listener = h.executor.listen_for_events(h.bus.clone());
    h.bus
        .publish(BusEvent::external("payout.approved", json!({ "by": "ops" })))
        .await
        .unwrap();

    let resumed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.topic == "kata.task_executed" && event.task_id.as_deref() == Some(task.id.as_str()) {
                break;
            }
        }
    })
    .await;
    listener.abort();

    assert!(resumed.is_ok(), "task was not resumed by the bus event");
    let task = h.engine.get(&task.id).unwrap();
    assert_eq!(task.current_phase, "pay");
    assert_eq!(task.variables["approve"]["by"], "ops");
}

#[tokio::test]
async fn cancel_is_terminal_and_final() {
    let skills = SkillRegistry::new().with_fn("ledger.fetch", |_| async { Ok(Value::Null) });
    let h = harness(skills, EngineConfig::default(), &[FINANCE_AUDIT, APPROVAL]);
    let mut rx = h.bus.subscribe();

    let pending = h.engine.spawn("finance-audit", 1, None).await.unwrap();
    let canceled = h.engine.cancel(&pending.id).await.unwrap();
    assert_eq!(canceled.state, TaskState::Canceled);
    assert!(h.executor.execute_phase(&pending.id).await.unwrap().is_none());
    assert_eq!(h.engine.get(&pending.id).unwrap().state, TaskState::Canceled);

    // Also from waiting_for_event, and a late event does nothing
    let waiting = h.engine.spawn("payout", 1, None).await.unwrap();
    h.executor.execute_phase(&waiting.id).await.unwrap().unwrap();
    h.engine.cancel(&waiting.id).await.unwrap();
    assert!(h
        .executor
        .deliver_event(&BusEvent::external("payout.approved", Value::Null))
        .unwrap()
        .is_empty());

    for id in [&pending.id, &waiting.id] {
        assert!(matches!(
            h.engine.cancel(id).await.unwrap_err(),
            EngineError::TaskTerminal { .. }
        ));
    }

    let events = drain(&mut rx);
    assert_eq!(count(&events, "task.failed", &pending.id), 0);
    assert_eq!(count(&events, "task.completed", &pending.id), 0);
}

#[tokio::test]
async fn spawns_are_independent() {
    let h = harness(SkillRegistry::new(), EngineConfig::default(), &[FINANCE_AUDIT]);
    let a = h.engine.spawn("finance-audit", 1, None).await.unwrap();
    let b = h.engine.spawn("finance-audit", 1, None).await.unwrap();
    assert_ne!(a.id, b.id);

    let mut vars = Map::new();
    vars.insert("note".to_string(), json!("only a"));
    h.engine.update_variables(&a.id, vars).await.unwrap();
    assert!(h.engine.get(&b.id).unwrap().variables.is_empty());

    assert!(matches!(
        h.engine.spawn("finance-audit", 2, None).await.unwrap_err(),
        EngineError::KataNotFound(_)
    ));
}

//! End-to-end tests for `Engine::process_event`.
//!
//! Each test registers a small set of event definitions, feeds a webhook
//! payload through the engine and checks the aggregated invocation result.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use changeflow_engine::core::{
    InvocationResult, JobExecutionResult, Operation, TimeoutSettings, TrackingToken,
};
use changeflow_engine::{
    detector_fn, handler_fn, job_fn, Engine, HookContext, HookError, JobContext, JobDescriptor,
    JobError, Plugin, ProcessOptions, TimeoutConfig,
};

fn order_update(from: &str, to: &str) -> Value {
    json!({
        "event": {
            "op": "UPDATE",
            "data": {
                "old": {"id": 7, "status": from, "total": 120},
                "new": {"id": 7, "status": to, "total": 120}
            },
            "session_variables": {"x-hasura-role": "customer", "x-hasura-user-id": "u-1"}
        },
        "table": {"schema": "public", "name": "orders"},
        "trigger": {"name": "orders_all"},
        "id": "8f7e0c1a-delivery",
        "created_at": "2024-05-01T10:00:00.123456"
    })
}

fn user_insert() -> Value {
    json!({
        "event": {"op": "INSERT", "data": {"old": null, "new": {"id": 1, "email": "a@b.c"}}},
        "table": {"schema": "public", "name": "users"},
        "id": "delivery-2",
        "created_at": "2024-05-01T10:00:00Z"
    })
}

fn echo(name: &str) -> JobDescriptor {
    let label = name.to_string();
    JobDescriptor::new(job_fn(move |ctx: JobContext| {
        let label = label.clone();
        async move {
            ctx.log.info(format!("{label} done"));
            Ok::<_, JobError>(json!({"job": label, "correlation_id": ctx.correlation_id.as_str()}))
        }
    }))
    .named(name)
}

/// Registers the definitions most tests share.
fn shop_engine() -> Engine {
    let mut engine = Engine::builder().build();
    engine
        .register(
            "orders.cancelled",
            detector_fn(|_, event, _| {
                Ok(event.is_table("public", "orders")
                    && event.operation == Operation::Update
                    && event.column_changed("status")
                    && event.new_value("status") == Some(&json!("cancelled")))
            }),
            handler_fn(|_, _, _| {
                Ok(vec![echo("refund_payment"), echo("restock_items"), echo("notify_customer")])
            }),
        )
        .unwrap();
    engine
        .register(
            "orders.shipped",
            detector_fn(|_, event, _| Ok(event.new_value("status") == Some(&json!("shipped")))),
            handler_fn(|_, _, _| Ok(vec![echo("send_tracking_email")])),
        )
        .unwrap();
    engine
        .register(
            "users.updated",
            detector_fn(|_, event, _| {
                Ok(event.is_table("public", "users") && event.operation == Operation::Update)
            }),
            handler_fn(|_, _, _| Ok(vec![echo("sync_crm")])),
        )
        .unwrap();
    engine
}

#[tokio::test]
async fn cancelled_order_runs_three_jobs() {
    let engine = shop_engine();

    let result = engine
        .process_event(&order_update("pending", "cancelled"), ProcessOptions::new())
        .await
        .unwrap();

    assert!(!result.correlation_id.as_str().is_empty());
    assert_eq!(result.source_id, "8f7e0c1a-delivery");
    assert_eq!(result.detected_events(), vec!["orders.cancelled"]);
    assert_eq!(result.events.len(), 3);
    assert!(!result.timed_out);

    let cancelled = result.event("orders.cancelled").unwrap();
    let names: Vec<&str> = cancelled.jobs.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(names, vec!["refund_payment", "restock_items", "notify_customer"]);
    assert!(cancelled.jobs.iter().all(|j| j.completed && !j.aborted && j.attempts == 1));
    assert!(cancelled.jobs.iter().all(|j| j.logs.len() == 1));
}

#[tokio::test]
async fn insert_does_not_match_update_only_detector() {
    let engine = shop_engine();

    let result = engine.process_event(&user_insert(), ProcessOptions::new()).await.unwrap();

    assert!(result.detected_events().is_empty());
    assert_eq!(result.jobs().count(), 0);
    assert!(result.detected_events().len() <= engine.registry().len());
}

#[tokio::test]
async fn correlation_id_is_shared_by_every_job() {
    let engine = shop_engine();

    let result = engine
        .process_event(
            &order_update("pending", "cancelled"),
            ProcessOptions::new().correlation_id("checkout-req-91"),
        )
        .await
        .unwrap();

    assert_eq!(result.correlation_id.as_str(), "checkout-req-91");
    for job in result.jobs() {
        assert_eq!(job.correlation_id, result.correlation_id);
        assert_eq!(job.result.as_ref().unwrap()["correlation_id"], "checkout-req-91");
        assert!(job.logs.iter().all(|l| l.correlation_id == result.correlation_id));
    }
}

#[tokio::test]
async fn malformed_correlation_id_is_replaced() {
    let engine = shop_engine();

    let result = engine
        .process_event(
            &order_update("pending", "cancelled"),
            ProcessOptions::new().correlation_id("has spaces|and pipes"),
        )
        .await
        .unwrap();

    assert_ne!(result.correlation_id.as_str(), "has spaces|and pipes");
    assert!(!result.correlation_id.as_str().is_empty());
}

#[tokio::test]
async fn one_failing_job_of_five() {
    let mut engine = Engine::builder().build();
    engine
        .register(
            "orders.cancelled",
            detector_fn(|_, _, _| Ok(true)),
            handler_fn(|_, _, _| {
                let failing = JobDescriptor::new(job_fn(|_ctx| async {
                    Err::<Value, _>(JobError::Failed("payment gateway returned 502".to_string()))
                }))
                .named("refund_payment");
                Ok(vec![echo("a"), echo("b"), failing, echo("c"), echo("d")])
            }),
        )
        .unwrap();

    let result = engine
        .process_event(&order_update("pending", "cancelled"), ProcessOptions::new())
        .await
        .unwrap();

    let jobs: Vec<&JobExecutionResult> = result.jobs().collect();
    assert_eq!(jobs.len(), 5);
    assert_eq!(jobs.iter().filter(|j| j.completed).count(), 4);
    assert_eq!(result.failed_job_count(), 1);
    assert_eq!(jobs[2].error.as_deref(), Some("payment gateway returned 502"));
}

#[tokio::test(start_paused = true)]
async fn slow_first_job_is_still_reported_first() {
    let mut engine = Engine::builder().build();
    engine
        .register(
            "orders.cancelled",
            detector_fn(|_, _, _| Ok(true)),
            handler_fn(|_, _, _| {
                let slow = JobDescriptor::new(job_fn(|_ctx| async {
                    tokio::time::sleep(Duration::from_millis(800)).await;
                    Ok::<_, JobError>(json!("slow"))
                }))
                .named("slow");
                Ok(vec![slow, echo("fast")])
            }),
        )
        .unwrap();

    let result = engine
        .process_event(&order_update("pending", "cancelled"), ProcessOptions::new())
        .await
        .unwrap();

    let names: Vec<&str> = result.jobs().map(|j| j.name.as_str()).collect();
    assert_eq!(names, vec!["slow", "fast"]);
    assert!(result.jobs().all(|j| j.completed));
    assert!(result.jobs().next().unwrap().ended_at >= result.jobs().nth(1).unwrap().ended_at);
}

#[tokio::test]
async fn exhausted_host_runtime_starts_no_jobs() {
    let engine = shop_engine();
    let timeout = TimeoutConfig::new(TimeoutSettings {
        safety_margin_ms: 2_000,
        ..TimeoutSettings::default()
    })
    .with_remaining_time(|| 1_500);

    let result = engine
        .process_event(&order_update("pending", "cancelled"), ProcessOptions::new().timeout(timeout))
        .await
        .unwrap();

    assert!(result.timed_out);
    assert_eq!(result.started_job_count(), 0);
    assert!(result.events.is_empty());
    assert_eq!(
        result.skipped_events,
        vec!["orders.cancelled", "orders.shipped", "users.updated"]
    );
}

#[tokio::test]
async fn exhausted_host_runtime_times_out_with_nothing_to_evaluate() {
    let timeout = || {
        TimeoutConfig::new(TimeoutSettings {
            safety_margin_ms: 2_000,
            ..TimeoutSettings::default()
        })
        .with_remaining_time(|| 1_500)
    };

    let empty = Engine::builder().build();
    let result = empty
        .process_event(&order_update("pending", "cancelled"), ProcessOptions::new().timeout(timeout()))
        .await
        .unwrap();
    assert!(result.timed_out);
    assert!(result.events.is_empty());

    let filtered = shop_engine()
        .process_event(
            &order_update("pending", "cancelled"),
            ProcessOptions::new().listen_to(["billing.refunded"]).timeout(timeout()),
        )
        .await
        .unwrap();
    assert!(filtered.timed_out);
    assert!(filtered.skipped_events.is_empty());
}

#[tokio::test(start_paused = true)]
async fn host_runtime_drop_cancels_running_jobs() {
    let left = Arc::new(AtomicI64::new(30_000));
    let host = left.clone();
    let mut engine = Engine::builder().build();
    engine
        .register(
            "orders.cancelled",
            detector_fn(|_, _, _| Ok(true)),
            handler_fn(move |_, _, _| {
                let left = left.clone();
                let export = JobDescriptor::new(job_fn(|ctx: JobContext| async move {
                    ctx.cancelled().await;
                    Err::<Value, _>(JobError::Cancelled)
                }))
                .named("export")
                .timeout_ms(20_000);
                let drain = JobDescriptor::new(job_fn(move |_ctx| {
                    let left = left.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        left.store(0, Ordering::SeqCst);
                        Ok::<_, JobError>(Value::Null)
                    }
                }))
                .named("drain");
                Ok(vec![export, drain])
            }),
        )
        .unwrap();
    let timeout = TimeoutConfig::new(TimeoutSettings {
        safety_margin_ms: 1_000,
        max_execution_time_ms: 60_000,
        ..TimeoutSettings::default()
    })
    .with_remaining_time(move || host.load(Ordering::SeqCst));

    let result = engine
        .process_event(&order_update("pending", "cancelled"), ProcessOptions::new().timeout(timeout))
        .await
        .unwrap();

    let jobs: Vec<&JobExecutionResult> = result.jobs().collect();
    assert!(jobs[0].aborted && !jobs[0].completed);
    assert!(jobs[1].completed);
    assert!(result.total_duration_ms < 1_000);
    assert!(result.timed_out);
}

#[tokio::test(start_paused = true)]
async fn global_budget_aborts_long_job() {
    let mut engine = Engine::builder().build();
    engine
        .register(
            "orders.cancelled",
            detector_fn(|_, _, _| Ok(true)),
            handler_fn(|_, _, _| {
                let cooperative = JobDescriptor::new(job_fn(|ctx: JobContext| async move {
                    tokio::select! {
                        _ = ctx.cancelled() => Err(JobError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(json!("done")),
                    }
                }))
                .named("export")
                .timeout_ms(20_000);
                Ok(vec![cooperative, echo("quick")])
            }),
        )
        .unwrap();
    let timeout = TimeoutConfig::new(TimeoutSettings {
        safety_margin_ms: 100,
        max_execution_time_ms: 1_000,
        ..TimeoutSettings::default()
    });

    let result = engine
        .process_event(&order_update("pending", "cancelled"), ProcessOptions::new().timeout(timeout))
        .await
        .unwrap();

    let jobs: Vec<&JobExecutionResult> = result.jobs().collect();
    assert!(jobs[0].aborted && !jobs[0].completed);
    assert!(jobs[1].completed);
    assert!(result.timed_out);
}

#[tokio::test]
async fn listened_events_limit_evaluation() {
    let engine = shop_engine();

    let result = engine
        .process_event(
            &order_update("pending", "shipped"),
            ProcessOptions::new().listen_to(["users.updated", "orders.shipped"]),
        )
        .await
        .unwrap();

    let evaluated: Vec<&str> = result.events.iter().map(|e| e.event_name.as_str()).collect();
    assert_eq!(evaluated, vec!["orders.shipped", "users.updated"]);
    assert_eq!(result.detected_events(), vec!["orders.shipped"]);
}

#[tokio::test]
async fn jobs_continue_lineage_of_source_token() {
    let mut engine = Engine::builder().track_lineage().build();
    engine
        .register(
            "orders.cancelled",
            detector_fn(|_, _, _| Ok(true)),
            handler_fn(|_, _, _| {
                let stamp = || {
                    JobDescriptor::new(job_fn(|ctx: JobContext| async move {
                        Ok::<_, JobError>(json!(ctx.tracking_token().encode()))
                    }))
                };
                Ok(vec![stamp(), stamp()])
            }),
        )
        .unwrap();
    let mut raw = order_update("pending", "cancelled");
    raw["event"]["data"]["new"]["updated_by"] = json!("v1|billing.refund|corr-root|job-0");

    let result = engine.process_event(&raw, ProcessOptions::new()).await.unwrap();

    assert_eq!(result.correlation_id.as_str(), "corr-root");
    let tokens: Vec<TrackingToken> = result
        .jobs()
        .map(|j| TrackingToken::decode(j.result.as_ref().and_then(Value::as_str).unwrap()).unwrap())
        .collect();
    assert_eq!(tokens.len(), 2);
    for token in &tokens {
        assert_eq!(token.source, "billing.refund");
        assert_eq!(token.correlation_id, "corr-root");
        assert_ne!(token.job_execution_id, "job-0");
    }
    assert_ne!(tokens[0].job_execution_id, tokens[1].job_execution_id);
}

/// Records hook calls, tagged with its own name.
struct Observer {
    name: &'static str,
    journal: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Plugin for Observer {
    fn name(&self) -> &str {
        self.name
    }

    async fn on_job_end(
        &self,
        _ctx: &HookContext,
        result: &JobExecutionResult,
    ) -> Result<(), HookError> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:end:{}", self.name, result.name));
        Ok(())
    }

    async fn on_invocation_complete(
        &self,
        ctx: &HookContext,
        result: &InvocationResult,
    ) -> Result<(), HookError> {
        assert_eq!(ctx.correlation_id, result.correlation_id);
        self.journal.lock().unwrap().push(format!("{}:complete", self.name));
        Err(HookError::Failed("observer storage offline".to_string()))
    }
}

#[tokio::test]
async fn engine_plugins_run_before_call_plugins() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut engine = Engine::builder()
        .plugin(Observer {
            name: "engine",
            journal: journal.clone(),
        })
        .build();
    engine
        .register(
            "orders.cancelled",
            detector_fn(|_, _, _| Ok(true)),
            handler_fn(|_, _, _| Ok(vec![echo("only")])),
        )
        .unwrap();

    let result = engine
        .process_event(
            &order_update("pending", "cancelled"),
            ProcessOptions::new().plugin(Observer {
                name: "call",
                journal: journal.clone(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(result.jobs().filter(|j| j.completed).count(), 1);
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["engine:end:only", "call:end:only", "engine:complete", "call:complete"]
    );
}

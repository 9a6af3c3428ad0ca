use std::{
    env,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use pool::{InProcessLauncher, PoolError, PoolEvent, WorkerPool};
use serde_json::{Value, json};
use tokio::time;
use types::{PoolSettings, WorkerRequest, WorkerRequestKind};
use worker::{AgentHandler, HandlerContext, HandlerError};

fn temp_base(label: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after unix epoch")
        .as_nanos();
    env::temp_dir().join(format!(
        "moltbot-pool-{label}-{}-{unique}",
        std::process::id()
    ))
}

fn test_settings(label: &str, worker_count: usize) -> PoolSettings {
    PoolSettings {
        worker_count,
        sandbox_base_dir: temp_base(label),
        request_timeout_ms: 5_000,
        heartbeat_interval_ms: 100,
        restart_delay_ms: 200,
        startup_timeout_ms: 10_000,
        shutdown_grace_ms: 2_000,
        ..PoolSettings::default()
    }
}

fn embedded_pool(label: &str, worker_count: usize) -> WorkerPool {
    WorkerPool::with_launcher(
        test_settings(label, worker_count),
        Arc::new(InProcessLauncher::new()),
    )
}

fn agent_request(user_id: &str, payload: Value) -> WorkerRequest {
    WorkerRequest {
        request_id: String::new(),
        user_id: user_id.to_owned(),
        kind: WorkerRequestKind::AgentMessage { message: payload },
        timeout_ms: None,
    }
}

/// Handler whose `sleep` command stalls for the requested duration, for
/// timeout and drain scenarios.
struct SleepyHandler;

#[async_trait]
impl AgentHandler for SleepyHandler {
    async fn handle_message(
        &self,
        _ctx: &HandlerContext,
        message: Value,
    ) -> Result<Value, HandlerError> {
        Ok(json!({ "echo": message }))
    }

    async fn handle_command(
        &self,
        _ctx: &HandlerContext,
        command: &str,
        args: Value,
    ) -> Result<Value, HandlerError> {
        if command == "sleep" {
            let ms = args["ms"].as_u64().unwrap_or(0);
            time::sleep(Duration::from_millis(ms)).await;
            return Ok(json!({ "slept_ms": ms }));
        }
        Err(HandlerError::new("UNKNOWN_COMMAND", format!("no such command `{command}`")))
    }
}

fn sleepy_pool(label: &str, worker_count: usize) -> WorkerPool {
    WorkerPool::with_launcher(
        test_settings(label, worker_count),
        Arc::new(InProcessLauncher::with_handler_factory(|| {
            Arc::new(SleepyHandler)
        })),
    )
}

async fn wait_for_healthy(pool: &WorkerPool, expected: usize) {
    let deadline = time::Instant::now() + Duration::from_secs(10);
    loop {
        if pool.status().await.healthy_workers >= expected {
            return;
        }
        assert!(
            time::Instant::now() < deadline,
            "pool never reached {expected} healthy workers"
        );
        time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn requests_before_start_are_rejected() {
    let pool = embedded_pool("not-started", 2);
    let error = pool
        .send_request(agent_request("user-a", json!(1)))
        .await
        .expect_err("dispatch should fail before start");
    assert!(matches!(error, PoolError::PoolNotStarted));
}

#[tokio::test]
async fn sticky_assignments_hold_across_repeated_requests() {
    let pool = embedded_pool("sticky", 3);
    pool.start().await.expect("pool should start");

    let mut assigned = Vec::new();
    for user in ["user-a", "user-b", "user-c"] {
        let dispatched = pool
            .send_request(agent_request(user, json!({ "hello": user })))
            .await
            .expect("request should succeed");
        assert!(dispatched.response.success);
        assigned.push((user, dispatched.worker_id));
    }

    for _ in 0..10 {
        for (user, worker_id) in &assigned {
            let dispatched = pool
                .send_request(agent_request(user, json!("again")))
                .await
                .expect("request should succeed");
            assert_eq!(&dispatched.worker_id, worker_id, "{user} moved workers");
        }
    }

    pool.stop(None).await.expect("pool should stop");
}

#[tokio::test]
async fn status_counts_workers_and_routing_entries() {
    let pool = embedded_pool("status", 2);
    pool.start().await.expect("pool should start");

    let status = pool.status().await;
    assert_eq!(status.total_workers, 2);
    assert_eq!(status.healthy_workers, 2);
    assert_eq!(status.workers.len(), 2);
    assert_eq!(status.routing_table_size, 0);

    pool.send_request(agent_request("user-a", json!(1)))
        .await
        .expect("request should succeed");
    let status = pool.status().await;
    assert_eq!(status.routing_table_size, 1);
    assert_eq!(status.queued_requests, 0);

    pool.stop(None).await.expect("pool should stop");
}

#[tokio::test]
async fn a_killed_worker_restarts_and_keeps_its_users() {
    let pool = embedded_pool("crash-survival", 2);
    pool.start().await.expect("pool should start");
    let mut events = pool.subscribe();

    let first = pool
        .send_request(agent_request("user-x", json!("hi")))
        .await
        .expect("request should succeed");
    let home_worker = first.worker_id.clone();

    pool.kill_worker(&home_worker)
        .await
        .expect("kill should succeed");

    // Exit handling emits a restart notice before the respawn fires.
    let deadline = time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        let event = time::timeout(remaining, events.recv())
            .await
            .expect("restart event should arrive")
            .expect("event stream should stay open");
        if matches!(&event, PoolEvent::WorkerRestart { worker_id, .. } if worker_id == &home_worker)
        {
            break;
        }
    }

    wait_for_healthy(&pool, 2).await;

    let second = pool
        .send_request(agent_request("user-x", json!("back?")))
        .await
        .expect("request should succeed after restart");
    assert_eq!(second.worker_id, home_worker, "sticky slot should survive the crash");

    pool.stop(None).await.expect("pool should stop");
}

#[tokio::test]
async fn a_timed_out_request_leaves_the_worker_usable() {
    let pool = sleepy_pool("timeout", 1);
    pool.start().await.expect("pool should start");

    let mut slow = agent_request("user-t", Value::Null);
    slow.kind = WorkerRequestKind::AgentCommand {
        command: "sleep".to_owned(),
        args: json!({ "ms": 1_000 }),
    };
    slow.timeout_ms = Some(100);

    let error = pool
        .send_request(slow)
        .await
        .expect_err("the slow request should time out");
    assert!(matches!(error, PoolError::RequestTimeout { .. }));

    // Give the stalled handler time to finish; its late response is dropped.
    time::sleep(Duration::from_millis(1_200)).await;

    let after = pool
        .send_request(agent_request("user-t", json!("quick")))
        .await
        .expect("the worker should still serve requests");
    assert!(after.response.success);

    pool.stop(None).await.expect("pool should stop");
}

#[tokio::test]
async fn users_are_repinned_when_their_worker_is_down() {
    let mut settings = test_settings("force-reassign", 2);
    // Keep the dead slot down for the whole test.
    settings.restart_delay_ms = 60_000;
    let pool = WorkerPool::with_launcher(settings, Arc::new(InProcessLauncher::new()));
    pool.start().await.expect("pool should start");

    let first = pool
        .send_request(agent_request("user-y", json!(1)))
        .await
        .expect("request should succeed");
    let original_worker = first.worker_id.clone();

    pool.kill_worker(&original_worker)
        .await
        .expect("kill should succeed");
    time::sleep(Duration::from_millis(300)).await;

    let rerouted = pool
        .send_request(agent_request("user-y", json!(2)))
        .await
        .expect("request should be rerouted to the surviving worker");
    assert_ne!(rerouted.worker_id, original_worker);

    // The forced assignment is sticky: subsequent requests stay put.
    let again = pool
        .send_request(agent_request("user-y", json!(3)))
        .await
        .expect("request should succeed");
    assert_eq!(again.worker_id, rerouted.worker_id);
    assert_eq!(
        pool.worker_for_user("user-y").await.as_deref(),
        Some(rerouted.worker_id.as_str())
    );

    pool.stop(None).await.expect("pool should stop");
}

#[tokio::test]
async fn stop_waits_for_in_flight_requests_within_the_grace_period() {
    let pool = sleepy_pool("drain-ok", 1);
    pool.start().await.expect("pool should start");

    let mut slow = agent_request("user-d", Value::Null);
    slow.kind = WorkerRequestKind::AgentCommand {
        command: "sleep".to_owned(),
        args: json!({ "ms": 500 }),
    };
    let in_flight = tokio::spawn({
        let pool = pool.clone();
        async move { pool.send_request(slow).await }
    });

    time::sleep(Duration::from_millis(100)).await;
    pool.stop(Some(2_000)).await.expect("stop should succeed");

    let dispatched = in_flight
        .await
        .expect("request task should join")
        .expect("the in-flight request should finish inside the grace period");
    assert!(dispatched.response.success);
}

#[tokio::test]
async fn stop_fails_stragglers_shortly_after_the_grace_period() {
    let pool = sleepy_pool("drain-cutoff", 1);
    pool.start().await.expect("pool should start");

    let mut stuck = agent_request("user-s", Value::Null);
    stuck.kind = WorkerRequestKind::AgentCommand {
        command: "sleep".to_owned(),
        args: json!({ "ms": 10_000 }),
    };
    let in_flight = tokio::spawn({
        let pool = pool.clone();
        async move { pool.send_request(stuck).await }
    });

    time::sleep(Duration::from_millis(100)).await;
    let stop_started = time::Instant::now();
    pool.stop(Some(200)).await.expect("stop should succeed");
    assert!(stop_started.elapsed() < Duration::from_secs(3));

    let error = in_flight
        .await
        .expect("request task should join")
        .expect_err("the straggler should receive a shutdown failure");
    match error {
        PoolError::RequestFailed { error_code, .. } => {
            assert_eq!(error_code.as_deref(), Some("WORKER_SHUTDOWN"));
        }
        PoolError::WorkerExited { .. } => {
            // Also acceptable: the worker went down before the synthesized
            // failure response reached the supervisor.
        }
        other => panic!("unexpected dispatch error: {other}"),
    }
}

#[tokio::test]
async fn pool_ready_event_is_broadcast_on_start() {
    let pool = embedded_pool("events", 2);
    let mut events = pool.subscribe();
    pool.start().await.expect("pool should start");

    let deadline = time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        let event = time::timeout(remaining, events.recv())
            .await
            .expect("pool:ready should arrive")
            .expect("event stream should stay open");
        if matches!(event, PoolEvent::PoolReady) {
            break;
        }
    }

    pool.stop(None).await.expect("pool should stop");
}

//! End-to-end tests against real `warmpool-worker` processes

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use warmpool_pool::{
    ErrorKind, ExecutionRequest, PoolConfig, PoolError, PoolLifecycle, PoolManager, RetryPolicy,
    SandboxPolicyConfig, WorkerHandle, WorkerState,
};
use warmpool_worker::SandboxRules;

fn config(dir: &TempDir) -> PoolConfig {
    PoolConfig::default()
        .with_worker_program(env!("CARGO_BIN_EXE_warmpool-worker"))
        .with_socket_dir(dir.path())
        .with_health_check_interval(Duration::from_millis(200))
        .with_shutdown_grace_period(Duration::from_secs(5))
        .with_retry_backoff(RetryPolicy::fixed(Duration::from_millis(20)))
}

async fn started(config: PoolConfig, size: usize) -> PoolManager {
    let pool = PoolManager::new(config);
    pool.start(size).await.unwrap();
    pool
}

fn sigkill(worker: &WorkerHandle) {
    let pid = worker.pid().unwrap();
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Wait until some worker reports an in-flight request
async fn busy_worker(pool: &PoolManager) -> Arc<WorkerHandle> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(worker) = pool.workers().into_iter().find(|w| w.in_flight() > 0) {
            return worker;
        }
        assert!(Instant::now() < deadline, "no worker picked up the request");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn sleep_request(seconds: f64) -> ExecutionRequest {
    ExecutionRequest::new("testing.sleep")
        .with_arg("seconds", seconds)
        .with_deadline(Duration::from_secs(10))
}

#[tokio::test]
async fn test_start_reaches_ready() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir), 2).await;

    assert_eq!(pool.lifecycle(), PoolLifecycle::Running);
    assert_eq!(pool.ready_count(), 2);
    let status = pool.status();
    assert!(status.workers.iter().all(|w| w.pid.is_some()));
    assert!(status.workers.iter().all(|w| w.last_heartbeat.is_some()));

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_add_100() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir), 1).await;

    let request = ExecutionRequest::new("testing.add_100")
        .with_arg("num", 5)
        .with_deadline(Duration::from_secs(5));
    let request_id = request.request_id;
    let result = pool.submit(request).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.request_id, request_id);
    assert_eq!(result.payload, Some(json!(105)));

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_unknown_action_is_a_result() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir), 1).await;

    let result = pool
        .submit(ExecutionRequest::new("testing.unknown_action"))
        .await
        .unwrap();
    assert_eq!(result.error_kind(), Some(ErrorKind::ActionExecutionError));

    // The worker that answered is still healthy
    assert_eq!(pool.ready_count(), 1);
    assert_eq!(pool.status().crashes, 0);

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_pair_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir), 3).await;

    let submissions = (0..50).map(|i| {
        let pool = pool.clone();
        async move {
            let request = ExecutionRequest::new("testing.echo").with_arg("i", i);
            let request_id = request.request_id;
            let result = pool.submit(request).await.unwrap();
            (i, request_id, result)
        }
    });
    let results = futures::future::join_all(submissions).await;

    for (i, request_id, result) in results {
        assert_eq!(result.request_id, request_id);
        assert_eq!(result.payload, Some(json!({"i": i})));
    }

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_crash_mid_request_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir), 2).await;

    let submitting = pool.clone();
    let task = tokio::spawn(async move { submitting.submit(sleep_request(0.5)).await });

    let victim = busy_worker(&pool).await;
    sigkill(&victim);

    let result = task.await.unwrap().unwrap();
    assert!(result.is_success());

    // The crashed worker is replaced
    let deadline = Instant::now() + Duration::from_secs(10);
    while pool.ready_count() < 2 || pool.status().crashes == 0 {
        assert!(Instant::now() < deadline, "crashed worker was not replaced");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(pool.workers().iter().all(|w| w.id() != victim.id()));
    assert_eq!(victim.state(), WorkerState::Terminated);

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_crash_without_retries_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir).with_max_retries(0), 1).await;

    let submitting = pool.clone();
    let task = tokio::spawn(async move { submitting.submit(sleep_request(1.0)).await });

    let victim = busy_worker(&pool).await;
    sigkill(&victim);

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::WorkerUnavailable { attempts: 1, .. }));
    assert_eq!(err.kind(), Some(ErrorKind::WorkerUnavailable));

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_deadline_exhausts_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir).with_max_retries(1), 2).await;

    let request = ExecutionRequest::new("testing.sleep")
        .with_arg("seconds", 5.0)
        .with_deadline(Duration::from_millis(200));
    let err = pool.submit(request).await.unwrap_err();
    assert!(matches!(err, PoolError::WorkerUnavailable { attempts: 2, .. }));

    // A timeout says nothing about the worker's health
    assert_eq!(pool.status().crashes, 0);

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_late_timeout_from_first_attempt_does_not_end_retry() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(
        config(&dir)
            .with_max_retries(1)
            .with_retry_backoff(RetryPolicy::immediate()),
        1,
    )
    .await;

    // Both attempts land on the one worker; the first attempt's own
    // TimeoutError arrives while the second is still running
    let request = ExecutionRequest::new("testing.sleep")
        .with_arg("seconds", 5.0)
        .with_deadline(Duration::from_millis(300));
    let begun = Instant::now();
    let err = pool.submit(request).await.unwrap_err();
    let elapsed = begun.elapsed();

    assert!(
        matches!(err, PoolError::WorkerUnavailable { attempts: 2, .. }),
        "{:?}",
        err
    );
    assert!(elapsed >= Duration::from_millis(600), "retry ended after {:?}", elapsed);

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_unresponsive_worker_killed_after_missed_health_checks() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(
        config(&dir)
            .with_health_check_interval(Duration::from_millis(100))
            .with_health_check_timeout(Duration::from_millis(100))
            .with_max_missed_health_checks(2)
            .with_max_retries(0),
        1,
    )
    .await;

    // The worker's single-threaded loop cannot answer pings while spinning
    let submitting = pool.clone();
    let task = tokio::spawn(async move {
        submitting
            .submit(
                ExecutionRequest::new("testing.spin")
                    .with_arg("millis", 5_000)
                    .with_deadline(Duration::from_secs(30)),
            )
            .await
    });
    let victim = busy_worker(&pool).await;
    let spinning = Instant::now();

    while victim.state() != WorkerState::Terminated {
        assert!(
            spinning.elapsed() < Duration::from_secs(2),
            "spinning worker was never declared unresponsive"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(pool.status().crashes, 1);

    let err = task.await.unwrap().unwrap_err();
    assert!(
        matches!(err, PoolError::WorkerUnavailable { attempts: 1, .. }),
        "{:?}",
        err
    );
    assert!(spinning.elapsed() < Duration::from_secs(5));

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_while_starting_wins() {
    let dir = tempfile::tempdir().unwrap();
    let pool = PoolManager::new(config(&dir));

    let starting = pool.clone();
    let start = tokio::spawn(async move { starting.start(3).await });
    while pool.lifecycle() == PoolLifecycle::Stopped {
        tokio::task::yield_now().await;
    }
    assert_eq!(pool.lifecycle(), PoolLifecycle::Starting);

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
    let err = start.await.unwrap().unwrap_err();
    assert!(
        matches!(err, PoolError::ShuttingDown | PoolError::PoolInitialization(_)),
        "{:?}",
        err
    );

    assert_eq!(pool.lifecycle(), PoolLifecycle::Stopped);
    assert!(pool.workers().is_empty());

    // No health loop was left behind to bring workers back
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(pool.lifecycle(), PoolLifecycle::Stopped);
    assert!(pool.workers().is_empty());
}

#[tokio::test]
async fn test_test_mode_has_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("written.txt");
    let pool = started(config(&dir).with_test_mode(true), 1).await;

    let result = pool
        .submit(ExecutionRequest::new("testing.write_file").with_args(json!({
            "path": target.to_string_lossy(),
            "content": "hello",
        })))
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.payload, Some(json!({"test_mode": true})));
    assert!(!target.exists());

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

async fn write_via(pool: &PoolManager, path: &Path) -> Option<ErrorKind> {
    let result = pool
        .submit(ExecutionRequest::new("testing.write_file").with_args(json!({
            "path": path.to_string_lossy(),
            "content": "x",
        })))
        .await
        .unwrap();
    result.error_kind()
}

#[tokio::test]
async fn test_sandbox_differs_from_unrestricted() {
    let dir = tempfile::tempdir().unwrap();
    let allowed = dir.path().join("allowed");
    std::fs::create_dir(&allowed).unwrap();

    let sandboxed = started(
        config(&dir).with_sandbox(SandboxPolicyConfig::sandboxed(
            SandboxRules::new().allow_path(&allowed),
        )),
        1,
    )
    .await;
    let outside = dir.path().join("outside.txt");
    assert_eq!(
        write_via(&sandboxed, &outside).await,
        Some(ErrorKind::SandboxViolation)
    );
    assert!(!outside.exists());
    assert_eq!(write_via(&sandboxed, &allowed.join("inside.txt")).await, None);
    sandboxed.shutdown(Duration::from_secs(5)).await.unwrap();

    let unrestricted = started(config(&dir), 1).await;
    assert_eq!(write_via(&unrestricted, &outside).await, None);
    assert!(outside.exists());
    unrestricted.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_sandbox_denies_egress_outside_allowlist() {
    let dir = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let pool = started(
        config(&dir).with_sandbox(SandboxPolicyConfig::sandboxed(
            SandboxRules::new().allow_host(format!("127.0.0.1:{}", port)),
        )),
        1,
    )
    .await;

    let fetch = |port: u16| {
        ExecutionRequest::new("testing.fetch")
            .with_args(json!({ "host": "127.0.0.1", "port": port }))
            .with_deadline(Duration::from_secs(5))
    };

    let allowed = pool.submit(fetch(port)).await.unwrap();
    assert!(allowed.is_success(), "{:?}", allowed.error);

    let denied = pool.submit(fetch(port.wrapping_add(1))).await.unwrap();
    assert_eq!(denied.error_kind(), Some(ErrorKind::SandboxViolation));
    let detail = denied.error.and_then(|e| e.detail).unwrap();
    assert_eq!(detail["rule"], json!("egress"));

    // A violation is the action's outcome, not a worker fault
    assert_eq!(pool.status().crashes, 0);

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_sandbox_memory_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(
        config(&dir).with_sandbox(SandboxPolicyConfig::sandboxed(
            SandboxRules::new().with_memory_bytes(Some(1)),
        )),
        1,
    )
    .await;

    let result = pool
        .submit(ExecutionRequest::new("testing.echo").with_arg("x", 1))
        .await
        .unwrap();
    assert_eq!(result.error_kind(), Some(ErrorKind::SandboxViolation));
    let detail = result.error.and_then(|e| e.detail).unwrap();
    assert_eq!(detail["rule"], json!("memory"));
    assert_eq!(detail["limit_bytes"], json!(1));

    // Same worker keeps serving
    assert_eq!(pool.ready_count(), 1);
    assert_eq!(pool.status().crashes, 0);

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_requests() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir), 2).await;
    let workers = pool.workers();

    let submitting = pool.clone();
    let task = tokio::spawn(async move { submitting.submit(sleep_request(0.5)).await });
    busy_worker(&pool).await;

    let begun = Instant::now();
    pool.shutdown(Duration::from_secs(5)).await.unwrap();
    assert!(begun.elapsed() < Duration::from_secs(5));

    let result = task.await.unwrap().unwrap();
    assert!(result.is_success());

    assert_eq!(pool.lifecycle(), PoolLifecycle::Stopped);
    assert!(pool.workers().is_empty());
    for worker in workers {
        assert_eq!(worker.state(), WorkerState::Terminated);
        assert!(!worker.socket_path().exists());
    }

    let err = pool
        .submit(ExecutionRequest::new("testing.echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::NotRunning));
}

#[tokio::test]
async fn test_duplicate_request_id_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir), 1).await;

    let first = sleep_request(0.5);
    let duplicate = ExecutionRequest::new("testing.echo").with_request_id(first.request_id);

    let submitting = pool.clone();
    let task = tokio::spawn(async move { submitting.submit(first).await });
    busy_worker(&pool).await;

    let err = pool.submit(duplicate).await.unwrap_err();
    assert!(matches!(err, PoolError::DuplicateRequestId(_)));
    assert!(task.await.unwrap().unwrap().is_success());

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_resize_grows_and_shrinks() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir), 2).await;
    let original = pool.workers();

    pool.resize(3).await.unwrap();
    assert_eq!(pool.ready_count(), 3);
    assert_eq!(pool.desired_size(), 3);

    pool.resize(1).await.unwrap();
    assert_eq!(pool.workers().len(), 1);
    assert_eq!(pool.ready_count(), 1);
    // Oldest worker survives
    assert_eq!(pool.workers()[0].id(), original[0].id());
    assert_eq!(original[1].state(), WorkerState::Terminated);

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_health_check_replaces_dead_worker() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir), 1).await;
    let victim = pool.workers().remove(0);

    sigkill(&victim);
    let killed = Instant::now();

    // Noticed by the next health-check tick, 200ms apart
    while pool.status().crashes == 0 {
        assert!(
            killed.elapsed() < Duration::from_millis(500),
            "dead worker not detected within one health-check interval"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = pool.status();
        if status.ready_count() == 1 && status.workers.iter().all(|w| w.id != victim.id()) {
            break;
        }
        assert!(Instant::now() < deadline, "dead worker was not replaced");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let result = pool
        .submit(ExecutionRequest::new("testing.add_100").with_arg("num", 1))
        .await
        .unwrap();
    assert_eq!(result.payload, Some(json!(101)));

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_start_twice_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let pool = started(config(&dir), 1).await;

    assert!(matches!(pool.start(1).await, Err(PoolError::AlreadyRunning)));

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_missing_worker_program() {
    let dir = tempfile::tempdir().unwrap();
    let pool = PoolManager::new(
        config(&dir)
            .with_worker_program(dir.path().join("does-not-exist"))
            .with_startup_retries(1),
    );

    let err = pool.start(1).await.unwrap_err();
    assert!(matches!(err, PoolError::PoolInitialization(_)));
    assert_eq!(pool.lifecycle(), PoolLifecycle::Stopped);
}

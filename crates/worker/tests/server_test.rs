// Worker server tests over a real Unix socket
//
// The server runs in-process; the test plays the pool manager's side of the
// connection with a framed stream.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use warmpool_protocol::{ErrorKind, ExecutionRequest, ExecutionResult, Frame, FrameCodec};
use warmpool_worker::{
    testing, test_mode_payload, ActionExecutor, SandboxMode, SandboxRules, WorkerConfig,
    WorkerServer,
};

type Client = Framed<UnixStream, FrameCodec>;

fn start(config: WorkerConfig) -> (Arc<WorkerServer>, JoinHandle<()>) {
    let executor = ActionExecutor::new(Arc::new(testing::registry()), config.sandbox_policy());
    let server = Arc::new(WorkerServer::new(config, executor));
    let listener = server.bind().unwrap();

    let serving = Arc::clone(&server);
    let handle = tokio::spawn(async move { serving.serve(listener).await });
    (server, handle)
}

async fn connect(path: &Path) -> Client {
    Framed::new(UnixStream::connect(path).await.unwrap(), FrameCodec::new())
}

async fn next_result(client: &mut Client) -> ExecutionResult {
    match client.next().await {
        Some(Ok(Frame::Result(result))) => result,
        other => panic!("expected a result frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_execute_add_100() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let (server, handle) = start(WorkerConfig::new("w-add", &socket));

    let mut client = connect(&socket).await;
    let request = ExecutionRequest::new("testing.add_100").with_arg("num", 5);
    let request_id = request.request_id;
    client.send(Frame::Execute(request)).await.unwrap();

    let result = next_result(&mut client).await;
    assert_eq!(result.request_id, request_id);
    assert!(result.is_success());
    assert_eq!(result.payload, Some(json!(105)));

    server.shutdown_token().cancel();
    handle.await.unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_results_return_in_completion_order() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let (server, handle) = start(WorkerConfig::new("w-order", &socket));

    let mut client = connect(&socket).await;
    let slow = ExecutionRequest::new("testing.sleep").with_arg("seconds", 0.3);
    let fast = ExecutionRequest::new("testing.add_100").with_arg("num", 1);
    let (slow_id, fast_id) = (slow.request_id, fast.request_id);

    client.send(Frame::Execute(slow)).await.unwrap();
    client.send(Frame::Execute(fast)).await.unwrap();

    let first = next_result(&mut client).await;
    let second = next_result(&mut client).await;
    assert_eq!(first.request_id, fast_id);
    assert_eq!(second.request_id, slow_id);
    assert!(second.is_success());

    server.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_unknown_action_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let (server, handle) = start(WorkerConfig::new("w-unknown", &socket));

    let mut client = connect(&socket).await;
    client
        .send(Frame::Execute(ExecutionRequest::new("testing.unknown_action")))
        .await
        .unwrap();
    let result = next_result(&mut client).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ActionExecutionError));

    // Same connection keeps working
    client
        .send(Frame::Execute(
            ExecutionRequest::new("testing.add_100").with_arg("num", 2),
        ))
        .await
        .unwrap();
    assert_eq!(next_result(&mut client).await.payload, Some(json!(102)));

    server.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_test_mode_skips_execution() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let target = dir.path().join("side-effect.txt");
    let (server, handle) = start(WorkerConfig::new("w-test", &socket).with_test_mode(true));

    let mut client = connect(&socket).await;
    let request = ExecutionRequest::new("testing.write_file")
        .with_args(json!({"path": target.to_string_lossy(), "content": "x"}));
    client.send(Frame::Execute(request)).await.unwrap();

    let result = next_result(&mut client).await;
    assert!(result.is_success());
    assert_eq!(result.payload, Some(test_mode_payload()));
    assert!(!target.exists());

    server.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_ping_reports_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let (server, handle) = start(WorkerConfig::new("w-ping", &socket));

    let mut client = connect(&socket).await;
    client
        .send(Frame::Execute(
            ExecutionRequest::new("testing.sleep").with_arg("seconds", 0.3),
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send(Frame::Ping { nonce: 7 }).await.unwrap();

    match client.next().await {
        Some(Ok(Frame::Pong { nonce, in_flight })) => {
            assert_eq!(nonce, 7);
            assert_eq!(in_flight, 1);
        }
        other => panic!("expected pong, got {:?}", other),
    }
    assert!(next_result(&mut client).await.is_success());

    server.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_garbage_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let (server, handle) = start(WorkerConfig::new("w-garbage", &socket));

    let mut raw = UnixStream::connect(&socket).await.unwrap();
    raw.write_all(&[0, 0, 0, 3, b'{', b'{', b'{']).await.unwrap();
    let mut client = Framed::new(raw, FrameCodec::new());
    assert!(client.next().await.is_none());

    // The server itself keeps accepting
    let mut fresh = connect(&socket).await;
    fresh
        .send(Frame::Execute(
            ExecutionRequest::new("testing.add_100").with_arg("num", 0),
        ))
        .await
        .unwrap();
    assert!(next_result(&mut fresh).await.is_success());

    server.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let (server, handle) = start(
        WorkerConfig::new("w-drain", &socket).with_shutdown_grace(Duration::from_secs(5)),
    );

    let mut client = connect(&socket).await;
    let request = ExecutionRequest::new("testing.sleep").with_arg("seconds", 0.2);
    let request_id = request.request_id;
    client.send(Frame::Execute(request)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.shutdown_token().cancel();

    let result = next_result(&mut client).await;
    assert_eq!(result.request_id, request_id);
    assert!(result.is_success());

    handle.await.unwrap();
    assert_eq!(server.in_flight(), 0);
}

#[tokio::test]
async fn test_concurrency_cap_queues_requests() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let (server, handle) = start(WorkerConfig::new("w-cap", &socket).with_max_concurrent(1));

    let mut client = connect(&socket).await;
    let started = Instant::now();
    for _ in 0..2 {
        client
            .send(Frame::Execute(
                ExecutionRequest::new("testing.sleep").with_arg("seconds", 0.2),
            ))
            .await
            .unwrap();
    }
    assert!(next_result(&mut client).await.is_success());
    assert!(next_result(&mut client).await.is_success());
    assert!(started.elapsed() >= Duration::from_millis(390));

    server.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_sandboxed_worker_reports_violation() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("w.sock");
    let allowed = dir.path().join("allowed");
    std::fs::create_dir(&allowed).unwrap();
    let forbidden = dir.path().join("forbidden.txt");

    let config = WorkerConfig::new("w-sandbox", &socket)
        .with_sandbox(SandboxMode::Sandboxed, SandboxRules::new().allow_path(&allowed));
    let (server, handle) = start(config);

    let mut client = connect(&socket).await;
    client
        .send(Frame::Execute(ExecutionRequest::new("testing.write_file").with_args(
            json!({"path": forbidden.to_string_lossy(), "content": "x"}),
        )))
        .await
        .unwrap();
    let denied = next_result(&mut client).await;
    assert_eq!(denied.error_kind(), Some(ErrorKind::SandboxViolation));
    assert!(!forbidden.exists());

    let inside = allowed.join("ok.txt");
    client
        .send(Frame::Execute(ExecutionRequest::new("testing.write_file").with_args(
            json!({"path": inside.to_string_lossy(), "content": "x"}),
        )))
        .await
        .unwrap();
    assert!(next_result(&mut client).await.is_success());
    assert!(inside.exists());

    server.shutdown_token().cancel();
    handle.await.unwrap();
}

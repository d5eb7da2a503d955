//! Integration tests for the `interp-bridge` binary.
//!
//! `serve` speaks the same protocol as the Python endpoint, so these tests
//! also cover supervision end to end without needing an interpreter.

use interp_bridge::{
    BridgeConfig, BridgeError, InterpreterCommand, Marshaller, ProcessSupervisor, RpcClient,
    ServiceCache, ServiceKey, SupervisorConfig, TransportErrorKind, Value,
};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};

const BIN: &str = env!("CARGO_BIN_EXE_interp-bridge");

const ARITH_SOURCE: &str = "\
def plus(a, b):
    return a + b

def minus(a, b):
    return a - b
";

/// Start `serve` on an ephemeral port and wait for its ready line.
async fn start_serve(spill_dir: &TempDir) -> (Child, u16) {
    let mut child = Command::new(BIN)
        .args(["serve", "-u", "arith", "0"])
        .env("BRIDGE_SPILL_DIR", spill_dir.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to start interp-bridge serve");

    let stdout = child.stdout.take().unwrap();
    let mut lines = tokio::io::BufReader::new(stdout).lines();
    let line = tokio::time::timeout(Duration::from_secs(30), lines.next_line())
        .await
        .expect("serve did not report readiness")
        .unwrap()
        .expect("serve closed stdout");
    let port = line
        .strip_prefix(BridgeConfig::READY_LINE_PREFIX)
        .expect("unexpected ready line")
        .parse()
        .unwrap();
    (child, port)
}

async fn connect(port: u16, dir: &TempDir) -> RpcClient {
    RpcClient::connect(
        SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        Arc::new(Marshaller::new(16, dir.path().join("client"))),
    )
    .await
    .unwrap()
}

fn serve_command() -> InterpreterCommand {
    InterpreterCommand::new(BIN, "arith").with_command("serve")
}

#[tokio::test]
async fn test_serve_answers_calls_and_shuts_down() {
    let dir = TempDir::new().unwrap();
    let (mut child, port) = start_serve(&dir).await;
    let client = connect(port, &dir).await;

    client.ping().await.unwrap();
    let sum: i64 = client
        .call("plus", vec![Value::Int(2), Value::Int(3)], false)
        .await
        .unwrap();
    assert_eq!(sum, 5);

    let response = client.request("times", vec![], false).await.unwrap();
    assert!(response.unwrap_err().is_type("NameError"));

    client.request_shutdown().await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_serve_spills_large_arguments() {
    let dir = TempDir::new().unwrap();
    let (_child, port) = start_serve(&dir).await;
    let client = connect(port, &dir).await;

    let values: Vec<f64> = (0..5000).map(|i| i as f64).collect();
    let arg = client.marshaller().flatten(&values).unwrap();
    assert!(matches!(arg, Value::ArrayRef(_)));

    let total: f64 = client.call("sum", vec![arg], false).await.unwrap();
    assert_eq!(total, values.iter().sum::<f64>());
    assert!(client.marshaller().owned_files().is_empty());
}

#[tokio::test]
async fn test_register_source_against_catalog() {
    let dir = TempDir::new().unwrap();
    let (_child, port) = start_serve(&dir).await;
    let client = connect(port, &dir).await;

    client
        .register_source(ARITH_SOURCE, &["plus", "minus"], false)
        .await
        .unwrap();

    let err = client
        .register_source("def plus(a, b):\n    return 0\n", &["plus"], false)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Registration(_)));
    assert!(err.remote().unwrap().is_type("ImportError"));

    let err = client
        .register_source(ARITH_SOURCE, &["times"], false)
        .await
        .unwrap_err();
    assert!(err.remote().unwrap().is_type("NameError"));
}

#[tokio::test]
async fn test_serve_exits_with_bind_conflict_status() {
    let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = held.local_addr().unwrap().port();

    let status = Command::new(BIN)
        .args(["serve", "-u", "arith", &port.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .unwrap();
    assert_eq!(status.code(), Some(BridgeConfig::BIND_CONFLICT_EXIT_CODE));
}

#[tokio::test]
async fn test_unknown_handler_set_fails() {
    let status = Command::new(BIN)
        .args(["serve", "-u", "geometry", "0"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn test_supervisor_launches_and_stops_serve() {
    let dir = TempDir::new().unwrap();
    let supervisor = ProcessSupervisor::new(
        SupervisorConfig::default()
            .with_base_port(35000)
            .with_spill_dir(dir.path().join("spill")),
    );

    let process = supervisor
        .launch(
            "cli-test@serve",
            &serve_command(),
            Arc::new(Marshaller::new(16, dir.path().join("client"))),
        )
        .await
        .unwrap();
    assert!(process.is_alive().await);
    assert!(supervisor.ports().is_reserved(process.port()));

    let diff: i64 = process
        .client()
        .call("minus", vec![Value::Int(10), Value::Int(4)], false)
        .await
        .unwrap();
    assert_eq!(diff, 6);

    process.stop().await;
    process.stop().await;
    assert!(!process.is_alive().await);
    assert!(!supervisor.ports().is_reserved(process.port()));

    let err = process.client().ping().await.unwrap_err();
    assert_eq!(err.transport_kind(), Some(TransportErrorKind::Closed));
}

#[tokio::test]
async fn test_service_cache_shares_and_separates_instances() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(ServiceCache::new(
        SupervisorConfig::default()
            .with_base_port(36000)
            .with_spill_dir(dir.path()),
    ));
    let command = serve_command();
    let alpha = ServiceKey::new("alpha", "serve");
    let beta = ServiceKey::new("beta", "serve");

    let (first, second) = tokio::join!(
        cache.get_or_create(&alpha, &command),
        cache.get_or_create(&alpha, &command)
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(Arc::ptr_eq(&first, &second));

    let other = cache.get_or_create(&beta, &command).await.unwrap();
    assert_ne!(first.port(), other.port());
    assert_eq!(cache.keys().await, vec![alpha.clone(), beta.clone()]);

    assert!(cache.stop(&alpha).await);
    assert!(first.is_stopped());
    assert!(cache.get(&alpha).await.is_none());

    let relaunched = cache.get_or_create(&alpha, &command).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &relaunched));
    assert!(relaunched.is_alive().await);

    cache.clear().await;
    assert!(cache.is_empty().await);
    assert!(!other.is_alive().await);
}

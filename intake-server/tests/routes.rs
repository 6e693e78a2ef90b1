use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::Json;
use intake_config::load_from_str;
use intake_core::{ExclusiveLock, IntakeRuntime, TokioProcessRunner};
use intake_server::routes::{STATUS_PATH, configuration, status};
use intake_server::{AppState, build_table, runtime_config, spawn_status_server};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CONFIG: &str = r#"
    scratch_dir = "scratch"
    tick_period = "1h"

    [status]
    bind = "127.0.0.1:0"

    [[bindings]]
    root = "inbox"
    processor = "drop"

    [processors.drop]
    kind = "discard"
"#;

async fn start(base: &Path) -> (IntakeRuntime, AppState) {
    std::fs::create_dir_all(base.join("inbox")).unwrap();
    std::fs::write(base.join("inbox/waiting.dat"), b"x").unwrap();

    let config = Arc::new(load_from_str(CONFIG, base).unwrap().config);
    let table = build_table(&config, Arc::new(TokioProcessRunner)).unwrap();
    let runtime = IntakeRuntime::start(
        table,
        Arc::new(ExclusiveLock::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
        )),
        runtime_config(&config),
    )
    .await
    .unwrap();
    let state = AppState::new(runtime.status_handle(), config);
    (runtime, state)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_report_runtime_and_configuration() {
    let tmp = tempdir().unwrap();
    let base = tmp.path().canonicalize().unwrap();
    let (runtime, state) = start(&base).await;

    let Json(snapshot) = status(State(state.clone())).await;
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].path, base.join("inbox/waiting.dat"));
    assert_eq!(snapshot.tick_period, "1h");
    assert_eq!(snapshot.bindings[0].processor, "drop");

    let Json(view) = configuration(State(state)).await;
    assert_eq!(view.bindings[0].root, base.join("inbox"));
    assert_eq!(view.scratch_dir, base.join("scratch"));
    assert_eq!(view.tick_period, "1h");
    assert!(view.processors.contains_key("drop"));

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_route_serves_json_until_shutdown() {
    let tmp = tempdir().unwrap();
    let base = tmp.path().canonicalize().unwrap();
    let (runtime, state) = start(&base).await;

    let bind = "127.0.0.1:0".parse().unwrap();
    let (addr, server) = spawn_status_server(bind, state, runtime.shutdown_token())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {STATUS_PATH} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("application/json"));
    let (_, body) = response.split_once("\r\n\r\n").unwrap();
    let body: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(body["entries"][0]["status"], "PENDING");
    assert_eq!(body["tick_period"], "1h");

    runtime.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server stops with the runtime")
        .unwrap()
        .unwrap();
}

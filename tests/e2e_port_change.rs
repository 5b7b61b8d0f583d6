// tests/e2e_port_change.rs
mod helpers;

use devmesh::proxy::{Bundle, ProxyController, ProxyData, ProxyError};
use helpers::{can_bind_loopback, free_port, registry_at, spawn_mock_runtime, worker_config};
use reqwest::Client;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_port_change_moves_listener() {
    if !can_bind_loopback().await {
        eprintln!("skipping port change test: cannot bind to loopback in this environment");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let (runtime, runtime_url) = spawn_mock_runtime("v1").await;
    let config = worker_config("app", dir.path());
    let controller = ProxyController::start(config.clone(), registry.clone())
        .await
        .unwrap();
    controller.reload_start(Bundle::default()).unwrap();
    controller.reload_complete(ProxyData::new(&runtime_url)).unwrap();

    let old_addr = controller.snapshot().await.unwrap().public_addr;
    let client = Client::new();

    // A slow request accepted on the old port must still complete.
    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .get(format!("http://{}/slow/300", old_addr))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let new_port = free_port().await;
    let mut moved = config.clone();
    moved.dev.port = new_port;
    controller.config_update(moved).await.unwrap();

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(snapshot.public_addr.port(), new_port);
    assert_eq!(in_flight.await.unwrap(), "v1 slow 300");

    let body = Client::new()
        .get(format!("http://127.0.0.1:{}/after", new_port))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "v1 /after");

    // Old port no longer accepts new connections.
    assert!(Client::new()
        .get(format!("http://{}/gone", old_addr))
        .send()
        .await
        .is_err());

    // Callers resolving the worker now get the new port.
    assert_eq!(registry.resolve("app").await.unwrap().port, new_port);

    controller.shutdown().await;
    runtime.stop().await;
}

#[tokio::test]
async fn test_port_in_use_is_reported_and_old_port_keeps_serving() {
    if !can_bind_loopback().await {
        eprintln!("skipping port change test: cannot bind to loopback in this environment");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let (runtime, runtime_url) = spawn_mock_runtime("v1").await;
    let config = worker_config("app", dir.path());
    let controller = ProxyController::start(config.clone(), registry_at(dir.path()))
        .await
        .unwrap();
    controller.reload_start(Bundle::default()).unwrap();
    controller.reload_complete(ProxyData::new(&runtime_url)).unwrap();
    let addr = controller.snapshot().await.unwrap().public_addr;

    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut moved = config.clone();
    moved.dev.port = blocker.local_addr().unwrap().port();

    let err = controller.config_update(moved).await.unwrap_err();
    assert!(matches!(err, ProxyError::Bind { .. }), "unexpected error: {}", err);
    assert_eq!(controller.snapshot().await.unwrap().public_addr, addr);

    let body = Client::new()
        .get(format!("http://{}/still", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "v1 /still");

    controller.shutdown().await;
    runtime.stop().await;
}

#[tokio::test]
async fn test_partial_rebind_republishes_moved_port() {
    if !can_bind_loopback().await {
        eprintln!("skipping port change test: cannot bind to loopback in this environment");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let (runtime, runtime_url) = spawn_mock_runtime("v1").await;
    let config = worker_config("app", dir.path());
    let controller = ProxyController::start(config.clone(), registry.clone())
        .await
        .unwrap();
    controller.reload_start(Bundle::default()).unwrap();
    controller.reload_complete(ProxyData::new(&runtime_url)).unwrap();

    // The public listener moves, then the inspector bind fails.
    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let new_port = free_port().await;
    let mut moved = config.clone();
    moved.dev.port = new_port;
    moved.dev.inspector_port = blocker.local_addr().unwrap().port();

    let err = controller.config_update(moved).await.unwrap_err();
    assert!(matches!(err, ProxyError::Bind { .. }), "unexpected error: {}", err);
    assert_eq!(controller.snapshot().await.unwrap().public_addr.port(), new_port);
    assert_eq!(registry.resolve("app").await.unwrap().port, new_port);

    let body = Client::new()
        .get(format!("http://127.0.0.1:{}/moved", new_port))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "v1 /moved");

    controller.shutdown().await;
    runtime.stop().await;
}

#[tokio::test]
async fn test_inspector_port_change() {
    if !can_bind_loopback().await {
        eprintln!("skipping port change test: cannot bind to loopback in this environment");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let config = worker_config("app", dir.path());
    let controller = ProxyController::start(config.clone(), registry_at(dir.path()))
        .await
        .unwrap();
    let before = controller.snapshot().await.unwrap();

    let new_port = free_port().await;
    let mut moved = config.clone();
    moved.dev.inspector_port = new_port;
    controller.config_update(moved).await.unwrap();

    let after = controller.snapshot().await.unwrap();
    assert_eq!(after.inspector_addr.port(), new_port);
    assert_eq!(after.public_addr, before.public_addr);

    let resp = Client::new()
        .get(format!("http://127.0.0.1:{}/json/version", new_port))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    controller.shutdown().await;
}

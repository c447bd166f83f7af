//! End-to-end Manager + Storage scenarios (spec §8 scenarios 2-4, persistence
//! convergence). Uses a real sqlite file under a temp dir; no live SSH server
//! is available in this harness, so scenarios that require an actual
//! Active session (1, 4's "restores Active" half) are covered only through
//! the Failed branch and through Storage round-tripping.

use std::sync::Arc;

use chrono::Utc;
use sshtunneld::manager::Manager;
use sshtunneld::model::{AuthMethod, Hop, HostKeyMode, TunnelSpec, TunnelType};
use sshtunneld::storage::Storage;

fn unreachable_spec(id: &str) -> TunnelSpec {
    let now = Utc::now();
    TunnelSpec {
        id: id.to_string(),
        name: format!("tunnel-{id}"),
        owner: "test-owner".to_string(),
        tunnel_type: TunnelType::Local,
        hops: vec![Hop {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "nobody".to_string(),
            auth_method: AuthMethod::Agent,
            key_ref: None,
            host_key_mode: HostKeyMode::Insecure,
        }],
        local_port: 0,
        local_bind_address: "127.0.0.1".to_string(),
        remote_host: "127.0.0.1".to_string(),
        remote_port: 9,
        auto_reconnect: false,
        keep_alive_interval_secs: 30,
        max_retries: 0,
        created_at: now,
        updated_at: now,
    }
}

async fn open_storage() -> (Arc<Storage>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tunnels.db");
    let storage = Storage::connect(&path).await.unwrap();
    (Arc::new(storage), dir)
}

#[tokio::test]
async fn duplicate_id_rejected_and_persisted_once() {
    let (storage, _dir) = open_storage().await;
    let manager = Manager::new(Some(storage));

    manager.create(unreachable_spec("dup-a")).await.unwrap();
    let second = manager.create(unreachable_spec("dup-a")).await;
    assert!(second.is_err());

    assert_eq!(manager.list().await.len(), 1);
}

#[tokio::test]
async fn unreachable_host_becomes_failed_then_deletable() {
    let (storage, _dir) = open_storage().await;
    let manager = Manager::new(Some(storage));

    manager.create(unreachable_spec("unreachable-a")).await.unwrap();

    let mut status = manager.get_status("unreachable-a").await.unwrap();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(15);
    while status.state != sshtunneld::model::TunnelState::Failed {
        assert!(tokio::time::Instant::now() < deadline, "tunnel never transitioned to Failed");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        status = manager.get_status("unreachable-a").await.unwrap();
    }
    assert!(status.last_error.as_deref().unwrap_or("").to_lowercase().contains("connect"));

    manager.delete("unreachable-a").await.unwrap();
    assert_eq!(manager.list().await.len(), 0);
}

#[tokio::test]
async fn create_returns_before_any_network_io_completes() {
    let (storage, _dir) = open_storage().await;
    let manager = Manager::new(Some(storage));

    let start = tokio::time::Instant::now();
    manager.create(unreachable_spec("fast-a")).await.unwrap();
    assert!(start.elapsed() < std::time::Duration::from_millis(50));

    manager.delete("fast-a").await.ok();
}

#[tokio::test]
async fn stopping_a_failed_tunnel_succeeds_and_is_idempotent() {
    let (storage, _dir) = open_storage().await;
    let manager = Manager::new(Some(storage));
    manager.create(unreachable_spec("stop-a")).await.unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(15);
    loop {
        let status = manager.get_status("stop-a").await.unwrap();
        if status.state == sshtunneld::model::TunnelState::Failed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    manager.stop("stop-a").await.unwrap();
    manager.stop("stop-a").await.unwrap();
    assert_eq!(manager.get_status("stop-a").await.unwrap().state, sshtunneld::model::TunnelState::Stopped);
}

#[tokio::test]
async fn load_from_storage_restores_specs_as_stopped_without_reconnecting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tunnels.db");

    {
        let storage = Arc::new(Storage::connect(&path).await.unwrap());
        let manager = Manager::new(Some(storage));
        manager.create(unreachable_spec("restore-a")).await.unwrap();
        manager.shutdown().await.ok();
    }

    let storage = Arc::new(Storage::connect(&path).await.unwrap());
    let manager = Manager::new(Some(storage));
    manager.load_from_storage().await.unwrap();

    let status = manager.get_status("restore-a").await.unwrap();
    assert_eq!(status.state, sshtunneld::model::TunnelState::Stopped);
}

#[tokio::test]
async fn get_missing_tunnel_returns_not_found() {
    let manager = Manager::new(None);
    let err = manager.get_status("does-not-exist").await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

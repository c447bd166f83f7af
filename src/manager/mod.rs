//! Concurrent tunnel registry: async create, stop/start/delete, persistence
//! hooks, status callbacks (spec §4.8).
//!
//! Grounded on the teacher's accept-loop-then-spawn idiom (`run_local_forward`)
//! generalized to a registry, and on
//! `examples/other_examples/.../oxideterm/auto_reconnect.rs`'s
//! `is_reconnecting()`-guarded background task pattern for `connectTunnel`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::auth::{Authenticator, MultiAuthenticator};
use crate::cancel::CancelSource;
use crate::circuit::TunnelCircuitBreaker;
use crate::error::TunnelError;
use crate::forwarder::dynamic::DynamicForwarder;
use crate::forwarder::local::LocalForwarder;
use crate::forwarder::remote::RemoteForwarder;
use crate::forwarder::Forwarder;
use crate::model::{TunnelSpec, TunnelState, TunnelStatus, TunnelType};
use crate::session::multihop::MultiHopSession;
use crate::session::{AnySession, Session, SessionConfig};
use crate::storage::Storage;

const DIAL_TIMEOUT_SECS: u64 = 10;

/// `{type: "tunnel_update", tunnelId, status}` (spec §6 push channel).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TunnelUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub tunnel_id: String,
    pub status: TunnelStatus,
}

struct Tunnel {
    spec: TunnelSpec,
    status: RwLock<TunnelStatus>,
    session: RwLock<Option<AnySession>>,
    forwarder: RwLock<Option<Arc<dyn Forwarder>>>,
    cancel: CancelSource,
}

/// Registry of tunnels, with an optional durable Storage and a status-change
/// broadcast channel standing in for the out-of-core push channel.
pub struct Manager {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    storage: Option<Arc<Storage>>,
    updates: broadcast::Sender<TunnelUpdate>,
    breakers: TunnelCircuitBreaker,
}

impl Manager {
    pub fn new(storage: Option<Arc<Storage>>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(256);
        Arc::new(Manager {
            tunnels: RwLock::new(HashMap::new()),
            storage,
            updates,
            breakers: TunnelCircuitBreaker::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelUpdate> {
        self.updates.subscribe()
    }

    /// Reads all persisted specs and populates the registry in `Stopped`
    /// state; never auto-reconnects on boot.
    pub async fn load_from_storage(self: &Arc<Self>) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let specs = storage.list().await.map_err(anyhow::Error::from)?;
        let mut tunnels = self.tunnels.write().await;
        for spec in specs {
            let status = TunnelStatus {
                tunnel_id: spec.id.clone(),
                state: TunnelState::Stopped,
                connected_at: None,
                last_error: None,
                bytes_sent: 0,
                bytes_received: 0,
                retry_count: 0,
                bound_port: None,
            };
            tunnels.insert(
                spec.id.clone(),
                Arc::new(Tunnel {
                    spec,
                    status: RwLock::new(status),
                    session: RwLock::new(None),
                    forwarder: RwLock::new(None),
                    cancel: CancelSource::new(),
                }),
            );
        }
        Ok(())
    }

    /// Never does network I/O. Writes to Storage (if configured), inserts a
    /// `Pending` tunnel, returns, then spawns `connect_tunnel` in the
    /// background.
    pub async fn create(self: &Arc<Self>, spec: TunnelSpec) -> Result<(), TunnelError> {
        crate::model::validate_spec(&spec)?;

        if self.tunnels.read().await.contains_key(&spec.id) {
            return Err(TunnelError::Conflict(format!("tunnel id '{}' already exists", spec.id)));
        }

        if let Some(storage) = &self.storage {
            storage.save(&spec).await?;
        }

        let tunnel = Arc::new(Tunnel {
            status: RwLock::new(TunnelStatus::pending(&spec.id)),
            session: RwLock::new(None),
            forwarder: RwLock::new(None),
            cancel: CancelSource::new(),
            spec: spec.clone(),
        });

        {
            let mut tunnels = self.tunnels.write().await;
            if tunnels.contains_key(&spec.id) {
                return Err(TunnelError::Conflict(format!("tunnel id '{}' already exists", spec.id)));
            }
            tunnels.insert(spec.id.clone(), Arc::clone(&tunnel));
        }

        let manager = Arc::clone(self);
        let tunnel_id = spec.id.clone();
        tokio::spawn(async move {
            manager.connect_tunnel(tunnel_id).await;
        });

        Ok(())
    }

    async fn connect_tunnel(self: &Arc<Self>, tunnel_id: String) {
        let Some(tunnel) = self.tunnels.read().await.get(&tunnel_id).cloned() else {
            return;
        };

        let breaker = self.breakers.get_or_create(&tunnel_id).await;
        if breaker.allow().await.is_err() {
            self.fail_tunnel(&tunnel, "circuit breaker open".to_string()).await;
            return;
        }

        match self.build_and_start(&tunnel).await {
            Ok(()) => {
                breaker.record_success().await;
                self.activate_tunnel(&tunnel).await;
            }
            Err(e) => {
                breaker.record_failure().await;
                self.fail_tunnel(&tunnel, e.to_string()).await;
            }
        }
    }

    async fn build_and_start(self: &Arc<Self>, tunnel: &Arc<Tunnel>) -> Result<()> {
        let spec = &tunnel.spec;

        let session_config = SessionConfig {
            keep_alive_interval: std::time::Duration::from_secs(spec.keep_alive_interval_secs),
            auto_reconnect: spec.auto_reconnect,
            max_retries: spec.max_retries,
            dial_timeout: std::time::Duration::from_secs(DIAL_TIMEOUT_SECS),
            ..SessionConfig::default()
        };

        let manager = Arc::clone(self);
        let tunnel_id = spec.id.clone();
        let on_disconnect: crate::session::DisconnectCallback = Arc::new(move |message| {
            let manager = Arc::clone(&manager);
            let tunnel_id = tunnel_id.clone();
            tokio::spawn(async move {
                if let Some(tunnel) = manager.tunnels.read().await.get(&tunnel_id).cloned() {
                    if tunnel.spec.auto_reconnect {
                        // The Session is already retrying against its own
                        // cancellation source; tearing down the Forwarder or
                        // closing the Session here would abort that retry.
                        manager.note_disconnect(&tunnel, message).await;
                    } else {
                        manager.fail_tunnel(&tunnel, message).await;
                    }
                }
            });
        });

        let manager = Arc::clone(self);
        let tunnel_id = spec.id.clone();
        let on_reconnect: crate::session::ReconnectCallback = Arc::new(move || {
            let manager = Arc::clone(&manager);
            let tunnel_id = tunnel_id.clone();
            tokio::spawn(async move {
                if let Some(tunnel) = manager.tunnels.read().await.get(&tunnel_id).cloned() {
                    manager.activate_tunnel(&tunnel).await;
                }
            });
        });

        let sessions: Vec<Arc<Session>> = spec
            .hops
            .iter()
            .map(|hop| {
                let authenticator = MultiAuthenticator::new(vec![Authenticator::for_hop(hop, None)?]);
                Ok(Session::new(
                    hop.clone(),
                    authenticator,
                    session_config.clone(),
                    Some(Arc::clone(&on_disconnect)),
                    Some(Arc::clone(&on_reconnect)),
                ))
            })
            .collect::<Result<_>>()
            .context("failed to build authenticators for hops")?;

        let any_session = if sessions.len() == 1 {
            let session = sessions.into_iter().next().unwrap();
            session.connect_with_retry().await?;
            AnySession::Single(session)
        } else {
            let chain = MultiHopSession::new(sessions)?;
            chain.connect_with_retry().await?;
            AnySession::MultiHop(Arc::new(chain))
        };

        let forwarder_cancel = tunnel.cancel.child();
        let forwarder: Arc<dyn Forwarder> = match spec.tunnel_type {
            TunnelType::Local => LocalForwarder::new(
                spec.local_bind_address.clone(),
                spec.local_port,
                spec.remote_host.clone(),
                spec.remote_port,
                Arc::new(any_session.clone()),
                forwarder_cancel,
            ),
            TunnelType::Remote => RemoteForwarder::new(
                spec.remote_port,
                "127.0.0.1".to_string(),
                spec.local_port,
                any_session.clone(),
                forwarder_cancel,
            ),
            TunnelType::Dynamic => DynamicForwarder::new(
                spec.local_bind_address.clone(),
                spec.local_port,
                Arc::new(any_session.clone()),
                forwarder_cancel,
            ),
        };

        let bound_port = forwarder.start().await?;

        *tunnel.session.write().await = Some(any_session);
        *tunnel.forwarder.write().await = Some(forwarder);
        tunnel.status.write().await.bound_port = Some(bound_port);

        Ok(())
    }

    async fn activate_tunnel(&self, tunnel: &Arc<Tunnel>) {
        let mut status = tunnel.status.write().await;
        status.state = TunnelState::Active;
        status.last_error = None;
        status.retry_count = 0;
        if status.connected_at.is_none() {
            status.connected_at = Some(Utc::now());
        }
        let snapshot = status.clone();
        drop(status);
        self.publish(&tunnel.spec.id, snapshot).await;
    }

    /// A keep-alive drop with auto-reconnect in flight: the Session is
    /// retrying itself, so the Forwarder and Session stay bound to the
    /// tunnel — only the observable status changes, so the reconnect
    /// callback has something to reactivate (§3 "Active ⇒ live Session AND
    /// bound Forwarder").
    async fn note_disconnect(&self, tunnel: &Arc<Tunnel>, message: String) {
        let mut status = tunnel.status.write().await;
        status.state = TunnelState::Failed;
        status.last_error = Some(message);
        status.retry_count += 1;
        let snapshot = status.clone();
        drop(status);

        if let Some(storage) = &self.storage {
            storage.update_status(&tunnel.spec.id, "failed").await.ok();
        }
        self.publish(&tunnel.spec.id, snapshot).await;
    }

    /// Terminal failure: tears down whatever was built so the Forwarder and
    /// Session don't linger on a Failed tunnel (§3 invariant). Used for
    /// initial-connect failures and for disconnects with no auto-reconnect
    /// to recover them.
    async fn fail_tunnel(&self, tunnel: &Arc<Tunnel>, message: String) {
        if let Some(forwarder) = tunnel.forwarder.write().await.take() {
            forwarder.stop().await.ok();
        }
        if let Some(session) = tunnel.session.write().await.take() {
            session.close().await;
        }

        let mut status = tunnel.status.write().await;
        status.state = TunnelState::Failed;
        status.last_error = Some(message);
        status.bound_port = None;
        let snapshot = status.clone();
        drop(status);

        if let Some(storage) = &self.storage {
            storage.update_status(&tunnel.spec.id, "failed").await.ok();
        }
        self.publish(&tunnel.spec.id, snapshot).await;
    }

    async fn publish(&self, tunnel_id: &str, status: TunnelStatus) {
        let _ = self.updates.send(TunnelUpdate {
            kind: "tunnel_update",
            tunnel_id: tunnel_id.to_string(),
            status,
        });
    }

    /// Idempotent. Closes the Forwarder and Session, clears those references,
    /// sets state to `Stopped`. The Spec remains in Storage and registry.
    pub async fn stop(&self, id: &str) -> Result<(), TunnelError> {
        let tunnel = self.get_tunnel(id).await?;

        if let Some(forwarder) = tunnel.forwarder.write().await.take() {
            forwarder.stop().await.map_err(|e| TunnelError::Internal(e.to_string()))?;
        }
        if let Some(session) = tunnel.session.write().await.take() {
            session.close().await;
        }

        let mut status = tunnel.status.write().await;
        status.state = TunnelState::Stopped;
        status.bound_port = None;
        let snapshot = status.clone();
        drop(status);

        if let Some(storage) = &self.storage {
            storage.update_status(id, "stopped").await.ok();
        }
        self.publish(id, snapshot).await;
        Ok(())
    }

    /// Fails if already `Active`; otherwise sets `Pending` and spawns
    /// `connect_tunnel`.
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<(), TunnelError> {
        let tunnel = self.get_tunnel(id).await?;

        {
            let mut status = tunnel.status.write().await;
            if status.state == TunnelState::Active {
                return Err(TunnelError::Conflict(format!("tunnel '{id}' is already active")));
            }
            status.state = TunnelState::Pending;
        }

        let manager = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            manager.connect_tunnel(id).await;
        });

        Ok(())
    }

    /// Attempts Stop (errors are logged, not surfaced — a failed tunnel must
    /// still be deletable); removes from the registry, then Storage — the
    /// reverse of Create's storage-then-registry order (spec §9 "persistence
    /// races"), so a racing Create can't observe a half-deleted tunnel.
    pub async fn delete(&self, id: &str) -> Result<(), TunnelError> {
        if let Err(e) = self.stop(id).await {
            tracing::warn!(tunnel_id = id, error = %e, "stop-on-delete failed, continuing");
        }

        self.breakers.remove(id).await;
        self.tunnels.write().await.remove(id);

        if let Some(storage) = &self.storage {
            storage.delete(id).await.ok();
        }
        Ok(())
    }

    pub async fn get_status(&self, id: &str) -> Result<TunnelStatus, TunnelError> {
        let tunnel = self.get_tunnel(id).await?;
        Ok(tunnel.status.read().await.clone())
    }

    pub async fn get_spec(&self, id: &str) -> Result<TunnelSpec, TunnelError> {
        let tunnel = self.get_tunnel(id).await?;
        Ok(tunnel.spec.clone())
    }

    pub async fn list(&self) -> Vec<(TunnelSpec, TunnelStatus)> {
        let tunnels = self.tunnels.read().await;
        let mut result = Vec::with_capacity(tunnels.len());
        for tunnel in tunnels.values() {
            result.push((tunnel.spec.clone(), tunnel.status.read().await.clone()));
        }
        result
    }

    pub async fn get_metrics(&self, id: &str) -> Result<crate::forwarder::ForwarderStatsSnapshot, TunnelError> {
        let tunnel = self.get_tunnel(id).await?;
        let forwarder = tunnel.forwarder.read().await;
        forwarder
            .as_ref()
            .map(|f| f.stats())
            .ok_or_else(|| TunnelError::NotFound(format!("tunnel '{id}' has no running forwarder")))
    }

    pub async fn health(&self) -> (usize, usize, usize) {
        let tunnels = self.tunnels.read().await;
        let mut active = 0;
        let mut failed = 0;
        for tunnel in tunnels.values() {
            match tunnel.status.read().await.state {
                TunnelState::Active => active += 1,
                TunnelState::Failed => failed += 1,
                _ => {}
            }
        }
        (tunnels.len(), active, failed)
    }

    /// Stops every tunnel, surfacing the first error but continuing.
    pub async fn shutdown(&self) -> Result<()> {
        let ids: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        self.tunnels.write().await.clear();
        if let Some(e) = first_error {
            bail!("shutdown encountered errors, first: {e}");
        }
        Ok(())
    }

    async fn get_tunnel(&self, id: &str) -> Result<Arc<Tunnel>, TunnelError> {
        self.tunnels
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthMethod, Hop, HostKeyMode};

    fn unreachable_spec(id: &str) -> TunnelSpec {
        let now = Utc::now();
        TunnelSpec {
            id: id.to_string(),
            name: format!("tunnel-{id}"),
            owner: "alice".to_string(),
            tunnel_type: TunnelType::Local,
            hops: vec![Hop {
                host: "127.0.0.1".to_string(),
                port: 1,
                user: "root".to_string(),
                auth_method: AuthMethod::Password,
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

    #[tokio::test]
    async fn test_create_returns_quickly_for_unreachable_host() {
        let manager = Manager::new(None);
        let start = std::time::Instant::now();
        manager.create(unreachable_spec("t1")).await.unwrap();
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let manager = Manager::new(None);
        manager.create(unreachable_spec("a")).await.unwrap();
        let err = manager.create(unreachable_spec("a")).await.unwrap_err();
        assert!(matches!(err, TunnelError::Conflict(_)));
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_host_becomes_failed_then_deletable() {
        let manager = Manager::new(None);
        manager.create(unreachable_spec("t1")).await.unwrap();

        let mut status = manager.get_status("t1").await.unwrap();
        for _ in 0..150 {
            if status.state == TunnelState::Failed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            status = manager.get_status("t1").await.unwrap();
        }
        assert_eq!(status.state, TunnelState::Failed);

        manager.delete("t1").await.unwrap();
        assert_eq!(manager.list().await.len(), 0);
    }

    #[tokio::test]
    async fn test_get_missing_tunnel_not_found() {
        let manager = Manager::new(None);
        let err = manager.get_status("missing").await.unwrap_err();
        assert!(matches!(err, TunnelError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stopping_failed_tunnel_succeeds() {
        let manager = Manager::new(None);
        manager.create(unreachable_spec("t1")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        manager.stop("t1").await.unwrap();
        assert_eq!(manager.get_status("t1").await.unwrap().state, TunnelState::Stopped);
    }
}

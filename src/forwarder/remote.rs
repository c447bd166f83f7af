//! Ask the SSH peer to listen, accept inbound, dial local target (spec §4.6).
//!
//! Grounded on the teacher's `setup_remote_forward` (`tcpip_forward` +
//! `RemoteForwardMap` registration) and `SshoreHandler`'s forwarded-tcpip
//! handler (see `session::handler`), which does the actual accept-and-copy
//! once a connection mapping is registered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use tokio::sync::RwLock;

use crate::cancel::CancelSource;
use crate::session::AnySession;
use crate::session::handler::RemoteForwardMap;

use super::{Forwarder, ForwarderStats, ForwarderStatsSnapshot, DRAIN_TIMEOUT};

const REMOTE_FORWARD_BIND_ADDR: &str = "0.0.0.0";

pub struct RemoteForwarder {
    remote_port: u16,
    local_host: String,
    local_port: u16,
    session: AnySession,
    stats: Arc<ForwarderStats>,
    cancel: CancelSource,
    // Re-read under a read lock on each accept-loop iteration so a concurrent
    // Stop is seen promptly (spec §4.6).
    bound: RwLock<Option<(String, u32)>>,
    stopped: AtomicBool,
}

impl RemoteForwarder {
    pub fn new(
        remote_port: u16,
        local_host: String,
        local_port: u16,
        session: AnySession,
        cancel: CancelSource,
    ) -> Arc<Self> {
        Arc::new(RemoteForwarder {
            remote_port,
            local_host,
            local_port,
            session,
            stats: ForwarderStats::new(),
            cancel,
            bound: RwLock::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    fn remote_forward_map(&self) -> Result<RemoteForwardMap> {
        self.session
            .remote_forwards()
            .context("session has no remote-forward map — not connected")
    }
}

#[async_trait::async_trait]
impl Forwarder for RemoteForwarder {
    async fn start(&self) -> Result<u16> {
        let client = self
            .session
            .last_hop_client()
            .context("no live SSH client on last hop")?;

        let bound_port = client
            .tcpip_forward(REMOTE_FORWARD_BIND_ADDR, self.remote_port as u32)
            .await
            .with_context(|| format!("failed to request remote forward on port {}", self.remote_port))?;

        let actual_port = if bound_port != 0 {
            bound_port
        } else {
            self.remote_port as u32
        };

        {
            let map = self.remote_forward_map()?;
            map.lock()
                .expect("remote_forwards mutex poisoned")
                .insert(
                    (REMOTE_FORWARD_BIND_ADDR.to_string(), actual_port),
                    (self.local_host.clone(), self.local_port as u32),
                );
        }

        *self.bound.write().await = Some((REMOTE_FORWARD_BIND_ADDR.to_string(), actual_port));

        // The accept-and-copy loop itself lives in
        // `session::handler::SessionHandler::server_channel_open_forwarded_tcpip`,
        // driven by the SSH event loop rather than a dedicated task here —
        // this forwarder's "accept loop" is the registration above, and this
        // background task exists only to unregister on Stop.
        let map = self.remote_forward_map()?;
        let cancel = self.cancel.clone();
        let bound_key = (REMOTE_FORWARD_BIND_ADDR.to_string(), actual_port);
        tokio::spawn(async move {
            cancel.cancelled().await;
            map.lock().expect("remote_forwards mutex poisoned").remove(&bound_key);
        });

        Ok(actual_port as u16)
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();

        let bound = self.bound.read().await.clone();
        if let Some((addr, port)) = bound {
            if let Some(client) = self.session.last_hop_client() {
                tokio::time::timeout(DRAIN_TIMEOUT, client.cancel_tcpip_forward(&addr, port))
                    .await
                    .ok();
            }
        } else {
            bail!("remote forwarder stopped before it was started");
        }
        Ok(())
    }

    fn stats(&self) -> ForwarderStatsSnapshot {
        self.stats.snapshot()
    }
}

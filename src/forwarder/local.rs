//! Listen locally, dial through the session, bidirectional copy (spec §4.5).
//!
//! Grounded on the teacher's `run_local_forward`: bind, spawn an accept loop,
//! per-accept `channel_open_direct_tcpip` + `copy_bidirectional`, generalized
//! with an exactly-once `stop()` and atomic stats instead of a fire-and-forget
//! task with no lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::cancel::CancelSource;

use super::{AsyncDuplex, Forwarder, ForwarderStats, ForwarderStatsSnapshot, SessionDialer, DRAIN_TIMEOUT};

pub struct LocalForwarder {
    bind_addr: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    dialer: Arc<dyn SessionDialer>,
    stats: Arc<ForwarderStats>,
    cancel: CancelSource,
    listener_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    active_count: Arc<tokio::sync::Semaphore>,
    stopped: AtomicBool,
    bound_port: Mutex<Option<u16>>,
}

const MAX_CONCURRENT_CONNECTIONS: usize = 4096;

impl LocalForwarder {
    pub fn new(
        bind_addr: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
        dialer: Arc<dyn SessionDialer>,
        cancel: CancelSource,
    ) -> Arc<Self> {
        Arc::new(LocalForwarder {
            bind_addr,
            local_port,
            remote_host,
            remote_port,
            dialer,
            stats: ForwarderStats::new(),
            cancel,
            listener_handle: Mutex::new(None),
            active_count: Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_CONNECTIONS)),
            stopped: AtomicBool::new(false),
            bound_port: Mutex::new(None),
        })
    }
}

#[async_trait::async_trait]
impl Forwarder for LocalForwarder {
    async fn start(&self) -> Result<u16> {
        let addr = format!("{}:{}", self.bind_addr, self.local_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind local port {addr}"))?;
        let bound_port = listener.local_addr()?.port();
        *self.bound_port.lock().await = Some(bound_port);

        let remote_host = self.remote_host.clone();
        let remote_port = self.remote_port;
        let dialer = Arc::clone(&self.dialer);
        let stats = Arc::clone(&self.stats);
        let cancel = self.cancel.clone();
        let active_count = Arc::clone(&self.active_count);

        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    result = listener.accept() => result,
                    _ = cancel.cancelled() => break,
                };

                let (mut tcp_stream, _peer) = match accepted {
                    Ok(conn) => conn,
                    Err(_) if cancel.is_cancelled() => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "local forwarder accept error");
                        stats.incr_errors();
                        continue;
                    }
                };

                stats.incr_accepted();

                if !dialer.is_connected().await {
                    stats.incr_errors();
                    continue;
                }

                let Ok(permit) = Arc::clone(&active_count).try_acquire_owned() else {
                    stats.incr_errors();
                    continue;
                };

                let dialer = Arc::clone(&dialer);
                let stats = Arc::clone(&stats);
                let remote_host = remote_host.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    stats.incr_active();
                    match dialer.dial((remote_host, remote_port)).await {
                        Ok(mut channel_stream) => {
                            copy_and_count(&mut tcp_stream, &mut channel_stream, &stats).await;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "failed to open direct-tcpip channel");
                            stats.incr_errors();
                        }
                    }
                    stats.decr_active();
                });
            }
        });

        *self.listener_handle.lock().await = Some(handle);
        Ok(bound_port)
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        if let Some(handle) = self.listener_handle.lock().await.take() {
            tokio::time::timeout(DRAIN_TIMEOUT, handle).await.ok();
        }
        let remaining = MAX_CONCURRENT_CONNECTIONS - self.active_count.available_permits();
        if remaining > 0 {
            tracing::warn!(remaining, "local forwarder stopped with connections still draining");
        }
        Ok(())
    }

    fn stats(&self) -> ForwarderStatsSnapshot {
        self.stats.snapshot()
    }
}

async fn copy_and_count<A, B>(a: &mut A, b: &mut B, stats: &ForwarderStats)
where
    A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(a, b).await {
        Ok((sent, received)) => {
            stats.add_bytes_sent(sent);
            stats.add_bytes_received(received);
        }
        Err(e) => {
            tracing::debug!(error = %e, "forwarder copy ended");
        }
    }
}

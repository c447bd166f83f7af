//! Common forwarder contract and stats (spec §3 "Forwarder stats", §4.5-§4.7,
//! §9 "SessionDialer abstraction").

pub mod dynamic;
pub mod local;
pub mod remote;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream a forwarder can copy to/from — a real
/// `russh::ChannelStream`, a loopback `TcpStream` in tests, anything. Keeps
/// `SessionDialer` decoupled from russh's concrete channel type so it can be
/// mocked (spec §9 "SessionDialer abstraction").
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

/// Forwarders depend only on this narrow capability; both `Session` and
/// `MultiHopSession` satisfy it, and tests use an in-process mock.
#[async_trait::async_trait]
pub trait SessionDialer: Send + Sync {
    async fn dial(&self, address: (String, u16)) -> Result<Box<dyn AsyncDuplex>>;
    async fn is_connected(&self) -> bool;
}

#[async_trait::async_trait]
impl SessionDialer for crate::session::Session {
    async fn dial(&self, address: (String, u16)) -> Result<Box<dyn AsyncDuplex>> {
        let stream = crate::session::Session::dial(self, address).await?;
        Ok(Box::new(stream))
    }

    async fn is_connected(&self) -> bool {
        crate::session::Session::is_connected(self).await
    }
}

#[async_trait::async_trait]
impl SessionDialer for crate::session::multihop::MultiHopSession {
    async fn dial(&self, address: (String, u16)) -> Result<Box<dyn AsyncDuplex>> {
        let stream = crate::session::multihop::MultiHopSession::dial(self, address).await?;
        Ok(Box::new(stream))
    }

    async fn is_connected(&self) -> bool {
        crate::session::multihop::MultiHopSession::is_connected(self).await
    }
}

/// Atomic stats counters, updated with atomic reads/writes so individual
/// fields never tear, even though the set as a whole isn't jointly
/// snapshottable (spec §5).
#[derive(Default)]
pub struct ForwarderStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    accepted_connections: AtomicU64,
    active_connections: AtomicU64,
    error_count: AtomicU64,
    started_at_millis: AtomicU64,
    last_activity_millis: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ForwarderStatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub accepted_connections: u64,
    pub active_connections: u64,
    pub error_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ForwarderStats {
    pub fn new() -> Arc<Self> {
        let stats = Arc::new(ForwarderStats::default());
        stats.mark_started();
        stats
    }

    fn mark_started(&self) {
        self.started_at_millis
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn touch_activity(&self) {
        self.last_activity_millis
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        self.touch_activity();
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        self.touch_activity();
    }

    pub fn incr_accepted(&self) {
        self.accepted_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_active(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_active(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn incr_errors(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ForwarderStatsSnapshot {
        ForwarderStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            accepted_connections: self.accepted_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            started_at: millis_to_datetime(self.started_at_millis.load(Ordering::Relaxed)),
            last_activity: millis_to_datetime(self.last_activity_millis.load(Ordering::Relaxed)),
        }
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn millis_to_datetime(millis: u64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
}

/// Lifecycle contract shared by Local/Remote/Dynamic forwarders.
#[async_trait::async_trait]
pub trait Forwarder: Send + Sync {
    /// Starts accepting connections. Returns the bound local port, if any
    /// (ephemeral ports are resolved here and written back to the spec).
    async fn start(&self) -> Result<u16>;

    /// Exactly-once: closes the listener, cancels the forwarder's context,
    /// then waits for active connections to drain with a 10s cap.
    async fn stop(&self) -> Result<()>;

    fn stats(&self) -> ForwarderStatsSnapshot;
}

pub const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

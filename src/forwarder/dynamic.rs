//! Local SOCKS5 listener; destination chosen per-client (spec §4.7).
//!
//! No pack example implements SOCKS5; built directly from the spec's
//! byte-level prescription, which the spec's own design notes (§9) call "the
//! safe interpretation" of the ambiguous original reader. Lifecycle
//! (listener bind, accept loop, stats, exactly-once stop) mirrors
//! `LocalForwarder`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::cancel::CancelSource;

use super::{AsyncDuplex, Forwarder, ForwarderStats, ForwarderStatsSnapshot, SessionDialer, DRAIN_TIMEOUT};

const SOCKS5_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

pub struct DynamicForwarder {
    bind_addr: String,
    local_port: u16,
    dialer: Arc<dyn SessionDialer>,
    stats: Arc<ForwarderStats>,
    cancel: CancelSource,
    listener_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl DynamicForwarder {
    pub fn new(
        bind_addr: String,
        local_port: u16,
        dialer: Arc<dyn SessionDialer>,
        cancel: CancelSource,
    ) -> Arc<Self> {
        Arc::new(DynamicForwarder {
            bind_addr,
            local_port,
            dialer,
            stats: ForwarderStats::new(),
            cancel,
            listener_handle: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl Forwarder for DynamicForwarder {
    async fn start(&self) -> Result<u16> {
        let addr = format!("{}:{}", self.bind_addr, self.local_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind SOCKS5 listener on {addr}"))?;
        let bound_port = listener.local_addr()?.port();

        let dialer = Arc::clone(&self.dialer);
        let stats = Arc::clone(&self.stats);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    result = listener.accept() => result,
                    _ = cancel.cancelled() => break,
                };

                let (stream, _peer) = match accepted {
                    Ok(conn) => conn,
                    Err(_) if cancel.is_cancelled() => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "dynamic forwarder accept error");
                        stats.incr_errors();
                        continue;
                    }
                };

                stats.incr_accepted();
                let dialer = Arc::clone(&dialer);
                let stats = Arc::clone(&stats);

                tokio::spawn(async move {
                    stats.incr_active();
                    if let Err(e) = serve_socks5_connection(stream, &*dialer, &stats).await {
                        tracing::debug!(error = %e, "socks5 connection ended with error");
                        stats.incr_errors();
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
        Ok(())
    }

    fn stats(&self) -> ForwarderStatsSnapshot {
        self.stats.snapshot()
    }
}

async fn serve_socks5_connection(
    mut stream: tokio::net::TcpStream,
    dialer: &dyn SessionDialer,
    stats: &ForwarderStats,
) -> Result<()> {
    read_greeting(&mut stream).await?;
    stream.write_all(&[SOCKS5_VERSION, REPLY_SUCCESS]).await?;

    let target = match read_request(&mut stream).await? {
        RequestOutcome::Connect(address) => address,
        RequestOutcome::UnsupportedCommand => {
            send_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Ok(());
        }
        RequestOutcome::UnsupportedAddressType => {
            send_reply(&mut stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Ok(());
        }
    };

    if !dialer.is_connected().await {
        send_reply(&mut stream, REPLY_HOST_UNREACHABLE).await?;
        return Ok(());
    }

    let mut channel_stream = match dialer.dial(target).await {
        Ok(s) => s,
        Err(_) => {
            send_reply(&mut stream, REPLY_HOST_UNREACHABLE).await?;
            return Ok(());
        }
    };

    send_reply(&mut stream, REPLY_SUCCESS).await?;

    match tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await {
        Ok((sent, received)) => {
            stats.add_bytes_sent(sent);
            stats.add_bytes_received(received);
        }
        Err(e) => {
            tracing::debug!(error = %e, "socks5 copy ended");
        }
    }

    Ok(())
}

async fn send_reply(stream: &mut tokio::net::TcpStream, code: u8) -> Result<()> {
    stream
        .write_all(&[SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
        .context("failed to write SOCKS5 reply")
}

/// Reads `VER | NMETHODS | METHODS...` in full before any further reads, to
/// avoid partial-frame parsing bugs (spec §4.7, §9).
async fn read_greeting(stream: &mut tokio::net::TcpStream) -> Result<()> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.context("failed to read SOCKS5 greeting header")?;
    if header[0] != SOCKS5_VERSION {
        anyhow::bail!("unsupported SOCKS version {}", header[0]);
    }
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await.context("failed to read SOCKS5 methods")?;
    Ok(())
}

enum RequestOutcome {
    Connect((String, u16)),
    UnsupportedCommand,
    UnsupportedAddressType,
}

/// Reads the request header, then the address, then the port, as separate
/// sized reads (the spec's prescribed safe interpretation).
async fn read_request(stream: &mut tokio::net::TcpStream) -> Result<RequestOutcome> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.context("failed to read SOCKS5 request header")?;
    let [version, cmd, _rsv, atyp] = header;

    if version != SOCKS5_VERSION {
        anyhow::bail!("unsupported SOCKS version {version}");
    }
    if cmd != CMD_CONNECT {
        return Ok(RequestOutcome::UnsupportedCommand);
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.context("failed to read IPv4 address")?;
            IpAddr::V4(Ipv4Addr::from(buf)).to_string()
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await.context("failed to read domain length")?;
            let mut buf = vec![0u8; len_buf[0] as usize];
            stream.read_exact(&mut buf).await.context("failed to read domain")?;
            String::from_utf8(buf).context("domain is not valid UTF-8")?
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await.context("failed to read IPv6 address")?;
            IpAddr::V6(Ipv6Addr::from(buf)).to_string()
        }
        _ => return Ok(RequestOutcome::UnsupportedAddressType),
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await.context("failed to read port")?;
    let port = u16::from_be_bytes(port_buf);

    Ok(RequestOutcome::Connect((host, port)))
}

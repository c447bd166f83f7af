//! `russh::client::Handler` wired to a [`HostKeyVerifier`](crate::auth::HostKeyVerifier).
//!
//! Grounded on the teacher's `SshoreHandler` (`ssh/client.rs`), generalized
//! from "always accept" to dispatching through the hop's configured
//! verification mode, and carrying a `RemoteForwardMap` the way the teacher's
//! tunnel-session handler does for `-R` support (spec §4.6).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use russh::client;
use russh::keys::PublicKey;

use crate::auth::HostKeyVerifier;

/// Maps a bound remote address to the local target it should be paired with,
/// populated when `RemoteForwarder` issues `tcpip-forward`.
pub type RemoteForwardMap = Arc<Mutex<HashMap<(String, u32), (String, u32)>>>;

pub struct SessionHandler {
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
    pub remote_forwards: RemoteForwardMap,
}

impl SessionHandler {
    pub fn for_host(host: impl Into<String>, port: u16, verifier: HostKeyVerifier) -> Self {
        SessionHandler {
            host: host.into(),
            port,
            verifier,
            remote_forwards: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl client::Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.verifier.check(&self.host, self.port, server_public_key)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let target = self
            .remote_forwards
            .lock()
            .expect("remote_forwards mutex poisoned")
            .get(&(connected_address.to_string(), connected_port))
            .cloned();

        let Some((local_host, local_port)) = target else {
            tracing::warn!(
                connected_address,
                connected_port,
                "forwarded-tcpip with no matching tcpip-forward registration"
            );
            channel.close().await.ok();
            return Ok(());
        };

        let stream = match tokio::net::TcpStream::connect((local_host.as_str(), local_port as u16)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(local_host, local_port, error = %e, "failed to dial local forward target");
                channel.close().await.ok();
                return Ok(());
            }
        };

        let _ = session;
        tokio::spawn(async move {
            let mut channel_stream = channel.into_stream();
            let mut stream = stream;
            if let Err(e) = tokio::io::copy_bidirectional(&mut channel_stream, &mut stream).await {
                tracing::debug!(error = %e, "remote-forward stream closed");
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_host_starts_with_empty_forward_map() {
        let handler = SessionHandler::for_host("example.com", 22, HostKeyVerifier::Insecure);
        assert!(handler.remote_forwards.lock().unwrap().is_empty());
    }
}

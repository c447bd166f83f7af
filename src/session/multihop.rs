//! Chains N ≥ 1 `Session`s, each hop dialed through the previous one
//! (spec §4.3).

use std::sync::Arc;

use anyhow::{Context, Result, bail};

use super::Session;

/// A connection chain: hop 0 is dialed directly, hop i (i > 0) is dialed
/// through hop i-1's `dial`.
pub struct MultiHopSession {
    hops: Vec<Arc<Session>>,
}

impl MultiHopSession {
    pub fn new(hops: Vec<Arc<Session>>) -> Result<Self> {
        if hops.is_empty() {
            bail!("MultiHopSession requires at least one hop");
        }
        Ok(MultiHopSession { hops })
    }

    /// Connects hop 0 directly; for each subsequent hop, dials through the
    /// previous hop to obtain a stream and hands it to the next hop's
    /// `connect_over_conn`. Partial failure: sessions already opened are
    /// closed before returning the error.
    pub async fn connect(&self) -> Result<()> {
        let mut opened: Vec<&Arc<Session>> = Vec::new();

        if let Err(e) = self.hops[0].connect().await {
            return Err(e.context("failed to connect first hop"));
        }
        opened.push(&self.hops[0]);

        for i in 1..self.hops.len() {
            let previous = &self.hops[i - 1];
            let next = &self.hops[i];

            let dial_result = previous
                .dial((next.hop_host().to_string(), next.hop_port()))
                .await
                .with_context(|| format!("failed to dial hop {i} through previous hop"));

            let stream = match dial_result {
                Ok(s) => s,
                Err(e) => {
                    self.close_opened(&opened).await;
                    return Err(e);
                }
            };

            if let Err(e) = next.connect_over_conn(stream).await {
                self.close_opened(&opened).await;
                return Err(e.context(format!("failed to connect hop {i}")));
            }
            opened.push(next);
        }

        Ok(())
    }

    async fn close_opened(&self, opened: &[&Arc<Session>]) {
        for session in opened {
            session.close().await;
        }
    }

    /// Connects with exponential backoff, delegating to each hop's own
    /// `connect_with_retry` for the first hop only — subsequent hops ride on
    /// the first hop's retry loop restarting the whole chain on failure.
    pub async fn connect_with_retry(&self) -> Result<()> {
        self.hops[0]
            .connect_with_retry()
            .await
            .context("failed to connect first hop with retry")?;

        for i in 1..self.hops.len() {
            let previous = &self.hops[i - 1];
            let next = &self.hops[i];
            let stream = previous
                .dial((next.hop_host().to_string(), next.hop_port()))
                .await
                .with_context(|| format!("failed to dial hop {i} through previous hop"))?;
            next.connect_over_conn(stream)
                .await
                .with_context(|| format!("failed to connect hop {i}"))?;
        }

        Ok(())
    }

    /// Delegates to the last hop in the chain.
    pub async fn dial(&self, address: (String, u16)) -> Result<russh::ChannelStream<russh::client::Msg>> {
        self.hops
            .last()
            .expect("MultiHopSession always has at least one hop")
            .dial(address)
            .await
    }

    pub async fn is_connected(&self) -> bool {
        self.hops.last().expect("non-empty").is_connected().await
    }

    /// Narrow capability exposing only the last hop's SSH client, so
    /// `RemoteForwarder` doesn't need to reach through the internal slice
    /// (spec §9 design notes).
    pub fn last_hop_client(&self) -> Option<Arc<russh::client::Handle<super::handler::SessionHandler>>> {
        self.hops.last().and_then(|h| h.last_hop_client())
    }

    pub fn remote_forwards(&self) -> Option<super::handler::RemoteForwardMap> {
        self.hops.last().and_then(|h| h.remote_forwards())
    }

    /// Closes each session in order, joining any per-hop errors into one.
    pub async fn close(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        for session in &self.hops {
            session.close().await;
        }
        if errors.is_empty() {
            Ok(())
        } else {
            bail!("errors closing multi-hop chain: {}", errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Authenticator, MultiAuthenticator};
    use crate::model::{AuthMethod, Hop, HostKeyMode};
    use crate::session::SessionConfig;

    fn hop(host: &str, port: u16) -> Hop {
        Hop {
            host: host.to_string(),
            port,
            user: "root".to_string(),
            auth_method: AuthMethod::Password,
            key_ref: None,
            host_key_mode: HostKeyMode::Insecure,
        }
    }

    fn session(host: &str, port: u16) -> Arc<Session> {
        let auth = MultiAuthenticator::new(vec![Authenticator::Password {
            password: "x".to_string(),
        }]);
        Session::new(hop(host, port), auth, SessionConfig::default(), None, None)
    }

    #[test]
    fn test_empty_hops_rejected() {
        assert!(MultiHopSession::new(vec![]).is_err());
    }

    #[tokio::test]
    async fn test_single_hop_not_connected_initially() {
        let chain = MultiHopSession::new(vec![session("127.0.0.1", 1)]).unwrap();
        assert!(!chain.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_first_hop_failure_leaves_chain_disconnected() {
        let mut config = SessionConfig::default();
        config.dial_timeout = std::time::Duration::from_millis(50);
        let auth = MultiAuthenticator::new(vec![Authenticator::Password {
            password: "x".to_string(),
        }]);
        let first = Session::new(hop("127.0.0.1", 1), auth, config, None, None);
        let chain = MultiHopSession::new(vec![first]).unwrap();
        assert!(chain.connect().await.is_err());
        assert!(!chain.is_connected().await);
    }
}

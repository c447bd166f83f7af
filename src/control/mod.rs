//! Newline-delimited JSON-over-TCP control interface (spec §6).
//!
//! No teacher module exposes a network control surface — `sshore` is driven
//! entirely by its own CLI/TUI process. Grounded on the teacher's
//! `run_daemon_loop` (the one place the teacher runs a persistent background
//! loop driven by external signals) for the accept-loop/per-connection-task
//! shape, generalized to a request/response protocol instead of a single
//! fixed action.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::cancel::CancelSource;
use crate::error::ErrorPayload;
use crate::manager::Manager;
use crate::model::TunnelSpec;

/// One control-protocol request (spec §6). `id` is echoed back on the
/// response so callers can pipeline requests over one connection.
#[derive(Debug, Deserialize)]
struct Request {
    id: serde_json::Value,
    #[serde(flatten)]
    body: RequestBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum RequestBody {
    CreateTunnel { spec: TunnelSpec },
    ListTunnels,
    GetTunnel { tunnel_id: String },
    GetTunnelStatus { tunnel_id: String },
    GetTunnelMetrics { tunnel_id: String },
    StartTunnel { tunnel_id: String },
    StopTunnel { tunnel_id: String },
    DeleteTunnel { tunnel_id: String },
    Health,
}

#[derive(Debug, Serialize)]
struct Response {
    id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorPayload>,
}

impl Response {
    fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        Response { id, result: Some(result), error: None }
    }

    fn err(id: serde_json::Value, error: &crate::error::TunnelError) -> Self {
        Response { id, result: None, error: Some(error.into()) }
    }
}

/// Handle returned by `ControlServer::spawn`, used to shut the listener down.
pub struct ControlHandle {
    cancel: CancelSource,
    join: tokio::task::JoinHandle<()>,
    local_addr: std::net::SocketAddr,
}

impl ControlHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join.await.ok();
    }

    /// The address actually bound — differs from the requested one when
    /// `listen_address` asks for an ephemeral port (`:0`).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

pub struct ControlServer;

impl ControlServer {
    /// Binds `listen_address` and serves control requests until cancelled.
    pub async fn spawn(listen_address: &str, manager: Arc<Manager>) -> Result<ControlHandle> {
        let listener = TcpListener::bind(listen_address)
            .await
            .with_context(|| format!("failed to bind control listener on {listen_address}"))?;
        let local_addr = listener.local_addr().context("failed to read bound control address")?;
        tracing::info!(address = %local_addr, "control interface listening");

        let cancel = CancelSource::new();
        let loop_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    result = listener.accept() => result,
                    _ = loop_cancel.cancelled() => break,
                };
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "control listener accept error");
                        continue;
                    }
                };
                tracing::debug!(%peer, "control connection accepted");
                let manager = Arc::clone(&manager);
                let mut updates = manager.subscribe();
                let conn_cancel = loop_cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, manager, &mut updates, conn_cancel).await {
                        tracing::debug!(error = %e, "control connection ended with error");
                    }
                });
            }
        });

        Ok(ControlHandle { cancel, join, local_addr })
    }
}

async fn serve_connection(
    stream: TcpStream,
    manager: Arc<Manager>,
    updates: &mut tokio::sync::broadcast::Receiver<crate::manager::TunnelUpdate>,
    cancel: CancelSource,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read control connection")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&line, &manager).await;
                let mut payload = serde_json::to_vec(&response).context("failed to serialize response")?;
                payload.push(b'\n');
                write_half.write_all(&payload).await.context("failed to write control response")?;
            }
            update = updates.recv() => {
                match update {
                    Ok(update) => {
                        let mut payload = serde_json::to_vec(&update).context("failed to serialize push update")?;
                        payload.push(b'\n');
                        if write_half.write_all(&payload).await.is_err() {
                            break;
                        }
                    }
                    // A slow subscriber dropped messages; resubscribe and move on
                    // rather than tearing down the connection.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    Ok(())
}

async fn handle_line(line: &str, manager: &Arc<Manager>) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return Response {
                id: serde_json::Value::Null,
                result: None,
                error: Some(ErrorPayload {
                    code: "malformed_request".to_string(),
                    message: e.to_string(),
                    issues: Vec::new(),
                }),
            };
        }
    };

    let id = request.id;
    match dispatch(request.body, manager).await {
        Ok(value) => Response::ok(id, value),
        Err(e) => Response::err(id, &e),
    }
}

async fn dispatch(body: RequestBody, manager: &Arc<Manager>) -> Result<serde_json::Value, crate::error::TunnelError> {
    use crate::error::TunnelError;

    match body {
        RequestBody::CreateTunnel { spec } => {
            manager.create(spec).await?;
            Ok(serde_json::json!({"accepted": true}))
        }
        RequestBody::ListTunnels => {
            let tunnels = manager.list().await;
            let rendered: Vec<_> = tunnels
                .into_iter()
                .map(|(spec, status)| serde_json::json!({"spec": spec, "status": status}))
                .collect();
            Ok(serde_json::json!(rendered))
        }
        RequestBody::GetTunnel { tunnel_id } => {
            let spec = manager.get_spec(&tunnel_id).await?;
            serde_json::to_value(spec).map_err(|e| TunnelError::Internal(e.to_string()))
        }
        RequestBody::GetTunnelStatus { tunnel_id } => {
            let status = manager.get_status(&tunnel_id).await?;
            serde_json::to_value(status).map_err(|e| TunnelError::Internal(e.to_string()))
        }
        RequestBody::GetTunnelMetrics { tunnel_id } => {
            let metrics = manager.get_metrics(&tunnel_id).await?;
            Ok(serde_json::json!({
                "bytesSent": metrics.bytes_sent,
                "bytesReceived": metrics.bytes_received,
                "acceptedConnections": metrics.accepted_connections,
                "activeConnections": metrics.active_connections,
                "errorCount": metrics.error_count,
                "startedAt": metrics.started_at,
                "lastActivity": metrics.last_activity,
            }))
        }
        RequestBody::StartTunnel { tunnel_id } => {
            manager.start(&tunnel_id).await?;
            Ok(serde_json::json!({"accepted": true}))
        }
        RequestBody::StopTunnel { tunnel_id } => {
            manager.stop(&tunnel_id).await?;
            Ok(serde_json::json!({"stopped": true}))
        }
        RequestBody::DeleteTunnel { tunnel_id } => {
            manager.delete(&tunnel_id).await?;
            Ok(serde_json::json!({"deleted": true}))
        }
        RequestBody::Health => {
            let (total, active, failed) = manager.health().await;
            Ok(serde_json::json!({"total": total, "active": active, "failed": failed}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_shutdown_on_ephemeral_port() {
        let manager = Manager::new(None);
        let handle = ControlServer::spawn("127.0.0.1:0", Arc::clone(&manager))
            .await
            .unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_response() {
        let manager = Manager::new(None);
        let response = handle_line("not json", &manager).await;
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn test_health_dispatch() {
        let manager = Manager::new(None);
        let response = handle_line(r#"{"id":1,"action":"health"}"#, &manager).await;
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["total"], 0);
    }

    #[tokio::test]
    async fn test_unknown_tunnel_id_surfaces_not_found_error() {
        let manager = Manager::new(None);
        let response = handle_line(
            r#"{"id":1,"action":"get_tunnel_status","tunnel_id":"missing"}"#,
            &manager,
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, "not_found");
    }
}

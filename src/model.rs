//! Declarative data model (spec §3): `TunnelSpec`, `Hop`, `TunnelStatus`.
//!
//! Mirrors the teacher's `Bookmark`/`ForwardSpec` shape — plain serde structs
//! with a validation function alongside, not a builder or newtype per field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TunnelError, ValidationIssue};

const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '`', '(', ')', '{', '}', '<', '>', '\n', '\r', '$',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Local,
    Remote,
    Dynamic,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Local => "local",
            TunnelType::Remote => "remote",
            TunnelType::Dynamic => "dynamic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Key,
    Password,
    Agent,
    Cert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyMode {
    Strict,
    KnownHosts,
    Insecure,
}

/// One SSH server in a connection chain. Immutable after tunnel creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub key_ref: Option<String>,
    #[serde(default = "default_host_key_mode")]
    pub host_key_mode: HostKeyMode,
}

fn default_host_key_mode() -> HostKeyMode {
    HostKeyMode::KnownHosts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Pending,
    Active,
    Failed,
    Stopped,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Pending => "pending",
            TunnelState::Active => "active",
            TunnelState::Failed => "failed",
            TunnelState::Stopped => "stopped",
        }
    }
}

/// The declarative record a caller submits to `Manager::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub id: String,
    pub name: String,
    pub owner: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub hops: Vec<Hop>,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default = "default_bind_address")]
    pub local_bind_address: String,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

/// Live state of one tunnel, mutated only by the owning Manager code-path
/// under the tunnel's lock (spec §3, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub tunnel_id: String,
    pub state: TunnelState,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retry_count: u32,
    /// The OS-chosen port once a local/dynamic listener (or remote-forward
    /// grant) has actually bound; differs from `TunnelSpec.local_port` when
    /// that field was 0 (ephemeral).
    #[serde(default)]
    pub bound_port: Option<u16>,
}

impl TunnelStatus {
    pub fn pending(tunnel_id: impl Into<String>) -> Self {
        TunnelStatus {
            tunnel_id: tunnel_id.into(),
            state: TunnelState::Pending,
            connected_at: None,
            last_error: None,
            bytes_sent: 0,
            bytes_received: 0,
            retry_count: 0,
            bound_port: None,
        }
    }
}

fn validate_hostname(field: &str, value: &str, issues: &mut Vec<ValidationIssue>) {
    if value.is_empty() {
        issues.push(ValidationIssue {
            field: field.to_string(),
            issue: "must not be empty".to_string(),
        });
        return;
    }
    if value.contains(SHELL_METACHARACTERS) {
        issues.push(ValidationIssue {
            field: field.to_string(),
            issue: "contains disallowed shell metacharacters".to_string(),
        });
    }
}

fn validate_port(field: &str, port: u16, allow_zero: bool, issues: &mut Vec<ValidationIssue>) {
    if port == 0 && !allow_zero {
        issues.push(ValidationIssue {
            field: field.to_string(),
            issue: "must be in 1..=65535".to_string(),
        });
    }
}

/// Validates a spec against spec §7.1 (ports, non-empty hops, hostnames).
pub fn validate_spec(spec: &TunnelSpec) -> Result<(), TunnelError> {
    let mut issues = Vec::new();

    if spec.id.is_empty() {
        issues.push(ValidationIssue {
            field: "id".to_string(),
            issue: "must not be empty".to_string(),
        });
    }
    if spec.name.is_empty() {
        issues.push(ValidationIssue {
            field: "name".to_string(),
            issue: "must not be empty".to_string(),
        });
    }
    if spec.hops.is_empty() {
        issues.push(ValidationIssue {
            field: "hops".to_string(),
            issue: "must contain at least one hop".to_string(),
        });
    }

    validate_port("local_port", spec.local_port, true, &mut issues);
    validate_hostname(
        "local_bind_address",
        &spec.local_bind_address,
        &mut issues,
    );
    validate_hostname("remote_host", &spec.remote_host, &mut issues);
    validate_port("remote_port", spec.remote_port, false, &mut issues);

    for (i, hop) in spec.hops.iter().enumerate() {
        validate_hostname(&format!("hops[{i}].host"), &hop.host, &mut issues);
        validate_port(&format!("hops[{i}].port"), hop.port, false, &mut issues);
        if hop.user.is_empty() {
            issues.push(ValidationIssue {
                field: format!("hops[{i}].user"),
                issue: "must not be empty".to_string(),
            });
        }
        if matches!(hop.auth_method, AuthMethod::Key | AuthMethod::Cert) && hop.key_ref.is_none() {
            issues.push(ValidationIssue {
                field: format!("hops[{i}].key_ref"),
                issue: "required for key/cert authentication".to_string(),
            });
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(TunnelError::validation(issues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hop() -> Hop {
        Hop {
            host: "example.com".to_string(),
            port: 22,
            user: "root".to_string(),
            auth_method: AuthMethod::Key,
            key_ref: Some("~/.ssh/id_ed25519".to_string()),
            host_key_mode: HostKeyMode::KnownHosts,
        }
    }

    fn sample_spec() -> TunnelSpec {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        TunnelSpec {
            id: "t1".to_string(),
            name: "my-tunnel".to_string(),
            owner: "alice".to_string(),
            tunnel_type: TunnelType::Local,
            hops: vec![sample_hop()],
            local_port: 0,
            local_bind_address: "127.0.0.1".to_string(),
            remote_host: "127.0.0.1".to_string(),
            remote_port: 8080,
            auto_reconnect: true,
            keep_alive_interval_secs: 30,
            max_retries: 5,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(validate_spec(&sample_spec()).is_ok());
    }

    #[test]
    fn test_local_port_zero_is_allowed() {
        let spec = sample_spec();
        assert_eq!(spec.local_port, 0);
        assert!(validate_spec(&spec).is_ok());
    }

    #[test]
    fn test_remote_port_zero_rejected() {
        let mut spec = sample_spec();
        spec.remote_port = 0;
        let err = validate_spec(&spec).unwrap_err();
        match err {
            TunnelError::Validation(issues) => {
                assert!(issues.iter().any(|i| i.field == "remote_port"));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn test_empty_hops_rejected() {
        let mut spec = sample_spec();
        spec.hops.clear();
        let err = validate_spec(&spec).unwrap_err();
        match err {
            TunnelError::Validation(issues) => {
                assert!(issues.iter().any(|i| i.field == "hops"));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn test_shell_metacharacters_rejected() {
        let mut spec = sample_spec();
        spec.remote_host = "evil.com; rm -rf /".to_string();
        let err = validate_spec(&spec).unwrap_err();
        match err {
            TunnelError::Validation(issues) => {
                assert!(issues.iter().any(|i| i.field == "remote_host"));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn test_key_auth_requires_key_ref() {
        let mut spec = sample_spec();
        spec.hops[0].key_ref = None;
        let err = validate_spec(&spec).unwrap_err();
        match err {
            TunnelError::Validation(issues) => {
                assert!(issues.iter().any(|i| i.field == "hops[0].key_ref"));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn test_tunnel_status_pending_has_no_connected_at() {
        let status = TunnelStatus::pending("t1");
        assert_eq!(status.state, TunnelState::Pending);
        assert!(status.connected_at.is_none());
    }
}

//! Service configuration (spec §6 configuration table), loaded the way the
//! teacher's `config::load_from`/`AppConfig` does: XDG path with override,
//! atomic write via a temp file + rename, defaults composed from
//! `#[serde(default = "...")]` functions.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default)]
    pub auth_secret: Option<String>,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_jwt_lifetime_secs")]
    pub jwt_lifetime_secs: u64,
}

fn default_listen_address() -> String {
    "127.0.0.1:7022".to_string()
}

fn default_storage_path() -> PathBuf {
    data_dir().join("tunnels.db")
}

fn default_jwt_lifetime_secs() -> u64 {
    3600
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshtunneld")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            listen_address: default_listen_address(),
            storage_path: default_storage_path(),
            auth_secret: None,
            tls_cert: None,
            tls_key: None,
            debug: false,
            jwt_lifetime_secs: default_jwt_lifetime_secs(),
        }
    }
}

/// Return the XDG-compliant config file path: `~/.config/sshtunneld/config.toml`.
pub fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
    config_dir.join("sshtunneld").join("config.toml")
}

/// Load config with an optional custom path override. Priority:
/// custom_path → XDG default. Creates a default file if none exists.
pub fn load_with_override(custom_path: Option<&str>) -> Result<ServiceConfig> {
    let path = resolve_config_path(custom_path);
    load_from(&path)
}

pub fn save_with_override(config: &ServiceConfig, custom_path: Option<&str>) -> Result<()> {
    let path = resolve_config_path(custom_path);
    save_to(config, &path)
}

fn resolve_config_path(custom_path: Option<&str>) -> PathBuf {
    match custom_path {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => config_path(),
    }
}

pub fn load_from(path: &Path) -> Result<ServiceConfig> {
    if !path.exists() {
        let config = ServiceConfig::default();
        save_to(&config, path)?;
        return Ok(config);
    }

    check_permissions(path);

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: ServiceConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(config)
}

pub fn save_to(config: &ServiceConfig, path: &Path) -> Result<()> {
    atomic_write(config, path)
}

/// Serialize to TOML and write via a temp file in the same directory,
/// then rename into place, with 0600 permissions on unix.
fn atomic_write(config: &ServiceConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config).context("failed to serialize config")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .context("failed to create temp file for config write")?;

    use std::io::Write;
    tmp.write_all(content.as_bytes())
        .context("failed to write config content")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .context("failed to set config file permissions")?;
    }

    tmp.persist(path)
        .with_context(|| format!("failed to persist config file to {}", path.display()))?;

    Ok(())
}

#[cfg(unix)]
fn check_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = fs::metadata(path) {
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o600 {
            tracing::warn!(path = %path.display(), mode = format!("{mode:o}"), "config file has unexpected permissions");
        }
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_expected_listen_address() {
        let config = ServiceConfig::default();
        assert_eq!(config.listen_address, "127.0.0.1:7022");
        assert!(!config.debug);
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = ServiceConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: ServiceConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.listen_address, config.listen_address);
        assert_eq!(parsed.jwt_lifetime_secs, config.jwt_lifetime_secs);
    }

    #[test]
    fn test_load_from_missing_path_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = load_from(&path).unwrap();
        assert_eq!(config.listen_address, default_listen_address());
        assert!(path.exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_saved_file_has_0600_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        save_to(&ServiceConfig::default(), &path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = ServiceConfig::default();
        config.debug = true;
        config.listen_address = "0.0.0.0:9000".to_string();
        save_to(&config, &path).unwrap();
        let loaded = load_from(&path).unwrap();
        assert!(loaded.debug);
        assert_eq!(loaded.listen_address, "0.0.0.0:9000");
    }
}

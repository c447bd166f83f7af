//! Authentication material and host-key verification for one hop (spec §4.1).
//!
//! Grounded on the teacher's `ssh::load_keys`/`load_key_from_path`/
//! `authenticate` (key-then-password sequencing) and `ssh::known_hosts`
//! (hashed/plain known_hosts matching), generalized from "one interactive
//! session" to "one `Hop`'s declared `AuthMethod`".

pub mod known_hosts;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use russh::client::AuthResult;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};

use crate::model::{Hop, HostKeyMode};

use known_hosts::HostKeyStatus;

/// One piece of authentication material, produced from a `Hop`'s declared
/// `AuthMethod` (spec §4.1: Key / Agent / Password / Certificate).
pub enum Credential {
    PublicKey(PrivateKeyWithHashAlg),
    Password(String),
}

/// Produces authentication material for one hop. Each variant corresponds to
/// one of the four `AuthMethod`s in the data model.
pub enum Authenticator {
    /// Private-key file (`~` expanded), optionally passphrase-protected.
    Key { path: PathBuf, passphrase: Option<String> },
    /// Agent socket, from an explicit path or `SSH_AUTH_SOCK`.
    Agent { socket_path: Option<PathBuf> },
    /// Static password credential.
    Password { password: String },
    /// OpenSSH user certificate plus its matching private key.
    Certificate { cert_path: PathBuf, key_path: PathBuf, passphrase: Option<String> },
}

impl Authenticator {
    /// Build an authenticator for a hop from its declared `key_ref`/auth method.
    /// `key_ref` doubles as the private-key path (Key), the cert path
    /// (Certificate, paired with `<cert_path>` minus `-cert.pub` as the key
    /// path), the agent socket path (Agent), or is unused (Password, which
    /// reads its credential from `password` instead).
    pub fn for_hop(hop: &Hop, password: Option<String>) -> Result<Authenticator> {
        use crate::model::AuthMethod;
        match hop.auth_method {
            AuthMethod::Key => {
                let key_ref = hop
                    .key_ref
                    .as_ref()
                    .context("Key authentication requires key_ref")?;
                Ok(Authenticator::Key {
                    path: expand_path(key_ref),
                    passphrase: None,
                })
            }
            AuthMethod::Agent => Ok(Authenticator::Agent {
                socket_path: hop.key_ref.as_ref().map(|p| expand_path(p)),
            }),
            AuthMethod::Password => {
                let password = password.context("Password authentication requires a password")?;
                Ok(Authenticator::Password { password })
            }
            AuthMethod::Cert => {
                let cert_ref = hop
                    .key_ref
                    .as_ref()
                    .context("Cert authentication requires key_ref")?;
                let cert_path = expand_path(cert_ref);
                let key_path = PathBuf::from(
                    cert_path
                        .to_string_lossy()
                        .trim_end_matches("-cert.pub")
                        .to_string(),
                );
                Ok(Authenticator::Certificate {
                    cert_path,
                    key_path,
                    passphrase: None,
                })
            }
        }
    }

    /// Produce the credential this authenticator represents. Failure modes
    /// (missing key file, malformed key, agent unreachable) are reported with
    /// the offending path — never silently skipped.
    pub fn produce(&self) -> Result<Credential> {
        match self {
            Authenticator::Key { path, passphrase } => {
                let key = load_private_key(path, passphrase.as_deref())?;
                Ok(Credential::PublicKey(PrivateKeyWithHashAlg::new(
                    Arc::new(key),
                    None,
                )))
            }
            Authenticator::Agent { socket_path } => {
                // Agent signer material is only resolvable at authenticate() time
                // against a live `russh::keys::agent` connection; we surface the
                // socket path here and let the caller bind it during auth.
                let path = socket_path
                    .clone()
                    .or_else(|| std::env::var("SSH_AUTH_SOCK").ok().map(PathBuf::from))
                    .context("no SSH agent socket available (set SSH_AUTH_SOCK or key_ref)")?;
                if !path.exists() {
                    bail!("SSH agent socket not found: {}", path.display());
                }
                bail!("agent authentication requires a live agent connection, not a static credential");
            }
            Authenticator::Password { password } => Ok(Credential::Password(password.clone())),
            Authenticator::Certificate {
                cert_path,
                key_path,
                passphrase,
            } => {
                if !cert_path.exists() {
                    bail!("certificate file not found: {}", cert_path.display());
                }
                let key = load_private_key(key_path, passphrase.as_deref())?;
                Ok(Credential::PublicKey(PrivateKeyWithHashAlg::new(
                    Arc::new(key),
                    None,
                )))
            }
        }
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).to_string())
}

fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<russh::keys::PrivateKey> {
    if !path.exists() {
        bail!("private key file not found: {}", path.display());
    }
    russh::keys::load_secret_key(path, passphrase)
        .with_context(|| format!("failed to load SSH key: {}", path.display()))
}

/// Sequences several authenticators; drops ones that fail to produce
/// material and fails only if none succeed (spec §4.1).
pub struct MultiAuthenticator {
    authenticators: Vec<Authenticator>,
}

impl MultiAuthenticator {
    pub fn new(authenticators: Vec<Authenticator>) -> Self {
        MultiAuthenticator { authenticators }
    }

    /// Try `authenticate_publickey`/`authenticate_password` with each
    /// authenticator's credential in order, returning on the first success.
    pub async fn authenticate<H: russh::client::Handler>(
        &self,
        session: &mut russh::client::Handle<H>,
        user: &str,
    ) -> Result<()> {
        let mut last_err: Option<anyhow::Error> = None;
        let mut tried_any = false;

        for authenticator in &self.authenticators {
            let credential = match authenticator.produce() {
                Ok(c) => c,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            tried_any = true;

            let result = match credential {
                Credential::PublicKey(key) => session.authenticate_publickey(user, key).await,
                Credential::Password(password) => {
                    session.authenticate_password(user, password).await
                }
            };

            match result {
                Ok(AuthResult::Success) => return Ok(()),
                Ok(AuthResult::Failure { .. }) => continue,
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        if !tried_any {
            bail!(
                "no authenticator produced usable credentials: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default()
            );
        }
        bail!("authentication failed: no authenticator succeeded");
    }
}

/// Host-key-verification strategy, separate from the ability to authenticate
/// (spec §4.1): accept-any, or verify against known_hosts, optionally falling
/// back to insecure only if the caller explicitly opted in.
#[derive(Debug, Clone, Copy)]
pub enum HostKeyVerifier {
    /// Accept any server key. Insecure; used only when a `Hop` requests it.
    Insecure,
    /// Verify against `~/.ssh/known_hosts`; refuse unknown or changed hosts.
    Strict,
    /// Verify against known_hosts; refuse changed hosts, but accept (and
    /// record) unknown hosts — trust-on-first-use.
    KnownHosts,
}

impl HostKeyVerifier {
    pub fn from_mode(mode: HostKeyMode) -> Self {
        match mode {
            HostKeyMode::Strict => HostKeyVerifier::Strict,
            HostKeyMode::KnownHosts => HostKeyVerifier::KnownHosts,
            HostKeyMode::Insecure => HostKeyVerifier::Insecure,
        }
    }

    /// Check a server's host key, returning `Ok(true)` to proceed with the
    /// handshake. Strict mode refuses unknown hosts; Insecure never refuses.
    pub fn check(&self, hostname: &str, port: u16, server_key: &PublicKey) -> Result<bool> {
        match self {
            HostKeyVerifier::Insecure => Ok(true),
            HostKeyVerifier::Strict => match known_hosts::check_host_key(hostname, port, server_key)? {
                HostKeyStatus::Known => Ok(true),
                HostKeyStatus::Unknown { fingerprint, key_type } => {
                    bail!("unknown host key for {hostname}:{port} ({key_type} {fingerprint}), strict mode refuses unknown hosts")
                }
                HostKeyStatus::Changed { fingerprint_new, known_hosts_line } => {
                    bail!("host key for {hostname}:{port} changed (new fingerprint {fingerprint_new}), known_hosts line {known_hosts_line}")
                }
            },
            HostKeyVerifier::KnownHosts => match known_hosts::check_host_key(hostname, port, server_key)? {
                HostKeyStatus::Known => Ok(true),
                HostKeyStatus::Unknown { .. } => {
                    known_hosts::add_host_key(hostname, port, server_key)?;
                    Ok(true)
                }
                HostKeyStatus::Changed { fingerprint_new, known_hosts_line } => {
                    bail!("host key for {hostname}:{port} changed (new fingerprint {fingerprint_new}), known_hosts line {known_hosts_line}")
                }
            },
        }
    }
}

//! Config loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::crypto::CipherKind;
use crate::error::{ProxyError, Result};

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    1080
}

fn default_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub acl: AclConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_local_address")]
    pub local_address: String,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Idle/connect timeout, seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub fast_open: bool,
    #[serde(default)]
    pub reuse_port: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// `"host:port"` relay entries, tried in random order per
    /// connection.
    #[serde(default)]
    pub servers: Vec<String>,
    /// A local pluggable transport listening on `127.0.0.1:<port>`;
    /// when set it replaces `servers` as the sole remote.
    #[serde(default)]
    pub plugin_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CryptoConfig {
    pub method: String,
    #[serde(default)]
    pub password: String,
    /// Hex master key; bypasses the password KDF.
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AclConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Resolve domain destinations locally so IP rules can reclassify
    /// them. Off means "remote DNS": names always go to the relay.
    #[serde(default = "default_true")]
    pub resolve_names: bool,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            path: None,
            resolve_names: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Bind outgoing sockets to this interface.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub mptcp: bool,
    #[serde(default)]
    pub ipv6_first: bool,
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<ProxyConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&text).map_err(|e| ProxyError::Config(format!("{e}")))
    }

    pub fn validate(&self) -> Result<()> {
        let kind: CipherKind = self.crypto.method.parse()?;
        if self.crypto.password.is_empty() && self.crypto.key.is_none() {
            return Err(ProxyError::Config(
                "either crypto.password or crypto.key is required".into(),
            ));
        }
        if let Some(key) = &self.crypto.key {
            crate::crypto::kdf::parse_raw_key(key, kind.key_len())?;
        }
        if self.remote.servers.is_empty() && self.remote.plugin_port.is_none() {
            return Err(ProxyError::Config(
                "remote.servers must list at least one relay".into(),
            ));
        }
        for entry in &self.remote.servers {
            split_host_port(entry)?;
        }
        if self.server.timeout_secs == 0 {
            return Err(ProxyError::Config("server.timeout_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }
}

/// Split `host:port`, honoring a bracketed IPv6 host.
pub fn split_host_port(entry: &str) -> Result<(String, u16)> {
    let bad = || ProxyError::Config(format!("invalid remote entry: {entry}"));
    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
        let port = tail.strip_prefix(':').ok_or_else(bad)?;
        return Ok((host.to_string(), port.parse().map_err(|_| bad())?));
    }
    let (host, port) = entry.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() {
        return Err(bad());
    }
    Ok((host.to_string(), port.parse().map_err(|_| bad())?))
}

//! Switch configuration.
//!
//! Loaded from `<conf_dir>/switch.json` with one file per tenant under
//! `<conf_dir>/network/`. Missing files fall back to defaults;
//! malformed JSON is a startup error. The admin bearer token lives in
//! `<conf_dir>/token` and is generated on first start.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use lanlink_proto::control::RouteEntry;

use crate::error::{Result, SwitchError};

/// Default session read/write deadline, seconds.
pub const DEFAULT_TIMEOUT: u64 = 300;

/// Default bridge MTU, including the Ethernet header.
pub const DEFAULT_MTU: u32 = 1518;

const DEFAULT_LISTEN: &str = "0.0.0.0:10002";

/// Carrier for endpoint connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    /// Mirror ring events to this file when set.
    pub file: Option<String>,
    /// Numeric verbosity, higher is quieter (10 debug, 20 info,
    /// 30 warn, 40 error).
    pub level: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub name: String,
    pub provider: String,
    pub mtu: u32,
    /// CIDR assigned to the bridge interface itself, if any.
    pub address: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider: "linux".into(),
            mtu: DEFAULT_MTU,
            address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SubnetConfig {
    pub start: String,
    pub end: String,
    pub netmask: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub username: String,
    pub password: String,
}

/// One tenant: an isolated broadcast domain.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: String,
    pub bridge: BridgeConfig,
    pub subnet: SubnetConfig,
    pub routes: Vec<RouteEntry>,
    pub password: Vec<CredentialConfig>,
}

impl NetworkConfig {
    fn normalize(&mut self) {
        if self.bridge.name.is_empty() {
            self.bridge.name = format!("br-{}", self.name);
        }
        if self.bridge.provider.is_empty() {
            self.bridge.provider = "linux".into();
        }
        if self.bridge.mtu == 0 {
            self.bridge.mtu = DEFAULT_MTU;
        }
    }

    /// Credential table keyed by username.
    pub fn credentials(&self) -> HashMap<String, String> {
        self.password
            .iter()
            .map(|c| (c.username.clone(), c.password.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub alias: String,
    pub protocol: Protocol,
    pub listen: String,
    /// Session deadline, seconds.
    pub timeout: u64,
    pub log: LogConfig,
    pub admin: Option<AdminConfig>,
    pub crypt: Option<CryptConfig>,
    #[serde(skip)]
    pub networks: Vec<NetworkConfig>,
    #[serde(skip)]
    pub conf_dir: PathBuf,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            alias: String::new(),
            protocol: Protocol::Tcp,
            listen: DEFAULT_LISTEN.into(),
            timeout: DEFAULT_TIMEOUT,
            log: LogConfig::default(),
            admin: None,
            crypt: None,
            networks: Vec::new(),
            conf_dir: PathBuf::new(),
        }
    }
}

impl SwitchConfig {
    /// Load `switch.json` and every tenant file under `network/`.
    pub fn load(conf_dir: &Path) -> Result<Self> {
        let main = conf_dir.join("switch.json");
        let mut cfg: SwitchConfig = if main.exists() {
            let text = fs::read_to_string(&main)?;
            serde_json::from_str(&text)
                .map_err(|e| SwitchError::Config(format!("{}: {e}", main.display())))?
        } else {
            debug!(path = %main.display(), "no switch.json, using defaults");
            SwitchConfig::default()
        };
        cfg.conf_dir = conf_dir.to_path_buf();

        let network_dir = conf_dir.join("network");
        if network_dir.is_dir() {
            let mut paths: Vec<PathBuf> = fs::read_dir(&network_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|e| e == "json"))
                .collect();
            paths.sort();
            for path in paths {
                let text = fs::read_to_string(&path)?;
                let network: NetworkConfig = serde_json::from_str(&text)
                    .map_err(|e| SwitchError::Config(format!("{}: {e}", path.display())))?;
                cfg.networks.push(network);
            }
        }

        cfg.normalize();
        Ok(cfg)
    }

    pub fn normalize(&mut self) {
        if self.alias.is_empty() {
            self.alias = std::env::var("HOSTNAME").unwrap_or_else(|_| "lanlink".into());
        }
        if self.listen.is_empty() {
            self.listen = DEFAULT_LISTEN.into();
        }
        if self.timeout == 0 {
            self.timeout = DEFAULT_TIMEOUT;
        }
        for network in &mut self.networks {
            network.normalize();
        }
    }

    pub fn token_file(&self) -> PathBuf {
        self.conf_dir.join("token")
    }

    /// Read the admin bearer token, generating one on first use.
    pub fn load_or_create_token(&self) -> Result<String> {
        let path = self.token_file();
        if path.exists() {
            let token = fs::read_to_string(&path)?;
            return Ok(token.trim().to_string());
        }
        let token = Uuid::new_v4().simple().to_string();
        fs::write(&path, &token)?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_dir_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SwitchConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.listen, DEFAULT_LISTEN);
        assert_eq!(cfg.timeout, DEFAULT_TIMEOUT);
        assert_eq!(cfg.protocol, Protocol::Tcp);
        assert!(cfg.networks.is_empty());
        assert!(!cfg.alias.is_empty());
    }

    #[test]
    fn test_load_switch_and_networks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("switch.json"),
            r#"{"alias":"sw1","listen":"0.0.0.0:9999","timeout":60,"protocol":"udp"}"#,
        )
        .unwrap();
        fs::create_dir(dir.path().join("network")).unwrap();
        fs::write(
            dir.path().join("network/private.json"),
            r#"{
                "name": "private",
                "subnet": {"start": "10.1.1.2", "end": "10.1.1.20", "netmask": "255.255.255.0"},
                "password": [{"username": "alice", "password": "secret"}],
                "routes": [{"prefix": "192.168.0.0/24", "nexthop": "10.1.1.1"}]
            }"#,
        )
        .unwrap();

        let cfg = SwitchConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.alias, "sw1");
        assert_eq!(cfg.timeout, 60);
        assert_eq!(cfg.protocol, Protocol::Udp);
        assert_eq!(cfg.networks.len(), 1);
        let net = &cfg.networks[0];
        assert_eq!(net.bridge.name, "br-private");
        assert_eq!(net.bridge.mtu, DEFAULT_MTU);
        assert_eq!(net.credentials().get("alice").unwrap(), "secret");
        assert_eq!(net.routes[0].prefix, "192.168.0.0/24");
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("switch.json"), "{not json").unwrap();
        assert!(matches!(
            SwitchConfig::load(dir.path()),
            Err(SwitchError::Config(_))
        ));
    }

    #[test]
    fn test_token_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SwitchConfig::load(dir.path()).unwrap();
        let first = cfg.load_or_create_token().unwrap();
        let second = cfg.load_or_create_token().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }
}

// Process configuration shared by every mode.
//
// Flags take `--key value` form; any flag can also come from the
// environment as HIVEDB_<KEY> (flags win). A single config struct is parsed
// once in main and threaded into whichever roles the mode starts.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};

/// Process role selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    ControlPlane,
    TenantNode,
    Gateway,
    AllInOne,
}

impl FromStr for Mode {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "control-plane" => Ok(Mode::ControlPlane),
            "tenant-node" => Ok(Mode::TenantNode),
            "gateway" => Ok(Mode::Gateway),
            "all-in-one" => Ok(Mode::AllInOne),
            other => Err(PlatformError::Configuration(format!(
                "unknown mode '{}', expected control-plane|tenant-node|gateway|all-in-one",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::ControlPlane => "control-plane",
            Mode::TenantNode => "tenant-node",
            Mode::Gateway => "gateway",
            Mode::AllInOne => "all-in-one",
        };
        write!(f, "{}", s)
    }
}

/// Object-store credentials and location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Knobs for the external log-shipping replicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LitestreamConfig {
    pub enabled: bool,
    pub sync_interval_secs: u64,
    pub retention_hours: u64,
}

impl Default for LitestreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_secs: 1,
            retention_hours: 72,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub mode: Mode,
    /// Identity within the node pool (control plane or worker).
    pub node_id: String,
    /// Seed peer list `host:port,...` for replication; empty means
    /// single-peer mode.
    pub raft_peers: Vec<String>,
    /// Local bind for the replication transport.
    pub raft_bind_addr: String,
    /// Bind for the control plane's request/reply IPC listener.
    pub ipc_bind_addr: String,
    /// Local storage root.
    pub data_dir: PathBuf,
    /// Known control-plane IPC addresses; any may be contacted.
    pub control_plane_addrs: Vec<String>,
    /// Worker cache capacity in weighted units.
    pub max_tenants: u32,
    /// Address this worker advertises to the control plane.
    pub node_address: String,
    /// HTTP bind for the gateway listener / worker request endpoint.
    pub http_bind_addr: String,
    pub s3: S3Config,
    pub litestream: LitestreamConfig,
    /// Secret key for session and SSO tokens.
    pub jwt_secret: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            mode: Mode::AllInOne,
            node_id: "node-1".to_string(),
            raft_peers: Vec::new(),
            raft_bind_addr: "127.0.0.1:7000".to_string(),
            ipc_bind_addr: "127.0.0.1:8090".to_string(),
            data_dir: PathBuf::from("./data"),
            control_plane_addrs: vec!["127.0.0.1:8090".to_string()],
            max_tenants: 1000,
            node_address: "http://127.0.0.1:8091".to_string(),
            http_bind_addr: "127.0.0.1:8080".to_string(),
            s3: S3Config::default(),
            litestream: LitestreamConfig::default(),
            jwt_secret: String::new(),
        }
    }
}

impl PlatformConfig {
    /// Parse from CLI args (without the binary name), with environment
    /// fallback for every flag.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut cfg = Self::default();

        let mut get = |key: &str| -> Option<String> {
            let flag = format!("--{}", key);
            if let Some(pos) = args.iter().position(|a| a == &flag) {
                return args.get(pos + 1).cloned();
            }
            let env_key = format!("HIVEDB_{}", key.replace('-', "_").to_uppercase());
            std::env::var(env_key).ok()
        };

        if let Some(v) = get("mode") {
            cfg.mode = v.parse()?;
        }
        if let Some(v) = get("node-id") {
            cfg.node_id = v;
        }
        if let Some(v) = get("raft-peers") {
            cfg.raft_peers = split_list(&v);
        }
        if let Some(v) = get("raft-bind-addr") {
            cfg.raft_bind_addr = v;
        }
        if let Some(v) = get("ipc-bind-addr") {
            cfg.ipc_bind_addr = v;
        }
        if let Some(v) = get("data-dir") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("control-plane-addrs") {
            cfg.control_plane_addrs = split_list(&v);
        }
        if let Some(v) = get("max-tenants") {
            cfg.max_tenants = v
                .parse()
                .map_err(|_| PlatformError::Configuration(format!("bad max-tenants '{}'", v)))?;
        }
        if let Some(v) = get("node-address") {
            cfg.node_address = v;
        }
        if let Some(v) = get("http-bind-addr") {
            cfg.http_bind_addr = v;
        }
        if let Some(v) = get("s3-endpoint") {
            cfg.s3.endpoint = v;
        }
        if let Some(v) = get("s3-region") {
            cfg.s3.region = v;
        }
        if let Some(v) = get("s3-bucket") {
            cfg.s3.bucket = v;
        }
        if let Some(v) = get("s3-access-key") {
            cfg.s3.access_key = v;
        }
        if let Some(v) = get("s3-secret-key") {
            cfg.s3.secret_key = v;
        }
        if let Some(v) = get("litestream-enabled") {
            cfg.litestream.enabled = v == "true" || v == "1";
        }
        if let Some(v) = get("litestream-sync") {
            cfg.litestream.sync_interval_secs = v.parse().map_err(|_| {
                PlatformError::Configuration(format!("bad litestream-sync '{}'", v))
            })?;
        }
        if let Some(v) = get("litestream-retention") {
            cfg.litestream.retention_hours = v.parse().map_err(|_| {
                PlatformError::Configuration(format!("bad litestream-retention '{}'", v))
            })?;
        }
        if let Some(v) = get("jwt-secret") {
            cfg.jwt_secret = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(PlatformError::Configuration("node-id is required".into()));
        }
        if self.max_tenants == 0 {
            return Err(PlatformError::Configuration(
                "max-tenants must be positive".into(),
            ));
        }
        match self.mode {
            Mode::TenantNode | Mode::Gateway => {
                if self.control_plane_addrs.is_empty() {
                    return Err(PlatformError::Configuration(
                        "control-plane-addrs is required for this mode".into(),
                    ));
                }
            }
            _ => {}
        }
        if !self.raft_peers.is_empty() && !self.raft_peers.contains(&self.raft_bind_addr) {
            // A peer set that excludes the local bind cannot elect this node.
            return Err(PlatformError::Configuration(format!(
                "raft-peers must include raft-bind-addr {}",
                self.raft_bind_addr
            )));
        }
        Ok(())
    }

    /// True when no replication peers are configured; commands apply
    /// directly and synchronously.
    pub fn single_peer(&self) -> bool {
        self.raft_peers.is_empty()
    }

    /// The worker binds the socket behind its advertised address.
    pub fn worker_bind_addr(&self) -> &str {
        self.node_address
            .strip_prefix("http://")
            .or_else(|| self.node_address.strip_prefix("https://"))
            .unwrap_or(&self.node_address)
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_mode_and_peers() {
        let cfg = PlatformConfig::from_args(&args(&[
            "--mode",
            "control-plane",
            "--node-id",
            "cp-1",
            "--raft-bind-addr",
            "10.0.0.1:7000",
            "--raft-peers",
            "10.0.0.1:7000,10.0.0.2:7000,10.0.0.3:7000",
        ]))
        .unwrap();
        assert_eq!(cfg.mode, Mode::ControlPlane);
        assert_eq!(cfg.raft_peers.len(), 3);
        assert!(!cfg.single_peer());
    }

    #[test]
    fn test_empty_peers_is_single_peer_mode() {
        let cfg = PlatformConfig::from_args(&args(&["--mode", "control-plane"])).unwrap();
        assert!(cfg.single_peer());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = PlatformConfig::from_args(&args(&["--mode", "sidecar"])).unwrap_err();
        assert!(matches!(err, PlatformError::Configuration(_)));
    }

    #[test]
    fn test_peer_list_must_contain_bind_addr() {
        let err = PlatformConfig::from_args(&args(&[
            "--mode",
            "control-plane",
            "--raft-bind-addr",
            "10.0.0.9:7000",
            "--raft-peers",
            "10.0.0.1:7000,10.0.0.2:7000",
        ]))
        .unwrap_err();
        assert!(matches!(err, PlatformError::Configuration(_)));
    }
}

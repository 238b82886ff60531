use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::load_policies;
use crate::session::SessionConfig;
use crate::types::{Credentials, PortRange};

pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub asn: String,
    /// Executable run to restart the AS after links changed.
    pub as_config_script: PathBuf,
    /// Seconds between reconciliation passes.
    pub as_config_delay: u64,
    /// Update queue depth above which a warning is logged.
    pub backlog_warn: usize,
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub coord: String,
    pub client_name: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_file: Option<PathBuf>,
    pub policies: PathBuf,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceConfig {
    pub vlan: String,
    pub ip: String,
    pub first_port: u16,
    pub last_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            asn: String::new(),
            as_config_script: PathBuf::from("./restart-as.sh"),
            as_config_delay: 5,
            backlog_warn: 8,
            connections: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("COORD_CLIENT_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        for conn in &mut config.connections {
            if let Some(ref secret_file) = conn.secret_file {
                conn.secret = std::fs::read_to_string(secret_file)
                    .map_err(|e| {
                        anyhow::anyhow!(
                            "Failed to read secret file {}: {}",
                            secret_file.display(),
                            e
                        )
                    })?
                    .trim()
                    .to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.asn.is_empty() {
            anyhow::bail!("Invalid configuration: `asn` is required");
        }
        if self.as_config_delay == 0 {
            anyhow::bail!("Invalid configuration: `asConfigDelay` must be positive");
        }
        if self.connections.is_empty() {
            anyhow::bail!("Invalid configuration: no coordinator connections");
        }
        for conn in &self.connections {
            for iface in &conn.interfaces {
                if iface.first_port > iface.last_port {
                    anyhow::bail!(
                        "Invalid port range {}-{} on VLAN {} of {}",
                        iface.first_port,
                        iface.last_port,
                        iface.vlan,
                        conn.client_name
                    );
                }
            }
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.as_config_delay)
    }

    /// Builds one session configuration per connection, loading its
    /// policy file.
    pub fn sessions(&self) -> anyhow::Result<Vec<SessionConfig>> {
        self.connections
            .iter()
            .map(|conn| -> anyhow::Result<SessionConfig> {
                Ok(SessionConfig {
                    address: conn.coord.clone(),
                    credentials: Credentials {
                        asn: self.asn.clone(),
                        client: conn.client_name.clone(),
                        token: conn.secret.clone(),
                    },
                    interfaces: conn
                        .interfaces
                        .iter()
                        .map(|iface| PortRange {
                            interface_vlan: iface.vlan.clone(),
                            interface_ip: iface.ip.clone(),
                            first_port: iface.first_port.into(),
                            last_port: iface.last_port.into(),
                        })
                        .collect(),
                    policies: load_policies(&conn.policies)?,
                    backlog_warn: self.backlog_warn,
                })
            })
            .collect()
    }
}

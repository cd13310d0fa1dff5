//! Configuration module for flexblock.

use crate::error::{FlexError, Result};
use crate::types::{Capability, NodeId, PoolId, DEFAULT_COPIES, GB};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Minimum recommended length of the shared token secret.
pub const MIN_SECRET_LENGTH: usize = 32;

/// Main configuration for a flexblock process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlexConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Metadata manager configuration.
    #[serde(default)]
    pub mdm: MdmConfig,
    /// Storage node configuration.
    #[serde(default)]
    pub sds: SdsConfig,
    /// Client node configuration.
    #[serde(default)]
    pub sdc: SdcConfig,
    /// Shared secrets.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Network configuration.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl FlexConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlexError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| FlexError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(FlexError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Node ID 0 is reserved for internal rebuild traffic".to_string(),
            });
        }

        if self.security.token_secret.is_empty() {
            return Err(FlexError::InvalidConfig {
                field: "security.token_secret".to_string(),
                reason: "Token secret must not be empty".to_string(),
            });
        }

        if self.node.role == NodeRole::Mdm {
            if self.mdm.default_copies == 0 {
                return Err(FlexError::InvalidConfig {
                    field: "mdm.default_copies".to_string(),
                    reason: "At least one copy is required".to_string(),
                });
            }
            if self.mdm.heartbeat_stale_after <= self.mdm.sweep_interval {
                return Err(FlexError::InvalidConfig {
                    field: "mdm.heartbeat_stale_after".to_string(),
                    reason: "Stale threshold must exceed the sweep interval".to_string(),
                });
            }
            if self.mdm.io_timeout_threshold == 0 {
                return Err(FlexError::InvalidConfig {
                    field: "mdm.io_timeout_threshold".to_string(),
                    reason: "Threshold must be non-zero".to_string(),
                });
            }
        }

        if self.node.role == NodeRole::Sds {
            if self.sds.capacity == 0 {
                return Err(FlexError::InvalidConfig {
                    field: "sds.capacity".to_string(),
                    reason: "Storage node capacity must be non-zero".to_string(),
                });
            }
            if self.sds.pool_id == 0 {
                return Err(FlexError::InvalidConfig {
                    field: "sds.pool_id".to_string(),
                    reason: "Storage node must name the pool it joins".to_string(),
                });
            }
        }

        if self.sdc.io_timeout.is_zero() {
            return Err(FlexError::InvalidConfig {
                field: "sdc.io_timeout".to_string(),
                reason: "IO timeout must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                name: "dev-mdm".to_string(),
                role: NodeRole::Mdm,
            },
            mdm: MdmConfig {
                control_addr: "127.0.0.1:6611".parse().expect("valid socket address"),
                admin_addr: "127.0.0.1:6612".parse().expect("valid socket address"),
                ..MdmConfig::default()
            },
            sds: SdsConfig {
                data_addr: "127.0.0.1:7072".parse().expect("valid socket address"),
                mdm_addr: "127.0.0.1:6611".to_string(),
                pool_id: 1,
                ..SdsConfig::default()
            },
            sdc: SdcConfig {
                mdm_addr: "127.0.0.1:6611".to_string(),
                ..SdcConfig::default()
            },
            security: SecurityConfig {
                token_secret: "development-secret-change-me-before-production".to_string(),
            },
            network: NetworkConfig::default(),
            storage: StorageConfig {
                data_dir: PathBuf::from("/tmp/flexblock/data"),
                cache_size: 64 * 1024 * 1024,
            },
            observability: ObservabilityConfig {
                metrics_enabled: false,
                ..ObservabilityConfig::default()
            },
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub id: NodeId,
    /// Human-readable node name.
    pub name: String,
    /// Process role.
    pub role: NodeRole,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: "flexblock-node".to_string(),
            role: NodeRole::Mdm,
        }
    }
}

/// Process role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Metadata manager: authority, placement, rebuild, health.
    Mdm,
    /// Storage data server.
    Sds,
    /// Storage data client.
    Sdc,
}

impl NodeRole {
    /// Capabilities advertised on registration.
    pub fn capabilities(&self) -> Vec<Capability> {
        match self {
            NodeRole::Mdm => vec![Capability::MdmEligible],
            NodeRole::Sds => vec![Capability::Sds],
            NodeRole::Sdc => vec![Capability::Sdc],
        }
    }
}

/// Metadata manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdmConfig {
    /// Control-channel listen address.
    pub control_addr: SocketAddr,
    /// Admin REST listen address.
    pub admin_addr: SocketAddr,
    /// A node silent for longer than this is declared failed.
    #[serde(with = "humantime_serde")]
    pub heartbeat_stale_after: Duration,
    /// How often staleness is checked.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Consecutive IO timeouts reported against a node before it is failed.
    pub io_timeout_threshold: u32,
    /// Rebuild progress poll interval.
    #[serde(with = "humantime_serde")]
    pub rebuild_poll_interval: Duration,
    /// Metrics aggregation tick.
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,
    /// Copies for newly created pools.
    pub default_copies: usize,
    /// Rebuild bandwidth for newly created pools, MiB/s.
    pub default_rebuild_rate_mbps: u64,
    /// Events kept in memory.
    pub event_history: usize,
}

impl Default for MdmConfig {
    fn default() -> Self {
        Self {
            control_addr: "0.0.0.0:6611".parse().expect("valid socket address"),
            admin_addr: "0.0.0.0:6612".parse().expect("valid socket address"),
            heartbeat_stale_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            io_timeout_threshold: 3,
            rebuild_poll_interval: Duration::from_millis(500),
            metrics_interval: Duration::from_secs(5),
            default_copies: DEFAULT_COPIES,
            default_rebuild_rate_mbps: 100,
            event_history: 10_000,
        }
    }
}

/// Storage node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdsConfig {
    /// Data-plane listen address.
    pub data_addr: SocketAddr,
    /// Address other processes use to reach this node; defaults to `data_addr`.
    #[serde(default)]
    pub advertise_addr: Option<String>,
    /// Metadata manager control address.
    pub mdm_addr: String,
    /// Capacity offered to the pool, in bytes.
    pub capacity: u64,
    /// Pool this node joins.
    pub pool_id: PoolId,
    /// Failure domain tag.
    #[serde(default)]
    pub fault_set: Option<String>,
    /// Heartbeat interval.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for SdsConfig {
    fn default() -> Self {
        Self {
            data_addr: "0.0.0.0:7072".parse().expect("valid socket address"),
            advertise_addr: None,
            mdm_addr: "127.0.0.1:6611".to_string(),
            capacity: 100 * GB,
            pool_id: 0,
            fault_set: None,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Client node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdcConfig {
    /// Metadata manager control address.
    pub mdm_addr: String,
    /// Heartbeat interval.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Per-replica IO timeout.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

impl Default for SdcConfig {
    fn default() -> Self {
        Self {
            mdm_addr: "127.0.0.1:6611".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            io_timeout: Duration::from_secs(2),
        }
    }
}

/// Shared secrets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Cluster-wide IO token signing key.
    pub token_secret: String,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Request timeout for control and admin calls.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for chunk data.
    pub data_dir: PathBuf,
    /// Read cache size in bytes.
    pub cache_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/flexblock/data"),
            cache_size: 256 * 1024 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: "0.0.0.0:9090".parse().expect("valid socket address"),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

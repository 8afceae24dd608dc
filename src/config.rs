//! Configuration management
//!
//! Settings are layered in this order:
//! - Built-in defaults
//! - TOML configuration file (created with defaults when missing)
//! - Environment variables prefixed with `CYSPLOIT__` (nested keys joined by `__`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// External scanner invocation and scheduling
    pub scanning: ScanningConfig,
    /// Exploitation-framework RPC endpoint
    pub rpc: RpcConfig,
    /// Console polling policy
    pub console: ConsoleConfig,
    /// Packet capture collaborator
    pub capture: CaptureConfig,
    /// HTTP surface
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanningConfig {
    /// Path or name of the network mapper binary
    pub nmap_path: String,
    pub ping_path: String,
    pub arp_path: String,
    /// Arguments of the discovery pass, target appended last
    pub discovery_args: Vec<String>,
    /// Arguments of the fast port scan, target appended last
    pub port_scan_args: Vec<String>,
    /// Arguments of OS detection, target appended last
    pub os_detection_args: Vec<String>,
    /// Lifetime of a single external invocation before it is killed
    pub command_timeout_secs: u64,
    /// Lifetime of a vulnerability script run, which probes far more than a port scan
    pub vuln_scan_timeout_secs: u64,
    /// Hosts profiled concurrently within one scan job (1 = strictly sequential)
    pub host_concurrency: usize,
    /// Synthesize hosts for the machine's own interfaces
    pub include_local_interfaces: bool,
    pub os_detection: bool,
    pub mac_lookup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Only taken from configuration when no settings entry exists
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Budget for framework scans driven through the console
    pub timeout_ms: u64,
    /// Budget for ad-hoc console commands
    pub command_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Text that marks a console scan as finished
    pub scan_markers: Vec<String>,
    /// Text that marks a module run as finished
    pub module_markers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub tcpdump_path: String,
    /// Directory receiving pcap files
    pub output_dir: PathBuf,
    /// Time allowed for the capture process to exit after SIGINT
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty, compact)
    pub format: String,
    /// Rolling log file (None for stderr only)
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Base directory for the record store
    pub data_dir: PathBuf,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            nmap_path: "nmap".to_string(),
            ping_path: "ping".to_string(),
            arp_path: "arp".to_string(),
            discovery_args: vec!["-sn".into(), "-T4".into()],
            port_scan_args: vec!["-T4".into(), "-F".into(), "--open".into()],
            os_detection_args: vec!["-O".into(), "--osscan-guess".into(), "-T4".into()],
            command_timeout_secs: 60,
            vuln_scan_timeout_secs: 900,
            host_concurrency: 1,
            include_local_interfaces: true,
            os_detection: true,
            mac_lookup: true,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 55553,
            username: "msf".to_string(),
            password: None,
            connect_timeout_secs: 10,
            call_timeout_secs: 30,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            command_timeout_ms: 15_000,
            poll_interval_ms: 500,
            scan_markers: vec!["completed".to_string()],
            module_markers: Vec::new(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            tcpdump_path: "tcpdump".to_string(),
            output_dir: PathBuf::from("./captures"),
            stop_grace_secs: 5,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:5000".to_string(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scanning: ScanningConfig::default(),
            rpc: RpcConfig::default(),
            console: ConsoleConfig::default(),
            capture: CaptureConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file with environment variable overrides
    pub async fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        info!("Loading configuration from: {}", config_path.display());

        let mut settings = config::Config::builder();
        settings = settings.add_source(config::Config::try_from(&Self::default())?);

        if config_path.exists() {
            debug!("Found configuration file, loading settings");
            settings = settings.add_source(config::File::from(config_path));
        } else {
            info!("No configuration file found, using defaults");
            Self::create_default_config(config_path).await?;
        }

        settings = settings.add_source(
            config::Environment::with_prefix("CYSPLOIT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    async fn create_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let config_content = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default configuration")?;

        tokio::fs::write(path, config_content)
            .await
            .context("Failed to write default configuration file")?;

        info!("Created default configuration file: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(anyhow::anyhow!("Invalid logging level: {}", self.logging.level)),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => return Err(anyhow::anyhow!("Invalid logging format: {}", self.logging.format)),
        }

        if self.scanning.host_concurrency == 0 {
            return Err(anyhow::anyhow!("host_concurrency must be greater than 0"));
        }

        if !(1..=600).contains(&self.scanning.command_timeout_secs) {
            return Err(anyhow::anyhow!(
                "command_timeout_secs must be between 1 and 600, got {}",
                self.scanning.command_timeout_secs
            ));
        }

        if self.scanning.vuln_scan_timeout_secs < self.scanning.command_timeout_secs {
            return Err(anyhow::anyhow!("vuln_scan_timeout_secs must not be shorter than command_timeout_secs"));
        }

        if self.console.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("console poll_interval_ms must be greater than 0"));
        }

        if self.console.timeout_ms < self.console.poll_interval_ms
            || self.console.command_timeout_ms < self.console.poll_interval_ms
        {
            return Err(anyhow::anyhow!("console timeouts must be at least one poll interval"));
        }

        if self.rpc.call_timeout_secs == 0 || self.rpc.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("rpc timeouts must be greater than 0"));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.scanning.command_timeout_secs)
    }

    pub fn vuln_scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scanning.vuln_scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.connect_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.call_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.console.poll_interval_ms)
    }
}

//! Per-host profiling
//!
//! Profiling one address is a chain of independent scanner invocations. Only the liveness
//! probe can end the chain; the port scan, OS detection and neighbor lookup each degrade to a
//! missing field when they fail.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{net::IpAddr, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    config::ScanningConfig,
    core::{DeviceType, HostDetails, HostState, NewHost, NewPort, PortState, RecordId},
    error::{ReconError, Result},
    log_host_profiled,
    parser::{self, OpenPort, VulnFinding},
    process::{CommandSpec, ProcessRunner},
};

pub const UNKNOWN_OS: &str = "Unknown";

/// Host fields and open ports assembled for one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostProfile {
    pub ip_address: IpAddr,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub os_type: String,
    pub device_type: DeviceType,
    pub open_ports: Vec<OpenPort>,
    /// Concatenated scanner output, kept for the scan job's audit trail
    #[serde(skip)]
    pub raw_output: String,
}

impl HostProfile {
    pub fn port_numbers(&self) -> Vec<u16> {
        self.open_ports.iter().map(|p| p.number).collect()
    }

    pub fn to_new_host(&self, scan_id: RecordId) -> NewHost {
        NewHost {
            scan_id,
            ip_address: self.ip_address,
            hostname: self.hostname.clone(),
            mac_address: self.mac_address.clone(),
            os_type: self.os_type.clone(),
            state: HostState::Up,
            details: HostDetails::new(self.device_type, self.port_numbers()),
        }
    }

    /// Port rows for this profile, bound to the host row the store created
    pub fn to_new_ports(&self, host_id: RecordId, scan_id: RecordId) -> Vec<NewPort> {
        self.open_ports
            .iter()
            .map(|port| {
                let (product, version) = split_product(port.product.as_deref());
                NewPort {
                    host_id: Some(host_id),
                    scan_id: Some(scan_id),
                    port_number: port.number,
                    protocol: port.protocol,
                    state: PortState::Open,
                    service: Some(port.service.clone()),
                    product,
                    version,
                }
            })
            .collect()
    }
}

/// Split version-detection text such as `OpenSSH 8.9p1 Ubuntu` into product and version
fn split_product(text: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return (None, None);
    };
    match text.split_once(' ') {
        Some((product, rest)) if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) => {
            (Some(product.to_string()), Some(rest.trim().to_string()))
        }
        _ => (Some(text.to_string()), None),
    }
}

/// Per-run overrides of the profiling invocations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileOptions {
    /// Explicit port specification replacing the fast scan's default port list
    pub ports: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VulnScanLevel {
    Basic,
    Deep,
}

impl VulnScanLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Some(Self::Basic),
            "deep" => Some(Self::Deep),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Deep => "deep",
        }
    }

    pub(crate) fn port_args(&self) -> &'static [&'static str] {
        match self {
            Self::Basic => &["-F"],
            Self::Deep => &["-p-"],
        }
    }
}

/// Raw output and findings of one vulnerability script run
#[derive(Debug, Clone, PartialEq)]
pub struct VulnProbe {
    pub command: String,
    pub raw_output: String,
    pub findings: Vec<VulnFinding>,
}

#[async_trait]
pub trait HostProfiler: Send + Sync {
    /// Profile a single address, or fail with [`ReconError::DeviceUnreachable`]
    async fn profile(&self, ip: IpAddr, options: &ProfileOptions) -> Result<HostProfile>;

    /// Run vulnerability scripts against a single address
    async fn probe_vulnerabilities(&self, ip: IpAddr, level: VulnScanLevel) -> Result<VulnProbe>;
}

/// Profiles hosts with ping, the network mapper and the neighbor table
pub struct DefaultHostProfiler {
    runner: Arc<dyn ProcessRunner>,
    config: ScanningConfig,
}

impl DefaultHostProfiler {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: ScanningConfig) -> Self {
        Self { runner, config }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    async fn is_alive(&self, ip: IpAddr) -> bool {
        let spec = CommandSpec::new(&self.config.ping_path, self.command_timeout())
            .args(["-c", "1", "-W", "1"])
            .arg(ip.to_string());
        match self.runner.run_checked(&spec).await {
            Ok(_) => true,
            Err(e) => {
                debug!(host = %ip, "Liveness probe failed: {}", e);
                false
            }
        }
    }

    async fn port_scan(&self, ip: IpAddr, options: &ProfileOptions) -> Option<String> {
        let mut spec = CommandSpec::new(&self.config.nmap_path, self.command_timeout());
        match &options.ports {
            Some(ports) => {
                spec = spec
                    .args(self.config.port_scan_args.iter().filter(|a| a.as_str() != "-F").cloned())
                    .args(["-p", ports.as_str()]);
            }
            None => spec = spec.args(self.config.port_scan_args.iter().cloned()),
        }
        let spec = spec.arg(ip.to_string());
        self.run_best_effort(&spec, ip, "port scan").await
    }

    async fn os_detection(&self, ip: IpAddr) -> Option<String> {
        let spec = CommandSpec::new(&self.config.nmap_path, self.command_timeout())
            .args(self.config.os_detection_args.iter().cloned())
            .arg(ip.to_string());
        self.run_best_effort(&spec, ip, "OS detection").await
    }

    async fn neighbor_lookup(&self, ip: IpAddr) -> Option<String> {
        let spec = CommandSpec::new(&self.config.arp_path, self.command_timeout())
            .arg("-n")
            .arg(ip.to_string());
        let output = self.run_best_effort(&spec, ip, "neighbor lookup").await?;
        parser::parse_arp_output(&output)
    }

    async fn run_best_effort(&self, spec: &CommandSpec, ip: IpAddr, step: &str) -> Option<String> {
        match self.runner.run_checked(spec).await {
            Ok(output) => Some(output.stdout),
            Err(e) => {
                warn!(host = %ip, step, "Profiling step degraded: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl HostProfiler for DefaultHostProfiler {
    async fn profile(&self, ip: IpAddr, options: &ProfileOptions) -> Result<HostProfile> {
        if !self.is_alive(ip).await {
            return Err(ReconError::unreachable(ip));
        }

        let mut raw_output = String::new();

        let ports = match self.port_scan(ip, options).await {
            Some(output) => {
                let parsed = parser::parse_profile(&output);
                raw_output.push_str(&output);
                parsed
            }
            None => parser::ProfileParse::default(),
        };

        let mut os_type = None;
        let mut scanner_mac = ports.mac_address.clone();
        if self.config.os_detection {
            if let Some(output) = self.os_detection(ip).await {
                let parsed = parser::parse_profile(&output);
                os_type = parsed.os_guess;
                scanner_mac = scanner_mac.or(parsed.mac_address);
                raw_output.push_str(&output);
            }
        }

        let mut mac_address = None;
        if self.config.mac_lookup {
            mac_address = self.neighbor_lookup(ip).await;
        }

        let port_numbers = ports.port_numbers();
        let device_type = parser::infer_device_type(&ip, &port_numbers);
        log_host_profiled!(ip, device_type, port_numbers.len());

        Ok(HostProfile {
            ip_address: ip,
            hostname: None,
            mac_address: mac_address.or(scanner_mac),
            os_type: os_type.unwrap_or_else(|| UNKNOWN_OS.to_string()),
            device_type,
            open_ports: ports.open_ports,
            raw_output,
        })
    }

    async fn probe_vulnerabilities(&self, ip: IpAddr, level: VulnScanLevel) -> Result<VulnProbe> {
        let spec = CommandSpec::new(
            &self.config.nmap_path,
            Duration::from_secs(self.config.vuln_scan_timeout_secs),
        )
        .args(["-sV", "--script", "vuln"])
        .args(level.port_args().iter().copied())
        .arg(ip.to_string());

        let output = self.runner.run_checked(&spec).await?;
        let findings = parser::parse_vuln_scripts(&output.stdout);
        debug!(host = %ip, findings = findings.len(), "Vulnerability scripts finished");

        Ok(VulnProbe {
            command: spec.display(),
            raw_output: output.stdout,
            findings,
        })
    }
}

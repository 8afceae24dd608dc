//! Core records and application wiring
//!
//! The record types mirror what the persistence collaborator stores: scan jobs, hosts,
//! ports, vulnerabilities and capture sessions. A host's identity is its IP address, but
//! every scan job appends fresh host rows instead of updating earlier ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, net::IpAddr, path::PathBuf, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    api,
    capture::CaptureManager,
    cli::{Cli, Commands, MsfAction, ScanDepth},
    config::AppConfig,
    dispatcher::{CommandDispatcher, Dispatch, Flow},
    error::{ReconError, Result},
    metasploit::{FrameworkClient, FrameworkScanKind, ModuleType},
    metrics::MetricsCollector,
    network::{InterfaceProvider, SystemInterfaces},
    persistence::{JsonFileStore, ReconStore, SettingsStore},
    process::{ProcessRunner, TokioProcessRunner},
    profiler::{DefaultHostProfiler, ProfileOptions, VulnScanLevel},
    rpc::{Connector, RpcSessionManager, TcpConnector},
    scanner::{parse_port_specification, ScanOrchestrator},
};

/// Identifier assigned by the store
pub type RecordId = u64;

/// Lifecycle of scan jobs and capture sessions; `Completed` and `Error` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJob {
    pub id: RecordId,
    pub command: String,
    pub target: String,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub raw_output: Option<String>,
    pub structured_output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Up,
    Down,
    Unknown,
}

/// Device class inferred from open ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Router,
    Server,
    Computer,
    Unknown,
    /// One of the operator's own interfaces
    #[serde(rename = "self")]
    Local,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Server => "server",
            Self::Computer => "computer",
            Self::Unknown => "unknown",
            Self::Local => "self",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDetails {
    pub device_type: DeviceType,
    pub open_ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default)]
    pub is_local_interface: bool,
}

impl HostDetails {
    pub fn new(device_type: DeviceType, open_ports: Vec<u16>) -> Self {
        Self {
            device_type,
            open_ports,
            interface: None,
            netmask: None,
            is_local_interface: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: RecordId,
    pub scan_id: RecordId,
    pub ip_address: IpAddr,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub os_type: String,
    pub state: HostState,
    pub last_seen: DateTime<Utc>,
    pub details: HostDetails,
}

/// Host row before the store assigns its identifier
#[derive(Debug, Clone, PartialEq)]
pub struct NewHost {
    pub scan_id: RecordId,
    pub ip_address: IpAddr,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub os_type: String,
    pub state: HostState,
    pub details: HostDetails,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub id: RecordId,
    pub host_id: Option<RecordId>,
    pub scan_id: Option<RecordId>,
    pub port_number: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPort {
    pub host_id: Option<RecordId>,
    pub scan_id: Option<RecordId>,
    pub port_number: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VulnerabilitySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl VulnerabilitySeverity {
    /// Map a scanner severity label; anything unrecognized becomes `Low`
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "medium" | "moderate" => Self::Medium,
            _ => Self::Low,
        }
    }

    pub fn from_cvss(score: f32) -> Self {
        if score >= 9.0 {
            Self::Critical
        } else if score >= 7.0 {
            Self::High
        } else if score >= 4.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl fmt::Display for VulnerabilitySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub id: RecordId,
    pub host_id: RecordId,
    pub port_id: Option<RecordId>,
    pub cve_id: Option<String>,
    pub severity: VulnerabilitySeverity,
    pub title: String,
    pub description: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub scan_id: Option<RecordId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewVulnerability {
    pub host_id: RecordId,
    pub port_id: Option<RecordId>,
    pub cve_id: Option<String>,
    pub severity: VulnerabilitySeverity,
    pub title: String,
    pub description: Option<String>,
    pub scan_id: Option<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSession {
    pub id: RecordId,
    pub interface: String,
    pub filter: Option<String>,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub packet_count: u64,
    pub pcap_file: Option<PathBuf>,
}

/// Result of one network scan job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub scan_job_id: RecordId,
    pub devices_found: usize,
    pub hosts: Vec<Host>,
}

/// Result of profiling a single address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceScanResult {
    pub scan_job_id: RecordId,
    pub is_online: bool,
    pub device: Option<Host>,
    pub ports: Vec<Port>,
}

/// Result of a vulnerability scan against one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnScanResult {
    pub scan_job_id: RecordId,
    pub host_id: RecordId,
    pub vulnerabilities_found: usize,
    pub vulnerabilities: Vec<Vulnerability>,
}

/// One row per address: the most recent host record for each IP, ordered by address
pub fn latest_hosts(hosts: Vec<Host>) -> Vec<Host> {
    let mut latest: BTreeMap<IpAddr, Host> = BTreeMap::new();
    for host in hosts {
        match latest.get(&host.ip_address) {
            Some(existing) if existing.id >= host.id => {}
            _ => {
                latest.insert(host.ip_address, host);
            }
        }
    }
    latest.into_values().collect()
}

/// Shared collaborators behind every surface (terminal, HTTP API, one-shot CLI)
pub struct Services {
    pub config: AppConfig,
    pub records: Arc<dyn ReconStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub interfaces: Arc<dyn InterfaceProvider>,
    pub orchestrator: ScanOrchestrator,
    pub framework: FrameworkClient,
    pub captures: CaptureManager,
    pub metrics: Arc<MetricsCollector>,
}

impl Services {
    pub fn assemble(
        config: AppConfig,
        runner: Arc<dyn ProcessRunner>,
        connector: Arc<dyn Connector>,
        store: Arc<JsonFileStore>,
        interfaces: Arc<dyn InterfaceProvider>,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let records: Arc<dyn ReconStore> = store.clone();
        let settings: Arc<dyn SettingsStore> = store;

        let profiler = Arc::new(DefaultHostProfiler::new(runner.clone(), config.scanning.clone()));
        let orchestrator = ScanOrchestrator::new(
            runner,
            profiler,
            records.clone(),
            interfaces.clone(),
            metrics.clone(),
            config.scanning.clone(),
        );

        let session = Arc::new(RpcSessionManager::new(connector, config.call_timeout(), metrics.clone()));
        let framework = FrameworkClient::new(
            session,
            settings.clone(),
            config.rpc.clone(),
            config.console.clone(),
            metrics.clone(),
        );
        let captures = CaptureManager::new(records.clone(), config.capture.clone(), metrics.clone());

        Self {
            config,
            records,
            settings,
            interfaces,
            orchestrator,
            framework,
            captures,
            metrics,
        }
    }
}

/// Main application wiring the production collaborators together
pub struct Application {
    services: Arc<Services>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = Arc::new(JsonFileStore::open(&config.persistence.data_dir).await?);
        let connector = Arc::new(TcpConnector::new(config.connect_timeout()));
        let services = Services::assemble(
            config,
            Arc::new(TokioProcessRunner::new()),
            connector,
            store,
            Arc::new(SystemInterfaces),
        );
        Ok(Self {
            services: Arc::new(services),
        })
    }

    pub fn services(&self) -> Arc<Services> {
        self.services.clone()
    }

    pub async fn run(&mut self, cli: Cli) -> Result<()> {
        info!("Starting application run");
        let services = self.services.clone();

        match cli.command {
            Commands::Serve { .. } => {
                let bind = services.config.api.bind_address.clone();
                api::serve(services, &bind).await?;
            }
            Commands::Terminal => run_terminal(services).await?,
            Commands::Scan { target, ports } => {
                if let Some(spec) = &ports {
                    parse_port_specification(spec)?;
                }
                let options = ProfileOptions { ports };
                if target.contains('/') {
                    let summary = services.orchestrator.scan_network_with(&target, &options).await?;
                    print_json(&summary)?;
                } else {
                    print_json(&services.orchestrator.scan_device_with(&target, &options).await?)?;
                }
            }
            Commands::VulnScan { target, level } => {
                let level = match level {
                    ScanDepth::Basic => VulnScanLevel::Basic,
                    ScanDepth::Deep => VulnScanLevel::Deep,
                };
                print_json(&services.orchestrator.vuln_scan(&target, level).await?)?;
            }
            Commands::Msf { action } => run_msf(&services, action).await?,
            Commands::Interfaces => print_json(&services.interfaces.interfaces()?)?,
        }

        info!("Application run completed successfully");
        Ok(())
    }
}

async fn run_msf(services: &Services, action: MsfAction) -> Result<()> {
    let framework = &services.framework;
    let cancel = cancel_on_ctrl_c();

    match action {
        MsfAction::Status => print_json(&framework.status().await?),
        MsfAction::Exec { command } => {
            let output = framework.execute_command(&command.join(" "), &cancel).await?;
            print!("{}", output.output);
            if output.timed_out {
                warn!(console_id = %output.console_id, "Command still running, output may be incomplete");
            }
            Ok(())
        }
        MsfAction::Scan { target, kind } => {
            let report = framework
                .run_scan(&target, FrameworkScanKind::from_label(&kind), &cancel)
                .await?;
            print_json(&report)
        }
        MsfAction::Sessions => print_json(&framework.list_sessions().await?),
        MsfAction::Modules { module_type } => {
            let module_type = ModuleType::from_str(&module_type)
                .ok_or_else(|| ReconError::validation("moduleType", format!("unknown module type: {}", module_type)))?;
            print_json(&framework.list_modules(module_type).await?)
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_dispatch(dispatch: &Dispatch) {
    for line in &dispatch.lines {
        println!("{}", line);
    }
}

/// Interactive loop over stdin.
///
/// Typing `exit` while a command runs cancels it; end of input cancels the running command
/// and leaves once it has returned.
pub async fn run_terminal(services: Arc<Services>) -> Result<()> {
    let dispatcher = CommandDispatcher::new(services);
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    println!("Type 'help' for available commands.");

    'session: loop {
        let Some(line) = input.next_line().await? else {
            break;
        };
        let cancel = CancellationToken::new();
        let running = dispatcher.dispatch(&line, &cancel);
        tokio::pin!(running);

        let mut exit_after = false;
        let dispatch = loop {
            tokio::select! {
                dispatch = &mut running => break dispatch,
                next = input.next_line(), if !cancel.is_cancelled() => match next? {
                    Some(typed) if typed.trim().eq_ignore_ascii_case("exit") => {
                        info!("Cancelling running command");
                        cancel.cancel();
                    }
                    Some(typed) => {
                        if !typed.trim().is_empty() {
                            println!("[!] A command is still running; type 'exit' to cancel it");
                        }
                    }
                    None => {
                        cancel.cancel();
                        exit_after = true;
                    }
                },
            }
        };

        match dispatch.flow {
            Flow::Continue => print_dispatch(&dispatch),
            Flow::Clear => {
                print!("\x1B[2J\x1B[H");
                std::io::Write::flush(&mut std::io::stdout())?;
            }
            Flow::Exit => break 'session,
        }
        if exit_after {
            break;
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_coercion() {
        assert_eq!(VulnerabilitySeverity::from_label("HIGH"), VulnerabilitySeverity::High);
        assert_eq!(VulnerabilitySeverity::from_label(" Critical "), VulnerabilitySeverity::Critical);
        assert_eq!(VulnerabilitySeverity::from_label("severe-ish"), VulnerabilitySeverity::Low);
        assert_eq!(VulnerabilitySeverity::from_label(""), VulnerabilitySeverity::Low);
    }

    #[test]
    fn test_severity_from_cvss() {
        assert_eq!(VulnerabilitySeverity::from_cvss(9.8), VulnerabilitySeverity::Critical);
        assert_eq!(VulnerabilitySeverity::from_cvss(7.5), VulnerabilitySeverity::High);
        assert_eq!(VulnerabilitySeverity::from_cvss(5.0), VulnerabilitySeverity::Medium);
        assert_eq!(VulnerabilitySeverity::from_cvss(2.1), VulnerabilitySeverity::Low);
    }

    #[test]
    fn test_device_type_serializes_self() {
        let json = serde_json::to_string(&DeviceType::Local).unwrap();
        assert_eq!(json, "\"self\"");
        let details = HostDetails::new(DeviceType::Router, vec![53]);
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["deviceType"], "router");
        assert_eq!(value["openPorts"][0], 53);
    }

    fn host(id: RecordId, ip: &str) -> Host {
        Host {
            id,
            scan_id: 1,
            ip_address: ip.parse().unwrap(),
            hostname: None,
            mac_address: None,
            os_type: "Unknown".to_string(),
            state: HostState::Up,
            last_seen: Utc::now(),
            details: HostDetails::new(DeviceType::Unknown, Vec::new()),
        }
    }

    #[test]
    fn test_latest_hosts_keeps_newest_row_per_address() {
        let rows = vec![host(1, "10.0.0.9"), host(2, "10.0.0.2"), host(5, "10.0.0.9"), host(3, "10.0.0.2")];
        let latest = latest_hosts(rows);
        let ids: Vec<_> = latest.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[tokio::test]
    async fn test_assembled_services_share_one_store() {
        use crate::{persistence::keys, process::fake::ScriptedRunner, rpc::testing::FakeFramework};

        let f = testing::services(ScriptedRunner::new(), FakeFramework::standard(), Vec::new());
        f.services.settings.set_setting(keys::METASPLOIT_HOST, "10.1.1.1").await.unwrap();
        assert_eq!(f.store.get_setting(keys::METASPLOIT_HOST).await.unwrap().as_deref(), Some("10.1.1.1"));
        assert!(f.services.records.list_hosts().await.unwrap().is_empty());
        assert_eq!(f.framework.connects(), 0);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Error.is_terminal());
    }
}

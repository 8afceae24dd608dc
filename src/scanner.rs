//! Scan orchestration
//!
//! Turns a CIDR range into persisted host and port records:
//! - a discovery pass enumerates candidate addresses
//! - each candidate is profiled, at most `host_concurrency` at a time
//! - the machine's own interfaces are recorded as `self` hosts
//!
//! A single host failing never fails the batch. Only a failed discovery pass or a store
//! failure ends the scan job in `error`.

use ipnetwork::IpNetwork;
use serde_json::json;
use std::{
    net::IpAddr,
    str::FromStr,
    sync::Arc,
    time::Instant,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
    config::ScanningConfig,
    core::{
        DeviceScanResult, DeviceType, Host, HostDetails, HostState, NewHost, NewPort,
        NewVulnerability, PortState, RecordId, ScanSummary, VulnScanResult,
    },
    error::{ReconError, Result},
    log_error_with_context, log_scan_job,
    metrics::MetricsCollector,
    network::{InterfaceProvider, LocalInterface},
    parser::{self, DiscoveredHost},
    persistence::ReconStore,
    process::{sanitize_argument, CommandSpec, ProcessRunner},
    profiler::{HostProfile, HostProfiler, ProfileOptions, VulnScanLevel, UNKNOWN_OS},
};

pub const LOCAL_OS_TYPE: &str = "Self";

/// Drives discovery, profiling and persistence for scan jobs
pub struct ScanOrchestrator {
    runner: Arc<dyn ProcessRunner>,
    profiler: Arc<dyn HostProfiler>,
    store: Arc<dyn ReconStore>,
    interfaces: Arc<dyn InterfaceProvider>,
    metrics: Arc<MetricsCollector>,
    config: ScanningConfig,
}

impl ScanOrchestrator {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        profiler: Arc<dyn HostProfiler>,
        store: Arc<dyn ReconStore>,
        interfaces: Arc<dyn InterfaceProvider>,
        metrics: Arc<MetricsCollector>,
        config: ScanningConfig,
    ) -> Self {
        Self {
            runner,
            profiler,
            store,
            interfaces,
            metrics,
            config,
        }
    }

    pub async fn scan_network(&self, cidr: &str) -> Result<ScanSummary> {
        self.scan_network_with(cidr, &ProfileOptions::default()).await
    }

    /// Discover and profile every host in `cidr`
    pub async fn scan_network_with(&self, cidr: &str, options: &ProfileOptions) -> Result<ScanSummary> {
        let target = validate_cidr(cidr)?;
        let spec = CommandSpec::new(&self.config.nmap_path, self.command_timeout())
            .args(self.config.discovery_args.iter().cloned())
            .arg(target.as_str());

        let job = self.store.create_scan_job(&spec.display(), &target).await?;
        self.metrics.record_scan_started("network");
        log_scan_job!(job.id, target, job.status);
        let started = Instant::now();

        match self.run_network_job(job.id, &spec, options).await {
            Ok((hosts, raw_output)) => {
                let structured = serde_json::to_value(&hosts)?;
                let job = self.store.complete_scan_job(job.id, raw_output, structured).await?;
                self.metrics.record_scan_completed("network", started.elapsed());
                log_scan_job!(job.id, target, job.status);
                Ok(ScanSummary {
                    scan_job_id: job.id,
                    devices_found: hosts.len(),
                    hosts,
                })
            }
            Err(e) => Err(self.fail_job(job.id, &target, "network", e).await),
        }
    }

    async fn run_network_job(
        &self,
        scan_id: RecordId,
        discovery: &CommandSpec,
        options: &ProfileOptions,
    ) -> Result<(Vec<Host>, String)> {
        let output = self.runner.run_checked(discovery).await?;
        let mut raw_output = output.stdout.clone();

        let local = if self.config.include_local_interfaces {
            self.local_interfaces()
        } else {
            Vec::new()
        };

        // Our own addresses are recorded once, as `self` hosts.
        let candidates: Vec<DiscoveredHost> = parser::parse_discovery(&output.stdout)
            .into_iter()
            .filter(|h| !local.iter().any(|l| l.ip_address == h.ip_address))
            .collect();
        info!(scan_job_id = scan_id, candidates = candidates.len(), "Discovery pass finished");

        let mut hosts = Vec::new();
        for (candidate, outcome) in self.profile_all(&candidates, options).await {
            match outcome {
                Ok(mut profile) => {
                    profile.hostname = candidate.hostname.clone();
                    raw_output.push_str(&profile.raw_output);
                    hosts.push(self.persist_profile(scan_id, &profile).await?);
                }
                Err(ReconError::DeviceUnreachable { ip }) => {
                    debug!(host = %ip, "Host did not answer, skipping");
                    self.metrics.record_host_skipped("unreachable");
                }
                Err(e) if e.is_step_local() => {
                    warn!(host = %candidate.ip_address, "Profiling failed, skipping host: {}", e);
                    self.metrics.record_host_skipped("failed");
                }
                Err(e) => {
                    log_error_with_context!(e, "host_profile");
                    self.metrics.record_host_skipped("error");
                }
            }
        }

        for iface in &local {
            hosts.push(self.persist_local(scan_id, iface).await?);
        }

        Ok((hosts, raw_output))
    }

    /// Profile candidates with at most `host_concurrency` in flight, results in discovery order
    async fn profile_all<'a>(
        &self,
        candidates: &'a [DiscoveredHost],
        options: &ProfileOptions,
    ) -> Vec<(&'a DiscoveredHost, Result<HostProfile>)> {
        let semaphore = Arc::new(Semaphore::new(self.config.host_concurrency.max(1)));

        let tasks = candidates.iter().map(|candidate| {
            let semaphore = semaphore.clone();
            let profiler = self.profiler.clone();
            async move {
                // The semaphore is never closed, so a permit is always granted.
                let _permit = semaphore.acquire().await.ok();
                let outcome = profiler.profile(candidate.ip_address, options).await;
                (candidate, outcome)
            }
        });

        futures::future::join_all(tasks).await
    }

    async fn persist_profile(&self, scan_id: RecordId, profile: &HostProfile) -> Result<Host> {
        let host = self.store.insert_host(profile.to_new_host(scan_id)).await?;
        for port in profile.to_new_ports(host.id, scan_id) {
            self.store.insert_port(port).await?;
        }
        self.metrics.record_host_profiled(profile.open_ports.len());
        Ok(host)
    }

    async fn persist_local(&self, scan_id: RecordId, iface: &LocalInterface) -> Result<Host> {
        let details = HostDetails {
            device_type: DeviceType::Local,
            open_ports: Vec::new(),
            interface: Some(iface.name.clone()),
            netmask: Some(iface.netmask.clone()),
            is_local_interface: true,
        };
        self.store
            .insert_host(NewHost {
                scan_id,
                ip_address: iface.ip_address,
                hostname: Some(iface.host_label()),
                mac_address: iface.mac_address.clone(),
                os_type: LOCAL_OS_TYPE.to_string(),
                state: HostState::Up,
                details,
            })
            .await
    }

    fn local_interfaces(&self) -> Vec<LocalInterface> {
        match self.interfaces.external_ipv4() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Could not enumerate local interfaces: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn scan_device(&self, ip_address: &str) -> Result<DeviceScanResult> {
        self.scan_device_with(ip_address, &ProfileOptions::default()).await
    }

    /// Profile one address in its own scan job
    pub async fn scan_device_with(&self, ip_address: &str, options: &ProfileOptions) -> Result<DeviceScanResult> {
        let ip = validate_ip(ip_address)?;
        let port_args = match &options.ports {
            Some(ports) => {
                parse_port_specification(ports)?;
                let mut args: Vec<String> = self
                    .config
                    .port_scan_args
                    .iter()
                    .filter(|a| a.as_str() != "-F")
                    .cloned()
                    .collect();
                args.extend(["-p".to_string(), sanitize_argument(ports)]);
                args
            }
            None => self.config.port_scan_args.clone(),
        };
        let command = format!("{} {} {}", self.config.nmap_path, port_args.join(" "), ip);
        let job = self.store.create_scan_job(&command, &ip.to_string()).await?;
        self.metrics.record_scan_started("device");
        log_scan_job!(job.id, ip, job.status);
        let started = Instant::now();

        let outcome = match self.profiler.profile(ip, options).await {
            Ok(profile) => self.persist_device(job.id, &profile).await.map(Some),
            Err(ReconError::DeviceUnreachable { .. }) => Ok(None),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(found) => {
                let (raw, device, ports) = match found {
                    Some((raw, host)) => {
                        let ports = self.store.ports_for_host(host.id).await?;
                        (raw, Some(host), ports)
                    }
                    None => (format!("{} is unreachable", ip), None, Vec::new()),
                };
                let structured = json!({ "isOnline": device.is_some(), "device": device });
                self.store.complete_scan_job(job.id, raw, structured).await?;
                self.metrics.record_scan_completed("device", started.elapsed());
                Ok(DeviceScanResult {
                    scan_job_id: job.id,
                    is_online: device.is_some(),
                    device,
                    ports,
                })
            }
            Err(e) => Err(self.fail_job(job.id, &ip.to_string(), "device", e).await),
        }
    }

    async fn persist_device(&self, scan_id: RecordId, profile: &HostProfile) -> Result<(String, Host)> {
        let host = self.persist_profile(scan_id, profile).await?;
        Ok((profile.raw_output.clone(), host))
    }

    /// Run vulnerability scripts against one address and record the findings
    pub async fn vuln_scan(&self, ip_address: &str, level: VulnScanLevel) -> Result<VulnScanResult> {
        let ip = validate_ip(ip_address)?;
        let command = format!(
            "{} -sV --script vuln {} {}",
            self.config.nmap_path,
            level.port_args().join(" "),
            ip
        );
        let job = self.store.create_scan_job(&command, &ip.to_string()).await?;
        self.metrics.record_scan_started("vuln");
        log_scan_job!(job.id, ip, job.status);
        let started = Instant::now();

        match self.run_vuln_job(job.id, ip, level).await {
            Ok((host_id, vulnerabilities, raw_output)) => {
                let structured = serde_json::to_value(&vulnerabilities)?;
                self.store.complete_scan_job(job.id, raw_output, structured).await?;
                self.metrics.record_scan_completed("vuln", started.elapsed());
                self.metrics.record_vulnerabilities(vulnerabilities.len());
                Ok(VulnScanResult {
                    scan_job_id: job.id,
                    host_id,
                    vulnerabilities_found: vulnerabilities.len(),
                    vulnerabilities,
                })
            }
            Err(e) => Err(self.fail_job(job.id, &ip.to_string(), "vuln", e).await),
        }
    }

    async fn run_vuln_job(
        &self,
        scan_id: RecordId,
        ip: IpAddr,
        level: VulnScanLevel,
    ) -> Result<(RecordId, Vec<crate::core::Vulnerability>, String)> {
        let probe = self.profiler.probe_vulnerabilities(ip, level).await?;

        let host = match self.store.latest_host_for_ip(ip).await? {
            Some(host) => host,
            None => {
                let open_ports: Vec<u16> = probe.findings.iter().filter_map(|f| f.port).collect();
                self.store
                    .insert_host(NewHost {
                        scan_id,
                        ip_address: ip,
                        hostname: None,
                        mac_address: None,
                        os_type: UNKNOWN_OS.to_string(),
                        state: HostState::Up,
                        details: HostDetails::new(parser::infer_device_type(&ip, &open_ports), open_ports),
                    })
                    .await?
            }
        };

        let mut known_ports = self.store.ports_for_host(host.id).await?;
        let mut vulnerabilities = Vec::new();
        for finding in &probe.findings {
            let port_id = match (finding.port, finding.protocol) {
                (Some(number), Some(protocol)) => {
                    let existing = known_ports
                        .iter()
                        .rev()
                        .find(|p| p.port_number == number && p.protocol == protocol)
                        .map(|p| p.id);
                    match existing {
                        Some(id) => Some(id),
                        None => {
                            let port = self
                                .store
                                .insert_port(NewPort {
                                    host_id: Some(host.id),
                                    scan_id: Some(scan_id),
                                    port_number: number,
                                    protocol,
                                    state: PortState::Open,
                                    service: None,
                                    product: None,
                                    version: None,
                                })
                                .await?;
                            let id = port.id;
                            known_ports.push(port);
                            Some(id)
                        }
                    }
                }
                _ => None,
            };

            let vulnerability = self
                .store
                .insert_vulnerability(NewVulnerability {
                    host_id: host.id,
                    port_id,
                    cve_id: finding.cve_id.clone(),
                    severity: finding.severity,
                    title: finding.title.clone(),
                    description: finding.description.clone(),
                    scan_id: Some(scan_id),
                })
                .await?;
            vulnerabilities.push(vulnerability);
        }

        Ok((host.id, vulnerabilities, probe.raw_output))
    }

    async fn fail_job(&self, scan_id: RecordId, target: &str, kind: &'static str, error: ReconError) -> ReconError {
        log_error_with_context!(error, "scan_job");
        self.metrics.record_scan_failed(kind);
        if let Err(store_error) = self.store.fail_scan_job(scan_id, &error.to_string()).await {
            warn!(scan_job_id = scan_id, "Could not mark scan job as failed: {}", store_error);
        }
        log_scan_job!(scan_id, target, crate::core::JobStatus::Error);
        ReconError::scan_job_failed(scan_id, error.to_string())
    }

    fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.command_timeout_secs)
    }
}

/// Sanitize a user-supplied range and check that it is a network or address
pub fn validate_cidr(raw: &str) -> Result<String> {
    let target = sanitize_argument(raw);
    if target.is_empty() {
        return Err(ReconError::invalid_target(raw, "target is empty"));
    }
    IpNetwork::from_str(&target)
        .map_err(|e| ReconError::invalid_target(raw, e.to_string()))?;
    Ok(target)
}

pub fn validate_ip(raw: &str) -> Result<IpAddr> {
    let target = sanitize_argument(raw);
    IpAddr::from_str(&target).map_err(|_| ReconError::invalid_target(raw, "not an IP address"))
}

/// Parse port specification string into list of ports
pub fn parse_port_specification(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();

    for part in spec.split(',').map(str::trim) {
        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = start
                .parse()
                .map_err(|_| ReconError::validation("port", format!("Invalid start port: {}", start)))?;
            let end: u16 = end
                .parse()
                .map_err(|_| ReconError::validation("port", format!("Invalid end port: {}", end)))?;

            if start == 0 || start > end {
                return Err(ReconError::validation("port_range", format!("Invalid range: {}-{}", start, end)));
            }

            ports.extend(start..=end);
        } else {
            let port: u16 = part
                .parse()
                .map_err(|_| ReconError::validation("port", format!("Invalid port: {}", part)))?;
            if port == 0 {
                return Err(ReconError::validation("port", "Port 0 is not scannable"));
            }
            ports.push(port);
        }
    }

    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::JobStatus,
        network::StaticInterfaces,
        persistence::JsonFileStore,
        process::fake::ScriptedRunner,
        profiler::DefaultHostProfiler,
    };

    const DISCOVERY: &str = "\
Starting Nmap 7.94
Nmap scan report for gateway (192.168.1.1)
Host is up (0.0010s latency).
Nmap scan report for 192.168.1.5
Host is up (0.0020s latency).
Nmap done: 256 IP addresses (2 hosts up) scanned in 2.10 seconds
";

    struct Fixture {
        orchestrator: ScanOrchestrator,
        store: Arc<JsonFileStore>,
        runner: Arc<ScriptedRunner>,
    }

    fn fixture(runner: ScriptedRunner, interfaces: Vec<LocalInterface>, concurrency: usize) -> Fixture {
        let runner = Arc::new(runner);
        let store = Arc::new(JsonFileStore::in_memory());
        let config = ScanningConfig {
            host_concurrency: concurrency,
            ..ScanningConfig::default()
        };
        let profiler = Arc::new(DefaultHostProfiler::new(runner.clone(), config.clone()));
        let orchestrator = ScanOrchestrator::new(
            runner.clone(),
            profiler,
            store.clone(),
            Arc::new(StaticInterfaces(interfaces)),
            Arc::new(MetricsCollector::new()),
            config,
        );
        Fixture { orchestrator, store, runner }
    }

    fn lan_runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .respond("nmap", &["-sn", "192.168.1.0/24"], DISCOVERY)
            .respond("ping", &["192.168.1.1"], "")
            .respond("ping", &["192.168.1.5"], "")
            .respond("nmap", &["-F", "192.168.1.1"], "53/tcp open domain\n")
            .respond("nmap", &["-F", "192.168.1.5"], "22/tcp open ssh\n80/tcp open http\n")
    }

    fn eth0() -> LocalInterface {
        LocalInterface {
            name: "eth0".to_string(),
            ip_address: "192.168.1.50".parse().unwrap(),
            netmask: "255.255.255.0".to_string(),
            mac_address: Some("02:00:00:00:00:01".to_string()),
            is_up: true,
            is_loopback: false,
        }
    }

    #[tokio::test]
    async fn test_scan_network_classifies_hosts() {
        let f = fixture(lan_runner(), vec![eth0()], 1);

        let summary = f.orchestrator.scan_network("192.168.1.0/24").await.unwrap();
        assert_eq!(summary.devices_found, 3);

        let router = &summary.hosts[0];
        assert_eq!(router.ip_address.to_string(), "192.168.1.1");
        assert_eq!(router.hostname.as_deref(), Some("gateway"));
        assert_eq!(router.details.device_type, DeviceType::Router);
        assert_eq!(router.os_type, UNKNOWN_OS);

        let server = &summary.hosts[1];
        assert_eq!(server.details.device_type, DeviceType::Server);
        assert_eq!(server.details.open_ports, vec![22, 80]);

        let own = &summary.hosts[2];
        assert_eq!(own.details.device_type, DeviceType::Local);
        assert_eq!(own.hostname.as_deref(), Some("localhost-eth0"));
        assert_eq!(own.os_type, LOCAL_OS_TYPE);

        let ports = f.store.ports_for_host(server.id).await.unwrap();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|p| p.scan_id == Some(summary.scan_job_id)));

        let job = f.store.get_scan_job(summary.scan_job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.raw_output.unwrap().contains("Nmap scan report for 192.168.1.5"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_skipped() {
        let runner = ScriptedRunner::new()
            .respond("nmap", &["-sn"], DISCOVERY)
            .fail("ping", &["192.168.1.1"], 1)
            .respond("ping", &["192.168.1.5"], "")
            .respond("nmap", &["-F", "192.168.1.5"], "22/tcp open ssh\n");
        let f = fixture(runner, vec![], 1);

        let summary = f.orchestrator.scan_network("192.168.1.0/24").await.unwrap();
        assert_eq!(summary.devices_found, 1);
        assert_eq!(summary.hosts[0].ip_address.to_string(), "192.168.1.5");
    }

    /// Profiler whose every host fails, with a step failure for .1 and an internal fault otherwise
    struct FailingProfiler;

    #[async_trait::async_trait]
    impl HostProfiler for FailingProfiler {
        async fn profile(&self, ip: IpAddr, _options: &ProfileOptions) -> Result<HostProfile> {
            if ip.to_string().ends_with(".1") {
                Err(ReconError::subprocess("nmap", "exit status 1"))
            } else {
                Err(ReconError::internal("profiler", "state lost"))
            }
        }

        async fn probe_vulnerabilities(&self, _ip: IpAddr, _level: VulnScanLevel) -> Result<crate::profiler::VulnProbe> {
            Err(ReconError::internal("profiler", "unused"))
        }
    }

    #[tokio::test]
    async fn test_failed_hosts_never_fail_the_batch() {
        let runner = Arc::new(ScriptedRunner::new().respond("nmap", &["-sn"], DISCOVERY));
        let store = Arc::new(JsonFileStore::in_memory());
        let metrics = Arc::new(MetricsCollector::new());
        let orchestrator = ScanOrchestrator::new(
            runner,
            Arc::new(FailingProfiler),
            store.clone(),
            Arc::new(StaticInterfaces(vec![])),
            metrics.clone(),
            ScanningConfig::default(),
        );

        let summary = orchestrator.scan_network("192.168.1.0/24").await.unwrap();
        assert_eq!(summary.devices_found, 0);
        assert_eq!(metrics.snapshot().hosts_skipped, 2);
        let job = store.get_scan_job(summary.scan_job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_concurrent_profiling_keeps_discovery_order() {
        let f = fixture(lan_runner(), vec![], 4);
        let summary = f.orchestrator.scan_network("192.168.1.0/24").await.unwrap();
        let ips: Vec<String> = summary.hosts.iter().map(|h| h.ip_address.to_string()).collect();
        assert_eq!(ips, vec!["192.168.1.1", "192.168.1.5"]);
    }

    #[tokio::test]
    async fn test_local_address_is_not_profiled_twice() {
        let mut local = eth0();
        local.ip_address = "192.168.1.5".parse().unwrap();
        let f = fixture(lan_runner(), vec![local], 1);

        let summary = f.orchestrator.scan_network("192.168.1.0/24").await.unwrap();
        assert_eq!(summary.devices_found, 2);
        assert!(!f
            .runner
            .calls()
            .iter()
            .any(|c| c.program == "ping" && c.args.contains(&"192.168.1.5".to_string())));
    }

    #[tokio::test]
    async fn test_discovery_failure_fails_job() {
        let f = fixture(ScriptedRunner::new().fail("nmap", &["-sn"], 2), vec![], 1);

        let error = f.orchestrator.scan_network("10.0.0.0/24").await.unwrap_err();
        let ReconError::ScanJobFailed { scan_job_id, .. } = &error else {
            panic!("expected ScanJobFailed, got {:?}", error);
        };
        let job = f.store.get_scan_job(*scan_job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_invalid_target_creates_no_job() {
        let f = fixture(ScriptedRunner::new(), vec![], 1);
        let error = f.orchestrator.scan_network("not-a-network").await.unwrap_err();
        assert!(matches!(error, ReconError::InvalidTarget { .. }));
        assert!(f.store.list_scan_jobs().await.unwrap().is_empty());
        assert!(f.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_injected_target_is_sanitized() {
        let f = fixture(ScriptedRunner::new().respond("nmap", &["-sn"], ""), vec![], 1);
        f.orchestrator.scan_network("10.0.0.0/24;reboot").await.unwrap_err();
        f.orchestrator.scan_network("10.0.0.0/24 ").await.unwrap();
        let discovery = &f.runner.calls()[0];
        assert_eq!(discovery.args.last().map(String::as_str), Some("10.0.0.0/24"));
    }

    #[tokio::test]
    async fn test_scan_device_reports_offline() {
        let f = fixture(ScriptedRunner::new().fail("ping", &[], 1), vec![], 1);
        let result = f.orchestrator.scan_device("10.0.0.9").await.unwrap();
        assert!(!result.is_online);
        assert!(result.device.is_none());
        let job = f.store.get_scan_job(result.scan_job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_scan_device_online() {
        let runner = ScriptedRunner::new()
            .respond("ping", &[], "")
            .respond("nmap", &["-F", "10.0.0.7"], "3389/tcp open ms-wbt-server\n");
        let f = fixture(runner, vec![], 1);
        let result = f.orchestrator.scan_device("10.0.0.7").await.unwrap();
        assert!(result.is_online);
        assert_eq!(result.device.unwrap().details.device_type, DeviceType::Computer);
        assert_eq!(result.ports.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_device_with_explicit_ports() {
        let runner = ScriptedRunner::new()
            .respond("ping", &[], "")
            .respond("nmap", &["-p", "22-80", "10.0.0.7"], "22/tcp open ssh\n");
        let f = fixture(runner, vec![], 1);
        let options = ProfileOptions { ports: Some("22-80".to_string()) };

        let result = f.orchestrator.scan_device_with("10.0.0.7", &options).await.unwrap();
        assert_eq!(result.ports.len(), 1);

        let port_scan = f
            .runner
            .calls()
            .into_iter()
            .find(|c| c.program == "nmap" && c.args.iter().any(|a| a == "-p"))
            .unwrap();
        assert!(!port_scan.args.iter().any(|a| a == "-F"));
        let job = f.store.get_scan_job(result.scan_job_id).await.unwrap().unwrap();
        assert!(job.command.contains("-p 22-80"), "{}", job.command);
    }

    #[tokio::test]
    async fn test_scan_device_rejects_bad_ports() {
        let f = fixture(ScriptedRunner::new(), vec![], 1);
        let options = ProfileOptions { ports: Some("80-22".to_string()) };
        let error = f.orchestrator.scan_device_with("10.0.0.7", &options).await.unwrap_err();
        assert!(matches!(error, ReconError::Validation { .. }));
        assert!(f.store.list_scan_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vuln_scan_links_findings_to_ports() {
        let script = "\
80/tcp open  http
| http-vuln-cve2021-41773:
|   VULNERABLE:
|   Apache HTTP Server Path Traversal
|     State: VULNERABLE
|     IDs:  CVE:CVE-2021-41773
|_    Risk factor: High
";
        let f = fixture(ScriptedRunner::new().respond("nmap", &["vuln"], script), vec![], 1);

        let result = f.orchestrator.vuln_scan("10.0.0.8", VulnScanLevel::Basic).await.unwrap();
        assert_eq!(result.vulnerabilities_found, 1);
        let vulnerability = &result.vulnerabilities[0];
        assert_eq!(vulnerability.host_id, result.host_id);
        assert_eq!(vulnerability.cve_id.as_deref(), Some("CVE-2021-41773"));

        let ports = f.store.ports_for_host(result.host_id).await.unwrap();
        assert_eq!(vulnerability.port_id, Some(ports[0].id));
        assert_eq!(ports[0].port_number, 80);
    }

    #[tokio::test]
    async fn test_vuln_scan_failure_marks_job() {
        let f = fixture(ScriptedRunner::new().time_out("nmap", &["vuln"]), vec![], 1);
        let error = f.orchestrator.vuln_scan("10.0.0.8", VulnScanLevel::Deep).await.unwrap_err();
        assert!(matches!(error, ReconError::ScanJobFailed { .. }));
    }

    #[test]
    fn test_parse_port_specification() {
        let ports = parse_port_specification("22,80,443").unwrap();
        assert_eq!(ports, vec![22, 80, 443]);

        let ports = parse_port_specification("1-10").unwrap();
        assert_eq!(ports, (1..=10).collect::<Vec<u16>>());

        let ports = parse_port_specification("22,80-82,443").unwrap();
        assert_eq!(ports, vec![22, 80, 81, 82, 443]);

        assert!(parse_port_specification("90-80").is_err());
        assert!(parse_port_specification("0").is_err());
        assert!(parse_port_specification("http").is_err());
    }

    #[test]
    fn test_validate_cidr() {
        assert_eq!(validate_cidr("192.168.1.0/24").unwrap(), "192.168.1.0/24");
        assert_eq!(validate_cidr("10.0.0.7").unwrap(), "10.0.0.7");
        assert!(validate_cidr("192.168.1.0/40").is_err());
        assert!(validate_cidr("").is_err());
    }
}

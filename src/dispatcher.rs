//! Terminal command grammar
//!
//! ```text
//! scan -target <ip|cidr> [-port <range>]
//! vuln-scan -target <ip> [-level basic|deep]
//! packet-capture -i <iface> [-f <filter>]
//! stop-capture -s <sessionId>
//! show devices|vulns|interfaces
//! network-map
//! msf <console command...>
//! help | clear | exit
//! ```
//!
//! Every outcome is rendered as plain text lines. Failures are lines prefixed `[-]`, never
//! errors returned to the caller.

use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    core::{latest_hosts, DeviceType, Host, RecordId, Services, VulnerabilitySeverity},
    profiler::{ProfileOptions, VulnScanLevel},
    scanner::parse_port_specification,
};

pub const HELP_TEXT: &str = "\
Available commands:
  scan [options] - Scan the network or specific devices
    -target <ip/cidr> - Target IP or CIDR range
    -port <port/range> - Port or port range to scan
  vuln-scan [options] - Scan for vulnerabilities
    -target <ip> - Target IP to scan
    -level <basic|deep> - Scan depth level
  packet-capture [options] - Capture network packets
    -i <interface> - Network interface
    -f <filter> - Packet filter
  stop-capture -s <session_id> - Stop a packet capture
  network-map - Generate network map
  show [options] - Show various information
    devices - Show detected devices
    vulns - Show vulnerabilities
    interfaces - Show network interfaces
  msf <command> - Run a command in a framework console
  clear - Clear the terminal
  help - Show this help message
  exit - Cancel the running command, or leave the terminal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Success,
    Error,
    Warning,
    Info,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalLine {
    pub kind: LineKind,
    pub text: String,
}

impl TerminalLine {
    fn new(kind: LineKind, text: impl Into<String>) -> Self {
        Self { kind, text: text.into() }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new(LineKind::Success, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(LineKind::Error, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(LineKind::Warning, text)
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(LineKind::Info, text)
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(LineKind::Plain, text)
    }
}

impl fmt::Display for TerminalLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            LineKind::Success => "[+] ",
            LineKind::Error => "[-] ",
            LineKind::Warning => "[!] ",
            LineKind::Info => "[*] ",
            LineKind::Plain => "",
        };
        write!(f, "{}{}", prefix, self.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowTarget {
    Devices,
    Vulns,
    Interfaces,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan { target: String, ports: Option<String> },
    VulnScan { target: String, level: VulnScanLevel },
    PacketCapture { interface: String, filter: Option<String> },
    StopCapture { session_id: RecordId },
    Show(ShowTarget),
    NetworkMap,
    Msf { command: String },
    Help,
    Clear,
    Exit,
}

/// What the terminal does after printing a dispatch's lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Clear,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub lines: Vec<TerminalLine>,
    pub flow: Flow,
}

impl Dispatch {
    fn lines(lines: Vec<TerminalLine>) -> Self {
        Self { lines, flow: Flow::Continue }
    }

    fn flow(flow: Flow) -> Self {
        Self { lines: Vec::new(), flow }
    }
}

/// Value following `flag`; `variadic` flags take every token up to the next flag.
///
/// A flag immediately followed by another flag has no value.
fn flag_value(args: &[&str], flag: &str, variadic: bool) -> Option<String> {
    let start = args.iter().position(|a| *a == flag)? + 1;
    let rest = args.get(start..)?;
    let is_value = |a: &&str| !a.starts_with('-') || a.len() == 1;
    let taken: Vec<&str> = if variadic {
        rest.iter().take_while(|a| is_value(*a)).copied().collect()
    } else {
        rest.first().copied().filter(is_value).into_iter().collect()
    };
    let value = taken.join(" ");
    (!value.is_empty()).then_some(value)
}

/// Parse one input line; `Ok(None)` for a blank line
pub fn parse_command(input: &str) -> std::result::Result<Option<Command>, TerminalLine> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    let Some((verb, args)) = tokens.split_first() else {
        return Ok(None);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "scan" => {
            let target = flag_value(args, "-target", false)
                .ok_or_else(|| TerminalLine::error("Error: Target is required. Use -target <ip/cidr>"))?;
            let ports = flag_value(args, "-port", false);
            if let Some(spec) = &ports {
                parse_port_specification(spec)
                    .map_err(|e| TerminalLine::error(format!("Error: Invalid port specification: {}", e)))?;
            }
            Command::Scan { target, ports }
        }
        "vuln-scan" => {
            let target = flag_value(args, "-target", false)
                .ok_or_else(|| TerminalLine::error("Error: Target is required. Use -target <ip>"))?;
            let level = match flag_value(args, "-level", false) {
                Some(raw) => VulnScanLevel::from_str(&raw).ok_or_else(|| {
                    TerminalLine::error("Error: Level must be basic or deep. Use -level <basic|deep>")
                })?,
                None => VulnScanLevel::Basic,
            };
            Command::VulnScan { target, level }
        }
        "packet-capture" => {
            let interface = flag_value(args, "-i", false)
                .ok_or_else(|| TerminalLine::error("Error: Interface is required. Use -i <interface>"))?;
            let filter = flag_value(args, "-f", true);
            Command::PacketCapture { interface, filter }
        }
        "stop-capture" => {
            let session_id = flag_value(args, "-s", false)
                .and_then(|raw| raw.parse::<RecordId>().ok())
                .filter(|id| *id > 0)
                .ok_or_else(|| TerminalLine::error("Error: Session ID is required. Use -s <session_id>"))?;
            Command::StopCapture { session_id }
        }
        "show" => match args.first().map(|a| a.to_ascii_lowercase()).as_deref() {
            Some("devices") => Command::Show(ShowTarget::Devices),
            Some("vulns") => Command::Show(ShowTarget::Vulns),
            Some("interfaces") => Command::Show(ShowTarget::Interfaces),
            other => {
                return Err(TerminalLine::error(format!(
                    "Unknown show command: {}. Available: devices, vulns, interfaces",
                    other.unwrap_or("")
                )))
            }
        },
        "network-map" => Command::NetworkMap,
        "msf" => {
            if args.is_empty() {
                return Err(TerminalLine::error("Error: Command is required. Use msf <console command>"));
            }
            Command::Msf { command: args.join(" ") }
        }
        "help" => Command::Help,
        "clear" => Command::Clear,
        "exit" => Command::Exit,
        other => {
            return Err(TerminalLine::error(format!(
                "Unknown command: {}. Type 'help' for available commands.",
                other
            )))
        }
    };
    Ok(Some(command))
}

pub struct CommandDispatcher {
    services: Arc<Services>,
}

impl CommandDispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Parse and run one line. `cancel` stops framework console polling early.
    pub async fn dispatch(&self, input: &str, cancel: &CancellationToken) -> Dispatch {
        match parse_command(input) {
            Ok(Some(command)) => {
                debug!(?command, "Dispatching terminal command");
                self.execute(command, cancel).await
            }
            Ok(None) => Dispatch::lines(Vec::new()),
            Err(usage) => Dispatch::lines(vec![usage]),
        }
    }

    pub async fn execute(&self, command: Command, cancel: &CancellationToken) -> Dispatch {
        let lines = match command {
            Command::Scan { target, ports } => self.scan(&target, ports).await,
            Command::VulnScan { target, level } => self.vuln_scan(&target, level).await,
            Command::PacketCapture { interface, filter } => self.start_capture(&interface, filter.as_deref()).await,
            Command::StopCapture { session_id } => self.stop_capture(session_id).await,
            Command::Show(ShowTarget::Devices) => self.show_devices().await,
            Command::Show(ShowTarget::Vulns) => self.show_vulns().await,
            Command::Show(ShowTarget::Interfaces) => self.show_interfaces(),
            Command::NetworkMap => self.network_map().await,
            Command::Msf { command } => self.msf(&command, cancel).await,
            Command::Help => HELP_TEXT.lines().map(TerminalLine::plain).collect(),
            Command::Clear => return Dispatch::flow(Flow::Clear),
            Command::Exit => return Dispatch::flow(Flow::Exit),
        };
        Dispatch::lines(lines)
    }

    async fn scan(&self, target: &str, ports: Option<String>) -> Vec<TerminalLine> {
        let orchestrator = &self.services.orchestrator;
        if target.contains('/') {
            let mut lines = vec![TerminalLine::info(format!("Scanning network {}...", target))];
            match orchestrator.scan_network_with(target, &ProfileOptions { ports }).await {
                Ok(summary) => {
                    lines.push(TerminalLine::success("Scan completed successfully"));
                    lines.push(TerminalLine::success(format!("Found {} devices on network", summary.devices_found)));
                    lines.push(TerminalLine::success(format!("Session ID: {}", summary.scan_job_id)));
                }
                Err(e) => lines.push(TerminalLine::error(format!("Error scanning network: {}", e))),
            }
            return lines;
        }

        let mut lines = vec![TerminalLine::info(format!("Scanning device {}...", target))];
        match orchestrator.scan_device_with(target, &ProfileOptions { ports }).await {
            Ok(result) => match result.device {
                Some(device) => {
                    lines.push(TerminalLine::success("Device is online"));
                    lines.extend(device_lines(&device));
                }
                None => lines.push(TerminalLine::error(format!("Device {} is not responding", target))),
            },
            Err(e) => lines.push(TerminalLine::error(format!("Error scanning device: {}", e))),
        }
        lines
    }

    async fn vuln_scan(&self, target: &str, level: VulnScanLevel) -> Vec<TerminalLine> {
        let mut lines = vec![TerminalLine::info(format!(
            "Scanning {} for vulnerabilities ({} scan)...",
            target,
            level.as_str()
        ))];
        let result = match self.services.orchestrator.vuln_scan(target, level).await {
            Ok(result) => result,
            Err(e) => {
                lines.push(TerminalLine::error(format!("Error scanning for vulnerabilities: {}", e)));
                return lines;
            }
        };
        if result.vulnerabilities_found == 0 {
            lines.push(TerminalLine::success("No vulnerabilities found"));
            return lines;
        }

        lines.push(TerminalLine::success(format!("Found {} vulnerabilities", result.vulnerabilities_found)));
        let count = |severity| result.vulnerabilities.iter().filter(|v| v.severity == severity).count();
        for (severity, label) in [
            (VulnerabilitySeverity::Critical, "CRITICAL"),
            (VulnerabilitySeverity::High, "HIGH"),
        ] {
            let n = count(severity);
            if n > 0 {
                lines.push(TerminalLine::warning(format!("{}: {} vulnerabilities found", label, n)));
            }
        }
        for vuln in result
            .vulnerabilities
            .iter()
            .filter(|v| v.severity == VulnerabilitySeverity::Critical)
        {
            lines.push(TerminalLine::warning(format!(
                "{}: {}",
                vuln.cve_id.as_deref().unwrap_or("N/A"),
                vuln.title
            )));
        }
        lines.push(TerminalLine::success("Scan completed"));
        lines
    }

    async fn start_capture(&self, interface: &str, filter: Option<&str>) -> Vec<TerminalLine> {
        let announce = match filter {
            Some(f) => format!("Starting packet capture on interface {} with filter \"{}\"...", interface, f),
            None => format!("Starting packet capture on interface {}...", interface),
        };
        let mut lines = vec![TerminalLine::info(announce)];
        match self.services.captures.start(interface, filter).await {
            Ok(session) => {
                lines.push(TerminalLine::success("Packet capture started"));
                lines.push(TerminalLine::success(format!("Session ID: {}", session.id)));
                lines.push(TerminalLine::success(format!("Use 'stop-capture -s {}' to stop", session.id)));
            }
            Err(e) => lines.push(TerminalLine::error(format!("Error starting packet capture: {}", e))),
        }
        lines
    }

    async fn stop_capture(&self, session_id: RecordId) -> Vec<TerminalLine> {
        let mut lines = vec![TerminalLine::info(format!("Stopping packet capture session {}...", session_id))];
        match self.services.captures.stop(session_id).await {
            Ok(session) => {
                lines.push(TerminalLine::success("Packet capture stopped"));
                lines.push(TerminalLine::success(format!("Session ID: {}", session.id)));
                lines.push(TerminalLine::success(format!("Packets captured: {}", session.packet_count)));
            }
            Err(e) => lines.push(TerminalLine::error(format!("Error stopping packet capture: {}", e))),
        }
        lines
    }

    async fn show_devices(&self) -> Vec<TerminalLine> {
        let hosts = match self.services.records.list_hosts().await {
            Ok(hosts) => latest_hosts(hosts),
            Err(e) => return vec![TerminalLine::error(format!("Error listing devices: {}", e))],
        };
        if hosts.is_empty() {
            return vec![TerminalLine::plain("No devices found. Run a network scan first.")];
        }
        let mut lines = vec![TerminalLine::plain(format!("Found {} devices:", hosts.len()))];
        for host in &hosts {
            lines.extend(device_lines(host));
        }
        lines
    }

    async fn show_vulns(&self) -> Vec<TerminalLine> {
        let vulns = match self.services.records.list_vulnerabilities().await {
            Ok(vulns) => vulns,
            Err(e) => return vec![TerminalLine::error(format!("Error listing vulnerabilities: {}", e))],
        };
        if vulns.is_empty() {
            return vec![TerminalLine::plain("No vulnerabilities found. Run a vulnerability scan first.")];
        }
        let mut lines = vec![TerminalLine::plain(format!("Found {} vulnerabilities:", vulns.len()))];
        for vuln in &vulns {
            lines.push(TerminalLine::success(format!("ID: {}", vuln.id)));
            lines.push(TerminalLine::plain(format!("    Device ID: {}", vuln.host_id)));
            lines.push(TerminalLine::plain(format!("    CVE: {}", vuln.cve_id.as_deref().unwrap_or("N/A"))));
            lines.push(TerminalLine::plain(format!("    Title: {}", vuln.title)));
            lines.push(TerminalLine::plain(format!(
                "    Severity: {}",
                vuln.severity.to_string().to_uppercase()
            )));
            lines.push(TerminalLine::plain(format!(
                "    Discovered: {}",
                vuln.discovered_at.format("%Y-%m-%d %H:%M:%S UTC")
            )));
        }
        lines
    }

    fn show_interfaces(&self) -> Vec<TerminalLine> {
        let interfaces = match self.services.interfaces.interfaces() {
            Ok(interfaces) => interfaces,
            Err(e) => return vec![TerminalLine::error(format!("Error listing interfaces: {}", e))],
        };
        if interfaces.is_empty() {
            return vec![TerminalLine::plain("No network interfaces found.")];
        }
        let mut lines = vec![TerminalLine::plain(format!("Found {} network interfaces:", interfaces.len()))];
        for iface in &interfaces {
            lines.push(TerminalLine::success(format!("Name: {}", iface.name)));
            lines.push(TerminalLine::plain(format!("    Address: {}", iface.ip_address)));
            lines.push(TerminalLine::plain(format!("    Netmask: {}", iface.netmask)));
        }
        lines
    }

    async fn network_map(&self) -> Vec<TerminalLine> {
        let hosts = match self.services.records.list_hosts().await {
            Ok(hosts) => latest_hosts(hosts),
            Err(e) => return vec![TerminalLine::error(format!("Error building network map: {}", e))],
        };
        if hosts.is_empty() {
            return vec![TerminalLine::error("No devices found. Run a network scan first.")];
        }

        let mut lines = vec![TerminalLine::success(format!(
            "Network map generated with {} devices",
            hosts.len()
        ))];
        for device_type in [
            DeviceType::Local,
            DeviceType::Router,
            DeviceType::Server,
            DeviceType::Computer,
            DeviceType::Unknown,
        ] {
            let group: Vec<&Host> = hosts.iter().filter(|h| h.details.device_type == device_type).collect();
            if group.is_empty() {
                continue;
            }
            lines.push(TerminalLine::plain(format!("{} ({})", device_type.as_str(), group.len())));
            for host in group {
                let name = host.hostname.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default();
                lines.push(TerminalLine::plain(format!("  - {}{}", host.ip_address, name)));
            }
        }
        lines
    }

    async fn msf(&self, command: &str, cancel: &CancellationToken) -> Vec<TerminalLine> {
        match self.services.framework.execute_command(command, cancel).await {
            Ok(output) => {
                let mut lines: Vec<TerminalLine> = output.output.lines().map(TerminalLine::plain).collect();
                if output.cancelled {
                    lines.push(TerminalLine::info("Command cancelled"));
                } else if output.timed_out {
                    lines.push(TerminalLine::warning("Command still running, output may be incomplete"));
                }
                lines
            }
            Err(e) => vec![TerminalLine::error(format!("Error executing framework command: {}", e))],
        }
    }
}

fn device_lines(host: &Host) -> Vec<TerminalLine> {
    let ports = if host.details.open_ports.is_empty() {
        "None detected".to_string()
    } else {
        host.details
            .open_ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    vec![
        TerminalLine::success(format!("IP: {}", host.ip_address)),
        TerminalLine::plain(format!("    MAC: {}", host.mac_address.as_deref().unwrap_or("Unknown"))),
        TerminalLine::plain(format!("    Type: {}", host.details.device_type.as_str())),
        TerminalLine::plain(format!("    Name: {}", host.hostname.as_deref().unwrap_or("Unknown"))),
        TerminalLine::plain(format!("    OS: {}", host.os_type)),
        TerminalLine::plain(format!("    Open Ports: {}", ports)),
    ]
}

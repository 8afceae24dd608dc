//! Scanner output parsing
//!
//! The network mapper's human-readable output is not a stable format, so parsing is line
//! oriented and best effort. Every line is classified, lines matching no pattern are kept as
//! [`ScanOutputItem::Unparseable`] and dropped by the callers, and nothing here returns an
//! error: an empty result is a valid answer (for instance when the host is down).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::trace;

use crate::core::{DeviceType, Protocol, VulnerabilitySeverity};

static REPORT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Nmap scan report for (?:(\S+) \(([0-9A-Fa-f:.]+)\)|([0-9A-Fa-f:.]+))\s*$")
        .expect("valid report regex")
});
static PORT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)/(tcp|udp)\s+open\s+(\S+)(?:\s+(.+?))?\s*$").expect("valid port regex")
});
static ANY_PORT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)/(tcp|udp)\s+\S+").expect("valid port state regex"));
static OS_DETAILS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^OS details:\s*(.+)$").expect("valid os regex"));
static OS_RUNNING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Running(?: \(JUST GUESSING\))?:\s*(.+)$").expect("valid running regex")
});
static OS_AGGRESSIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Aggressive OS guesses:\s*(.+)$").expect("valid guess regex"));
static MAC_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^MAC Address:\s*([0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5})(?:\s+\((.+)\))?")
        .expect("valid mac regex")
});
static MAC_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{1,2}(?::[0-9A-Fa-f]{1,2}){5}$").expect("valid mac token regex")
});
static GUESS_CONFIDENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\(\d+%\)\s*$").expect("valid confidence regex"));
static SCRIPT_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\|_?\s?([A-Za-z0-9][\w.\-]*):\s*(.*)$").expect("valid script header regex")
});
static CVE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CVE-\d{4}-\d{4,}").expect("valid cve regex"));
static CVE_WITH_SCORE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(CVE-\d{4}-\d{4,})\s+(\d{1,2}(?:\.\d+)?)").expect("valid cve score regex")
});
static RISK_FACTOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Risk factor:\s*(\w+)").expect("valid risk regex"));
static CVSS_SCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CVSS(?:v\d)?:\s*(\d{1,2}(?:\.\d+)?)").expect("valid cvss regex"));

/// A host named by a discovery pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredHost {
    pub hostname: Option<String>,
    pub ip_address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPort {
    pub number: u16,
    pub protocol: Protocol,
    pub service: String,
    /// Product and version text reported by version detection
    pub product: Option<String>,
}

/// Facts gathered under one `Nmap scan report for` header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostBlock {
    pub host: Option<DiscoveredHost>,
    pub open_ports: Vec<OpenPort>,
    pub os_guess: Option<String>,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
}

impl HostBlock {
    fn has_facts(&self) -> bool {
        !self.open_ports.is_empty() || self.os_guess.is_some() || self.mac_address.is_some()
    }
}

/// One parsed segment of scanner output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutputItem {
    /// A host header with nothing else recognized beneath it
    DiscoveryLine(DiscoveredHost),
    /// A host header together with the ports, OS guess or MAC found beneath it
    HostBlock(HostBlock),
    Unparseable(String),
}

/// Profiling facts merged across the blocks of one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileParse {
    pub open_ports: Vec<OpenPort>,
    pub os_guess: Option<String>,
    pub mac_address: Option<String>,
}

impl ProfileParse {
    pub fn port_numbers(&self) -> Vec<u16> {
        self.open_ports.iter().map(|p| p.number).collect()
    }
}

/// Split scanner output into host segments
pub fn parse_output(text: &str) -> Vec<ScanOutputItem> {
    let mut items = Vec::new();
    let mut current: Option<HostBlock> = None;

    let flush = |block: Option<HostBlock>, items: &mut Vec<ScanOutputItem>| {
        if let Some(block) = block {
            match (&block.host, block.has_facts()) {
                (Some(host), false) => items.push(ScanOutputItem::DiscoveryLine(host.clone())),
                (_, true) => items.push(ScanOutputItem::HostBlock(block)),
                (None, false) => {}
            }
        }
    };

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("Nmap scan report for") {
            flush(current.take(), &mut items);
            match parse_report_line(line) {
                Some(host) => {
                    current = Some(HostBlock {
                        host: Some(host),
                        ..HostBlock::default()
                    })
                }
                None => items.push(ScanOutputItem::Unparseable(line.to_string())),
            }
            continue;
        }

        if let Some(port) = parse_port_line(line) {
            current.get_or_insert_with(HostBlock::default).open_ports.push(port);
        } else if let Some(os) = parse_os_line(line) {
            let block = current.get_or_insert_with(HostBlock::default);
            // `OS details` is more precise than the guesses that may precede it.
            if block.os_guess.is_none() || line.starts_with("OS details") {
                block.os_guess = Some(os);
            }
        } else if let Some(caps) = MAC_LINE.captures(line) {
            let block = current.get_or_insert_with(HostBlock::default);
            block.mac_address = Some(caps[1].to_ascii_lowercase());
            block.vendor = caps.get(2).map(|m| m.as_str().to_string());
        } else {
            trace!(line, "Unmatched scanner line");
            items.push(ScanOutputItem::Unparseable(line.to_string()));
        }
    }
    flush(current.take(), &mut items);

    items
}

/// Hosts named by a discovery (`-sn`) pass
pub fn parse_discovery(text: &str) -> Vec<DiscoveredHost> {
    let mut hosts: Vec<DiscoveredHost> = Vec::new();
    for item in parse_output(text) {
        let host = match item {
            ScanOutputItem::DiscoveryLine(host) => Some(host),
            ScanOutputItem::HostBlock(block) => block.host,
            ScanOutputItem::Unparseable(_) => None,
        };
        if let Some(host) = host {
            if !hosts.iter().any(|h| h.ip_address == host.ip_address) {
                hosts.push(host);
            }
        }
    }
    hosts
}

/// Ports, OS guess and MAC from a profiling invocation against a single target
pub fn parse_profile(text: &str) -> ProfileParse {
    let mut profile = ProfileParse::default();
    for item in parse_output(text) {
        if let ScanOutputItem::HostBlock(block) = item {
            for port in block.open_ports {
                if !profile
                    .open_ports
                    .iter()
                    .any(|p| p.number == port.number && p.protocol == port.protocol)
                {
                    profile.open_ports.push(port);
                }
            }
            if profile.os_guess.is_none() {
                profile.os_guess = block.os_guess;
            }
            if profile.mac_address.is_none() {
                profile.mac_address = block.mac_address;
            }
        }
    }
    profile
}

/// MAC address from neighbor-table output (`arp -n <ip>` on Linux or BSD)
pub fn parse_arp_output(text: &str) -> Option<String> {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("Address"))
        .flat_map(|line| line.split_whitespace())
        .find(|token| MAC_TOKEN.is_match(token))
        .map(|mac| mac.to_ascii_lowercase())
}

/// Infer what kind of device a host is from its address and open ports
pub fn infer_device_type(ip: &IpAddr, open_ports: &[u16]) -> DeviceType {
    let has = |port: u16| open_ports.contains(&port);
    if ip.to_string().ends_with(".1") || has(53) {
        DeviceType::Router
    } else if has(22) && has(80) {
        DeviceType::Server
    } else if has(3389) {
        DeviceType::Computer
    } else {
        DeviceType::Unknown
    }
}

fn parse_report_line(line: &str) -> Option<DiscoveredHost> {
    let caps = REPORT_LINE.captures(line)?;
    let (hostname, ip) = match (caps.get(1), caps.get(2), caps.get(3)) {
        (Some(name), Some(ip), _) => (Some(name.as_str().to_string()), ip.as_str()),
        (_, _, Some(ip)) => (None, ip.as_str()),
        _ => return None,
    };
    let ip_address = ip.parse::<IpAddr>().ok()?;
    Some(DiscoveredHost { hostname, ip_address })
}

fn parse_port_line(line: &str) -> Option<OpenPort> {
    let caps = PORT_LINE.captures(line)?;
    Some(OpenPort {
        number: caps[1].parse().ok()?,
        protocol: Protocol::from_str(&caps[2])?,
        service: caps[3].to_string(),
        product: caps.get(4).map(|m| m.as_str().to_string()),
    })
}

fn parse_os_line(line: &str) -> Option<String> {
    if let Some(caps) = OS_DETAILS.captures(line) {
        return first_item(&caps[1]);
    }
    if let Some(caps) = OS_RUNNING.captures(line) {
        return first_item(&caps[1]);
    }
    if let Some(caps) = OS_AGGRESSIVE.captures(line) {
        return first_item(&caps[1])
            .map(|guess| GUESS_CONFIDENCE.replace(&guess, "").trim().to_string())
            .filter(|guess| !guess.is_empty());
    }
    None
}

fn first_item(list: &str) -> Option<String> {
    list.split(',')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// One vulnerability reported by a `--script vuln` run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnFinding {
    pub port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub script_id: String,
    pub cve_id: Option<String>,
    pub severity: VulnerabilitySeverity,
    pub title: String,
    pub description: Option<String>,
}

struct ScriptBlock {
    port: Option<(u16, Protocol)>,
    script_id: String,
    inline: String,
    body: Vec<String>,
}

/// Vulnerability findings from script output
pub fn parse_vuln_scripts(text: &str) -> Vec<VulnFinding> {
    let mut blocks: Vec<ScriptBlock> = Vec::new();
    let mut current_port: Option<(u16, Protocol)> = None;

    for raw in text.lines() {
        let line = raw.trim_end();
        let trimmed = line.trim_start();

        if trimmed.starts_with("Nmap scan report for") {
            current_port = None;
            continue;
        }
        if let Some(caps) = ANY_PORT_LINE.captures(trimmed) {
            current_port = caps[1]
                .parse::<u16>()
                .ok()
                .zip(Protocol::from_str(&caps[2]));
            continue;
        }
        if !trimmed.starts_with('|') {
            continue;
        }

        // Script headers sit at most one space after the pipe; body lines are indented further.
        let after_pipe = trimmed.trim_start_matches(['|', '_']);
        let is_header = !after_pipe.trim().is_empty() && !after_pipe.starts_with("  ");
        if is_header {
            if let Some(caps) = SCRIPT_HEADER.captures(trimmed) {
                blocks.push(ScriptBlock {
                    port: current_port,
                    script_id: caps[1].to_string(),
                    inline: caps[2].trim().to_string(),
                    body: Vec::new(),
                });
                continue;
            }
        }
        if let Some(block) = blocks.last_mut() {
            let body = trimmed.trim_start_matches(['|', '_']).trim();
            if !body.is_empty() {
                block.body.push(body.to_string());
            }
        }
    }

    blocks.iter().flat_map(findings_from_block).collect()
}

fn findings_from_block(block: &ScriptBlock) -> Vec<VulnFinding> {
    let (port, protocol) = match block.port {
        Some((port, protocol)) => (Some(port), Some(protocol)),
        None => (None, None),
    };

    let scored: Vec<VulnFinding> = block
        .body
        .iter()
        .filter_map(|line| CVE_WITH_SCORE.captures(line))
        .filter_map(|caps| {
            let score: f32 = caps[2].parse().ok()?;
            Some(VulnFinding {
                port,
                protocol,
                script_id: block.script_id.clone(),
                cve_id: Some(caps[1].to_string()),
                severity: VulnerabilitySeverity::from_cvss(score),
                title: format!("{}: {}", block.script_id, &caps[1]),
                description: None,
            })
        })
        .collect();
    if !scored.is_empty() {
        return scored;
    }

    let vulnerable = block
        .body
        .iter()
        .any(|line| {
            line.starts_with("State:") && line.contains("VULNERABLE") && !line.contains("NOT VULNERABLE")
        });
    if !vulnerable {
        return Vec::new();
    }

    let mut title = None;
    let mut description = Vec::new();
    let mut in_references = false;
    for line in &block.body {
        if line.ends_with("VULNERABLE:") || line.starts_with("State:") || line.starts_with("IDs:") {
            continue;
        }
        if line.starts_with("Risk factor:") || line.starts_with("Disclosure date:") {
            continue;
        }
        if line.starts_with("References:") {
            in_references = true;
            continue;
        }
        if in_references || line.starts_with("http") {
            continue;
        }
        if title.is_none() {
            title = Some(line.clone());
        } else {
            description.push(line.clone());
        }
    }

    let all_text = block.body.join("\n");
    let cve_id = CVE_ID.find(&all_text).map(|m| m.as_str().to_string());
    let severity = RISK_FACTOR
        .captures(&all_text)
        .map(|caps| VulnerabilitySeverity::from_label(&caps[1]))
        .or_else(|| {
            CVSS_SCORE
                .captures(&all_text)
                .and_then(|caps| caps[1].parse::<f32>().ok())
                .map(VulnerabilitySeverity::from_cvss)
        })
        .unwrap_or(VulnerabilitySeverity::Low);

    let title = title
        .or_else(|| (!block.inline.is_empty()).then(|| block.inline.clone()))
        .unwrap_or_else(|| block.script_id.clone());

    vec![VulnFinding {
        port,
        protocol,
        script_id: block.script_id.clone(),
        cve_id,
        severity,
        title,
        description: (!description.is_empty()).then(|| description.join(" ")),
    }]
}

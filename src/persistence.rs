//! Record and settings storage
//!
//! Two collaborator traits:
//! - [`ReconStore`] for scan jobs, hosts, ports, vulnerabilities and capture sessions
//! - [`SettingsStore`] for opaque key/value settings such as framework credentials
//!
//! [`JsonFileStore`] implements both, keeping the records in memory and writing the whole
//! state to a single JSON file after every mutation.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    net::IpAddr,
    path::{Path, PathBuf},
};
use tokio::{fs, sync::RwLock};
use tracing::{debug, info};

use crate::{
    core::{
        CaptureSession, Host, JobStatus, NewHost, NewPort, NewVulnerability, Port, RecordId,
        ScanJob, Vulnerability,
    },
    error::{ReconError, Result},
};

/// Well-known settings keys
pub mod keys {
    pub const METASPLOIT_HOST: &str = "metasploit.host";
    pub const METASPLOIT_PORT: &str = "metasploit.port";
    pub const METASPLOIT_USERNAME: &str = "metasploit.username";
    pub const METASPLOIT_PASSWORD: &str = "metasploit.password";
}

pub const MASKED_SECRET: &str = "********";

/// Settings whose values are never returned in full
pub fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.ends_with("password") || key.ends_with("secret") || key.ends_with("token") || key.ends_with("api_key")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub is_secret: bool,
}

impl Setting {
    /// Copy safe to show to an operator
    pub fn masked(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: if self.is_secret { MASKED_SECRET.to_string() } else { self.value.clone() },
            is_secret: self.is_secret,
        }
    }
}

#[async_trait]
pub trait ReconStore: Send + Sync {
    async fn create_scan_job(&self, command: &str, target: &str) -> Result<ScanJob>;
    async fn complete_scan_job(
        &self,
        id: RecordId,
        raw_output: String,
        structured_output: serde_json::Value,
    ) -> Result<ScanJob>;
    async fn fail_scan_job(&self, id: RecordId, message: &str) -> Result<ScanJob>;
    async fn get_scan_job(&self, id: RecordId) -> Result<Option<ScanJob>>;
    async fn list_scan_jobs(&self) -> Result<Vec<ScanJob>>;

    async fn insert_host(&self, host: NewHost) -> Result<Host>;
    async fn get_host(&self, id: RecordId) -> Result<Option<Host>>;
    async fn list_hosts(&self) -> Result<Vec<Host>>;
    /// Most recent host row for an address
    async fn latest_host_for_ip(&self, ip: IpAddr) -> Result<Option<Host>>;

    async fn insert_port(&self, port: NewPort) -> Result<Port>;
    async fn ports_for_host(&self, host_id: RecordId) -> Result<Vec<Port>>;

    async fn insert_vulnerability(&self, vulnerability: NewVulnerability) -> Result<Vulnerability>;
    async fn vulnerabilities_for_host(&self, host_id: RecordId) -> Result<Vec<Vulnerability>>;
    async fn list_vulnerabilities(&self) -> Result<Vec<Vulnerability>>;

    async fn insert_capture(
        &self,
        interface: &str,
        filter: Option<&str>,
        pcap_file: Option<PathBuf>,
    ) -> Result<CaptureSession>;
    async fn finish_capture(
        &self,
        id: RecordId,
        status: JobStatus,
        packet_count: u64,
    ) -> Result<CaptureSession>;
    async fn get_capture(&self, id: RecordId) -> Result<Option<CaptureSession>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    /// All settings, secrets included in full
    async fn list_settings(&self) -> Result<Vec<Setting>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreState {
    next_id: RecordId,
    scan_jobs: Vec<ScanJob>,
    hosts: Vec<Host>,
    ports: Vec<Port>,
    vulnerabilities: Vec<Vulnerability>,
    captures: Vec<CaptureSession>,
    settings: BTreeMap<String, Setting>,
}

impl StoreState {
    fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }

    fn scan_job_mut(&mut self, id: RecordId) -> Result<&mut ScanJob> {
        self.scan_jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| ReconError::not_found("scan job", id))
    }

    fn finish_job(&mut self, id: RecordId, status: JobStatus) -> Result<&mut ScanJob> {
        let job = self.scan_job_mut(id)?;
        if job.status.is_terminal() {
            return Err(ReconError::validation(
                "status",
                format!("scan job {} is already {}", id, job.status),
            ));
        }
        job.status = status;
        job.end_time = Some(Utc::now());
        Ok(job)
    }

    fn host_exists(&self, id: RecordId) -> bool {
        self.hosts.iter().any(|h| h.id == id)
    }
}

/// Recon and settings store persisted as one JSON document
pub struct JsonFileStore {
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
}

impl JsonFileStore {
    /// Open or create `store.json` inside `data_dir`
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join("store.json");

        let state = if fs::try_exists(&path).await? {
            let json_data = fs::read_to_string(&path).await?;
            serde_json::from_str(&json_data)?
        } else {
            StoreState::default()
        };

        info!("Record store opened at: {}", path.display());
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    /// Store that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Write `state` to disk. Mutators stage changes on a copy and install it only afterwards.
    async fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json_data = serde_json::to_string_pretty(state)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json_data).await?;
        fs::rename(&tmp_path, path).await?;
        debug!("Persisted record store to: {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl ReconStore for JsonFileStore {
    async fn create_scan_job(&self, command: &str, target: &str) -> Result<ScanJob> {
        let mut guard = self.state.write().await;
        let mut state = StoreState::clone(&guard);
        let job = ScanJob {
            id: state.allocate_id(),
            command: command.to_string(),
            target: target.to_string(),
            status: JobStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            raw_output: None,
            structured_output: None,
        };
        state.scan_jobs.push(job.clone());
        self.persist(&state).await?;
        *guard = state;
        Ok(job)
    }

    async fn complete_scan_job(
        &self,
        id: RecordId,
        raw_output: String,
        structured_output: serde_json::Value,
    ) -> Result<ScanJob> {
        let mut guard = self.state.write().await;
        let mut state = StoreState::clone(&guard);
        let job = state.finish_job(id, JobStatus::Completed)?;
        job.raw_output = Some(raw_output);
        job.structured_output = Some(structured_output);
        let job = job.clone();
        self.persist(&state).await?;
        *guard = state;
        Ok(job)
    }

    async fn fail_scan_job(&self, id: RecordId, message: &str) -> Result<ScanJob> {
        let mut guard = self.state.write().await;
        let mut state = StoreState::clone(&guard);
        let job = state.finish_job(id, JobStatus::Error)?;
        job.raw_output = Some(message.to_string());
        let job = job.clone();
        self.persist(&state).await?;
        *guard = state;
        Ok(job)
    }

    async fn get_scan_job(&self, id: RecordId) -> Result<Option<ScanJob>> {
        let state = self.state.read().await;
        Ok(state.scan_jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn list_scan_jobs(&self) -> Result<Vec<ScanJob>> {
        Ok(self.state.read().await.scan_jobs.clone())
    }

    async fn insert_host(&self, host: NewHost) -> Result<Host> {
        let mut guard = self.state.write().await;
        let mut state = StoreState::clone(&guard);
        if !state.scan_jobs.iter().any(|job| job.id == host.scan_id) {
            return Err(ReconError::not_found("scan job", host.scan_id));
        }
        let host = Host {
            id: state.allocate_id(),
            scan_id: host.scan_id,
            ip_address: host.ip_address,
            hostname: host.hostname,
            mac_address: host.mac_address,
            os_type: host.os_type,
            state: host.state,
            last_seen: Utc::now(),
            details: host.details,
        };
        state.hosts.push(host.clone());
        self.persist(&state).await?;
        *guard = state;
        Ok(host)
    }

    async fn get_host(&self, id: RecordId) -> Result<Option<Host>> {
        let state = self.state.read().await;
        Ok(state.hosts.iter().find(|h| h.id == id).cloned())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        Ok(self.state.read().await.hosts.clone())
    }

    async fn latest_host_for_ip(&self, ip: IpAddr) -> Result<Option<Host>> {
        let state = self.state.read().await;
        Ok(state.hosts.iter().rev().find(|h| h.ip_address == ip).cloned())
    }

    async fn insert_port(&self, port: NewPort) -> Result<Port> {
        let mut guard = self.state.write().await;
        let mut state = StoreState::clone(&guard);
        if let Some(host_id) = port.host_id {
            if !state.host_exists(host_id) {
                return Err(ReconError::not_found("host", host_id));
            }
        }
        let port = Port {
            id: state.allocate_id(),
            host_id: port.host_id,
            scan_id: port.scan_id,
            port_number: port.port_number,
            protocol: port.protocol,
            state: port.state,
            service: port.service,
            product: port.product,
            version: port.version,
        };
        state.ports.push(port.clone());
        self.persist(&state).await?;
        *guard = state;
        Ok(port)
    }

    async fn ports_for_host(&self, host_id: RecordId) -> Result<Vec<Port>> {
        let state = self.state.read().await;
        Ok(state
            .ports
            .iter()
            .filter(|p| p.host_id == Some(host_id))
            .cloned()
            .collect())
    }

    async fn insert_vulnerability(&self, vulnerability: NewVulnerability) -> Result<Vulnerability> {
        let mut guard = self.state.write().await;
        let mut state = StoreState::clone(&guard);
        if !state.host_exists(vulnerability.host_id) {
            return Err(ReconError::not_found("host", vulnerability.host_id));
        }
        if let Some(port_id) = vulnerability.port_id {
            if !state.ports.iter().any(|p| p.id == port_id) {
                return Err(ReconError::not_found("port", port_id));
            }
        }
        let vulnerability = Vulnerability {
            id: state.allocate_id(),
            host_id: vulnerability.host_id,
            port_id: vulnerability.port_id,
            cve_id: vulnerability.cve_id,
            severity: vulnerability.severity,
            title: vulnerability.title,
            description: vulnerability.description,
            discovered_at: Utc::now(),
            scan_id: vulnerability.scan_id,
        };
        state.vulnerabilities.push(vulnerability.clone());
        self.persist(&state).await?;
        *guard = state;
        Ok(vulnerability)
    }

    async fn vulnerabilities_for_host(&self, host_id: RecordId) -> Result<Vec<Vulnerability>> {
        let state = self.state.read().await;
        Ok(state
            .vulnerabilities
            .iter()
            .filter(|v| v.host_id == host_id)
            .cloned()
            .collect())
    }

    async fn list_vulnerabilities(&self) -> Result<Vec<Vulnerability>> {
        Ok(self.state.read().await.vulnerabilities.clone())
    }

    async fn insert_capture(
        &self,
        interface: &str,
        filter: Option<&str>,
        pcap_file: Option<PathBuf>,
    ) -> Result<CaptureSession> {
        let mut guard = self.state.write().await;
        let mut state = StoreState::clone(&guard);
        let session = CaptureSession {
            id: state.allocate_id(),
            interface: interface.to_string(),
            filter: filter.map(str::to_string),
            status: JobStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            packet_count: 0,
            pcap_file,
        };
        state.captures.push(session.clone());
        self.persist(&state).await?;
        *guard = state;
        Ok(session)
    }

    async fn finish_capture(
        &self,
        id: RecordId,
        status: JobStatus,
        packet_count: u64,
    ) -> Result<CaptureSession> {
        let mut guard = self.state.write().await;
        let mut state = StoreState::clone(&guard);
        let session = state
            .captures
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ReconError::not_found("capture session", id))?;
        session.status = status;
        session.packet_count = packet_count;
        session.end_time = Some(Utc::now());
        let session = session.clone();
        self.persist(&state).await?;
        *guard = state;
        Ok(session)
    }

    async fn get_capture(&self, id: RecordId) -> Result<Option<CaptureSession>> {
        let state = self.state.read().await;
        Ok(state.captures.iter().find(|c| c.id == id).cloned())
    }
}

#[async_trait]
impl SettingsStore for JsonFileStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.read().await;
        Ok(state.settings.get(key).map(|s| s.value.clone()))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(ReconError::validation("key", "setting key must not be empty"));
        }
        let mut guard = self.state.write().await;
        let mut state = StoreState::clone(&guard);
        state.settings.insert(
            key.to_string(),
            Setting {
                key: key.to_string(),
                value: value.to_string(),
                is_secret: is_secret_key(key),
            },
        );
        self.persist(&state).await?;
        *guard = state;
        Ok(())
    }

    async fn list_settings(&self) -> Result<Vec<Setting>> {
        Ok(self.state.read().await.settings.values().cloned().collect())
    }
}

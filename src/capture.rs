//! Packet capture bookkeeping around a `tcpdump` child process

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};
use tokio::{
    process::{Child, Command},
    sync::Mutex,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::CaptureConfig,
    core::{CaptureSession, JobStatus, RecordId},
    error::{ReconError, Result},
    metrics::MetricsCollector,
    persistence::ReconStore,
    process::{sanitize_argument, sanitize_filter},
};

static PACKETS_CAPTURED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(\d+)\s+packets?\s+captured").expect("valid regex"));

/// Packet count from tcpdump's exit summary
pub fn parse_packet_count(stderr: &str) -> Option<u64> {
    PACKETS_CAPTURED
        .captures(stderr)
        .and_then(|caps| caps[1].parse().ok())
}

pub struct CaptureManager {
    store: Arc<dyn ReconStore>,
    config: CaptureConfig,
    metrics: Arc<MetricsCollector>,
    running: Mutex<HashMap<RecordId, Child>>,
}

impl CaptureManager {
    pub fn new(store: Arc<dyn ReconStore>, config: CaptureConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            store,
            config,
            metrics,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Start capturing on `interface` and record a running session
    pub async fn start(&self, interface: &str, filter: Option<&str>) -> Result<CaptureSession> {
        let iface = sanitize_argument(interface);
        if iface.is_empty() {
            return Err(ReconError::validation("interface", "interface name is required"));
        }
        let filter = filter.map(sanitize_filter).filter(|f| !f.is_empty());
        self.reap_exited().await;
        #[cfg(unix)]
        if !nix::unistd::geteuid().is_root() {
            warn!("Not running as root, tcpdump may be unable to open {}", iface);
        }

        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|e| ReconError::io("create capture directory", e.to_string()))?;
        let pcap_file = self
            .config
            .output_dir
            .join(format!("capture-{}-{}.pcap", iface, Utc::now().format("%Y%m%d-%H%M%S%3f")));

        let mut command = Command::new(&self.config.tcpdump_path);
        command.arg("-i").arg(&iface).arg("-w").arg(&pcap_file);
        if let Some(filter) = &filter {
            command.args(filter.split_whitespace());
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| ReconError::subprocess(&self.config.tcpdump_path, format!("failed to start: {}", e)))?;

        // On error the child is dropped, which kills it.
        let session = self
            .store
            .insert_capture(&iface, filter.as_deref(), Some(pcap_file.clone()))
            .await?;
        self.running.lock().await.insert(session.id, child);
        self.metrics.record_capture_started();
        info!(
            capture_id = session.id,
            interface = %iface,
            filter = filter.as_deref().unwrap_or(""),
            file = %pcap_file.display(),
            "Packet capture started"
        );
        Ok(session)
    }

    /// Interrupt the capture, wait for its summary and close the session
    pub async fn stop(&self, id: RecordId) -> Result<CaptureSession> {
        let Some(mut child) = self.running.lock().await.remove(&id) else {
            return match self.store.get_capture(id).await? {
                Some(session) => Err(ReconError::validation(
                    "sessionId",
                    format!("capture {} is already {}", id, session.status.as_str()),
                )),
                None => Err(ReconError::not_found("capture session", id)),
            };
        };

        interrupt(&mut child);
        let (status, packet_count) = self.collect_exit(id, child).await;
        let session = self.store.finish_capture(id, status, packet_count).await?;
        info!(capture_id = id, status = status.as_str(), packet_count, "Packet capture stopped");
        Ok(session)
    }

    /// Sessions whose capture process is still running
    pub async fn active(&self) -> Vec<RecordId> {
        self.reap_exited().await;
        let mut ids: Vec<_> = self.running.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Close the sessions of capture processes that exited on their own
    async fn reap_exited(&self) {
        let exited: Vec<(RecordId, Child)> = {
            let mut running = self.running.lock().await;
            let ids: Vec<RecordId> = running
                .iter_mut()
                .filter_map(|(id, child)| match child.try_wait() {
                    Ok(Some(_)) => Some(*id),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(capture_id = *id, "Cannot poll capture process: {}", e);
                        Some(*id)
                    }
                })
                .collect();
            ids.into_iter()
                .filter_map(|id| running.remove(&id).map(|child| (id, child)))
                .collect()
        };

        for (id, child) in exited {
            let (status, packet_count) = self.collect_exit(id, child).await;
            match self.store.finish_capture(id, status, packet_count).await {
                Ok(_) => warn!(capture_id = id, status = status.as_str(), "Capture process exited on its own"),
                Err(e) => warn!(capture_id = id, "Failed to close exited capture: {}", e),
            }
        }
    }

    /// Wait for the child and read the outcome from its exit summary
    async fn collect_exit(&self, id: RecordId, child: Child) -> (JobStatus, u64) {
        let grace = Duration::from_secs(self.config.stop_grace_secs);
        match timeout(grace, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                debug!(capture_id = id, stderr = %stderr.trim(), "Capture process exited");
                match parse_packet_count(&stderr) {
                    Some(count) => (JobStatus::Completed, count),
                    None if output.status.success() => (JobStatus::Completed, 0),
                    None => {
                        warn!(capture_id = id, "Capture exited with {}: {}", output.status, stderr.trim());
                        (JobStatus::Error, 0)
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(capture_id = id, "Waiting for capture process failed: {}", e);
                (JobStatus::Error, 0)
            }
            Err(_) => {
                // The timed-out future owned the child; dropping it killed the process.
                warn!(capture_id = id, "Capture did not stop within {:?}, killed", grace);
                (JobStatus::Error, 0)
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!(pid, "SIGINT failed ({}), killing capture", e);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::JsonFileStore;
    use tempfile::TempDir;

    #[test]
    fn test_parse_packet_count() {
        let stderr = "tcpdump: listening on eth0, link-type EN10MB\n\
                      42 packets captured\n\
                      45 packets received by filter\n\
                      0 packets dropped by kernel\n";
        assert_eq!(parse_packet_count(stderr), Some(42));
        assert_eq!(parse_packet_count("1 packet captured\n"), Some(1));
        assert_eq!(parse_packet_count("tcpdump: eth9: No such device exists"), None);
    }

    fn manager(dir: &TempDir, tcpdump_path: String) -> (CaptureManager, Arc<JsonFileStore>) {
        let store = Arc::new(JsonFileStore::in_memory());
        let config = CaptureConfig {
            tcpdump_path,
            output_dir: dir.path().join("captures"),
            stop_grace_secs: 2,
        };
        (CaptureManager::new(store.clone(), config, Arc::new(MetricsCollector::new())), store)
    }

    /// Stand-in tcpdump that prints its summary when interrupted
    #[cfg(unix)]
    fn fake_tcpdump(dir: &TempDir) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("tcpdump");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             trap 'echo \"7 packets captured\" >&2; exit 0' INT\n\
             while true; do sleep 0.05; done\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_stop_records_packet_count() {
        let dir = TempDir::new().unwrap();
        let (manager, store) = manager(&dir, fake_tcpdump(&dir));

        let session = manager.start("eth0", Some("port 80; reboot")).await.unwrap();
        assert_eq!(session.status, JobStatus::Running);
        assert_eq!(session.filter.as_deref(), Some("port 80 reboot"));
        assert_eq!(manager.active().await, vec![session.id]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stopped = manager.stop(session.id).await.unwrap();
        assert_eq!(stopped.status, JobStatus::Completed);
        assert_eq!(stopped.packet_count, 7);
        assert!(stopped.end_time.is_some());
        assert!(manager.active().await.is_empty());

        let stored = store.get_capture(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_that_exits_early_is_closed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tcpdump");
        std::fs::write(&path, "#!/bin/sh\necho 'tcpdump: eth9: No such device exists' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let (manager, store) = manager(&dir, path.to_string_lossy().into_owned());

        let session = manager.start("eth9", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(manager.active().await.is_empty());

        let stored = store.get_capture(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert!(stored.end_time.is_some());
        assert!(matches!(manager.stop(session.id).await, Err(ReconError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = manager(&dir, dir.path().join("no-such-tcpdump").to_string_lossy().into_owned());
        let error = manager.start("eth0", None).await.unwrap_err();
        assert!(matches!(error, ReconError::Subprocess { .. }));
        assert!(manager.active().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_session() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = manager(&dir, "tcpdump".to_string());
        assert!(matches!(manager.stop(99).await, Err(ReconError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_interface_is_required() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = manager(&dir, "tcpdump".to_string());
        assert!(matches!(
            manager.start(";|", None).await,
            Err(ReconError::Validation { .. })
        ));
    }
}

//! Remote console driving
//!
//! A console command is written once and then read back in polls. The command counts as done
//! when the framework reports the console idle or the output contains one of the caller's
//! completion markers. Running out of time is not an error: the output gathered so far is
//! returned with `timed_out` set.

use rmpv::Value;
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ConsoleConfig,
    error::{ReconError, Result},
    metrics::MetricsCollector,
    rpc::{codec, RpcSessionManager},
};

/// Polling policy for one console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Any of these in the accumulated output ends polling even while the console is busy
    pub markers: Vec<String>,
}

impl ConsoleOptions {
    /// Policy for framework scans, which stay busy long after their output is final
    pub fn scan(config: &ConsoleConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            markers: config.scan_markers.clone(),
        }
    }

    pub fn module(config: &ConsoleConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            markers: config.module_markers.clone(),
        }
    }

    /// Policy for ad-hoc operator commands
    pub fn command(config: &ConsoleConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.command_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            markers: Vec::new(),
        }
    }

    fn is_complete(&self, busy: Option<bool>, output: &str) -> bool {
        busy == Some(false) || self.markers.iter().any(|m| !m.is_empty() && output.contains(m.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleOutput {
    pub console_id: String,
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

pub struct ConsoleDriver {
    session: Arc<RpcSessionManager>,
    metrics: Arc<MetricsCollector>,
}

impl ConsoleDriver {
    pub fn new(session: Arc<RpcSessionManager>, metrics: Arc<MetricsCollector>) -> Self {
        Self { session, metrics }
    }

    pub fn session(&self) -> &Arc<RpcSessionManager> {
        &self.session
    }

    pub async fn create_console(&self) -> Result<String> {
        let response = self.session.call("console.create", Vec::new()).await?;
        let console_id = codec::map_get(&response, "id")
            .and_then(|id| codec::value_as_string(id).or_else(|| id.as_u64().map(|n| n.to_string())))
            .ok_or_else(|| ReconError::rpc("console.create", "response carried no console id"))?;
        debug!(console_id, "Console created");
        Ok(console_id)
    }

    pub async fn run_command(&self, command: &str, options: &ConsoleOptions) -> Result<ConsoleOutput> {
        self.run_command_cancellable(command, options, &CancellationToken::new()).await
    }

    /// Run `command` in a new console, stopping early when `cancel` fires
    pub async fn run_command_cancellable(
        &self,
        command: &str,
        options: &ConsoleOptions,
        cancel: &CancellationToken,
    ) -> Result<ConsoleOutput> {
        let console_id = self.create_console().await?;
        self.run_in_console(&console_id, command, options, cancel).await
    }

    /// Write `command` to an existing console and poll it.
    ///
    /// The console is left as is when polling ends; it is reclaimed with the connection.
    pub async fn run_in_console(
        &self,
        console_id: &str,
        command: &str,
        options: &ConsoleOptions,
        cancel: &CancellationToken,
    ) -> Result<ConsoleOutput> {
        let started = Instant::now();
        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.session
            .call("console.write", vec![Value::from(console_id), Value::from(line)])
            .await?;

        let mut output = String::new();
        let finish = |output: String, timed_out: bool, cancelled: bool| ConsoleOutput {
            console_id: console_id.to_string(),
            output,
            timed_out,
            cancelled,
        };

        loop {
            if cancel.is_cancelled() {
                info!(console_id, "Console polling cancelled");
                return Ok(finish(output, false, true));
            }

            // A read in flight always runs to completion; only the waits between reads are
            // interrupted, so the connection never loses track of a response.
            let response = self
                .session
                .call("console.read", vec![Value::from(console_id)])
                .await?;
            if let Some(data) = codec::get_string(&response, "data") {
                output.push_str(&data);
            }
            let busy = codec::get_bool(&response, "busy");

            if options.is_complete(busy, &output) {
                debug!(console_id, elapsed_ms = started.elapsed().as_millis() as u64, "Console command finished");
                return Ok(finish(output, false, false));
            }

            let elapsed = started.elapsed();
            if elapsed >= options.timeout {
                warn!(console_id, "Console command still running after {:?}, returning partial output", options.timeout);
                self.metrics.record_console_timeout();
                return Ok(finish(output, true, false));
            }

            let wait = options.poll_interval.min(options.timeout - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(console_id, "Console polling cancelled");
                    return Ok(finish(output, false, true));
                }
                _ = sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{
        testing::{enveloped, standard_reply, FakeFramework, Reply},
        RpcCredentials,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options(timeout_ms: u64, markers: &[&str]) -> ConsoleOptions {
        ConsoleOptions {
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(50),
            markers: markers.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// Framework whose console answers reads with `reads[i]`, repeating the last entry
    fn console_framework(reads: Vec<(&'static str, bool)>) -> FakeFramework {
        let count = Arc::new(AtomicUsize::new(0));
        FakeFramework::new(move |method, params| match method {
            "console.create" => Reply::Value(codec::map([
                ("id", Value::from("3")),
                ("prompt", Value::from("msf6 > ")),
                ("busy", Value::from(false)),
            ])),
            "console.write" => Reply::Value(codec::map([("wrote", Value::from(12))])),
            "console.read" => {
                let i = count.fetch_add(1, Ordering::SeqCst).min(reads.len() - 1);
                let (data, busy) = reads[i];
                Reply::Value(codec::map([
                    ("data", Value::from(data)),
                    ("prompt", Value::from("msf6 > ")),
                    ("busy", Value::from(busy)),
                ]))
            }
            _ => standard_reply(method, params),
        })
    }

    async fn driver(framework: &FakeFramework) -> ConsoleDriver {
        let metrics = Arc::new(MetricsCollector::new());
        let session = Arc::new(RpcSessionManager::new(
            Arc::new(framework.clone()),
            Duration::from_secs(2),
            metrics.clone(),
        ));
        session
            .connect(RpcCredentials {
                host: "fake".into(),
                port: 55553,
                username: "msf".into(),
                password: "good".into(),
            })
            .await
            .unwrap();
        ConsoleDriver::new(session, metrics)
    }

    #[tokio::test]
    async fn test_polls_until_idle() {
        let framework = console_framework(vec![("[*] working\n", true), ("[*] done\n", false)]);
        let driver = driver(&framework).await;

        let result = driver.run_command("version", &options(2_000, &[])).await.unwrap();
        assert_eq!(result.console_id, "3");
        assert_eq!(result.output, "[*] working\n[*] done\n");
        assert!(!result.timed_out);
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn test_marker_completes_busy_console() {
        let framework = console_framework(vec![("Nmap: scan ", true), ("completed\n", true)]);
        let driver = driver(&framework).await;

        let result = driver
            .run_command("db_nmap -sS 10.0.0.1", &options(2_000, &["completed"]))
            .await
            .unwrap();
        assert!(!result.timed_out);
        assert!(result.output.ends_with("completed\n"));
    }

    #[tokio::test]
    async fn test_timeout_returns_partial_output() {
        let framework = console_framework(vec![(".", true)]);
        let driver = driver(&framework).await;
        let opts = options(300, &["completed"]);

        let started = Instant::now();
        let result = driver.run_command("db_nmap -p- 10.0.0.1", &opts).await.unwrap();
        let elapsed = started.elapsed();

        assert!(result.timed_out);
        assert!(result.output.starts_with('.'));
        // One read may still be in flight when the deadline passes.
        assert!(elapsed < opts.timeout + opts.poll_interval + Duration::from_millis(200), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling_without_destroy() {
        let framework = console_framework(vec![(".", true)]);
        let driver = driver(&framework).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(120)).await;
            trigger.cancel();
        });

        let result = driver
            .run_command_cancellable("run", &options(10_000, &[]), &cancel)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(!result.timed_out);
        assert!(!framework.requests().iter().any(|m| m == "console.destroy"));
    }

    #[tokio::test]
    async fn test_enveloped_console_replies() {
        let count = Arc::new(AtomicUsize::new(0));
        let framework = FakeFramework::new(move |method, params| match method {
            "console.create" => enveloped(codec::map([("id", Value::from("7")), ("busy", Value::from(false))])),
            "console.write" => enveloped(codec::map([("wrote", Value::from(8))])),
            "console.read" => {
                let busy = count.fetch_add(1, Ordering::SeqCst) == 0;
                let data = if busy { "[*] first\n" } else { "[*] second\n" };
                enveloped(codec::map([("data", Value::from(data)), ("busy", Value::from(busy))]))
            }
            _ => standard_reply(method, params),
        });
        let driver = driver(&framework).await;

        let result = driver.run_command("version", &options(2_000, &[])).await.unwrap();
        assert_eq!(result.console_id, "7");
        assert_eq!(result.output, "[*] first\n[*] second\n");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_request_sequence() {
        let framework = console_framework(vec![("", false)]);
        let driver = driver(&framework).await;
        driver.run_command("help", &options(1_000, &[])).await.unwrap();
        let requests = framework.requests();
        assert_eq!(requests, vec!["auth.login", "console.create", "console.write", "console.read"]);
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let framework = FakeFramework::new(|method, params| match method {
            "console.create" => Reply::Value(codec::map([("id", Value::from("1"))])),
            "console.read" => Reply::Value(codec::map([
                ("error", Value::from(true)),
                ("error_message", Value::from("Invalid Console ID")),
            ])),
            _ => standard_reply(method, params),
        });
        let driver = driver(&framework).await;
        let error = driver.run_command("help", &options(1_000, &[])).await.unwrap_err();
        assert!(matches!(error, ReconError::RpcProtocol { .. }));
    }

    #[test]
    fn test_completion_rule() {
        let opts = options(1_000, &["completed"]);
        assert!(opts.is_complete(Some(false), ""));
        assert!(opts.is_complete(Some(true), "Nmap done: scan completed"));
        assert!(!opts.is_complete(Some(true), "still going"));
        assert!(!opts.is_complete(None, "still going"));
    }
}

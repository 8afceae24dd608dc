//! Framework operations built on the console and the raw RPC session

use rmpv::Value;
use serde::Serialize;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::{ConsoleConfig, RpcConfig},
    console::{ConsoleDriver, ConsoleOptions, ConsoleOutput},
    error::{ReconError, Result},
    logging::TimingLogger,
    metrics::MetricsCollector,
    persistence::{keys, SettingsStore},
    process::sanitize_argument,
    rpc::{codec, RpcCredentials, RpcSessionManager},
};

/// Port scan flavours run through the framework's `db_nmap`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameworkScanKind {
    Tcp,
    Udp,
    All,
    Vuln,
    /// SYN scan only, used for unrecognised kinds
    Syn,
}

impl FrameworkScanKind {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "tcp" => Self::Tcp,
            "udp" => Self::Udp,
            "all" => Self::All,
            "vuln" => Self::Vuln,
            _ => Self::Syn,
        }
    }

    fn flags(&self) -> &'static str {
        match self {
            Self::Tcp => "-sS -sV",
            Self::Udp => "-sU -sV",
            Self::All => "-sS -sU -sV",
            Self::Vuln => "--script vuln",
            Self::Syn => "-sS",
        }
    }

    pub fn command(&self, target: &str) -> String {
        format!("db_nmap {} {}", self.flags(), target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    Exploit,
    Auxiliary,
    Post,
    Payload,
    Encoder,
    Nop,
}

impl ModuleType {
    /// Accepts both singular and plural names
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exploit" | "exploits" => Some(Self::Exploit),
            "auxiliary" => Some(Self::Auxiliary),
            "post" => Some(Self::Post),
            "payload" | "payloads" => Some(Self::Payload),
            "encoder" | "encoders" => Some(Self::Encoder),
            "nop" | "nops" => Some(Self::Nop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exploit => "exploit",
            Self::Auxiliary => "auxiliary",
            Self::Post => "post",
            Self::Payload => "payload",
            Self::Encoder => "encoder",
            Self::Nop => "nop",
        }
    }

    fn list_method(&self) -> &'static str {
        match self {
            Self::Exploit => "module.exploits",
            Self::Auxiliary => "module.auxiliary",
            Self::Post => "module.post",
            Self::Payload => "module.payloads",
            Self::Encoder => "module.encoders",
            Self::Nop => "module.nops",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameworkScanReport {
    pub kind: FrameworkScanKind,
    pub target: String,
    pub output: String,
    pub timed_out: bool,
    pub hosts: serde_json::Value,
    pub services: serde_json::Value,
    pub vulns: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRun {
    pub module_type: ModuleType,
    pub module_name: String,
    pub options: serde_json::Map<String, serde_json::Value>,
    pub console_id: String,
    pub output: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameworkStatus {
    pub configured: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<serde_json::Value>,
    pub message: String,
}

pub struct FrameworkClient {
    session: Arc<RpcSessionManager>,
    console: ConsoleDriver,
    settings: Arc<dyn SettingsStore>,
    rpc_defaults: RpcConfig,
    console_config: ConsoleConfig,
}

impl FrameworkClient {
    pub fn new(
        session: Arc<RpcSessionManager>,
        settings: Arc<dyn SettingsStore>,
        rpc_defaults: RpcConfig,
        console_config: ConsoleConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            console: ConsoleDriver::new(session.clone(), metrics),
            session,
            settings,
            rpc_defaults,
            console_config,
        }
    }

    pub fn console(&self) -> &ConsoleDriver {
        &self.console
    }

    /// Credentials from the settings store, each field falling back to configuration.
    ///
    /// `None` when no password is known from either source.
    pub async fn stored_credentials(&self) -> Result<Option<RpcCredentials>> {
        let host = self.settings.get_setting(keys::METASPLOIT_HOST).await?;
        let port = self.settings.get_setting(keys::METASPLOIT_PORT).await?;
        let username = self.settings.get_setting(keys::METASPLOIT_USERNAME).await?;
        let password = self.settings.get_setting(keys::METASPLOIT_PASSWORD).await?;

        let Some(password) = password.or_else(|| self.rpc_defaults.password.clone()) else {
            return Ok(None);
        };
        let port = match port {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ReconError::config(format!("stored framework port '{}' is not a port number", raw)))?,
            None => self.rpc_defaults.port,
        };

        Ok(Some(RpcCredentials {
            host: host.unwrap_or_else(|| self.rpc_defaults.host.clone()),
            port,
            username: username.unwrap_or_else(|| self.rpc_defaults.username.clone()),
            password,
        }))
    }

    pub async fn save_credentials(&self, credentials: &RpcCredentials) -> Result<()> {
        self.settings.set_setting(keys::METASPLOIT_HOST, &credentials.host).await?;
        self.settings
            .set_setting(keys::METASPLOIT_PORT, &credentials.port.to_string())
            .await?;
        self.settings
            .set_setting(keys::METASPLOIT_USERNAME, &credentials.username)
            .await?;
        self.settings
            .set_setting(keys::METASPLOIT_PASSWORD, &credentials.password)
            .await?;
        Ok(())
    }

    /// Persist the connection settings, then log in with them
    pub async fn init_db(&self, credentials: RpcCredentials) -> Result<()> {
        validate_credentials(&credentials)?;
        self.save_credentials(&credentials).await?;
        self.session.connect(credentials).await
    }

    pub async fn connect(&self, credentials: RpcCredentials) -> Result<()> {
        validate_credentials(&credentials)?;
        self.session.connect(credentials).await
    }

    /// Make sure a session is authenticated, logging in with stored settings when needed
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.session.is_ready().await {
            return Ok(());
        }
        if self.session.reconnect_if_needed().await? {
            return Ok(());
        }
        match self.stored_credentials().await? {
            Some(credentials) => self.session.connect(credentials).await,
            None => Err(ReconError::config(
                "framework connection settings not configured",
            )),
        }
    }

    pub async fn status(&self) -> Result<FrameworkStatus> {
        let Some(credentials) = self.stored_credentials().await? else {
            return Ok(FrameworkStatus {
                configured: false,
                connected: false,
                version: None,
                message: "Framework RPC not configured".to_string(),
            });
        };

        if let Err(e) = self.session.connect(credentials).await {
            return Ok(FrameworkStatus {
                configured: true,
                connected: false,
                version: None,
                message: e.to_string(),
            });
        }

        match self.version().await {
            Ok(version) => Ok(FrameworkStatus {
                configured: true,
                connected: true,
                version: Some(version),
                message: "Connected to framework RPC".to_string(),
            }),
            Err(e) => {
                warn!("Connected but version lookup failed: {}", e);
                Ok(FrameworkStatus {
                    configured: true,
                    connected: true,
                    version: None,
                    message: "Connected to framework RPC, version unavailable".to_string(),
                })
            }
        }
    }

    pub async fn version(&self) -> Result<serde_json::Value> {
        let response = self.session.call("core.version", Vec::new()).await?;
        Ok(codec::to_json(&response))
    }

    /// Run an operator command in a fresh console
    pub async fn execute_command(&self, command: &str, cancel: &CancellationToken) -> Result<ConsoleOutput> {
        if command.trim().is_empty() {
            return Err(ReconError::validation("command", "command must not be empty"));
        }
        self.ensure_connected().await?;
        let options = ConsoleOptions::command(&self.console_config);
        self.console.run_command_cancellable(command.trim(), &options, cancel).await
    }

    /// Scan through the framework so its database records the results, then read them back
    pub async fn run_scan(
        &self,
        target: &str,
        kind: FrameworkScanKind,
        cancel: &CancellationToken,
    ) -> Result<FrameworkScanReport> {
        let raw = target;
        let target = sanitize_argument(raw);
        if target.is_empty() {
            return Err(ReconError::invalid_target(raw, "target must not be empty"));
        }
        self.ensure_connected().await?;

        let command = kind.command(&target);
        info!(%command, "Starting framework scan");
        let timer = TimingLogger::start(format!("framework scan of {}", target));
        let options = ConsoleOptions::scan(&self.console_config);
        let output = self.console.run_command_cancellable(&command, &options, cancel).await?;
        if output.timed_out {
            info!(target = %target, "Framework scan still running, returning partial results");
        }

        timer.checkpoint("console");

        let filter = || vec![Value::Map(Vec::new())];
        let hosts = self.session.call("db.hosts", filter()).await?;
        let services = self.session.call("db.services", filter()).await?;
        let vulns = self.session.call("db.vulns", filter()).await?;

        Ok(FrameworkScanReport {
            kind,
            target,
            output: output.output,
            timed_out: output.timed_out,
            hosts: codec::to_json(&hosts),
            services: codec::to_json(&services),
            vulns: codec::to_json(&vulns),
        })
    }

    pub async fn execute_module(
        &self,
        module_type: ModuleType,
        module_name: &str,
        options: &serde_json::Map<String, serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<ModuleRun> {
        let module_name = sanitize_argument(module_name);
        if module_name.is_empty() {
            return Err(ReconError::validation("moduleName", "module name must not be empty"));
        }
        self.ensure_connected().await?;

        let info_params = || vec![Value::from(module_type.as_str()), Value::from(module_name.as_str())];
        let full_name = format!("{}/{}", module_type, module_name);
        match self.session.call("module.info", info_params()).await {
            Ok(_) => {}
            Err(ReconError::RpcProtocol { message, .. }) => {
                warn!(module = %full_name, "Module lookup failed: {}", message);
                return Err(ReconError::not_found("module", &full_name));
            }
            Err(e) => return Err(e),
        }

        let known = self.session.call("module.options", info_params()).await?;
        for key in options.keys() {
            if codec::map_get(&known, key).is_none() {
                warn!(module = %full_name, option = %key, "Option not advertised by module");
            }
        }

        let script = module_script(&full_name, options);
        let console_options = ConsoleOptions::module(&self.console_config);
        let output = self
            .console
            .run_command_cancellable(&script, &console_options, cancel)
            .await?;
        if output.timed_out {
            info!(module = %full_name, "Module still running, returning partial output");
        }

        Ok(ModuleRun {
            module_type,
            module_name,
            options: options.clone(),
            console_id: output.console_id,
            output: output.output,
            timed_out: output.timed_out,
        })
    }

    pub async fn list_sessions(&self) -> Result<serde_json::Value> {
        self.ensure_connected().await?;
        let response = self.session.call("session.list", Vec::new()).await?;
        Ok(codec::to_json(&response))
    }

    pub async fn list_modules(&self, module_type: ModuleType) -> Result<serde_json::Value> {
        self.ensure_connected().await?;
        let response = self.session.call(module_type.list_method(), Vec::new()).await?;
        Ok(codec::to_json(&response))
    }
}

fn validate_credentials(credentials: &RpcCredentials) -> Result<()> {
    if credentials.host.trim().is_empty() {
        return Err(ReconError::validation("host", "host is required"));
    }
    if credentials.port == 0 {
        return Err(ReconError::validation("port", "port must be between 1 and 65535"));
    }
    if credentials.username.trim().is_empty() {
        return Err(ReconError::validation("username", "username is required"));
    }
    if credentials.password.is_empty() {
        return Err(ReconError::validation("password", "password is required"));
    }
    Ok(())
}

/// Console lines selecting `full_name`, setting each option and running it
fn module_script(full_name: &str, options: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut script = format!("use {}\n", full_name);
    for (key, value) in options {
        let key = sanitize_argument(key);
        if key.is_empty() {
            continue;
        }
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        // A line break inside a value would start another console command.
        let value = value.replace(['\r', '\n'], " ");
        script.push_str(&format!("set {} {}\n", key, value.trim()));
    }
    script.push_str("run\n");
    script
}

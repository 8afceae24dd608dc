//! Error handling for the reconnaissance engine and the console RPC client
//!
//! Failures fall into three propagation classes:
//! - Per-host and per-step failures (unreachable device, degraded parse, subprocess timeout)
//!   are absorbed where they happen and never abort a batch
//! - Job-level failures (the discovery pass itself fails) mark the scan job `error`
//! - Session-level failures (not authenticated, bad credentials, remote `error` field)
//!   surface immediately to the caller

use std::{
    fmt,
    io,
    net::{AddrParseError, IpAddr},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, ReconError>;

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ReconError {
    /// Liveness probe failed; the caller skips this host
    #[error("Device unreachable: {ip}")]
    DeviceUnreachable { ip: IpAddr },

    /// A line of scanner output matched no known pattern
    #[error("Parse degraded: {line}")]
    ParseDegraded { line: String },

    /// External command exceeded its time budget and was killed
    #[error("Subprocess timeout: {program} after {duration_secs}s")]
    SubprocessTimeout { program: String, duration_secs: u64 },

    /// External command failed to launch or exited unsuccessfully
    #[error("Subprocess error: {program} - {message}")]
    Subprocess { program: String, message: String },

    /// The discovery step of a scan job failed; the job is marked `error`
    #[error("Scan job {scan_job_id} failed: {message}")]
    ScanJobFailed { scan_job_id: u64, message: String },

    #[error("Not authenticated with the RPC service")]
    NotAuthenticated,

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// The remote side answered with an `error` field
    #[error("RPC error from {method}: {message}")]
    RpcProtocol { method: String, message: String },

    #[error("RPC connection closed")]
    ConnectionClosed,

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Invalid target: {target} - {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("IO error: {operation} - {message}")]
    Io { operation: String, message: String },

    #[error("Not found: {entity} {id}")]
    NotFound { entity: String, id: String },

    #[error("Internal error: {context} - {message}")]
    Internal { context: String, message: String },
}

impl ReconError {
    pub fn unreachable(ip: IpAddr) -> Self {
        Self::DeviceUnreachable { ip }
    }

    pub fn parse_degraded<S: Into<String>>(line: S) -> Self {
        Self::ParseDegraded { line: line.into() }
    }

    pub fn subprocess_timeout<P: Into<String>>(program: P, duration_secs: u64) -> Self {
        Self::SubprocessTimeout {
            program: program.into(),
            duration_secs,
        }
    }

    pub fn subprocess<P: Into<String>, M: Into<String>>(program: P, message: M) -> Self {
        Self::Subprocess {
            program: program.into(),
            message: message.into(),
        }
    }

    pub fn scan_job_failed<M: Into<String>>(scan_job_id: u64, message: M) -> Self {
        Self::ScanJobFailed {
            scan_job_id,
            message: message.into(),
        }
    }

    pub fn auth_failed<M: Into<String>>(message: M) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
        }
    }

    pub fn rpc<T: Into<String>, M: Into<String>>(method: T, message: M) -> Self {
        Self::RpcProtocol {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn codec<S: Into<String>>(message: S) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    pub fn invalid_target<T: Into<String>, R: Into<String>>(target: T, reason: R) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::Io {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found<E: Into<String>, I: ToString>(entity: E, id: I) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn internal<C: Into<String>, M: Into<String>>(context: C, message: M) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Check if the operation may succeed when retried later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::ConnectionClosed
                | Self::SubprocessTimeout { .. }
                | Self::DeviceUnreachable { .. }
        )
    }

    /// Failures that degrade a single host or step and must not abort a batch
    pub fn is_step_local(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnreachable { .. }
                | Self::ParseDegraded { .. }
                | Self::SubprocessTimeout { .. }
                | Self::Subprocess { .. }
        )
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::NotAuthenticated | Self::AuthenticationFailed { .. })
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Internal { .. } => ErrorSeverity::Critical,
            Self::ScanJobFailed { .. } | Self::Configuration { .. } => ErrorSeverity::High,
            Self::NotAuthenticated | Self::AuthenticationFailed { .. } => ErrorSeverity::High,
            Self::RpcProtocol { .. } | Self::ConnectionClosed | Self::Network { .. } => ErrorSeverity::Medium,
            Self::Codec { .. } | Self::Io { .. } | Self::Subprocess { .. } => ErrorSeverity::Medium,
            Self::SubprocessTimeout { .. } | Self::Validation { .. } => ErrorSeverity::Low,
            Self::InvalidTarget { .. } | Self::NotFound { .. } => ErrorSeverity::Low,
            Self::DeviceUnreachable { .. } | Self::ParseDegraded { .. } => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Structured failure body returned by job- and session-level operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub success: bool,
    pub message: String,
    pub error: String,
}

impl ErrorPayload {
    pub fn new<M: Into<String>>(message: M, error: &ReconError) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: error.to_string(),
        }
    }
}

impl From<io::Error> for ReconError {
    fn from(error: io::Error) -> Self {
        Self::io("IO operation", error.to_string())
    }
}

impl From<AddrParseError> for ReconError {
    fn from(error: AddrParseError) -> Self {
        Self::invalid_target("IP address", error.to_string())
    }
}

impl From<std::num::ParseIntError> for ReconError {
    fn from(error: std::num::ParseIntError) -> Self {
        Self::validation("number parsing", error.to_string())
    }
}

impl From<serde_json::Error> for ReconError {
    fn from(error: serde_json::Error) -> Self {
        Self::codec(format!("JSON: {}", error))
    }
}

impl From<config::ConfigError> for ReconError {
    fn from(error: config::ConfigError) -> Self {
        Self::config(error.to_string())
    }
}

impl From<anyhow::Error> for ReconError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal("anyhow", error.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ReconError {
    fn from(error: rmp_serde::encode::Error) -> Self {
        Self::codec(format!("msgpack encode: {}", error))
    }
}

impl From<rmpv::ext::Error> for ReconError {
    fn from(error: rmpv::ext::Error) -> Self {
        Self::codec(format!("msgpack value: {}", error))
    }
}

impl From<ipnetwork::IpNetworkError> for ReconError {
    fn from(error: ipnetwork::IpNetworkError) -> Self {
        Self::invalid_target("CIDR", error.to_string())
    }
}

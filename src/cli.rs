//! Command-line interface definition
//!
//! Subcommands cover the long-running surfaces (`serve`, `terminal`) and one-shot
//! operations that print JSON to stdout.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::{
    config::AppConfig,
    scanner::{parse_port_specification, validate_cidr, validate_ip},
};

#[derive(Parser, Debug)]
#[command(
    name = "cysploit",
    about = "Network reconnaissance and exploitation-framework console client",
    long_about = "Discovers and profiles hosts with an external network mapper, records the results, \
                  and drives an exploitation framework through its RPC console"
)]
pub struct Cli {
    #[arg(short = 'c', long, help = "Configuration file path", value_name = "FILE", default_value = "config.toml")]
    pub config_path: PathBuf,

    #[arg(short = 'v', long, help = "Increase verbosity level", action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(short = 'q', long, help = "Only log warnings and errors")]
    pub quiet: bool,

    #[arg(long, help = "Log output format", value_enum, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Serve the HTTP API
    Serve {
        #[arg(long, help = "Address to bind, overriding the configuration", value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Interactive terminal using the command grammar
    Terminal,
    /// Scan a CIDR range, or profile a single address
    Scan {
        #[arg(short = 't', long, help = "Target IP or CIDR range")]
        target: String,
        #[arg(short = 'p', long, help = "Port specification (e.g., 22,80,443 or 1-1000)")]
        ports: Option<String>,
    },
    /// Run vulnerability scripts against one address
    VulnScan {
        #[arg(short = 't', long, help = "Target IP")]
        target: String,
        #[arg(short = 'l', long, value_enum, default_value_t = ScanDepth::Basic)]
        level: ScanDepth,
    },
    /// Exploitation-framework operations
    Msf {
        #[command(subcommand)]
        action: MsfAction,
    },
    /// List local network interfaces
    Interfaces,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum MsfAction {
    /// Report whether the RPC endpoint is configured and reachable
    Status,
    /// Run a console command
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Scan through the framework's db_nmap
    Scan {
        #[arg(short = 't', long)]
        target: String,
        #[arg(short = 'k', long, default_value = "tcp", help = "tcp, udp, all or vuln")]
        kind: String,
    },
    /// List open framework sessions
    Sessions,
    /// List modules of one type
    Modules {
        #[arg(default_value = "exploit")]
        module_type: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDepth {
    /// Common ports only
    Basic,
    /// All 65535 ports
    Deep,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
            Self::Compact => write!(f, "compact"),
        }
    }
}

impl Cli {
    /// Validate CLI arguments before any work starts
    pub fn validate(&self) -> Result<(), String> {
        if self.quiet && self.verbose > 0 {
            return Err("Cannot use both quiet and verbose modes".to_string());
        }

        match &self.command {
            Commands::Scan { target, ports } => {
                if target.contains('/') {
                    validate_cidr(target).map_err(|e| e.to_string())?;
                } else {
                    validate_ip(target).map_err(|e| e.to_string())?;
                }
                if let Some(spec) = ports {
                    parse_port_specification(spec).map_err(|e| e.to_string())?;
                }
            }
            Commands::VulnScan { target, .. } => {
                validate_ip(target).map_err(|e| e.to_string())?;
            }
            Commands::Msf { action: MsfAction::Scan { target, .. } } if target.trim().is_empty() => {
                return Err("Target is required".to_string());
            }
            _ => {}
        }
        Ok(())
    }

    /// Log level after applying `-v` and `-q` to the configured one
    pub fn effective_log_level(&self, configured: &str) -> String {
        if self.quiet {
            return "warn".to_string();
        }
        match self.verbose {
            0 => configured.to_string(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }

    /// Fold command-line logging overrides into the loaded configuration
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        config.logging.level = self.effective_log_level(&config.logging.level);
        if let Some(format) = self.log_format {
            config.logging.format = format.to_string();
        }
        if let Commands::Serve { bind: Some(bind) } = &self.command {
            config.api.bind_address = bind.clone();
        }
    }
}

//! # cysploit
//!
//! Network reconnaissance orchestration and an exploitation-framework console client.
//!
//! Licensed under the MIT License (https://opensource.org/licenses/MIT)
//!
//! ## Reconnaissance
//!
//! - [`process`]: external commands with a time budget
//! - [`parser`]: network mapper output into hosts, ports and findings
//! - [`profiler`]: liveness, ports, OS and MAC for one address
//! - [`scanner`]: scan jobs over CIDR ranges and single hosts
//!
//! ## Framework RPC
//!
//! - [`rpc`]: MessagePack transport and authenticated sessions
//! - [`console`]: driving remote consoles by polling
//! - [`metasploit`]: scans, modules and sessions on top of the console
//!
//! ## Surfaces
//!
//! [`dispatcher`] implements the terminal command grammar, [`api`] the HTTP endpoints and
//! [`cli`] the command line. [`core::Services`] holds the collaborators all three share.

pub mod api;
pub mod capture;
pub mod cli;
pub mod config;
pub mod console;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metasploit;
pub mod metrics;
pub mod network;
pub mod parser;
pub mod persistence;
pub mod process;
pub mod profiler;
pub mod rpc;
pub mod scanner;

pub use crate::{
    config::AppConfig,
    core::Application,
    error::{ReconError, Result},
};

//! Local network interfaces
//!
//! Every network scan also records the operator's own machine, one host per local IPv4
//! interface address.

use pnet::datalink;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalInterface {
    pub name: String,
    pub ip_address: IpAddr,
    pub netmask: String,
    pub mac_address: Option<String>,
    pub is_up: bool,
    pub is_loopback: bool,
}

impl LocalInterface {
    /// Hostname given to this interface's host row
    pub fn host_label(&self) -> String {
        format!("localhost-{}", self.name)
    }
}

/// Source of the machine's own interfaces
pub trait InterfaceProvider: Send + Sync {
    fn interfaces(&self) -> Result<Vec<LocalInterface>>;

    /// Interfaces that represent the machine on the network: IPv4 and not loopback
    fn external_ipv4(&self) -> Result<Vec<LocalInterface>> {
        Ok(self
            .interfaces()?
            .into_iter()
            .filter(|i| !i.is_loopback && i.ip_address.is_ipv4())
            .collect())
    }
}

/// Reads interfaces from the operating system through `pnet`
#[derive(Debug, Default, Clone)]
pub struct SystemInterfaces;

impl InterfaceProvider for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<LocalInterface>> {
        let mut found = Vec::new();
        for iface in datalink::interfaces() {
            for network in &iface.ips {
                found.push(LocalInterface {
                    name: iface.name.clone(),
                    ip_address: network.ip(),
                    netmask: network.mask().to_string(),
                    mac_address: iface.mac.map(|mac| mac.to_string()),
                    is_up: iface.is_up(),
                    is_loopback: iface.is_loopback(),
                });
            }
        }
        Ok(found)
    }
}

/// Fixed interface list, for hosts without interface access and for tests
#[derive(Debug, Default, Clone)]
pub struct StaticInterfaces(pub Vec<LocalInterface>);

impl InterfaceProvider for StaticInterfaces {
    fn interfaces(&self) -> Result<Vec<LocalInterface>> {
        Ok(self.0.clone())
    }
}

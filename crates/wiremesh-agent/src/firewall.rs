// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! NAT rules for subnet routers.

use std::future::Future;

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("iptables {args} failed: {stderr}")]
    Command { args: String, stderr: String },
}

pub trait Firewall: Send + Sync + 'static {
    /// Masquerade traffic from `iface` leaving into `subnet`.
    fn install_masquerade(
        &self,
        iface: &str,
        subnet: Ipv4Network,
    ) -> impl Future<Output = Result<(), FirewallError>> + Send;

    fn remove_masquerade(
        &self,
        iface: &str,
        subnet: Ipv4Network,
    ) -> impl Future<Output = Result<(), FirewallError>> + Send;

    /// Map `virt` 1:1 onto `subnet` for traffic arriving on `iface`.
    fn install_netmap(
        &self,
        iface: &str,
        virt: Ipv4Network,
        subnet: Ipv4Network,
    ) -> impl Future<Output = Result<(), FirewallError>> + Send;

    fn remove_netmap(
        &self,
        iface: &str,
        virt: Ipv4Network,
        subnet: Ipv4Network,
    ) -> impl Future<Output = Result<(), FirewallError>> + Send;
}

#[cfg(target_os = "linux")]
pub type CurrentFirewall = Iptables;

#[cfg(not(target_os = "linux"))]
pub type CurrentFirewall = StubFirewall;

/// One `iptables` rule, without the `-A`/`-D`/`-C` verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl Rule {
    fn args(&self, verb: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.to_string(),
            verb.to_string(),
            self.chain.to_string(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }
}

fn comment(iface: &str) -> [String; 4] {
    [
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        format!("wiremesh:{iface}"),
    ]
}

pub fn masquerade_rules(iface: &str, subnet: Ipv4Network) -> Vec<Rule> {
    let mut spec = vec!["-d".to_string(), subnet.to_string()];
    spec.extend(comment(iface));
    spec.extend(["-j".to_string(), "MASQUERADE".to_string()]);
    vec![
        Rule {
            table: "filter",
            chain: "FORWARD",
            spec: [
                vec!["-i".to_string(), iface.to_string(), "-d".to_string(), subnet.to_string()],
                comment(iface).to_vec(),
                vec!["-j".to_string(), "ACCEPT".to_string()],
            ]
            .concat(),
        },
        Rule {
            table: "nat",
            chain: "POSTROUTING",
            spec,
        },
    ]
}

pub fn netmap_rules(iface: &str, virt: Ipv4Network, subnet: Ipv4Network) -> Vec<Rule> {
    let inbound = [
        vec![
            "-i".to_string(),
            iface.to_string(),
            "-d".to_string(),
            virt.to_string(),
        ],
        comment(iface).to_vec(),
        vec!["-j".to_string(), "NETMAP".to_string(), "--to".to_string(), subnet.to_string()],
    ]
    .concat();
    let outbound = [
        vec![
            "-o".to_string(),
            iface.to_string(),
            "-s".to_string(),
            subnet.to_string(),
        ],
        comment(iface).to_vec(),
        vec!["-j".to_string(), "NETMAP".to_string(), "--to".to_string(), virt.to_string()],
    ]
    .concat();
    vec![
        Rule {
            table: "nat",
            chain: "PREROUTING",
            spec: inbound,
        },
        Rule {
            table: "nat",
            chain: "POSTROUTING",
            spec: outbound,
        },
    ]
}

// -- iptables backend --

#[derive(Debug, Default)]
pub struct Iptables;

impl Iptables {
    async fn run(&self, args: &[String]) -> Result<std::process::Output, FirewallError> {
        Ok(tokio::process::Command::new("iptables")
            .arg("-w")
            .args(args)
            .output()
            .await?)
    }

    async fn exists(&self, rule: &Rule) -> Result<bool, FirewallError> {
        Ok(self.run(&rule.args("-C")).await?.status.success())
    }

    async fn apply(&self, rule: &Rule, verb: &str) -> Result<(), FirewallError> {
        let args = rule.args(verb);
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(FirewallError::Command {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn install(&self, rules: &[Rule]) -> Result<(), FirewallError> {
        for rule in rules {
            if self.exists(rule).await? {
                debug!(table = rule.table, chain = rule.chain, "rule already present");
                continue;
            }
            self.apply(rule, "-A").await?;
        }
        Ok(())
    }

    async fn remove(&self, rules: &[Rule]) -> Result<(), FirewallError> {
        for rule in rules {
            while self.exists(rule).await? {
                self.apply(rule, "-D").await?;
            }
        }
        Ok(())
    }
}

impl Firewall for Iptables {
    async fn install_masquerade(&self, iface: &str, subnet: Ipv4Network) -> Result<(), FirewallError> {
        self.install(&masquerade_rules(iface, subnet)).await?;
        info!(interface = iface, %subnet, "installed masquerade");
        Ok(())
    }

    async fn remove_masquerade(&self, iface: &str, subnet: Ipv4Network) -> Result<(), FirewallError> {
        self.remove(&masquerade_rules(iface, subnet)).await?;
        info!(interface = iface, %subnet, "removed masquerade");
        Ok(())
    }

    async fn install_netmap(
        &self,
        iface: &str,
        virt: Ipv4Network,
        subnet: Ipv4Network,
    ) -> Result<(), FirewallError> {
        self.install(&netmap_rules(iface, virt, subnet)).await?;
        info!(interface = iface, %virt, %subnet, "installed netmap");
        Ok(())
    }

    async fn remove_netmap(
        &self,
        iface: &str,
        virt: Ipv4Network,
        subnet: Ipv4Network,
    ) -> Result<(), FirewallError> {
        self.remove(&netmap_rules(iface, virt, subnet)).await?;
        info!(interface = iface, %virt, %subnet, "removed netmap");
        Ok(())
    }
}

// -- Stub firewall for non-Linux --

#[derive(Debug, Default)]
pub struct StubFirewall;

impl Firewall for StubFirewall {
    async fn install_masquerade(&self, _iface: &str, _subnet: Ipv4Network) -> Result<(), FirewallError> {
        Err(FirewallError::Unsupported)
    }

    async fn remove_masquerade(&self, _iface: &str, _subnet: Ipv4Network) -> Result<(), FirewallError> {
        Err(FirewallError::Unsupported)
    }

    async fn install_netmap(
        &self,
        _iface: &str,
        _virt: Ipv4Network,
        _subnet: Ipv4Network,
    ) -> Result<(), FirewallError> {
        Err(FirewallError::Unsupported)
    }

    async fn remove_netmap(
        &self,
        _iface: &str,
        _virt: Ipv4Network,
        _subnet: Ipv4Network,
    ) -> Result<(), FirewallError> {
        Err(FirewallError::Unsupported)
    }
}

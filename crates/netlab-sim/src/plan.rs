//! Declarative topology: nodes, shaped links, addressing and static routes.
//!
//! [`TopologyPlan::two_router`] is the experiment network: hosts `h1` and
//! `h2` behind router `r1`, host `h3` behind router `r2`, and an `r1`–`r2`
//! transit link.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{NetlabError, Result};
use crate::impairment::{Bandwidth, Delay, LinkShaping};

/// Linux limit on interface names (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

/// Initial congestion window installed on host default routes.
pub const HOST_INITCWND: u32 = 10;

// ── Addresses ───────────────────────────────────────────────────────

/// An IPv4 address with a prefix length, e.g. `10.0.1.101/24`.
///
/// Unlike a network range the host bits are kept, since the same type is
/// used for interface addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    /// Prefixes longer than 32 are clamped to a single host.
    pub const fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        let prefix = if prefix > 32 { 32 } else { prefix };
        Self { addr, prefix }
    }

    pub fn mask(&self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p.min(32))),
        }
    }

    /// The network this address belongs to, host bits cleared.
    pub fn network(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            addr: Ipv4Addr::from(u32::from(self.addr) & self.mask()),
            prefix: self.prefix,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.addr) & self.mask()
    }
}

impl FromStr for Ipv4Cidr {
    type Err = NetlabError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || NetlabError::InvalidAddress(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse::<u8>().map_err(|_| invalid())?),
            // A missing prefix is a single host
            None => (s, 32),
        };
        if prefix > 32 {
            return Err(invalid());
        }
        let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

// ── Nodes and links ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Host,
    /// Forwards IPv4 between its interfaces while the network runs.
    Router,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Host => f.write_str("host"),
            NodeKind::Router => f.write_str("router"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    /// Address put on the node's first interface when it is configured.
    pub ip: Option<Ipv4Cidr>,
    /// Gateway for the node's default route.
    pub default_route: Option<Ipv4Addr>,
}

impl NodeSpec {
    pub fn router(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: NodeKind::Router,
            ip: None,
            default_route: None,
        }
    }

    pub fn host(name: &str, ip: Ipv4Cidr, gateway: Ipv4Addr) -> Self {
        Self {
            name: name.to_string(),
            kind: NodeKind::Host,
            ip: Some(ip),
            default_route: Some(gateway),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub node: String,
    pub interface: String,
}

impl Endpoint {
    pub fn new(node: &str, interface: &str) -> Self {
        Self {
            node: node.to_string(),
            interface: interface.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.interface)
    }
}

/// A point-to-point link; `shaping` applies to both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub a: Endpoint,
    pub b: Endpoint,
    pub shaping: LinkShaping,
}

/// Address assigned to a router interface after the network is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAssignment {
    pub node: String,
    pub interface: String,
    pub cidr: Ipv4Cidr,
}

// ── Routes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Add,
    Change,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDestination {
    Default,
    Net(Ipv4Cidr),
    Host(Ipv4Addr),
}

impl fmt::Display for RouteDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDestination::Default => f.write_str("default"),
            RouteDestination::Net(net) => write!(f, "{}", net),
            RouteDestination::Host(ip) => write!(f, "{}", ip),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub node: String,
    pub action: RouteAction,
    pub destination: RouteDestination,
    pub via: Option<Ipv4Addr>,
    pub dev: Option<String>,
    pub initcwnd: Option<u32>,
}

impl RouteSpec {
    pub fn add_via(node: &str, destination: Ipv4Cidr, via: Ipv4Addr) -> Self {
        Self {
            node: node.to_string(),
            action: RouteAction::Add,
            destination: RouteDestination::Net(destination),
            via: Some(via),
            dev: None,
            initcwnd: None,
        }
    }

    pub fn add_host_dev(node: &str, host: Ipv4Addr, dev: &str) -> Self {
        Self {
            node: node.to_string(),
            action: RouteAction::Add,
            destination: RouteDestination::Host(host),
            via: None,
            dev: Some(dev.to_string()),
            initcwnd: None,
        }
    }

    pub fn change_default(node: &str, via: Ipv4Addr, dev: &str, initcwnd: u32) -> Self {
        Self {
            node: node.to_string(),
            action: RouteAction::Change,
            destination: RouteDestination::Default,
            via: Some(via),
            dev: Some(dev.to_string()),
            initcwnd: Some(initcwnd),
        }
    }

    /// Arguments for `ip`, e.g. `route add 10.0.2.0/24 via 10.0.3.2`.
    pub fn ip_args(&self) -> Vec<String> {
        let action = match self.action {
            RouteAction::Add => "add",
            RouteAction::Change => "change",
        };
        let mut args = vec![
            "route".to_string(),
            action.to_string(),
            self.destination.to_string(),
        ];
        if let Some(via) = self.via {
            args.push("via".into());
            args.push(via.to_string());
        }
        if let Some(dev) = &self.dev {
            args.push("dev".into());
            args.push(dev.clone());
        }
        if let Some(cwnd) = self.initcwnd {
            args.push("initcwnd".into());
            args.push(cwnd.to_string());
        }
        args
    }
}

// ── Parameters ──────────────────────────────────────────────────────

/// Caller-supplied parameters of the `h1`–`r1` and `h2`–`r1` links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyParams {
    /// Mbit/s
    pub bw_h1: u32,
    pub delay_h1: Delay,
    /// Mbit/s
    pub bw_h2: u32,
    pub delay_h2: Delay,
}

impl Default for TopologyParams {
    fn default() -> Self {
        Self {
            bw_h1: 10,
            delay_h1: Delay::from_millis(100),
            bw_h2: 10,
            delay_h2: Delay::from_millis(100),
        }
    }
}

impl TopologyParams {
    /// Rate of the `h3`–`r2` and `r1`–`r2` links.
    pub fn derived_bandwidth(&self) -> Bandwidth {
        Bandwidth::mean(self.bw_h1, self.bw_h2)
    }

    /// Delay of the `h3`–`r2` and `r1`–`r2` links.
    pub fn derived_delay(&self) -> Delay {
        Delay::from_millis(1)
    }
}

// ── Plan ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyPlan {
    pub nodes: Vec<NodeSpec>,
    pub links: Vec<LinkSpec>,
    /// Applied once the network has been built.
    pub addresses: Vec<AddressAssignment>,
    /// Applied after `addresses`, in order.
    pub routes: Vec<RouteSpec>,
}

impl TopologyPlan {
    pub fn two_router(params: &TopologyParams) -> Self {
        let ip = Ipv4Addr::new;
        let cidr = |a, b, c, d, p| Ipv4Cidr::new(Ipv4Addr::new(a, b, c, d), p);

        let nodes = vec![
            NodeSpec::router("r1"),
            NodeSpec::router("r2"),
            NodeSpec::host("h1", cidr(10, 0, 1, 101, 24), ip(10, 0, 1, 1)),
            NodeSpec::host("h2", cidr(10, 0, 1, 102, 24), ip(10, 0, 1, 2)),
            NodeSpec::host("h3", cidr(10, 0, 2, 101, 24), ip(10, 0, 2, 1)),
        ];

        let bw_h3 = params.derived_bandwidth();
        let delay_h3 = params.derived_delay();
        let link = |a: (&str, &str), b: (&str, &str), shaping: LinkShaping| LinkSpec {
            a: Endpoint::new(a.0, a.1),
            b: Endpoint::new(b.0, b.1),
            shaping,
        };
        let links = vec![
            link(
                ("h1", "h1-eth0"),
                ("r1", "r1-eth1"),
                LinkShaping::new(Bandwidth::mbit(params.bw_h1), params.delay_h1),
            ),
            link(
                ("h2", "h2-eth0"),
                ("r1", "r1-eth2"),
                LinkShaping::new(Bandwidth::mbit(params.bw_h2), params.delay_h2),
            ),
            link(
                ("h3", "h3-eth0"),
                ("r2", "r2-eth3"),
                LinkShaping::new(bw_h3, delay_h3),
            ),
            link(
                ("r1", "r1-eth0"),
                ("r2", "r2-eth0"),
                LinkShaping::new(bw_h3, delay_h3),
            ),
        ];

        let assign = |node: &str, interface: &str, cidr: Ipv4Cidr| AddressAssignment {
            node: node.to_string(),
            interface: interface.to_string(),
            cidr,
        };
        let addresses = vec![
            assign("r1", "r1-eth1", cidr(10, 0, 1, 1, 24)),
            assign("r1", "r1-eth2", cidr(10, 0, 1, 2, 24)),
            assign("r2", "r2-eth3", cidr(10, 0, 2, 1, 24)),
            assign("r1", "r1-eth0", cidr(10, 0, 3, 1, 24)),
            assign("r2", "r2-eth0", cidr(10, 0, 3, 2, 24)),
        ];

        let routes = vec![
            RouteSpec::change_default("h1", ip(10, 0, 1, 1), "h1-eth0", HOST_INITCWND),
            RouteSpec::change_default("h2", ip(10, 0, 1, 2), "h2-eth0", HOST_INITCWND),
            RouteSpec::change_default("h3", ip(10, 0, 2, 1), "h3-eth0", HOST_INITCWND),
            RouteSpec::add_via("r1", cidr(10, 0, 2, 0, 24), ip(10, 0, 3, 2)),
            RouteSpec::add_host_dev("r1", ip(10, 0, 1, 101), "r1-eth1"),
            RouteSpec::add_host_dev("r1", ip(10, 0, 1, 102), "r1-eth2"),
            RouteSpec::add_via("r2", cidr(10, 0, 1, 0, 24), ip(10, 0, 3, 1)),
        ];

        Self {
            nodes,
            links,
            addresses,
            routes,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Interfaces of `node` in link declaration order.
    pub fn interfaces_of(&self, node: &str) -> Vec<&str> {
        let mut out = Vec::new();
        for link in &self.links {
            for end in [&link.a, &link.b] {
                if end.node == node {
                    out.push(end.interface.as_str());
                }
            }
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(NetlabError::InvalidTopology(msg));

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return invalid("node with empty name".into());
            }
            if !names.insert(node.name.as_str()) {
                return invalid(format!("duplicate node `{}`", node.name));
            }
        }

        let mut ifaces = HashSet::new();
        for link in &self.links {
            if link.a.node == link.b.node {
                return invalid(format!("link {} - {} is a loop", link.a, link.b));
            }
            for end in [&link.a, &link.b] {
                if !names.contains(end.node.as_str()) {
                    return invalid(format!("link endpoint {} names an unknown node", end));
                }
                if end.interface.is_empty() || end.interface.len() > MAX_IFNAME_LEN {
                    return invalid(format!(
                        "interface name `{}` must be 1..={} bytes",
                        end.interface, MAX_IFNAME_LEN
                    ));
                }
                if !ifaces.insert((end.node.as_str(), end.interface.as_str())) {
                    return invalid(format!("interface {} is used twice", end));
                }
            }
        }

        for node in &self.nodes {
            if node.ip.is_some() && self.interfaces_of(&node.name).is_empty() {
                return invalid(format!("node `{}` has an address but no link", node.name));
            }
        }

        for a in &self.addresses {
            if !ifaces.contains(&(a.node.as_str(), a.interface.as_str())) {
                return invalid(format!(
                    "address {} targets unknown {}:{}",
                    a.cidr, a.node, a.interface
                ));
            }
        }

        for r in &self.routes {
            if !names.contains(r.node.as_str()) {
                return invalid(format!("route on unknown node `{}`", r.node));
            }
            if let Some(dev) = &r.dev {
                if !ifaces.contains(&(r.node.as_str(), dev.as_str())) {
                    return invalid(format!("route on `{}` uses unknown dev `{}`", r.node, dev));
                }
            }
            if r.via.is_none() && r.dev.is_none() {
                return invalid(format!("route on `{}` has neither via nor dev", r.node));
            }
        }

        Ok(())
    }
}

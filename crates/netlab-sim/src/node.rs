use std::net::Ipv4Addr;

use tracing::{debug, info};

use crate::error::Result;
use crate::plan::{Ipv4Cidr, NodeKind, NodeSpec};
use crate::topology::Namespace;

/// An emulated host or router living in its own network namespace.
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub namespace: Namespace,
    /// Interface names in link declaration order.
    pub interfaces: Vec<String>,
    /// Current IPv4 address of each interface, parallel to `interfaces`.
    addresses: Vec<Option<Ipv4Cidr>>,
    spec: NodeSpec,
    forwarding: bool,
}

impl Node {
    pub(crate) fn new(spec: NodeSpec, namespace: Namespace) -> Self {
        Self {
            name: spec.name.clone(),
            kind: spec.kind,
            namespace,
            interfaces: Vec::new(),
            addresses: Vec::new(),
            spec,
            forwarding: false,
        }
    }

    pub(crate) fn attach(&mut self, interface: &str) {
        self.interfaces.push(interface.to_string());
        self.addresses.push(None);
    }

    /// Start-up hook, run once all links exist.
    ///
    /// Hosts get their address on the first interface and a default route;
    /// routers turn on IPv4 forwarding.
    pub fn configure(&mut self) -> Result<()> {
        if let (Some(ip), Some(first)) = (self.spec.ip, self.interfaces.first().cloned()) {
            self.set_ip(&first, ip)?;
        }
        if let Some(gw) = self.spec.default_route {
            let gw = gw.to_string();
            self.namespace
                .exec_checked("ip", &["route", "add", "default", "via", &gw])?;
        }
        if self.kind == NodeKind::Router {
            self.namespace
                .exec_checked("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;
            self.forwarding = true;
            info!(node = %self.name, "IPv4 forwarding enabled");
        }
        Ok(())
    }

    /// Tear-down hook. Routers turn forwarding back off; calling it twice
    /// is harmless.
    pub fn terminate(&mut self) {
        if self.forwarding {
            let _ = self
                .namespace
                .exec("sysctl", &["-w", "net.ipv4.ip_forward=0"]);
            self.forwarding = false;
            debug!(node = %self.name, "IPv4 forwarding disabled");
        }
    }

    pub fn forwarding(&self) -> bool {
        self.forwarding
    }

    pub fn set_ip(&mut self, interface: &str, cidr: Ipv4Cidr) -> Result<()> {
        self.namespace.set_address(interface, &cidr)?;
        if let Some(idx) = self.interfaces.iter().position(|i| i == interface) {
            self.addresses[idx] = Some(cidr);
        }
        Ok(())
    }

    pub fn address_of(&self, interface: &str) -> Option<Ipv4Cidr> {
        let idx = self.interfaces.iter().position(|i| i == interface)?;
        self.addresses[idx]
    }

    /// Address of the first interface, which is what other nodes use to
    /// reach this one by name.
    pub fn default_ip(&self) -> Option<Ipv4Addr> {
        self.addresses.first().copied().flatten().map(|c| c.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::DryRunRunner;
    use std::sync::Arc;

    fn node(spec: NodeSpec, runner: &Arc<DryRunRunner>) -> Node {
        let ns = Namespace::new(&format!("nl-{}", spec.name), runner.clone()).unwrap();
        Node::new(spec, ns)
    }

    #[test]
    fn router_toggles_forwarding() {
        let runner = Arc::new(DryRunRunner::new());
        let mut r1 = node(NodeSpec::router("r1"), &runner);
        r1.attach("r1-eth1");
        r1.configure().unwrap();
        assert!(r1.forwarding());

        r1.terminate();
        r1.terminate();
        assert!(!r1.forwarding());

        let sysctl: Vec<String> = runner
            .commands()
            .into_iter()
            .filter(|c| c.contains("sysctl"))
            .collect();
        assert_eq!(
            sysctl,
            vec![
                "ip netns exec nl-r1 sysctl -w net.ipv4.ip_forward=1",
                "ip netns exec nl-r1 sysctl -w net.ipv4.ip_forward=0",
            ]
        );
    }

    #[test]
    fn host_gets_address_and_default_route() {
        let runner = Arc::new(DryRunRunner::new());
        let spec = NodeSpec::host(
            "h1",
            "10.0.1.101/24".parse().unwrap(),
            Ipv4Addr::new(10, 0, 1, 1),
        );
        let mut h1 = node(spec, &runner);
        h1.attach("h1-eth0");
        h1.configure().unwrap();

        assert_eq!(h1.default_ip(), Some(Ipv4Addr::new(10, 0, 1, 101)));
        let cmds = runner.commands();
        assert!(cmds.contains(&"ip netns exec nl-h1 ip addr add 10.0.1.101/24 dev h1-eth0".to_string()));
        assert_eq!(
            cmds.last().map(String::as_str),
            Some("ip netns exec nl-h1 ip route add default via 10.0.1.1")
        );
        assert!(!h1.forwarding());
    }

    #[test]
    fn set_ip_tracks_address() {
        let runner = Arc::new(DryRunRunner::new());
        let mut r2 = node(NodeSpec::router("r2"), &runner);
        r2.attach("r2-eth3");
        r2.attach("r2-eth0");
        assert_eq!(r2.default_ip(), None);

        r2.set_ip("r2-eth0", "10.0.3.2/24".parse().unwrap()).unwrap();
        assert_eq!(r2.default_ip(), None);
        r2.set_ip("r2-eth3", "10.0.2.1/24".parse().unwrap()).unwrap();
        assert_eq!(r2.default_ip(), Some(Ipv4Addr::new(10, 0, 2, 1)));
        assert_eq!(
            r2.address_of("r2-eth0").map(|c| c.to_string()),
            Some("10.0.3.2/24".to_string())
        );
    }
}

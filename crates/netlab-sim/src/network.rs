//! Instantiated topology: namespaces, veth links, shaping and routes.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{NetlabError, Result};
use crate::exec::{CommandOutput, CommandRunner};
use crate::impairment::apply_shaping;
use crate::node::Node;
use crate::plan::{Ipv4Cidr, LinkSpec, RouteSpec, TopologyPlan};
use crate::topology::Namespace;

#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Prepended to node names to form namespace names.
    pub namespace_prefix: String,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            namespace_prefix: "nl-".to_string(),
        }
    }
}

pub struct Network {
    plan: TopologyPlan,
    nodes: Vec<Node>,
    runner: Arc<dyn CommandRunner>,
    stopped: bool,
}

impl Network {
    /// Builds the plan and then applies its router addresses and static
    /// routes.
    pub fn start(
        plan: TopologyPlan,
        runner: Arc<dyn CommandRunner>,
        options: &NetworkOptions,
    ) -> Result<Self> {
        let mut net = Self::build(plan, runner, options)?;
        net.apply_plan_addresses()?;
        net.apply_plan_routes()?;
        Ok(net)
    }

    /// Creates one namespace per node, wires and shapes the links, then
    /// runs each node's start-up hook.
    ///
    /// On error, everything created so far is torn down again.
    pub fn build(
        plan: TopologyPlan,
        runner: Arc<dyn CommandRunner>,
        options: &NetworkOptions,
    ) -> Result<Self> {
        plan.validate()?;

        let mut net = Network {
            plan: TopologyPlan::default(),
            nodes: Vec::with_capacity(plan.nodes.len()),
            runner: runner.clone(),
            stopped: false,
        };

        info!("*** Creating network");
        info!(
            "*** Adding nodes: {}",
            plan.nodes
                .iter()
                .map(|n| n.name.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        );
        for spec in &plan.nodes {
            let ns_name = format!("{}{}", options.namespace_prefix, spec.name);
            let ns = Namespace::new(&ns_name, runner.clone())?;
            net.nodes.push(Node::new(spec.clone(), ns));
        }

        info!("*** Adding links:");
        for link in &plan.links {
            net.add_link(link)?;
            info!(
                "({}, {}) {} - {}",
                link.shaping
                    .bandwidth
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "unlimited".into()),
                link.shaping
                    .delay
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "0ms".into()),
                link.a,
                link.b
            );
        }

        info!("*** Configuring nodes");
        for node in &mut net.nodes {
            node.configure()?;
        }

        net.plan = plan;
        Ok(net)
    }

    fn add_link(&mut self, link: &LinkSpec) -> Result<()> {
        let a = self.index_of(&link.a.node)?;
        let b = self.index_of(&link.b.node)?;

        let (na, nb) = (&self.nodes[a], &self.nodes[b]);
        na.namespace
            .add_veth_link(&nb.namespace, &link.a.interface, &link.b.interface)?;
        for (node, iface) in [(na, &link.a.interface), (nb, &link.b.interface)] {
            apply_shaping(&node.namespace, iface, &link.shaping)?;
            node.namespace.set_link_up(iface)?;
        }

        self.nodes[a].attach(&link.a.interface);
        self.nodes[b].attach(&link.b.interface);
        Ok(())
    }

    pub fn apply_plan_addresses(&mut self) -> Result<()> {
        info!("*** Assigning router addresses");
        let addresses = self.plan.addresses.clone();
        for a in addresses {
            self.set_ip(&a.node, &a.interface, a.cidr)?;
        }
        Ok(())
    }

    pub fn apply_plan_routes(&self) -> Result<()> {
        info!("*** Installing static routes");
        for route in &self.plan.routes {
            self.add_route(route)?;
        }
        Ok(())
    }

    pub fn set_ip(&mut self, node: &str, interface: &str, cidr: Ipv4Cidr) -> Result<()> {
        let idx = self.index_of(node)?;
        self.nodes[idx].set_ip(interface, cidr)?;
        info!("{}: {} = {}", node, interface, cidr);
        Ok(())
    }

    pub fn add_route(&self, route: &RouteSpec) -> Result<()> {
        let args = route.ip_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.node(&route.node)?
            .namespace
            .exec_checked("ip", &args)?;
        info!("{}: ip {}", route.node, args.join(" "));
        Ok(())
    }

    /// Runs a command in a node's namespace and captures its output.
    pub fn cmd(&self, node: &str, args: &[&str]) -> Result<CommandOutput> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| NetlabError::InvalidTopology("empty command".into()))?;
        self.node(node)?.namespace.exec(program, rest)
    }

    /// Runs a command in a node's namespace attached to the terminal.
    pub fn run_foreground(&self, node: &str, args: &[&str]) -> Result<bool> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| NetlabError::InvalidTopology("empty command".into()))?;
        self.node(node)?.namespace.exec_foreground(program, rest)
    }

    /// Hands a command line to `sh -c` inside a node's namespace, attached
    /// to the terminal. Pipes, redirections and `&` work as in a shell.
    pub fn run_node_shell(&self, node: &str, command: &str) -> Result<bool> {
        self.node(node)?
            .namespace
            .exec_foreground("sh", &["-c", command])
    }

    /// Runs a shell command in the root namespace.
    pub fn run_root_shell(&self, command: &str) -> Result<bool> {
        Ok(self.runner.run_foreground("sh", &["-c", command])?)
    }

    /// Runs a program in the root namespace through the network's runner
    /// (and so through `sudo` when configured), capturing its output.
    pub fn run_root(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        Ok(self.runner.run(program, args)?)
    }

    pub fn node(&self, name: &str) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| NetlabError::UnknownNode(name.to_string()))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn links(&self) -> &[LinkSpec] {
        &self.plan.links
    }

    pub fn plan(&self) -> &TopologyPlan {
        &self.plan
    }

    pub fn default_ip(&self, name: &str) -> Option<Ipv4Addr> {
        self.node(name).ok()?.default_ip()
    }

    pub fn namespace_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.node(name)?.namespace.path())
    }

    /// Whether commands reach the kernel (as opposed to a dry run).
    pub fn is_live(&self) -> bool {
        self.runner.is_live()
    }

    pub fn uses_sudo(&self) -> bool {
        self.runner.uses_sudo()
    }

    /// Pings every other node once from every node.
    pub fn ping_all(&self) -> PingReport {
        info!("*** Ping: testing ping reachability");
        let mut rows = Vec::with_capacity(self.nodes.len());
        for src in &self.nodes {
            let mut results = Vec::new();
            for dst in &self.nodes {
                if src.name == dst.name {
                    continue;
                }
                let ok = match dst.default_ip() {
                    Some(ip) => {
                        let ip = ip.to_string();
                        src.namespace
                            .exec("ping", &["-c1", "-W1", &ip])
                            .map(|out| out.success)
                            .unwrap_or(false)
                    }
                    None => false,
                };
                results.push((dst.name.clone(), ok));
            }
            rows.push((src.name.clone(), results));
        }
        PingReport { rows }
    }

    /// Turns router forwarding off and deletes every namespace.
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        info!("*** Stopping {} nodes", self.nodes.len());
        for node in &mut self.nodes {
            node.terminate();
        }
        // Dropping a namespace deletes it along with its veth ends
        let names: Vec<String> = self.nodes.drain(..).map(|n| n.name).collect();
        info!("{}", names.join(" "));
        info!("*** Done");
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| NetlabError::UnknownNode(name.to_string()))
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        if !self.stopped {
            warn!("network dropped without stop(), tearing down");
            self.stop();
        }
    }
}

/// Outcome of [`Network::ping_all`], one row per source node.
#[derive(Debug, Clone, Default)]
pub struct PingReport {
    pub rows: Vec<(String, Vec<(String, bool)>)>,
}

impl PingReport {
    pub fn sent(&self) -> usize {
        self.rows.iter().map(|(_, r)| r.len()).sum()
    }

    pub fn received(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|(_, r)| r.iter())
            .filter(|(_, ok)| *ok)
            .count()
    }

    pub fn dropped_percent(&self) -> f64 {
        let sent = self.sent();
        if sent == 0 {
            return 0.0;
        }
        (sent - self.received()) as f64 * 100.0 / sent as f64
    }
}

impl fmt::Display for PingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (src, results) in &self.rows {
            write!(f, "{} ->", src)?;
            for (dst, ok) in results {
                if *ok {
                    write!(f, " {}", dst)?;
                } else {
                    f.write_str(" X")?;
                }
            }
            writeln!(f)?;
        }
        write!(
            f,
            "*** Results: {:.0}% dropped ({}/{} received)",
            self.dropped_percent(),
            self.received(),
            self.sent()
        )
    }
}

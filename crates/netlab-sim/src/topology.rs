use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::error::{NetlabError, Result};
use crate::exec::{CommandOutput, CommandRunner};
use crate::plan::Ipv4Cidr;

/// A Linux network namespace managed via `ip netns`.
///
/// Creates the namespace on construction, brings loopback up, and
/// deletes the namespace on drop. Deleting the namespace also destroys
/// every veth end that lives in it.
pub struct Namespace {
    pub name: String,
    runner: Arc<dyn CommandRunner>,
}

impl Namespace {
    pub fn new(name: &str, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        // cleanup any existing namespace with the same name
        let _ = runner.run("ip", &["netns", "del", name]);

        let output = runner.run("ip", &["netns", "add", name])?;
        if !output.success {
            return Err(NetlabError::command_failed(
                "ip",
                &["netns", "add", name],
                &output.stderr,
            ));
        }

        let ns = Self {
            name: name.to_string(),
            runner,
        };
        let _ = ns.exec("ip", &["link", "set", "lo", "up"]);
        Ok(ns)
    }

    /// Path of the namespace handle, usable with `setns(2)`.
    pub fn path(&self) -> PathBuf {
        PathBuf::from("/var/run/netns").join(&self.name)
    }

    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput> {
        let full = self.netns_args(cmd, args);
        let full: Vec<&str> = full.iter().map(String::as_str).collect();
        Ok(self.runner.run("ip", &full)?)
    }

    /// Like [`Namespace::exec`] but a non-zero exit becomes an error
    /// carrying the command's stderr.
    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = self.exec(cmd, args)?;
        if !output.success {
            return Err(NetlabError::command_failed(cmd, args, &output.stderr));
        }
        Ok(output)
    }

    /// Runs a command inside the namespace attached to the terminal.
    pub fn exec_foreground(&self, cmd: &str, args: &[&str]) -> Result<bool> {
        let full = self.netns_args(cmd, args);
        let full: Vec<&str> = full.iter().map(String::as_str).collect();
        Ok(self.runner.run_foreground("ip", &full)?)
    }

    /// Creates a veth pair with one end in `self` and the other in
    /// `other`. Both ends are left down and unaddressed.
    ///
    /// The pair is created directly inside the two namespaces, so the
    /// names never exist in the root namespace.
    pub fn add_veth_link(&self, other: &Namespace, veth_local: &str, veth_peer: &str) -> Result<()> {
        let args = [
            "link", "add", veth_local, "netns", &self.name, "type", "veth", "peer", "name",
            veth_peer, "netns", &other.name,
        ];
        let output = self.runner.run("ip", &args)?;
        if !output.success {
            return Err(NetlabError::command_failed("ip", &args, &output.stderr));
        }

        debug!(
            local = %format!("{}:{}", self.name, veth_local),
            peer = %format!("{}:{}", other.name, veth_peer),
            "veth pair created"
        );
        Ok(())
    }

    pub fn set_link_up(&self, interface: &str) -> Result<()> {
        self.exec_checked("ip", &["link", "set", interface, "up"])?;
        Ok(())
    }

    /// Replaces whatever IPv4 addresses `interface` has with `cidr`.
    pub fn set_address(&self, interface: &str, cidr: &Ipv4Cidr) -> Result<()> {
        let _ = self.exec("ip", &["-4", "addr", "flush", "dev", interface]);
        let cidr = cidr.to_string();
        self.exec_checked("ip", &["addr", "add", &cidr, "dev", interface])?;
        Ok(())
    }

    fn netns_args(&self, cmd: &str, args: &[&str]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 4);
        full.push("netns".to_string());
        full.push("exec".to_string());
        full.push(self.name.clone());
        full.push(cmd.to_string());
        full.extend(args.iter().map(|a| a.to_string()));
        full
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        let _ = self.runner.run("ip", &["netns", "del", &self.name]);
    }
}

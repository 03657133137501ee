//! Interactive command loop over a running [`Network`].

use std::io::{BufRead, Write};
use std::path::Path;

use netlab_sim::network::Network;
use netlab_sim::sockdiag::{dump_tcp_sockets, SocketFilter};

const PROMPT: &str = "netlab> ";

/// Socket dump helper shipped alongside `netlab`.
const SOCKDIAG_BIN: &str = "netlab-sockdiag";

const HELP: &str = "\
Documented commands:
  help              show this text
  nodes             list node names
  net               list nodes and their links
  links             list links with their shaping
  dump              show node addresses and namespaces
  pingall           ping between every pair of nodes
  sh <cmd>          run <cmd> in the root namespace
  ss <node>         show established TCP sockets of <node>
  <node> <cmd>      run <cmd> with sh inside <node>; node names in
                    <cmd> are replaced by their IP (e.g. h1 ping h3)
  exit | quit       tear the network down and leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Empty,
    Help,
    Nodes,
    Net,
    Links,
    Dump,
    PingAll,
    Sh(String),
    SockStat(String),
    NodeCmd { node: String, args: Vec<String> },
    Exit,
    Unknown(String),
}

impl ShellCommand {
    pub fn parse(line: &str, nodes: &[&str]) -> Self {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            return ShellCommand::Empty;
        };
        let rest: Vec<String> = words.map(str::to_string).collect();

        match first {
            "help" | "?" => ShellCommand::Help,
            "nodes" => ShellCommand::Nodes,
            "net" => ShellCommand::Net,
            "links" => ShellCommand::Links,
            "dump" => ShellCommand::Dump,
            "pingall" => ShellCommand::PingAll,
            "exit" | "quit" | "EOF" => ShellCommand::Exit,
            "sh" if !rest.is_empty() => ShellCommand::Sh(line[2..].trim().to_string()),
            "ss" if rest.len() == 1 => ShellCommand::SockStat(rest[0].clone()),
            node if nodes.contains(&node) && !rest.is_empty() => ShellCommand::NodeCmd {
                node: node.to_string(),
                args: rest,
            },
            _ => ShellCommand::Unknown(line.to_string()),
        }
    }
}

/// Reads commands from `input` until `exit` or end of input.
pub fn run<R: BufRead, W: Write>(net: &Network, mut input: R, mut out: W) -> anyhow::Result<()> {
    let mut line = String::new();
    loop {
        write!(out, "{PROMPT}")?;
        out.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(out)?;
            break;
        }

        let cmd = ShellCommand::parse(&line, &net.node_names());
        if cmd == ShellCommand::Exit {
            break;
        }
        if let Err(e) = execute(net, &cmd, &mut out) {
            writeln!(out, "*** Error: {e}")?;
        }
    }
    Ok(())
}

fn execute<W: Write>(net: &Network, cmd: &ShellCommand, out: &mut W) -> anyhow::Result<()> {
    match cmd {
        ShellCommand::Empty | ShellCommand::Exit => {}
        ShellCommand::Help => writeln!(out, "{HELP}")?,
        ShellCommand::Nodes => {
            let mut names = net.node_names();
            names.sort_unstable();
            writeln!(out, "available nodes are: \n{}", names.join(" "))?;
        }
        ShellCommand::Net => {
            for node in net.nodes() {
                write!(out, "{}", node.name)?;
                for link in net.links() {
                    if link.a.node == node.name {
                        write!(out, " {}:{}", link.a.interface, link.b.interface)?;
                    } else if link.b.node == node.name {
                        write!(out, " {}:{}", link.b.interface, link.a.interface)?;
                    }
                }
                writeln!(out)?;
            }
        }
        ShellCommand::Links => {
            for link in net.links() {
                let bw = link
                    .shaping
                    .bandwidth
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "unlimited".into());
                let delay = link
                    .shaping
                    .delay
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "0ms".into());
                writeln!(
                    out,
                    "{}<->{} ({} {} loss {}%)",
                    link.a.interface, link.b.interface, bw, delay, link.shaping.loss_percent
                )?;
            }
        }
        ShellCommand::Dump => {
            for node in net.nodes() {
                let addrs: Vec<String> = node
                    .interfaces
                    .iter()
                    .map(|i| match node.address_of(i) {
                        Some(c) => format!("{}:{}", i, c.addr),
                        None => format!("{}:None", i),
                    })
                    .collect();
                writeln!(
                    out,
                    "<{} {}: {} netns={}>",
                    node.kind,
                    node.name,
                    addrs.join(","),
                    node.namespace.name
                )?;
            }
        }
        ShellCommand::PingAll => writeln!(out, "{}", net.ping_all())?,
        ShellCommand::Sh(command) => {
            out.flush()?;
            net.run_root_shell(command)?;
        }
        ShellCommand::SockStat(node) => {
            let path = net.namespace_path(node)?;
            // setns needs CAP_SYS_ADMIN; under sudo only the helper process has it
            let report = if net.is_live() && !net.uses_sudo() {
                dump_in_process(&path)?
            } else {
                dump_with_helper(net, &path)?
            };
            if report.trim().is_empty() {
                writeln!(out, "*** {node}: no established TCP sockets")?;
            } else {
                writeln!(out, "{}", report.trim_end())?;
            }
        }
        ShellCommand::NodeCmd { node, args } => {
            let line = substitute_node_ips(net, args).join(" ");
            out.flush()?;
            net.run_node_shell(node, &line)?;
        }
        ShellCommand::Unknown(line) => writeln!(out, "*** Unknown command: {line}")?,
    }
    Ok(())
}

fn dump_in_process(netns: &Path) -> anyhow::Result<String> {
    let sockets = dump_tcp_sockets(netns, &SocketFilter::default())?;
    Ok(sockets
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Runs `netlab-sockdiag <netns>` through the network's runner so it gets
/// the same privileges as the `ip`/`tc` commands.
fn dump_with_helper(net: &Network, netns: &Path) -> anyhow::Result<String> {
    let program = sockdiag_program();
    let netns = netns.display().to_string();
    let output = net.run_root(&program, &[&netns])?;
    if !output.success {
        anyhow::bail!("{SOCKDIAG_BIN} failed: {}", output.stderr.trim());
    }
    Ok(output.stdout)
}

/// The helper next to the running executable, else whatever `PATH` finds.
fn sockdiag_program() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(SOCKDIAG_BIN)))
        .filter(|path| path.is_file())
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| SOCKDIAG_BIN.to_string())
}

/// Replaces arguments naming a node with that node's address.
fn substitute_node_ips(net: &Network, args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| match net.default_ip(arg) {
            Some(ip) => ip.to_string(),
            None => arg.clone(),
        })
        .collect()
}

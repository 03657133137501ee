//! netlab-sockdiag
//!
//! Dumps the established IPv4 TCP sockets of one network namespace
//! together with their kernel `tcp_info` (RTT, cwnd, retransmits).

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use netlab_sim::sockdiag::{dump_tcp_sockets, SocketFilter};

#[derive(Parser, Debug)]
#[command(name = "netlab-sockdiag", about = "Dump TCP socket state inside a network namespace")]
struct Cli {
    /// Namespace handle (`/proc/<pid>/ns/net`, `/var/run/netns/<name>`)
    /// or the bare name of an `ip netns` namespace.
    netns: String,

    #[arg(long)]
    src: Option<Ipv4Addr>,

    #[arg(long)]
    dst: Option<Ipv4Addr>,

    #[arg(long)]
    sport: Option<u16>,

    #[arg(long)]
    dport: Option<u16>,

    /// Print JSON instead of the text report.
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl Cli {
    fn netns_path(&self) -> PathBuf {
        if self.netns.contains('/') {
            PathBuf::from(&self.netns)
        } else {
            PathBuf::from("/var/run/netns").join(&self.netns)
        }
    }

    fn filter(&self) -> SocketFilter {
        SocketFilter {
            src: self.src,
            dst: self.dst,
            sport: self.sport,
            dport: self.dport,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let path = cli.netns_path();
    let sockets = dump_tcp_sockets(&path, &cli.filter())
        .with_context(|| format!("socket dump in {} failed", path.display()))?;
    tracing::debug!(count = sockets.len(), netns = %path.display(), "dump complete");

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&sockets)?);
    } else {
        for s in &sockets {
            println!("{s}");
        }
    }
    Ok(())
}

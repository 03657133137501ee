//! netlab
//!
//! Brings up a two-router experiment network in Linux network namespaces:
//!
//! ```text
//!  h1 ──┐
//!       r1 ──── r2 ── h3
//!  h2 ──┘
//! ```
//!
//! The `h1`–`r1` and `h2`–`r1` links take their bandwidth and delay from the
//! command line; the other two links run at the mean of those rates with
//! 1ms delay. After addressing and static routes are installed the tool
//! drops into an interactive shell and tears everything down on exit.

mod shell;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use netlab_sim::config::{NetlabConfig, Overrides};
use netlab_sim::exec::{CommandRunner, DryRunRunner, SystemRunner};
use netlab_sim::impairment::Delay;
use netlab_sim::network::Network;
use netlab_sim::plan::TopologyPlan;

/// Set by the Ctrl-C handler; checked once setup has finished.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn note_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
    tracing::info!("Interrupt");
}

/// Whether Ctrl-C arrived since the last call.
fn take_interrupt() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

/// Two-router topology with configurable h1 and h2 links.
#[derive(Parser, Debug)]
#[command(name = "netlab", about = "Two-router topology with configurable h1 and h2 links")]
struct Cli {
    /// Bandwidth for h1-r1 link (Mbps) [default: 10]
    #[arg(long)]
    bw_h1: Option<u32>,

    /// Delay for h1-r1 link [default: 100ms]
    #[arg(long)]
    delay_h1: Option<Delay>,

    /// Bandwidth for h2-r1 link (Mbps) [default: 10]
    #[arg(long)]
    bw_h2: Option<u32>,

    /// Delay for h2-r1 link [default: 100ms]
    #[arg(long)]
    delay_h2: Option<Delay>,

    /// TOML file with link and runtime settings; flags take precedence.
    #[arg(long, env = "NETLAB_CONFIG")]
    config: Option<PathBuf>,

    /// Log the ip/tc/sysctl commands instead of running them.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Run ip/tc/sysctl directly rather than through sudo.
    #[arg(long, default_value_t = false)]
    no_sudo: bool,

    /// Prefix for namespace names [default: nl-]
    #[arg(long)]
    prefix: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            bw_h1: self.bw_h1,
            delay_h1: self.delay_h1,
            bw_h2: self.bw_h2,
            delay_h2: self.delay_h2,
            sudo: self.no_sudo.then_some(false),
            namespace_prefix: self.prefix.clone(),
        }
    }

    fn load_config(&self) -> anyhow::Result<NetlabConfig> {
        let overrides = self.overrides();
        match &self.config {
            Some(path) => NetlabConfig::from_file(path, overrides)
                .with_context(|| format!("failed to load config {}", path.display())),
            None => Ok(NetlabConfig::from_toml_str("", overrides)?),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let params = &config.params;

    tracing::info!(
        bw_h1 = params.bw_h1,
        delay_h1 = %params.delay_h1,
        bw_h2 = params.bw_h2,
        delay_h2 = %params.delay_h2,
        bw_h3 = %params.derived_bandwidth(),
        delay_h3 = %params.derived_delay(),
        dry_run = cli.dry_run,
        "netlab starting"
    );

    let runner: Arc<dyn CommandRunner> = if cli.dry_run {
        Arc::new(DryRunRunner::new())
    } else {
        Arc::new(SystemRunner::new(config.runtime.sudo))
    };

    // Must be in place before setup; a SIGINT there would skip teardown.
    // In the shell the foreground command gets SIGINT, not us.
    if let Err(e) = ctrlc::set_handler(note_interrupt) {
        tracing::warn!("could not install Ctrl-C handler: {e}");
    }

    let plan = TopologyPlan::two_router(params);
    let mut net = Network::start(plan, runner, &config.runtime.network)
        .context("failed to bring up the network")?;

    if take_interrupt() {
        tracing::info!("*** Interrupted during setup");
        net.stop();
        return Ok(());
    }

    tracing::info!("*** Starting CLI:");
    let result = shell::run(&net, io::stdin().lock(), io::stdout().lock());

    net.stop();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_flags_gives_documented_defaults() {
        let cli = Cli::try_parse_from(["netlab"]).unwrap();
        let config = NetlabConfig::from_toml_str("", cli.overrides()).unwrap();
        assert_eq!(config.params.bw_h1, 10);
        assert_eq!(config.params.delay_h1.to_string(), "100ms");
        assert_eq!(config.params.bw_h2, 10);
        assert_eq!(config.params.delay_h2.to_string(), "100ms");
        assert_eq!(config.params.derived_bandwidth().to_string(), "10Mbit");
        assert_eq!(config.params.derived_delay().to_string(), "1ms");
        assert!(config.runtime.sudo);
    }

    #[test]
    fn flags_are_parsed() {
        let cli = Cli::try_parse_from([
            "netlab", "--bw-h1", "20", "--delay-h1", "50ms", "--bw-h2", "5", "--delay-h2", "2s",
            "--no-sudo", "--prefix", "exp-",
        ])
        .unwrap();
        let config = NetlabConfig::from_toml_str("", cli.overrides()).unwrap();
        assert_eq!(config.params.bw_h1, 20);
        assert_eq!(config.params.delay_h1, Delay::from_millis(50));
        assert_eq!(config.params.delay_h2, Delay::from_millis(2000));
        assert_eq!(config.params.derived_bandwidth().as_mbit(), 12.5);
        assert!(!config.runtime.sudo);
        assert_eq!(config.runtime.network.namespace_prefix, "exp-");
    }

    #[test]
    fn interrupt_is_consumed_once() {
        assert!(!take_interrupt());
        note_interrupt();
        assert!(take_interrupt());
        assert!(!take_interrupt());
    }

    #[test]
    fn malformed_flags_are_rejected() {
        assert!(Cli::try_parse_from(["netlab", "--bw-h1", "-3"]).is_err());
        assert!(Cli::try_parse_from(["netlab", "--bw-h1", "ten"]).is_err());
        assert!(Cli::try_parse_from(["netlab", "--delay-h2", "slow"]).is_err());
    }
}

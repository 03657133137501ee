//! Builds the real two-router topology in network namespaces and checks
//! reachability and shaping end to end.
//!
//! **Requirements:**
//! - Linux with `ip netns` + `tc` (htb, netem) support
//! - root
//!
//! Run:
//! ```bash
//! sudo cargo test -p netlab-sim --test two_router_netns -- --nocapture
//! ```

use std::sync::Arc;

use netlab_sim::exec::{CommandRunner, SystemRunner};
use netlab_sim::network::{Network, NetworkOptions};
use netlab_sim::plan::{TopologyParams, TopologyPlan};
use netlab_sim::test_util::{check_privileges, unique_ns_name};

/// Extracts `time=<ms>` from ping output.
fn get_ping_time(output: &str) -> Option<f32> {
    for line in output.lines() {
        if let Some(idx) = line.find("time=") {
            let rest = &line[idx + 5..];
            let end = rest.find(' ').unwrap_or(rest.len());
            return rest[..end].parse::<f32>().ok();
        }
    }
    None
}

fn start_network() -> Option<Network> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .with_test_writer()
        .try_init();

    if !check_privileges() {
        eprintln!("Skipping test, insufficient privileges or missing tools");
        return None;
    }
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(false));
    let options = NetworkOptions {
        namespace_prefix: format!("{}-", unique_ns_name("nl")),
    };
    let plan = TopologyPlan::two_router(&TopologyParams::default());
    match Network::start(plan, runner, &options) {
        Ok(net) => Some(net),
        Err(e) if e.to_string().contains("qdisc kind is unknown") => {
            eprintln!("Skipping test, htb/netem qdisc not available");
            None
        }
        Err(e) => panic!("Failed to start network: {e}"),
    }
}

#[test]
fn hosts_reach_each_other_through_both_routers() {
    let Some(mut net) = start_network() else {
        return;
    };

    let out = net
        .cmd("h1", &["ping", "-c", "3", "-i", "0.3", "10.0.2.101"])
        .expect("Failed to exec ping");
    println!("Ping output:\n{}", out.stdout);
    assert!(out.success, "h1 -> h3 ping failed: {}", out.stderr);

    // 100ms each way on h1-r1, 1ms on every other hop
    let rtt = get_ping_time(&out.stdout).expect("Could not parse ping time");
    assert!(rtt >= 200.0, "RTT {rtt} ms is below the configured 2x100ms");

    let report = net.ping_all();
    println!("{report}");
    assert_eq!(report.received(), report.sent());

    net.stop();
}

#[test]
fn routers_forward_and_stop_restores() {
    let Some(mut net) = start_network() else {
        return;
    };

    let out = net
        .cmd("r1", &["sysctl", "-n", "net.ipv4.ip_forward"])
        .expect("sysctl");
    assert_eq!(out.stdout.trim(), "1");

    let route = net.cmd("h1", &["ip", "route", "show", "default"]).expect("ip route");
    assert!(route.stdout.contains("initcwnd 10"), "{}", route.stdout);

    let qdisc = net
        .cmd("r1", &["tc", "qdisc", "show", "dev", "r1-eth0"])
        .expect("tc qdisc show");
    assert!(qdisc.stdout.contains("netem"), "{}", qdisc.stdout);

    let ns_path = net.namespace_path("h1").expect("h1 path");
    net.stop();
    assert!(!ns_path.exists(), "namespace {} survived stop()", ns_path.display());
}

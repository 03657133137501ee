//! Property-based checks of the two-router parameter derivation.

use netlab_sim::impairment::Bandwidth;
use netlab_sim::plan::{TopologyParams, TopologyPlan};
use proptest::prelude::*;

fn params(bw_h1: u32, bw_h2: u32) -> TopologyParams {
    TopologyParams {
        bw_h1,
        bw_h2,
        ..Default::default()
    }
}

proptest! {
    #[test]
    fn derived_bandwidth_is_exact_mean(a in 0u32..=100_000, b in 0u32..=100_000) {
        let p = params(a, b);
        let derived = p.derived_bandwidth().as_mbit();
        prop_assert_eq!(derived * 2.0, (a as u64 + b as u64) as f64);
        prop_assert_eq!(p.derived_delay().to_string(), "1ms");
    }

    #[test]
    fn transit_links_share_derived_shaping(a in 0u32..=1000, b in 0u32..=1000) {
        let plan = TopologyPlan::two_router(&params(a, b));
        let expected = Some(Bandwidth::mean(a, b));
        prop_assert_eq!(plan.links[2].shaping.bandwidth, expected);
        prop_assert_eq!(plan.links[3].shaping.bandwidth, expected);
        prop_assert_eq!(plan.links[0].shaping.bandwidth, Some(Bandwidth::mbit(a)));
        prop_assert_eq!(plan.links[1].shaping.bandwidth, Some(Bandwidth::mbit(b)));
    }

    #[test]
    fn addressing_never_depends_on_flags(a in any::<u32>(), b in any::<u32>()) {
        let plan = TopologyPlan::two_router(&params(a, b));
        let reference = TopologyPlan::two_router(&TopologyParams::default());
        prop_assert_eq!(&plan.nodes, &reference.nodes);
        prop_assert_eq!(&plan.addresses, &reference.addresses);
        prop_assert_eq!(&plan.routes, &reference.routes);
    }
}

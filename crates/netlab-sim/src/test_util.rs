use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonically increasing counter for generating unique test resource names.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether we have sufficient privileges (root) and tools (`ip`, `tc`)
/// available to create network namespaces. Returns `false` if the test
/// environment cannot support namespace-based tests.
pub fn check_privileges() -> bool {
    let ip_ok = match Command::new("ip").args(["netns", "list"]).output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    };
    let tc_ok = Command::new("tc")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    ip_ok && tc_ok && is_root()
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

/// Generates a unique namespace-safe prefix or name.
///
/// Combines the prefix, process ID, and an atomic counter to avoid
/// collisions when tests run in parallel. Names are truncated to 15
/// characters to respect the Linux interface name limit.
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = format!("{}_{:x}_{}", prefix, pid % 0xFFFF, seq);
    if name.len() > 15 {
        name[..15].to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_differ_and_fit() {
        let a = unique_ns_name("nl_test");
        let b = unique_ns_name("nl_test");
        assert_ne!(a, b);
        assert!(a.len() <= 15);
    }
}

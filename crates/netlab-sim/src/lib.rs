//! Emulated IPv4 networks on a single Linux machine.
//!
//! Provides network namespace management, veth links shaped with
//! `tc htb`/`netem`, router forwarding lifecycle, the two-router
//! experiment topology, and TCP socket diagnostics inside a node's
//! namespace.

pub mod config;
pub mod error;
pub mod exec;
pub mod impairment;
pub mod network;
pub mod node;
pub mod plan;
pub mod sockdiag;
pub mod topology;

pub mod test_util;

pub use error::{NetlabError, Result};

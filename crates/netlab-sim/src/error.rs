use std::io;

use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum NetlabError {
    #[error("command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
    #[error("unknown node `{0}`")]
    UnknownNode(String),
    #[error("invalid delay `{0}` (expected e.g. 100ms, 500us, 1s)")]
    InvalidDelay(String),
    #[error("invalid IPv4 address `{0}`")]
    InvalidAddress(String),
    #[error("invalid config TOML: {0}")]
    Config(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    ConfigVersion(u32),
    #[error("netlink: {0}")]
    Netlink(String),
}

pub type Result<T> = std::result::Result<T, NetlabError>;

impl NetlabError {
    pub(crate) fn command_failed(program: &str, args: &[&str], stderr: &str) -> Self {
        NetlabError::CommandFailed {
            command: crate::exec::render(program, args),
            stderr: stderr.trim().to_string(),
        }
    }
}

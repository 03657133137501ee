use std::path::Path;

use serde::Deserialize;

use crate::error::{NetlabError, Result};
use crate::impairment::Delay;
use crate::network::NetworkOptions;
use crate::plan::TopologyParams;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetlabConfigInput {
    pub version: u32,
    pub links: LinksInput,
    pub runtime: RuntimeInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinksInput {
    pub h1: LinkInput,
    pub h2: LinkInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkInput {
    /// Mbit/s
    pub bw: Option<u32>,
    pub delay: Option<Delay>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeInput {
    pub sudo: Option<bool>,
    pub namespace_prefix: Option<String>,
}

/// Values given on the command line. They win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bw_h1: Option<u32>,
    pub delay_h1: Option<Delay>,
    pub bw_h2: Option<u32>,
    pub delay_h2: Option<Delay>,
    pub sudo: Option<bool>,
    pub namespace_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Prefix external commands with `sudo`.
    pub sudo: bool,
    pub network: NetworkOptions,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sudo: true,
            network: NetworkOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetlabConfig {
    pub params: TopologyParams,
    pub runtime: RuntimeConfig,
}

impl NetlabConfigInput {
    pub fn resolve(self, overrides: Overrides) -> Result<NetlabConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(NetlabError::ConfigVersion(version));
        }

        let defaults = TopologyParams::default();
        let params = TopologyParams {
            bw_h1: overrides.bw_h1.or(self.links.h1.bw).unwrap_or(defaults.bw_h1),
            delay_h1: overrides
                .delay_h1
                .or(self.links.h1.delay)
                .unwrap_or(defaults.delay_h1),
            bw_h2: overrides.bw_h2.or(self.links.h2.bw).unwrap_or(defaults.bw_h2),
            delay_h2: overrides
                .delay_h2
                .or(self.links.h2.delay)
                .unwrap_or(defaults.delay_h2),
        };

        let default_runtime = RuntimeConfig::default();
        let prefix = overrides
            .namespace_prefix
            .or(self.runtime.namespace_prefix)
            .map(|p| p.trim().to_string())
            .unwrap_or(default_runtime.network.namespace_prefix);
        let runtime = RuntimeConfig {
            sudo: overrides
                .sudo
                .or(self.runtime.sudo)
                .unwrap_or(default_runtime.sudo),
            network: NetworkOptions {
                namespace_prefix: prefix,
            },
        };

        Ok(NetlabConfig { params, runtime })
    }
}

impl NetlabConfig {
    pub fn from_toml_str(input: &str, overrides: Overrides) -> Result<Self> {
        if input.trim().is_empty() {
            return NetlabConfigInput::default().resolve(overrides);
        }
        let parsed: NetlabConfigInput = toml::from_str(input)?;
        parsed.resolve(overrides)
    }

    pub fn from_file(path: &Path, overrides: Overrides) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw, overrides)
    }
}

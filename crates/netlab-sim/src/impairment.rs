use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::error::{NetlabError, Result};
use crate::topology::Namespace;

/// Highest rate the htb shaper is configured with, in Mbit/s.
pub const MAX_BANDWIDTH_MBIT: f64 = 1000.0;

/// Link rate in megabits per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Bandwidth(pub f64);

impl Bandwidth {
    pub fn mbit(mbit: u32) -> Self {
        Bandwidth(mbit as f64)
    }

    /// Arithmetic mean of two integer rates. Odd sums keep their half.
    pub fn mean(a: u32, b: u32) -> Self {
        Bandwidth((a as f64 + b as f64) / 2.0)
    }

    pub fn as_mbit(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Mbit", self.0)
    }
}

/// One-way delay as understood by netem (`100ms`, `500us`, `1s`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Delay(Duration);

impl Delay {
    pub fn from_millis(ms: u64) -> Self {
        Delay(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for Delay {
    fn from(d: Duration) -> Self {
        Delay(d)
    }
}

impl FromStr for Delay {
    type Err = NetlabError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);

        let value: f64 = number
            .parse()
            .map_err(|_| NetlabError::InvalidDelay(s.to_string()))?;
        if !value.is_finite() || value < 0.0 {
            return Err(NetlabError::InvalidDelay(s.to_string()));
        }

        // netem treats a bare number as microseconds
        let micros = match unit.trim() {
            "" | "us" | "usec" => value,
            "ms" | "msec" => value * 1_000.0,
            "s" | "sec" => value * 1_000_000.0,
            _ => return Err(NetlabError::InvalidDelay(s.to_string())),
        };
        if (micros - micros.round()).abs() > 1e-6 {
            return Err(NetlabError::InvalidDelay(s.to_string()));
        }

        Ok(Delay(Duration::from_micros(micros.round() as u64)))
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let micros = self.0.as_micros();
        if micros != 0 && micros % 1_000_000 == 0 {
            write!(f, "{}s", micros / 1_000_000)
        } else if micros % 1_000 == 0 {
            write!(f, "{}ms", micros / 1_000)
        } else {
            write!(f, "{}us", micros)
        }
    }
}

impl Serialize for Delay {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Delay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Traffic shaping for one side of a link.
///
/// `bandwidth` installs an htb rate limiter; `delay`, `jitter`, `loss_percent`
/// and `max_queue` go to a netem qdisc hung below it. A zero bandwidth means
/// the link is not rate limited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkShaping {
    pub bandwidth: Option<Bandwidth>,
    pub delay: Option<Delay>,
    pub jitter: Option<Delay>,
    pub loss_percent: f32,
    /// netem queue `limit` in packets.
    pub max_queue: Option<u32>,
}

impl LinkShaping {
    pub fn new(bandwidth: Bandwidth, delay: Delay) -> Self {
        Self {
            bandwidth: Some(bandwidth),
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Rate to configure, or `None` when the link stays unshaped.
    fn effective_bandwidth(&self) -> Option<Bandwidth> {
        let bw = self.bandwidth?;
        if bw.0 == 0.0 {
            return None;
        }
        if !(bw.0 > 0.0 && bw.0 <= MAX_BANDWIDTH_MBIT) {
            warn!(
                "Bandwidth limit {} is outside supported range 0..{} - ignoring",
                bw.0, MAX_BANDWIDTH_MBIT
            );
            return None;
        }
        Some(bw)
    }

    fn effective_loss(&self) -> Option<f32> {
        if self.loss_percent == 0.0 {
            return None;
        }
        if !(0.0..=100.0).contains(&self.loss_percent) {
            warn!("Bad loss percentage {}% - ignoring", self.loss_percent);
            return None;
        }
        Some(self.loss_percent)
    }

    fn netem_params(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(delay) = self.delay {
            args.push("delay".into());
            args.push(delay.to_string());
            if let Some(jitter) = self.jitter {
                if jitter.as_duration() > Duration::ZERO {
                    args.push(jitter.to_string());
                }
            }
        }
        if let Some(loss) = self.effective_loss() {
            args.push("loss".into());
            args.push(format!("{}%", loss));
        }
        if let Some(limit) = self.max_queue {
            args.push("limit".into());
            args.push(limit.to_string());
        }
        args
    }

    /// `tc` argument lists that install this shaping on `interface`,
    /// assuming no root qdisc is present.
    pub fn tc_commands(&self, interface: &str) -> Vec<Vec<String>> {
        let mut cmds = Vec::new();
        let netem = self.netem_params();

        let netem_parent: &[&str] = match self.effective_bandwidth() {
            Some(bw) => {
                cmds.push(strings(&[
                    "qdisc", "add", "dev", interface, "root", "handle", "5:0", "htb", "default",
                    "1",
                ]));
                let rate = bw.to_string();
                cmds.push(strings(&[
                    "class", "add", "dev", interface, "parent", "5:0", "classid", "5:1", "htb",
                    "rate", &rate, "burst", "15k",
                ]));
                &["parent", "5:1", "handle", "10:"]
            }
            None => &["root", "handle", "10:"],
        };

        if !netem.is_empty() {
            let mut cmd = strings(&["qdisc", "add", "dev", interface]);
            cmd.extend(netem_parent.iter().map(|s| s.to_string()));
            cmd.push("netem".into());
            cmd.extend(netem);
            cmds.push(cmd);
        }

        cmds
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Installs `shaping` on an interface inside a namespace.
///
/// Removes any existing root qdisc first (best effort), so calling this
/// again replaces the previous shaping.
pub fn apply_shaping(ns: &Namespace, interface: &str, shaping: &LinkShaping) -> Result<()> {
    let _ = ns.exec("tc", &["qdisc", "del", "dev", interface, "root"]);

    for cmd in shaping.tc_commands(interface) {
        let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
        ns.exec_checked("tc", &args)?;
    }
    Ok(())
}

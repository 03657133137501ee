//! Process execution seam.
//!
//! Every `ip`, `tc` and `sysctl` invocation goes through a [`CommandRunner`]
//! so the same topology code can drive the kernel or just print what it
//! would do.

use std::io;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use tracing::{debug, info};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandRunner: Send + Sync {
    /// Runs `program args...` to completion and captures its output.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;

    /// Runs `program args...` attached to the caller's terminal.
    /// Returns whether it exited successfully.
    fn run_foreground(&self, program: &str, args: &[&str]) -> io::Result<bool>;

    /// Whether commands actually touch the system.
    fn is_live(&self) -> bool {
        true
    }

    /// Whether commands are elevated through `sudo` rather than running
    /// with this process's own privileges.
    fn uses_sudo(&self) -> bool {
        false
    }
}

/// Runs commands for real, optionally through `sudo`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    sudo: bool,
}

impl SystemRunner {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args);
        cmd
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        debug!(command = %render(program, args), "exec");
        let output = self
            .command(program, args)
            .stdin(Stdio::null())
            .output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_foreground(&self, program: &str, args: &[&str]) -> io::Result<bool> {
        let status = self
            .command(program, args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        Ok(status.success())
    }

    fn uses_sudo(&self) -> bool {
        self.sudo
    }
}

/// Records command lines instead of running them. Every command succeeds
/// with empty output.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    log: Mutex<Vec<String>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command lines issued so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn record(&self, program: &str, args: &[&str]) {
        let line = render(program, args);
        info!("[dry-run] {}", line);
        if let Ok(mut log) = self.log.lock() {
            log.push(line);
        }
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        self.record(program, args);
        Ok(CommandOutput {
            success: true,
            ..Default::default()
        })
    }

    fn run_foreground(&self, program: &str, args: &[&str]) -> io::Result<bool> {
        self.record(program, args);
        Ok(true)
    }

    fn is_live(&self) -> bool {
        false
    }
}

pub(crate) fn render(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_records_in_order() {
        let runner = DryRunRunner::new();
        runner.run("ip", &["netns", "add", "nl-h1"]).unwrap();
        runner
            .run_foreground("ip", &["netns", "exec", "nl-h1", "ping", "10.0.1.1"])
            .unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "ip netns add nl-h1".to_string(),
                "ip netns exec nl-h1 ping 10.0.1.1".to_string(),
            ]
        );
        assert!(!runner.is_live());
    }

    #[test]
    fn dry_run_reports_success() {
        let runner = DryRunRunner::new();
        let out = runner.run("tc", &["qdisc", "show"]).unwrap();
        assert!(out.success);
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn system_runner_captures_output() {
        let runner = SystemRunner::new(false);
        let out = match runner.run("echo", &["hello"]) {
            Ok(out) => out,
            Err(_) => {
                eprintln!("Skipping test, echo not available");
                return;
            }
        };
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn sudo_is_reported() {
        assert!(SystemRunner::new(true).uses_sudo());
        assert!(!SystemRunner::new(false).uses_sudo());
        assert!(!DryRunRunner::new().uses_sudo());
    }
}

use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use stackup_core::validate_identifier;
use tracing::debug;

use crate::process::output_within;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub running: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
}

impl ServiceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }
}

/// Host service supervisor. Implementations must be idempotent: starting a
/// running service or stopping a stopped one succeeds.
pub trait ServiceManager: Send + Sync {
    fn status(&self, service: &str) -> Result<ServiceSnapshot>;

    /// `timeout` bounds the action the same way it bounds installer calls.
    fn apply(&self, service: &str, action: ServiceAction, timeout: Option<Duration>) -> Result<()>;

    /// Brings `service` back to `target`, touching only what differs.
    fn restore(&self, service: &str, target: ServiceSnapshot) -> Result<()> {
        let current = self.status(service)?;
        if current.enabled != target.enabled {
            let action = if target.enabled {
                ServiceAction::Enable
            } else {
                ServiceAction::Disable
            };
            self.apply(service, action, None)?;
        }
        if target.running {
            // Restart even when running so restored files are loaded.
            let action = if current.running {
                ServiceAction::Restart
            } else {
                ServiceAction::Start
            };
            self.apply(service, action, None)?;
        } else if current.running {
            self.apply(service, ServiceAction::Stop, None)?;
        }
        Ok(())
    }
}

/// `systemctl`-backed supervisor.
#[derive(Debug, Clone)]
pub struct SystemdServices {
    program: String,
}

impl Default for SystemdServices {
    fn default() -> Self {
        Self {
            program: "systemctl".to_string(),
        }
    }
}

impl SystemdServices {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn query(&self, verb: &str, service: &str) -> Result<bool> {
        let output = self.run(&[verb, "--quiet", &unit_name(service)], None)?;
        Ok(output.status.success())
    }

    fn run(&self, args: &[&str], timeout: Option<Duration>) -> Result<Output> {
        debug!(program = %self.program, args = ?args, "running service command");
        output_within(Command::new(&self.program).args(args), timeout)
            .with_context(|| format!("failed to run {} {}", self.program, args.join(" ")))
    }
}

impl ServiceManager for SystemdServices {
    fn status(&self, service: &str) -> Result<ServiceSnapshot> {
        validate_identifier("service", service)?;
        Ok(ServiceSnapshot {
            running: self.query("is-active", service)?,
            enabled: self.query("is-enabled", service)?,
        })
    }

    fn apply(&self, service: &str, action: ServiceAction, timeout: Option<Duration>) -> Result<()> {
        validate_identifier("service", service)?;
        let unit = unit_name(service);
        let output = self.run(&[action.as_str(), &unit], timeout)?;
        if output.status.success() {
            return Ok(());
        }
        Err(anyhow!(
            "{} {} {} failed: status={} stderr='{}'",
            self.program,
            action.as_str(),
            unit,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

fn unit_name(service: &str) -> String {
    format!("{service}.service")
}

use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use semver::Version;
use stackup_core::{normalize_release_tag, validate_identifier, UpgradeError};
use tracing::debug;

use crate::process::output_within;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Per-component installation logic. The orchestrator only needs these three
/// entry points; how a component is downloaded or configured is not its
/// concern.
///
/// `timeout` bounds a single attempt. Implementations that outlive it
/// should fail with an `io::ErrorKind::TimedOut` error in the chain.
pub trait ComponentInstaller: Send + Sync {
    /// `None` when the component is not installed.
    fn installed_version(&self, component: &str) -> Result<Option<Version>>;

    fn install(&self, component: &str, version: &Version, timeout: Option<Duration>) -> Result<()>;

    fn health_check(&self, component: &str, timeout: Option<Duration>) -> Result<HealthStatus>;
}

/// Runs `<scripts_dir>/<component>` with a verb:
///
/// - `version` prints the installed version (empty output: not installed)
/// - `install <version>` installs the given version
/// - `health` exits 0 when healthy
#[derive(Debug, Clone)]
pub struct ScriptInstaller {
    scripts_dir: PathBuf,
}

impl ScriptInstaller {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
        }
    }

    fn script(&self, component: &str) -> Result<PathBuf> {
        validate_identifier("component name", component)?;
        let path = self.scripts_dir.join(component);
        if !path.is_file() {
            return Err(UpgradeError::validation(
                "installer",
                format!("no script for '{component}' at {}", path.display()),
            )
            .into());
        }
        Ok(path)
    }

    fn run(&self, component: &str, args: &[&str], timeout: Option<Duration>) -> Result<Output> {
        let script = self.script(component)?;
        debug!(component, script = %script.display(), args = ?args, "running installer script");
        output_within(Command::new(&script).args(args), timeout)
            .with_context(|| format!("failed to run {}", script.display()))
    }
}

impl ComponentInstaller for ScriptInstaller {
    fn installed_version(&self, component: &str) -> Result<Option<Version>> {
        let output = self.run(component, &["version"], None)?;
        if !output.status.success() {
            return Err(anyhow!(
                "installer version query for '{component}' failed: status={} stderr='{}'",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reported = stdout.trim();
        if reported.is_empty() {
            return Ok(None);
        }
        normalize_release_tag(reported)
            .map(Some)
            .ok_or_else(|| anyhow!("installer for '{component}' reported unparseable version '{reported}'"))
    }

    fn install(&self, component: &str, version: &Version, timeout: Option<Duration>) -> Result<()> {
        let version = version.to_string();
        let output = self.run(component, &["install", &version], timeout)?;
        if output.status.success() {
            return Ok(());
        }
        Err(anyhow!(
            "install of {component} {version} failed: status={} stderr='{}'",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }

    fn health_check(&self, component: &str, timeout: Option<Duration>) -> Result<HealthStatus> {
        let output = self.run(component, &["health"], timeout)?;
        if output.status.success() {
            return Ok(HealthStatus::Healthy);
        }
        let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok(HealthStatus::Unhealthy(if detail.is_empty() {
            format!("health check exited with {}", output.status)
        } else {
            detail
        }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::io;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use stackup_core::{exit_code_for, ExitCode};

    use super::*;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("must write script");
        let mut permissions = fs::metadata(&path).expect("metadata").permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).expect("must chmod");
    }

    #[test]
    fn script_installer_drives_verbs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = dir.path().join("agent_a.version");
        fs::write(&state, "v2.0.5\n").expect("must seed version");
        write_script(
            dir.path(),
            "agent_a",
            &format!(
                "case \"$1\" in\n  version) cat '{state}' ;;\n  install) echo \"$2\" > '{state}' ;;\n  health) exit 0 ;;\nesac",
                state = state.display()
            ),
        );

        let installer = ScriptInstaller::new(dir.path());
        assert_eq!(
            installer
                .installed_version("agent_a")
                .expect("must query")
                .map(|v| v.to_string()),
            Some("2.0.5".to_string())
        );
        installer
            .install("agent_a", &Version::new(2, 1, 0), Some(Duration::from_secs(5)))
            .expect("must install");
        assert_eq!(
            installer
                .installed_version("agent_a")
                .expect("must query")
                .map(|v| v.to_string()),
            Some("2.1.0".to_string())
        );
        assert!(installer
            .health_check("agent_a", None)
            .expect("must run")
            .is_healthy());
    }

    #[test]
    fn unhealthy_exit_reports_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(dir.path(), "agent_b", "echo 'port 9100 closed' >&2\nexit 1");
        let installer = ScriptInstaller::new(dir.path());
        assert_eq!(
            installer.health_check("agent_b", None).expect("must run"),
            HealthStatus::Unhealthy("port 9100 closed".to_string())
        );
    }

    #[test]
    fn missing_script_is_a_validation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let installer = ScriptInstaller::new(dir.path());
        let missing = installer.installed_version("agent_c").expect_err("must fail");
        assert_eq!(exit_code_for(&missing), ExitCode::Validation);
        assert!(installer.installed_version("../agent").is_err());
    }

    #[test]
    fn hung_health_script_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(dir.path(), "central_db", "sleep 5");
        let installer = ScriptInstaller::new(dir.path());
        let err = installer
            .health_check("central_db", Some(Duration::from_millis(200)))
            .expect_err("must time out");
        let timed_out = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<io::Error>())
            .any(|io| io.kind() == io::ErrorKind::TimedOut);
        assert!(timed_out, "unexpected error: {err:#}");
    }
}

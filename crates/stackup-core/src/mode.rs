use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::UpgradeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    DryRun,
    #[default]
    Standard,
    Safe,
    Fast,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Standard => "standard",
            Self::Safe => "safe",
            Self::Fast => "fast",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dry-run" | "dry_run" | "dryrun" => Ok(Self::DryRun),
            "standard" => Ok(Self::Standard),
            "safe" => Ok(Self::Safe),
            "fast" => Ok(Self::Fast),
            other => Err(UpgradeError::validation(
                "mode",
                format!("'{other}' is not one of safe, standard, fast"),
            )
            .into()),
        }
    }

    pub fn is_dry_run(self) -> bool {
        self == Self::DryRun
    }

    /// Safe mode treats any component failure as fatal to the whole run.
    pub fn failures_are_fatal(self) -> bool {
        self == Self::Safe
    }
}

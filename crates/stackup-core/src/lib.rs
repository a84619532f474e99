mod atomic;
mod config;
mod error;
mod mode;
mod names;
mod version;

pub use atomic::{unix_now, write_atomic, write_json_atomic};
pub use config::{
    ComponentConfig, ConfigBundle, ConfigPaths, FailurePolicy, PhaseConfig, PhasesDocument,
    ResolverSection, RiskTier, Settings, VersionsDocument,
};
pub use error::{exit_code_for, ExitCode, UpgradeError};
pub use mode::RunMode;
pub use names::{is_valid_identifier, validate_identifier};
pub use version::{normalize_release_tag, parse_strict_version, parse_version_range};

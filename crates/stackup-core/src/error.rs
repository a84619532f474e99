use thiserror::Error;

/// Classified failures that change how the CLI reports and exits.
///
/// These travel inside `anyhow::Error` and are recovered with `downcast_ref`
/// at the process edge, so library code keeps returning `anyhow::Result`.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("state integrity violation: {0}")]
    StateIntegrity(String),

    #[error("{resource} is locked by pid {owner_pid}")]
    LockBusy { resource: String, owner_pid: u32 },

    #[error("component '{component}' failed: {message}")]
    Operational { component: String, message: String },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("run interrupted; resume with --resume")]
    Interrupted,
}

impl UpgradeError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Validation { .. } => ExitCode::Validation,
            Self::LockBusy { .. } => ExitCode::LockBusy,
            Self::StateIntegrity(_)
            | Self::Operational { .. }
            | Self::Transient(_)
            | Self::Interrupted => ExitCode::Failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    Failure,
    NoOp,
    Validation,
    LockBusy,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::NoOp => 2,
            Self::Validation => 3,
            Self::LockBusy => 4,
        }
    }
}

/// Walks the error chain looking for a classified failure; anything
/// unclassified is a general failure.
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<UpgradeError>())
        .map(UpgradeError::exit_code)
        .unwrap_or(ExitCode::Failure)
}

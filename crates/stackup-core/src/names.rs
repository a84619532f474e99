use anyhow::Result;

use crate::UpgradeError;

const MAX_IDENTIFIER_LEN: usize = 64;

pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Rejects anything that could escape a path segment or a generated query.
/// Every component, phase, service and run identifier passes through here
/// before it is joined onto a filesystem path.
pub fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(UpgradeError::validation(field, "must not be empty").into());
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(UpgradeError::validation(
            field,
            format!("'{value}' exceeds {MAX_IDENTIFIER_LEN} characters"),
        )
        .into());
    }
    if !is_valid_identifier(value) {
        return Err(UpgradeError::validation(
            field,
            format!("'{value}' may only contain ASCII letters, digits, '-' and '_'"),
        )
        .into());
    }
    Ok(())
}

use std::path::{Component, Path};

use crate::TransferError;

/// Validates the name a transfer is announced under.
///
/// Chunk ids and the receiver's reassembly paths are derived from it, so
/// it must be a single plain path component.
///
/// Rejects:
/// - Empty names
/// - Path separators (`/` or `\`)
/// - `.` and `..`
/// - Names containing NUL
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::InvalidFileName("empty name".into()));
    }

    if file_name.contains(['/', '\\', '\0']) {
        return Err(TransferError::InvalidFileName(format!(
            "separators not allowed: {file_name}"
        )));
    }

    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidFileName(format!(
            "not a plain file name: {file_name}"
        ))),
    }
}

//! Cache directory validation
//!
//! The manager creates a missing cache directory on startup, so only an
//! existing path of the wrong kind is an error.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use std::path::Path;

/// Validate the certificate cache directory
pub fn validate_cache_dir(dir: &Path) -> ValidationResult {
    let mut result = ValidationResult::new();

    if dir.as_os_str().is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Cache,
            "cache-dir must not be empty",
        ));
        return result;
    }

    let metadata = match std::fs::metadata(dir) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return result,
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Cache,
                format!("Cannot inspect cache directory {:?}: {}", dir, e),
            ));
            return result;
        }
    };

    if !metadata.is_dir() {
        result.add_error(ValidationError::new(
            ErrorCategory::Cache,
            format!("Cache path {:?} exists but is not a directory", dir),
        ));
        return result;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            result.add_warning(ValidationWarning::new(format!(
                "Cache directory {:?} has mode {:o}; private keys are stored there, 700 is expected",
                dir, mode
            )));
        }
    }

    result
}

use std::path::{Component, Path, PathBuf};

use access::{BridgeError, Result};

/// Validates that a device-reported relative path stays inside its base
/// directory and returns it as a host path.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_relative_path(relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(BridgeError::invalid_parameter("empty relative path"));
    }

    let path = Path::new(relative);
    if path.is_absolute() {
        return Err(BridgeError::invalid_parameter(format!(
            "absolute path not allowed: {relative}"
        )));
    }

    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(BridgeError::invalid_parameter(format!(
                    "parent directory traversal not allowed: {relative}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(BridgeError::invalid_parameter(format!(
                    "absolute path not allowed: {relative}"
                )));
            }
            Component::CurDir => {}
            Component::Normal(part) => clean.push(part),
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(BridgeError::invalid_parameter(format!(
            "path has no file component: {relative}"
        )));
    }

    Ok(clean)
}

/// Joins a validated relative path onto `base`.
pub fn resolve_under(base: &Path, relative: &str) -> Result<PathBuf> {
    Ok(base.join(validate_relative_path(relative)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use access::ErrorCode;

    #[test]
    fn rejects_empty_path() {
        assert!(validate_relative_path("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        let err = validate_relative_path("DCIM/../../etc/passwd").unwrap_err();
        assert!(err.is(ErrorCode::InvalidParameter));
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_relative_path("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_current_dir_only() {
        assert!(validate_relative_path("./.").is_err());
    }

    #[test]
    fn strips_current_dir_components() {
        let path = validate_relative_path("./DCIM/./IMG_0001.JPG").unwrap();
        assert_eq!(path, PathBuf::from("DCIM/IMG_0001.JPG"));
    }

    #[test]
    fn accepts_dotfile() {
        assert!(validate_relative_path(".thumbnails/1.jpg").is_ok());
    }

    #[test]
    fn resolves_under_base() {
        let target = resolve_under(Path::new("/backup"), "DCIM/100/a.mov").unwrap();
        assert_eq!(target, PathBuf::from("/backup/DCIM/100/a.mov"));
    }
}

//! Path resolvers, one per access method.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use access::{AccessMethod, BridgeError, DeviceDescriptor, PathResolver, Result};

use crate::channels::command::{self, TemplateVars};
use crate::config::{Config, MetadataChannelConfig, ShellChannelConfig};

/// Finds the device's mount point under a set of mount roots.
///
/// Looks for a directory named like the device (case-insensitive) directly
/// under each root and one level deeper (`/run/media/<user>/<name>`).
pub struct MountPointResolver {
    roots: Vec<PathBuf>,
    priority: i32,
}

impl MountPointResolver {
    pub fn new(roots: Vec<PathBuf>, priority: i32) -> Self {
        Self { roots, priority }
    }

    fn find_in(dir: &Path, name: &str, depth: usize) -> Option<PathBuf> {
        let entries = fs::read_dir(dir).ok()?;
        let mut subdirs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if entry.file_name().to_string_lossy().eq_ignore_ascii_case(name) {
                return Some(path);
            }
            subdirs.push(path);
        }
        if depth == 0 {
            return None;
        }
        subdirs.sort();
        subdirs
            .iter()
            .find_map(|sub| Self::find_in(sub, name, depth - 1))
    }
}

impl PathResolver for MountPointResolver {
    fn method(&self) -> AccessMethod {
        AccessMethod::DirectFilesystem
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_available(&self) -> bool {
        self.roots.iter().any(|root| root.is_dir())
    }

    fn resolve(&self, device: &DeviceDescriptor) -> Result<String> {
        if device.display_name.is_empty() {
            return Err(BridgeError::invalid_parameter("device has no display name"));
        }
        for root in self.roots.iter().filter(|r| r.is_dir()) {
            if let Some(found) = Self::find_in(root, &device.display_name, 1) {
                tracing::debug!(mount = %found.display(), "Found mount point");
                return Ok(found.to_string_lossy().into_owned());
            }
        }
        Err(BridgeError::device_not_found(format!(
            "no mount point named {}",
            device.display_name
        ))
        .with_context(
            "mount_roots",
            self.roots
                .iter()
                .map(|r| r.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }
}

/// Resolves a handle through the shell automation program.
pub struct ShellResolver {
    config: ShellChannelConfig,
    priority: i32,
}

impl ShellResolver {
    pub fn new(config: ShellChannelConfig, priority: i32) -> Self {
        Self { config, priority }
    }
}

impl PathResolver for ShellResolver {
    fn method(&self) -> AccessMethod {
        AccessMethod::ShellAutomation
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_available(&self) -> bool {
        !self.config.list_args.is_empty() && command::is_program_available(&self.config.program)
    }

    fn resolve(&self, device: &DeviceDescriptor) -> Result<String> {
        if self.config.resolve_args.is_empty() {
            return Ok(format!("shell://{}", device.display_name));
        }
        let args = command::render_args(
            &self.config.resolve_args,
            &TemplateVars {
                device,
                handle: &device.native_handle,
                path: "",
            },
        );
        let output = command::run_capture(
            &self.config.program,
            &args,
            Duration::from_secs(self.config.timeout_secs),
        )?;
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                BridgeError::device_not_found(format!(
                    "{} did not report a handle for {}",
                    self.config.program, device.display_name
                ))
            })
    }
}

/// Addresses the device for metadata queries by handle or USB IDs.
pub struct MetadataResolver {
    config: MetadataChannelConfig,
    priority: i32,
}

impl MetadataResolver {
    pub fn new(config: MetadataChannelConfig, priority: i32) -> Self {
        Self { config, priority }
    }
}

impl PathResolver for MetadataResolver {
    fn method(&self) -> AccessMethod {
        AccessMethod::MetadataQuery
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_available(&self) -> bool {
        !self.config.query_args.is_empty() && command::is_program_available(&self.config.program)
    }

    fn resolve(&self, device: &DeviceDescriptor) -> Result<String> {
        if !device.native_handle.is_empty() {
            return Ok(device.native_handle.clone());
        }
        if !device.vendor_id.is_empty() && !device.product_id.is_empty() {
            return Ok(format!("usb:{}:{}", device.vendor_id, device.product_id));
        }
        Err(BridgeError::device_not_found(format!(
            "{} has neither a handle nor USB IDs",
            device.display_name
        )))
    }
}

/// The built-in resolvers configured from `config`.
pub fn default_resolvers(config: &Config) -> Vec<Box<dyn PathResolver>> {
    let priorities = &config.resolvers.priorities;
    vec![
        Box::new(MountPointResolver::new(
            config.resolvers.mount_roots.clone(),
            priorities.direct_filesystem,
        )),
        Box::new(ShellResolver::new(
            config.channels.shell.clone(),
            priorities.shell_automation,
        )),
        Box::new(MetadataResolver::new(
            config.channels.metadata.clone(),
            priorities.metadata_query,
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use access::ErrorCode;
    use tempfile::TempDir;

    #[test]
    fn test_mount_point_direct_child() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("EOS_DIGITAL")).unwrap();
        let resolver = MountPointResolver::new(vec![root.path().to_path_buf()], 30);

        assert!(resolver.is_available());
        let path = resolver
            .resolve(&DeviceDescriptor::new("eos_digital", "04a9", "3218"))
            .unwrap();
        assert!(path.ends_with("EOS_DIGITAL"));
    }

    #[test]
    fn test_mount_point_nested_user_dir() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("alice/Camera")).unwrap();
        let resolver = MountPointResolver::new(vec![root.path().to_path_buf()], 30);

        let path = resolver
            .resolve(&DeviceDescriptor::new("Camera", "", ""))
            .unwrap();
        assert_eq!(PathBuf::from(path), root.path().join("alice/Camera"));
    }

    #[test]
    fn test_mount_point_not_found() {
        let root = TempDir::new().unwrap();
        let resolver = MountPointResolver::new(vec![root.path().to_path_buf()], 30);
        let err = resolver
            .resolve(&DeviceDescriptor::new("Camera", "", ""))
            .unwrap_err();
        assert!(err.is(ErrorCode::DeviceNotFound));
    }

    #[test]
    fn test_mount_point_unavailable_without_roots() {
        let resolver = MountPointResolver::new(vec![PathBuf::from("/nonexistent/devbridge")], 30);
        assert!(!resolver.is_available());
    }

    #[test]
    fn test_shell_resolver_synthetic_handle() {
        let resolver = ShellResolver::new(ShellChannelConfig::default(), 20);
        assert!(!resolver.is_available());
        let handle = resolver
            .resolve(&DeviceDescriptor::new("Phone", "05ac", "12a8"))
            .unwrap();
        assert_eq!(handle, "shell://Phone");
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_resolver_runs_resolve_command() {
        let config = ShellChannelConfig {
            program: "sh".to_string(),
            resolve_args: vec!["-c".to_string(), "echo; echo 'dev-{vendor_id}'".to_string()],
            list_args: vec!["-c".to_string(), "true".to_string()],
            ..ShellChannelConfig::default()
        };
        let resolver = ShellResolver::new(config, 20);
        assert!(resolver.is_available());
        let handle = resolver
            .resolve(&DeviceDescriptor::new("Phone", "05ac", "12a8"))
            .unwrap();
        assert_eq!(handle, "dev-05ac");
    }

    #[test]
    fn test_metadata_resolver_prefers_native_handle() {
        let resolver = MetadataResolver::new(MetadataChannelConfig::default(), 10);
        let with_handle = DeviceDescriptor::new("Phone", "05ac", "12a8").with_handle("/sys/1-2");
        assert_eq!(resolver.resolve(&with_handle).unwrap(), "/sys/1-2");

        let ids_only = DeviceDescriptor::new("Phone", "05ac", "12a8");
        assert_eq!(resolver.resolve(&ids_only).unwrap(), "usb:05ac:12a8");

        let nothing = DeviceDescriptor::new("Phone", "", "");
        assert!(resolver.resolve(&nothing).is_err());
    }

    #[test]
    fn test_default_resolvers_follow_config() {
        let config = Config::default();
        let resolvers = default_resolvers(&config);
        let methods: Vec<AccessMethod> = resolvers.iter().map(|r| r.method()).collect();
        assert_eq!(
            methods,
            vec![
                AccessMethod::DirectFilesystem,
                AccessMethod::ShellAutomation,
                AccessMethod::MetadataQuery
            ]
        );
        assert_eq!(resolvers[0].priority(), 30);
    }
}

//! Scripted automation through a shell program.
//!
//! The configured list command prints one file per line:
//!
//! ```text
//! DCIM/100APPLE/IMG_0001.JPG<TAB>2483921<TAB>1700000000
//! DCIM/100APPLE/IMG_0002.MOV<TAB>-<TAB>-
//! ```
//!
//! Size `-` means unknown and `~N` means an estimate of `N` bytes. The
//! modification time is in Unix seconds and may be `-` or absent. The fetch
//! command writes the file's bytes to stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use access::{
    AccessChannel, AccessMethod, BridgeError, DeviceDescriptor, RemoteFileEntry, RemoteStream,
    Result, SizeSource,
};

use super::command::{self, TemplateVars};
use crate::config::ShellChannelConfig;
use crate::transfer::validate_relative_path;

pub struct ShellAutomationChannel {
    device: DeviceDescriptor,
    handle: String,
    config: ShellChannelConfig,
    connected: AtomicBool,
}

impl ShellAutomationChannel {
    pub fn new(
        device: DeviceDescriptor,
        handle: impl Into<String>,
        config: ShellChannelConfig,
    ) -> Self {
        Self {
            device,
            handle: handle.into(),
            config,
            connected: AtomicBool::new(false),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn args(&self, templates: &[String], path: &str) -> Vec<String> {
        command::render_args(
            templates,
            &TemplateVars {
                device: &self.device,
                handle: &self.handle,
                path,
            },
        )
    }
}

impl AccessChannel for ShellAutomationChannel {
    fn method(&self) -> AccessMethod {
        AccessMethod::ShellAutomation
    }

    fn connect_to_device(&self, name: &str, _vendor_id: &str, _product_id: &str) -> Result<()> {
        if !command::is_program_available(&self.config.program) {
            return Err(BridgeError::not_supported(format!(
                "{} is not installed",
                self.config.program
            )));
        }
        if self.config.list_args.is_empty() {
            return Err(BridgeError::not_supported("no shell list command configured"));
        }
        if !self.config.connect_args.is_empty() {
            let args = self.args(&self.config.connect_args, "");
            command::run_capture(&self.config.program, &args, self.timeout())
                .map_err(|e| e.with_context("device", name))?;
        }

        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(handle = %self.handle, "Shell channel connected");
        Ok(())
    }

    fn list_files(&self, base_path: &str) -> Result<Vec<RemoteFileEntry>> {
        if !self.is_connected() {
            return Err(BridgeError::transport("shell channel is not connected"));
        }
        let args = self.args(&self.config.list_args, base_path);
        let output = command::run_capture(&self.config.program, &args, self.timeout())?;
        Ok(parse_listing(&output, base_path))
    }

    fn get_file_stream(&self, path: &str) -> Result<Box<dyn RemoteStream>> {
        if !self.is_connected() {
            return Err(BridgeError::transport("shell channel is not connected"));
        }
        if self.config.fetch_args.is_empty() {
            return Err(BridgeError::not_supported("no shell fetch command configured"));
        }
        let args = self.args(&self.config.fetch_args, path);
        Ok(Box::new(command::spawn_stream(&self.config.program, &args, self.timeout())?))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn device_info(&self) -> DeviceDescriptor {
        self.device.clone()
    }

    fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Parses list command output. Malformed lines are logged and skipped.
pub fn parse_listing(output: &str, base_path: &str) -> Vec<RemoteFileEntry> {
    let base = base_path.trim_matches('/');
    let mut entries = Vec::new();

    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let relative = fields.next().unwrap_or_default().trim().trim_start_matches("./");
        if let Err(e) = validate_relative_path(relative) {
            tracing::warn!(line, error = %e, "Skipping listing line");
            continue;
        }

        let (size, source) = parse_size(fields.next().unwrap_or("-").trim());
        let modified = fields
            .next()
            .and_then(|t| t.trim().parse::<u64>().ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));

        let path = if base.is_empty() {
            relative.to_string()
        } else {
            format!("{base}/{relative}")
        };
        let mut entry = RemoteFileEntry::new(path, relative, size).with_size_source(source);
        if let Some(modified) = modified {
            entry = entry.with_modified(modified);
        }
        entries.push(entry);
    }

    entries
}

fn parse_size(field: &str) -> (u64, SizeSource) {
    if let Some(estimate) = field.strip_prefix('~') {
        return match estimate.parse() {
            Ok(size) => (size, SizeSource::Estimated),
            Err(_) => (0, SizeSource::Unknown),
        };
    }
    match field.parse() {
        Ok(size) => (size, SizeSource::Measured),
        Err(_) => (0, SizeSource::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use access::ErrorCode;

    fn epoch_secs(time: std::time::SystemTime) -> u64 {
        time.duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    #[test]
    fn test_parse_listing() {
        let output = "DCIM/IMG_0001.JPG\t2048\t1700000000\n\
                      DCIM/IMG_0002.MOV\t-\t-\n\
                      DCIM/IMG_0003.HEIC\t~5000\n\
                      \n\
                      ../escape\t1\t1\n\
                      README\n";
        let entries = parse_listing(output, "");

        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].size, 2048);
        assert_eq!(entries[0].size_source, SizeSource::Measured);
        assert_eq!(epoch_secs(entries[0].modified_time.unwrap()), 1_700_000_000);
        assert_eq!(entries[1].size_source, SizeSource::Unknown);
        assert!(entries[1].modified_time.is_none());
        assert_eq!(entries[2].size, 5000);
        assert_eq!(entries[2].size_source, SizeSource::Estimated);
        assert_eq!(entries[3].name, "README");
        assert_eq!(entries[3].size_source, SizeSource::Unknown);
    }

    #[test]
    fn test_parse_listing_with_base() {
        let entries = parse_listing("100APPLE/a.jpg\t1\t0\r\n", "/DCIM/");
        assert_eq!(entries[0].path, "DCIM/100APPLE/a.jpg");
        assert_eq!(entries[0].relative_path, "100APPLE/a.jpg");
    }

    #[test]
    fn test_unconfigured_channel_refuses_connect() {
        let channel = ShellAutomationChannel::new(
            DeviceDescriptor::new("Phone", "05ac", "12a8"),
            "shell://Phone",
            ShellChannelConfig::default(),
        );
        let err = channel.connect_to_device("Phone", "05ac", "12a8").unwrap_err();
        assert!(err.is(ErrorCode::NotSupported));
        assert!(!channel.is_connected());
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::io::Read;

        fn channel(list: &str, fetch: &str) -> ShellAutomationChannel {
            let config = ShellChannelConfig {
                program: "sh".to_string(),
                list_args: vec!["-c".to_string(), list.to_string()],
                fetch_args: vec!["-c".to_string(), fetch.to_string()],
                timeout_secs: 5,
                ..ShellChannelConfig::default()
            };
            ShellAutomationChannel::new(
                DeviceDescriptor::new("Phone", "05ac", "12a8"),
                "h1",
                config,
            )
        }

        #[test]
        fn test_list_and_fetch() {
            let channel = channel(
                "printf 'a.jpg\\t3\\t0\\nb.jpg\\t-\\t-\\n'",
                "printf 'xyz'",
            );
            channel.connect_to_device("Phone", "05ac", "12a8").unwrap();

            let entries = channel.list_files("").unwrap();
            assert_eq!(entries.len(), 2);

            let mut stream = channel.get_file_stream(&entries[0].path).unwrap();
            assert!(!stream.try_seek(1).unwrap());
            let mut data = Vec::new();
            stream.read_to_end(&mut data).unwrap();
            assert_eq!(data, b"xyz");
        }

        #[test]
        fn test_stalled_fetch_gives_up_after_timeout() {
            use crate::transfer::{
                IntegrityVerifier, ResumeManager, TransferOptions, TransferSession,
            };
            use std::sync::Arc;
            use std::time::Instant;
            use tempfile::TempDir;
            use tokio_util::sync::CancellationToken;

            let dir = TempDir::new().unwrap();
            let mut channel = channel("printf 'a.jpg\\t-\\t-\\n'", "printf abc; sleep 8");
            channel.config.timeout_secs = 1;
            channel.connect_to_device("Phone", "05ac", "12a8").unwrap();
            let entry = channel.list_files("").unwrap().remove(0);

            let session = TransferSession::new(
                Arc::new(channel),
                Arc::new(ResumeManager::open(dir.path().join("resume")).unwrap()),
                IntegrityVerifier::default(),
                TransferOptions::default(),
            );
            let cancel = CancellationToken::new();
            let canceller = {
                let cancel = cancel.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(300));
                    cancel.cancel();
                })
            };

            let start = Instant::now();
            let result = session.run(&entry, &dir.path().join("a.jpg"), &cancel);
            canceller.join().unwrap();

            assert!(start.elapsed() < Duration::from_secs(5));
            assert!(!result.success);
            assert!(result.error.unwrap().is(ErrorCode::Cancelled));
        }

        #[test]
        fn test_failed_connect_command() {
            let mut channel = channel("true", "true");
            channel.config.connect_args = vec!["-c".to_string(), "exit 2".to_string()];
            let err = channel.connect_to_device("Phone", "05ac", "12a8").unwrap_err();
            assert!(err.is(ErrorCode::TransportFailure));
            assert_eq!(err.context().get("device").unwrap(), "Phone");
        }
    }
}

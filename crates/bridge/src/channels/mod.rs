//! Concrete access channels.
//!
//! - [`filesystem`]: a mounted directory
//! - [`shell`]: scripted automation through a shell program
//! - [`metadata`]: device-management metadata queries
//! - [`command`]: subprocess helpers shared by the last two

pub mod command;
pub mod filesystem;
pub mod metadata;
pub mod shell;

use std::sync::Arc;

use access::{AccessChannel, AccessMethod, DeviceDescriptor, Result};

pub use filesystem::DirectFilesystemChannel;
pub use metadata::MetadataQueryChannel;
pub use shell::ShellAutomationChannel;

use crate::config::ChannelsConfig;

/// Builds the channel for a method once a resolver produced an address.
pub trait ChannelFactory: Send + Sync {
    fn create(
        &self,
        method: AccessMethod,
        device: &DeviceDescriptor,
        address: &str,
    ) -> Result<Arc<dyn AccessChannel>>;
}

/// Factory for the built-in channels.
pub struct DefaultChannelFactory {
    config: ChannelsConfig,
}

impl DefaultChannelFactory {
    pub fn new(config: ChannelsConfig) -> Self {
        Self { config }
    }
}

impl ChannelFactory for DefaultChannelFactory {
    fn create(
        &self,
        method: AccessMethod,
        device: &DeviceDescriptor,
        address: &str,
    ) -> Result<Arc<dyn AccessChannel>> {
        let channel: Arc<dyn AccessChannel> = match method {
            AccessMethod::DirectFilesystem => {
                Arc::new(DirectFilesystemChannel::new(device.clone(), address))
            }
            AccessMethod::ShellAutomation => Arc::new(ShellAutomationChannel::new(
                device.clone(),
                address,
                self.config.shell.clone(),
            )),
            AccessMethod::MetadataQuery => Arc::new(MetadataQueryChannel::new(
                device.clone(),
                address,
                self.config.metadata.clone(),
            )),
        };
        Ok(channel)
    }
}

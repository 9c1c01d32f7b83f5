//! Device discovery and bridging.
//!
//! [`enumerate`] lists attached devices, [`resolvers`] turn a device into an
//! address per access method and [`DeviceBridge`] connects a channel through
//! the first resolver that works.

pub mod bridge;
pub mod enumerate;
pub mod resolvers;

pub use bridge::DeviceBridge;
pub use enumerate::{CompositeEnumerator, DeviceEnumerator, StaticEnumerator, SysfsEnumerator};
pub use resolvers::{default_resolvers, MetadataResolver, MountPointResolver, ShellResolver};

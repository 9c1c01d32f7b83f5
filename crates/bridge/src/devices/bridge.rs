//! Device bridging: from a device name to a connected channel.

use std::sync::Arc;
use std::time::Instant;

use access::{
    AccessChannel, AccessMethod, AccessResult, BridgeError, DeviceDescriptor, PathResolver,
    RemoteFileEntry, Result,
};
use dashmap::DashMap;

use super::enumerate::{CompositeEnumerator, DeviceEnumerator, StaticEnumerator, SysfsEnumerator};
use super::resolvers::default_resolvers;
use crate::channels::{ChannelFactory, DefaultChannelFactory};
use crate::config::Config;
use crate::retry::{RetryManager, ScanProvider};

type ChannelKey = (String, AccessMethod);

/// Resolves devices to addresses and connects channels to them.
///
/// Resolvers are tried in descending priority. Every resolver and connect
/// attempt is recorded with the [`RetryManager`]. Connected channels are
/// cached per device and method, and closed by [`close_all`](Self::close_all)
/// or when the bridge is dropped.
pub struct DeviceBridge {
    enumerator: Box<dyn DeviceEnumerator>,
    resolvers: Vec<Box<dyn PathResolver>>,
    factory: Box<dyn ChannelFactory>,
    retry: Arc<RetryManager>,
    channels: DashMap<ChannelKey, Arc<dyn AccessChannel>>,
}

impl DeviceBridge {
    pub fn new(
        enumerator: Box<dyn DeviceEnumerator>,
        mut resolvers: Vec<Box<dyn PathResolver>>,
        factory: Box<dyn ChannelFactory>,
        retry: Arc<RetryManager>,
    ) -> Self {
        resolvers.sort_by_key(|r| std::cmp::Reverse(r.priority()));
        Self {
            enumerator,
            resolvers,
            factory,
            retry,
            channels: DashMap::new(),
        }
    }

    /// Builds a bridge over the configured devices, the host's USB tree and
    /// the built-in resolvers and channels.
    pub fn from_config(config: &Config, retry: Arc<RetryManager>) -> Self {
        let enumerator = CompositeEnumerator::new(vec![
            Box::new(StaticEnumerator::from_config(&config.devices)),
            Box::new(SysfsEnumerator::default()),
        ]);
        Self::new(
            Box::new(enumerator),
            default_resolvers(config),
            Box::new(DefaultChannelFactory::new(config.channels.clone())),
            retry,
        )
    }

    pub fn retry_manager(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    pub fn list_available_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.enumerator.enumerate()
    }

    /// Finds a device by exact name, falling back to the vendor/product pair
    /// when both are given.
    pub fn find_device(
        &self,
        name: &str,
        vendor_id: &str,
        product_id: &str,
    ) -> Result<DeviceDescriptor> {
        let devices = self.list_available_devices()?;
        devices
            .iter()
            .find(|d| d.display_name == name)
            .or_else(|| devices.iter().find(|d| d.matches_ids(vendor_id, product_id)))
            .cloned()
            .ok_or_else(|| {
                BridgeError::device_not_found(format!("no attached device named {name}"))
                    .with_context("device", name)
                    .with_context("known_devices", devices.len())
            })
    }

    /// Resolves the device to a path or handle without connecting.
    pub fn get_device_path(&self, name: &str, vendor_id: &str, product_id: &str) -> Result<String> {
        let device = self.find_device(name, vendor_id, product_id)?;
        let mut attempts = Vec::new();
        let mut last_error = None;

        for resolver in self.available_resolvers() {
            let start = Instant::now();
            match resolve_with(resolver.as_ref(), &device) {
                Ok(path) => return Ok(path),
                Err(e) => {
                    attempts.push(AccessResult::failed(resolver.method(), "", start.elapsed(), &e));
                    last_error = Some(e);
                }
            }
        }

        Err(self.exhausted(name, last_error, &attempts))
    }

    /// Returns a connected channel for the named device.
    pub fn detect_and_bridge(&self, name: &str) -> Result<Arc<dyn AccessChannel>> {
        self.detect_and_bridge_with_ids(name, "", "")
    }

    /// Like [`detect_and_bridge`](Self::detect_and_bridge), matching on the
    /// vendor/product pair when no device carries the exact name.
    pub fn detect_and_bridge_with_ids(
        &self,
        name: &str,
        vendor_id: &str,
        product_id: &str,
    ) -> Result<Arc<dyn AccessChannel>> {
        let device = self.find_device(name, vendor_id, product_id)?;

        let mut attempts = Vec::new();
        let mut last_error = None;
        for resolver in self.available_resolvers() {
            let method = resolver.method();
            if let Some(channel) = self.cached(&device, method) {
                tracing::debug!(method = %method, "Reusing connected channel");
                return Ok(channel);
            }
            match self.connect_with(resolver.as_ref(), &device) {
                Ok((channel, result)) => {
                    self.retry.record(&result);
                    tracing::info!(
                        device = %device.display_name,
                        method = %method,
                        path = %result.device_path,
                        "Bridged device"
                    );
                    return Ok(channel);
                }
                Err((error, result)) => {
                    tracing::warn!(method = %method, error = %error, "Access attempt failed");
                    self.retry.record(&result);
                    attempts.push(result);
                    last_error = Some(error);
                }
            }
        }

        self.retry.persist();
        Err(self.exhausted(name, last_error, &attempts))
    }

    /// Returns a connected channel for `device_name` using `method` only.
    ///
    /// Attempts are not recorded; callers such as the retry manager record
    /// the outcome of the whole operation instead.
    pub fn channel_for(
        &self,
        device_name: &str,
        method: AccessMethod,
    ) -> Result<Arc<dyn AccessChannel>> {
        let device = self.find_device(device_name, "", "")?;
        if let Some(channel) = self.cached(&device, method) {
            return Ok(channel);
        }

        let mut last_error = None;
        for resolver in self
            .available_resolvers()
            .filter(|r| r.method() == method)
        {
            match self.connect_with(resolver.as_ref(), &device) {
                Ok((channel, _)) => return Ok(channel),
                Err((error, _)) => last_error = Some(error),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            BridgeError::not_supported(format!("{method} is not available on this host"))
                .with_context("device", device_name)
        }))
    }

    /// Closes every channel this bridge created.
    pub fn close_all(&self) {
        let keys: Vec<ChannelKey> = self.channels.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some(((device, method), channel)) = self.channels.remove(&key) {
                if let Err(e) = channel.close() {
                    tracing::warn!(
                        device = %device,
                        method = %method,
                        error = %e,
                        "Failed to close channel"
                    );
                }
            }
        }
    }

    fn available_resolvers(&self) -> impl Iterator<Item = &Box<dyn PathResolver>> {
        self.resolvers.iter().filter(|r| {
            let available = r.is_available();
            if !available {
                tracing::debug!(method = %r.method(), "Resolver unavailable");
            }
            available
        })
    }

    fn cached(
        &self,
        device: &DeviceDescriptor,
        method: AccessMethod,
    ) -> Option<Arc<dyn AccessChannel>> {
        let key = channel_key(device, method);
        let channel = self.channels.get(&key).map(|entry| Arc::clone(entry.value()))?;
        if channel.is_connected() {
            Some(channel)
        } else {
            self.channels.remove(&key);
            None
        }
    }

    /// Resolves, builds and connects one channel. Both arms carry the
    /// attempt's [`AccessResult`].
    fn connect_with(
        &self,
        resolver: &dyn PathResolver,
        device: &DeviceDescriptor,
    ) -> std::result::Result<(Arc<dyn AccessChannel>, AccessResult), (BridgeError, AccessResult)> {
        let method = resolver.method();
        let start = Instant::now();

        let path = resolve_with(resolver, device)
            .map_err(|e| {
                let result = AccessResult::failed(method, "", start.elapsed(), &e);
                (e, result)
            })?;

        let connected = self
            .factory
            .create(method, device, &path)
            .and_then(|channel| {
                match channel.connect_to_device(
                    &device.display_name,
                    &device.vendor_id,
                    &device.product_id,
                ) {
                    Ok(()) => Ok(channel),
                    Err(e) => {
                        let _ = channel.close();
                        Err(e)
                    }
                }
            });

        match connected {
            Ok(channel) => {
                let result = AccessResult::succeeded(method, path, start.elapsed());
                self.channels
                    .insert(channel_key(device, method), Arc::clone(&channel));
                Ok((channel, result))
            }
            Err(e) => {
                let e = e.with_context("path", &path);
                let result = AccessResult::failed(method, path, start.elapsed(), &e);
                Err((e, result))
            }
        }
    }

    fn exhausted(
        &self,
        name: &str,
        last_error: Option<BridgeError>,
        attempts: &[AccessResult],
    ) -> BridgeError {
        let mut error = BridgeError::device_not_found(format!(
            "could not reach {name} through any access method"
        ));
        match last_error {
            Some(last) => {
                error = error.with_context("last_error", &last).with_source(last);
            }
            None => error = error.with_context("reason", "no access method is available"),
        }
        self.retry.annotate_exhaustion(error, name, attempts)
    }
}

impl ScanProvider for DeviceBridge {
    fn preferred_methods(&self) -> Vec<AccessMethod> {
        let mut methods = Vec::new();
        for resolver in self.available_resolvers() {
            if !methods.contains(&resolver.method()) {
                methods.push(resolver.method());
            }
        }
        methods
    }

    fn check_device(&self, device_name: &str) -> Result<()> {
        self.find_device(device_name, "", "").map(|_| ())
    }

    fn scan_with_method(
        &self,
        method: AccessMethod,
        device_name: &str,
        base_path: &str,
    ) -> Result<Vec<RemoteFileEntry>> {
        self.channel_for(device_name, method)?.list_files(base_path)
    }
}

impl Drop for DeviceBridge {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn channel_key(device: &DeviceDescriptor, method: AccessMethod) -> ChannelKey {
    (device.display_name.to_lowercase(), method)
}

/// Runs a resolver, treating a blank result as not found.
fn resolve_with(resolver: &dyn PathResolver, device: &DeviceDescriptor) -> Result<String> {
    let path = resolver.resolve(device)?;
    if path.trim().is_empty() {
        return Err(BridgeError::device_not_found(format!(
            "{} resolver returned an empty path",
            resolver.method()
        )));
    }
    Ok(path)
}

use std::sync::Arc;

use crate::client::device::DeviceProxy;
use crate::client::events::Subscription;
use crate::client::remote::Remote;
use crate::core::error::Result;
use crate::core::platform::DeviceDescriptor;
use crate::rpc::envelope::{Event, Method, Value};
use crate::rpc::transport::ClientTransport;

/// Client-side stand-in for a remote [`Platform`](crate::core::platform::Platform).
///
/// Entry point of the client API: every device and card proxy is obtained
/// through it and shares its transport.
#[derive(Clone)]
pub struct PlatformProxy {
    remote: Arc<Remote>,
}

impl PlatformProxy {
    pub fn new(transport: Arc<dyn ClientTransport>) -> Self {
        Self {
            remote: Arc::new(Remote::new(transport)),
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.remote
            .invoke(None, Method::PlatformInit, vec![])
            .await?
            .into_unit()
    }

    pub async fn get_device_info(&self) -> Result<Vec<DeviceDescriptor>> {
        self.remote
            .invoke(None, Method::PlatformGetDeviceInfo, vec![])
            .await?
            .into_devices()
    }

    /// Acquiring the same id twice yields proxies for the same handle
    pub async fn acquire_device(&self, id: &str) -> Result<DeviceProxy> {
        let handle = self
            .remote
            .invoke(
                None,
                Method::PlatformAcquireDevice,
                vec![Value::Text(id.to_string())],
            )
            .await?
            .into_handle()?;

        Ok(DeviceProxy::new(Arc::clone(&self.remote), handle, id))
    }

    /// Subscribe to platform-level events (`device-added`, `device-removed`)
    pub fn on<F>(&self, name: &str, callback: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        Subscription::spawn(self.remote.transport().subscribe(), None, name, callback)
    }

    /// Close the connection; outstanding calls on every proxy fail with `ConnectionClosed`
    pub async fn close(&self) {
        self.remote.transport().close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.remote.transport().is_closed()
    }
}

use std::sync::Arc;
use std::time::Duration;

use crate::client::card::CardProxy;
use crate::client::events::Subscription;
use crate::client::remote::Remote;
use crate::core::error::Result;
use crate::rpc::envelope::{Event, HandleId, Method, Value};

/// A remote reader slot, identified by a server-issued handle.
///
/// Nothing is cached: every query is a fresh round trip.
#[derive(Clone)]
pub struct DeviceProxy {
    remote: Arc<Remote>,
    handle: HandleId,
    device_id: String,
}

impl DeviceProxy {
    pub(crate) fn new(remote: Arc<Remote>, handle: HandleId, device_id: &str) -> Self {
        Self {
            remote,
            handle,
            device_id: device_id.to_string(),
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// The id this proxy was acquired with
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn invoke(&self, method: Method, args: Vec<Value>) -> Result<Value> {
        self.remote.invoke(Some(self.handle), method, args).await
    }

    pub async fn is_device_available(&self) -> Result<bool> {
        self.invoke(Method::DeviceIsDeviceAvailable, vec![])
            .await?
            .into_bool()
    }

    pub async fn is_card_present(&self) -> Result<bool> {
        self.invoke(Method::DeviceIsCardPresent, vec![])
            .await?
            .into_bool()
    }

    pub async fn start_session(&self) -> Result<CardProxy> {
        let handle = self
            .invoke(Method::DeviceStartSession, vec![])
            .await?
            .into_handle()?;
        Ok(CardProxy::new(Arc::clone(&self.remote), handle))
    }

    /// Fails with `Timeout` if no card shows up within `timeout`. The server
    /// may apply a shorter cap of its own.
    pub async fn wait_for_card_presence(&self, timeout: Duration) -> Result<()> {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.invoke(Method::DeviceWaitForCardPresence, vec![Value::Number(millis)])
            .await?
            .into_unit()
    }

    /// Release the device and any card session opened on it
    pub async fn release(&self) -> Result<()> {
        self.invoke(Method::DeviceRelease, vec![]).await?.into_unit()
    }

    /// Subscribe to `card-inserted`, `card-removed` and `device-removed` for this device
    pub fn on<F>(&self, name: &str, callback: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        Subscription::spawn(
            self.remote.transport().subscribe(),
            Some(self.handle),
            name,
            callback,
        )
    }
}

impl std::fmt::Debug for DeviceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProxy")
            .field("handle", &self.handle)
            .field("device_id", &self.device_id)
            .finish()
    }
}

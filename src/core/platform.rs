//! The three-level hardware interface the bridge carries across the network:
//! one [`Platform`] enumerates many [`Device`]s, each of which yields at most
//! one active [`Card`] session.
//!
//! Server hosts implement these traits (see `backend`) and hand the platform to
//! a `ServerAdapter`. Clients never see them directly; they talk to proxies with
//! the same method surface.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::error::Result;

/// How a reader talks to the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhysicalProtocol {
    /// ISO 7816-3 contact interface
    Contact,
    /// ISO 14443 / NFC
    Contactless,
    /// Software-emulated reader
    Virtual,
    Unknown,
}

/// Transmission protocol negotiated with the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicalProtocol {
    T0,
    T1,
    Raw,
    Any,
}

/// Immutable description of a reader slot; identity is `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: String,
    pub friendly_name: String,
    pub supports_apdu: bool,
    pub supports_contactless: bool,
    /// Built into the host (true) or a removable reader (false)
    pub is_integrated: bool,
    pub physical_protocol: PhysicalProtocol,
    pub logical_protocol: LogicalProtocol,
}

impl DeviceDescriptor {
    /// A removable contact reader speaking any logical protocol
    pub fn new(id: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            friendly_name: friendly_name.into(),
            supports_apdu: true,
            supports_contactless: false,
            is_integrated: false,
            physical_protocol: PhysicalProtocol::Contact,
            logical_protocol: LogicalProtocol::Any,
        }
    }

    pub fn contactless(mut self) -> Self {
        self.supports_contactless = true;
        self.physical_protocol = PhysicalProtocol::Contactless;
        self
    }
}

/// Spontaneous notifications raised by a platform implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    DeviceAdded(DeviceDescriptor),
    DeviceRemoved { device_id: String },
    CardInserted { device_id: String },
    CardRemoved { device_id: String },
}

impl PlatformEvent {
    pub const DEVICE_ADDED: &'static str = "device-added";
    pub const DEVICE_REMOVED: &'static str = "device-removed";
    pub const CARD_INSERTED: &'static str = "card-inserted";
    pub const CARD_REMOVED: &'static str = "card-removed";

    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            PlatformEvent::DeviceAdded(_) => Self::DEVICE_ADDED,
            PlatformEvent::DeviceRemoved { .. } => Self::DEVICE_REMOVED,
            PlatformEvent::CardInserted { .. } => Self::CARD_INSERTED,
            PlatformEvent::CardRemoved { .. } => Self::CARD_REMOVED,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            PlatformEvent::DeviceAdded(descriptor) => &descriptor.id,
            PlatformEvent::DeviceRemoved { device_id }
            | PlatformEvent::CardInserted { device_id }
            | PlatformEvent::CardRemoved { device_id } => device_id,
        }
    }
}

/// Root capability object; enumerates and hands out devices
#[async_trait]
pub trait Platform: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn get_device_info(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open the reader slot `id`. Callers only pass ids that were enumerated.
    async fn acquire_device(&self, id: &str) -> Result<Box<dyn Device>>;

    /// Stream of native device/card events
    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent>;
}

/// A reader slot
#[async_trait]
pub trait Device: Send + Sync {
    fn descriptor(&self) -> &DeviceDescriptor;

    async fn is_device_available(&self) -> Result<bool>;

    async fn is_card_present(&self) -> Result<bool>;

    async fn start_session(&self) -> Result<Box<dyn Card>>;

    /// Resolve once a card is present, or fail with `Timeout` after `timeout`
    async fn wait_for_card_presence(&self, timeout: Duration) -> Result<()>;

    async fn release(&self) -> Result<()>;
}

/// A live session with an inserted card
#[async_trait]
pub trait Card: Send + Sync {
    async fn get_atr(&self) -> Result<Vec<u8>>;

    async fn transmit(&self, command: &[u8]) -> Result<Vec<u8>>;

    async fn reset(&self) -> Result<()>;

    async fn release(&self) -> Result<()>;
}

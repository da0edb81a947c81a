//! Scriptable in-memory platform for tests, demos and `serve --mock`.
//!
//! Readers, cards and canned responses are set up from the host side; every
//! change emits the same [`PlatformEvent`]s a hardware backend would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::core::error::{BridgeError, Result};
use crate::core::platform::{Card, Device, DeviceDescriptor, Platform, PlatformEvent};

pub const DEMO_ATR_1: [u8; 17] = [
    0x3B, 0xAC, 0x00, 0x40, 0x2A, 0x00, 0x12, 0x25, 0x00, 0x64, 0x80, 0x00, 0x03, 0x10, 0x00, 0x90,
    0x00,
];
pub const DEMO_ATR_3: [u8; 10] = [0x3B, 0x75, 0x13, 0x00, 0x00, 0x47, 0x09, 0xEA, 0x90, 0x00];

struct Slot {
    descriptor: DeviceDescriptor,
    atr: Option<Vec<u8>>,
    /// Bumped on every insert/remove; a card session is only valid for the insertion it started on
    insertion: u64,
    latency: Duration,
    presence: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    slots: Vec<Slot>,
    responses: HashMap<Vec<u8>, Vec<u8>>,
    should_fail: bool,
    releases: Vec<String>,
    transmitted: Vec<Vec<u8>>,
}

impl State {
    fn slot(&self, device_id: &str) -> Result<&Slot> {
        self.slots
            .iter()
            .find(|slot| slot.descriptor.id == device_id)
            .ok_or_else(|| BridgeError::DeviceNotAvailable(format!("Reader '{device_id}' not found")))
    }

    fn slot_mut(&mut self, device_id: &str) -> Option<&mut Slot> {
        self.slots
            .iter_mut()
            .find(|slot| slot.descriptor.id == device_id)
    }
}

struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<PlatformEvent>,
}

impl Shared {
    fn emit(&self, event: PlatformEvent) {
        log::debug!("Mock platform event: {} ({})", event.name(), event.device_id());
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// In-memory [`Platform`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MockPlatform {
    shared: Arc<Shared>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// A platform with no readers
    pub fn new() -> Self {
        Self::with_event_buffer(64)
    }

    pub fn with_event_buffer(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    /// Three readers: two with a card inserted, one empty
    pub fn demo() -> Self {
        Self::with_demo_readers(64)
    }

    pub fn with_demo_readers(event_buffer: usize) -> Self {
        let platform = Self::with_event_buffer(event_buffer);
        platform.add_reader(
            DeviceDescriptor::new("Mock Reader 1", "Mock Reader 1"),
            Some(DEMO_ATR_1.to_vec()),
        );
        platform.add_reader(DeviceDescriptor::new("Mock Reader 2", "Mock Reader 2"), None);
        platform.add_reader(
            DeviceDescriptor::new("Mock Reader 3", "Mock Reader 3").contactless(),
            Some(DEMO_ATR_3.to_vec()),
        );
        platform
    }

    pub fn add_reader(&self, descriptor: DeviceDescriptor, atr: Option<Vec<u8>>) {
        let (presence, _) = watch::channel(atr.is_some());
        self.shared.state.lock().slots.push(Slot {
            descriptor: descriptor.clone(),
            atr,
            insertion: 0,
            latency: Duration::ZERO,
            presence,
        });
        self.shared.emit(PlatformEvent::DeviceAdded(descriptor));
    }

    /// Unplug a reader. Returns false if it was not present.
    pub fn remove_reader(&self, device_id: &str) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            let before = state.slots.len();
            state.slots.retain(|slot| slot.descriptor.id != device_id);
            state.slots.len() != before
        };
        if removed {
            self.shared.emit(PlatformEvent::DeviceRemoved {
                device_id: device_id.to_string(),
            });
        }
        removed
    }

    pub fn insert_card(&self, device_id: &str, atr: Vec<u8>) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            let slot = state
                .slot_mut(device_id)
                .ok_or_else(|| BridgeError::DeviceNotAvailable(format!("Reader '{device_id}' not found")))?;
            slot.atr = Some(atr);
            slot.insertion += 1;
            slot.presence.send_replace(true);
        }
        self.shared.emit(PlatformEvent::CardInserted {
            device_id: device_id.to_string(),
        });
        Ok(())
    }

    pub fn remove_card(&self, device_id: &str) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            let slot = state
                .slot_mut(device_id)
                .ok_or_else(|| BridgeError::DeviceNotAvailable(format!("Reader '{device_id}' not found")))?;
            slot.atr = None;
            slot.insertion += 1;
            slot.presence.send_replace(false);
        }
        self.shared.emit(PlatformEvent::CardRemoved {
            device_id: device_id.to_string(),
        });
        Ok(())
    }

    /// Answer `command` with `response` instead of the default table
    pub fn add_response(&self, command: Vec<u8>, response: Vec<u8>) {
        self.shared.state.lock().responses.insert(command, response);
    }

    /// Make every driver call fail
    pub fn set_failing(&self, should_fail: bool) {
        self.shared.state.lock().should_fail = should_fail;
    }

    /// Delay applied to every transmit on `device_id`
    pub fn set_latency(&self, device_id: &str, latency: Duration) {
        if let Some(slot) = self.shared.state.lock().slot_mut(device_id) {
            slot.latency = latency;
        }
    }

    /// Release log, oldest first: `"card:<id>"` and `"device:<id>"`
    pub fn releases(&self) -> Vec<String> {
        self.shared.state.lock().releases.clone()
    }

    /// Every command that reached a card, oldest first
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().transmitted.clone()
    }

    fn check_failing(&self, what: &str) -> Result<()> {
        if self.shared.state.lock().should_fail {
            return Err(BridgeError::DeviceNotAvailable(format!("Mock PCSC error: Failed to {what}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn init(&self) -> Result<()> {
        self.check_failing("establish context")?;
        log::info!("Mock platform ready");
        Ok(())
    }

    async fn get_device_info(&self) -> Result<Vec<DeviceDescriptor>> {
        self.check_failing("list readers")?;
        let state = self.shared.state.lock();
        Ok(state.slots.iter().map(|slot| slot.descriptor.clone()).collect())
    }

    async fn acquire_device(&self, id: &str) -> Result<Box<dyn Device>> {
        self.check_failing("connect")?;
        let descriptor = self.shared.state.lock().slot(id)?.descriptor.clone();
        Ok(Box::new(MockDevice {
            descriptor,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.shared.events.subscribe()
    }
}

struct MockDevice {
    descriptor: DeviceDescriptor,
    shared: Arc<Shared>,
}

#[async_trait]
impl Device for MockDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn is_device_available(&self) -> Result<bool> {
        Ok(self.shared.state.lock().slot(&self.descriptor.id).is_ok())
    }

    async fn is_card_present(&self) -> Result<bool> {
        Ok(self.shared.state.lock().slot(&self.descriptor.id)?.atr.is_some())
    }

    async fn start_session(&self) -> Result<Box<dyn Card>> {
        let state = self.shared.state.lock();
        if state.should_fail {
            return Err(BridgeError::DeviceNotAvailable(
                "Mock PCSC error: Failed to connect".to_string(),
            ));
        }

        let slot = state.slot(&self.descriptor.id)?;
        let atr = slot.atr.clone().ok_or_else(|| {
            BridgeError::CardNotPresent(format!("No card in '{}'", self.descriptor.id))
        })?;

        log::info!("Mock session started on {}", self.descriptor.id);
        Ok(Box::new(MockCard {
            device_id: self.descriptor.id.clone(),
            atr,
            insertion: slot.insertion,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn wait_for_card_presence(&self, timeout: Duration) -> Result<()> {
        let mut presence = self
            .shared
            .state
            .lock()
            .slot(&self.descriptor.id)?
            .presence
            .subscribe();

        let waited = tokio::time::timeout(timeout, presence.wait_for(|present| *present)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::DeviceNotAvailable(format!(
                "Reader '{}' removed while waiting",
                self.descriptor.id
            ))),
            Err(_) => Err(BridgeError::Timeout(format!(
                "No card in '{}' after {}ms",
                self.descriptor.id,
                timeout.as_millis()
            ))),
        }
    }

    async fn release(&self) -> Result<()> {
        self.shared
            .state
            .lock()
            .releases
            .push(format!("device:{}", self.descriptor.id));
        Ok(())
    }
}

struct MockCard {
    device_id: String,
    atr: Vec<u8>,
    insertion: u64,
    shared: Arc<Shared>,
}

impl MockCard {
    /// Fails once the card this session was opened on has been pulled
    fn check_present(&self, state: &State) -> Result<()> {
        match state.slot(&self.device_id) {
            Ok(slot) if slot.insertion == self.insertion && slot.atr.is_some() => Ok(()),
            Ok(_) => Err(BridgeError::CardNotPresent(format!(
                "Card removed from '{}'",
                self.device_id
            ))),
            Err(e) => Err(e),
        }
    }
}

/// Responses for commands that have no canned answer
fn default_response(command: &[u8]) -> Vec<u8> {
    match command {
        [0x00, 0xA4, 0x04, 0x00, ..] => vec![0x90, 0x00],
        [0x00, 0xB0, 0x00, 0x00, ..] => vec![0x48, 0x65, 0x6C, 0x6C, 0x6F, 0x90, 0x00],
        [0x00, 0xC0, 0x00, 0x00, ..] => vec![0x61, 0x10],
        [0x80, 0xCA, 0x9F, 0x7F, ..] => vec![0x6A, 0x88],
        _ => vec![0x6D, 0x00],
    }
}

#[async_trait]
impl Card for MockCard {
    async fn get_atr(&self) -> Result<Vec<u8>> {
        self.check_present(&self.shared.state.lock())?;
        Ok(self.atr.clone())
    }

    async fn transmit(&self, command: &[u8]) -> Result<Vec<u8>> {
        let latency = {
            let state = self.shared.state.lock();
            if state.should_fail {
                return Err(BridgeError::TransmissionFailed(
                    "Mock PCSC error: Transmit failed".to_string(),
                ));
            }
            self.check_present(&state)?;
            state.slot(&self.device_id)?.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.shared.state.lock();
        self.check_present(&state)?;
        state.transmitted.push(command.to_vec());
        let response = state
            .responses
            .get(command)
            .cloned()
            .unwrap_or_else(|| default_response(command));
        Ok(response)
    }

    async fn reset(&self) -> Result<()> {
        self.check_present(&self.shared.state.lock())?;
        log::debug!("Mock card in {} reset", self.device_id);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.shared
            .state
            .lock()
            .releases
            .push(format!("card:{}", self.device_id));
        Ok(())
    }
}

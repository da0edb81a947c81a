//! Server-side arena of live device and card objects, indexed by handle.
//!
//! Each device entry carries an explicit edge to its (at most one) card
//! session, so releasing a device removes the card with it. Removal happens
//! under the lock; disposal of the real objects happens afterwards, outside it,
//! through [`Released::dispose`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::{BridgeError, Result};
use crate::core::platform::{Card, Device};
use crate::rpc::envelope::HandleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Acquired, no card session
    Idle,
    SessionActive,
}

struct DeviceEntry {
    device_id: String,
    device: Arc<dyn Device>,
    card: Option<HandleId>,
}

struct CardEntry {
    card: Arc<dyn Card>,
    device: HandleId,
}

enum Entry {
    Device(DeviceEntry),
    Card(CardEntry),
}

/// A real object taken out of the registry and awaiting disposal
pub enum Disposable {
    Card(HandleId, Arc<dyn Card>),
    Device(HandleId, Arc<dyn Device>),
}

/// Objects removed by one release, children before parents
#[derive(Default)]
pub struct Released(Vec<Disposable>);

impl Released {
    pub fn handles(&self) -> Vec<HandleId> {
        self.0
            .iter()
            .map(|item| match item {
                Disposable::Card(handle, _) | Disposable::Device(handle, _) => *handle,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Release every real object in order. Driver failures are logged, not returned:
    /// the handles are gone either way.
    pub async fn dispose(self) {
        for item in self.0 {
            match item {
                Disposable::Card(handle, card) => {
                    if let Err(e) = card.release().await {
                        log::warn!("Failed to release card {handle} cleanly: {e}");
                    }
                }
                Disposable::Device(handle, device) => {
                    if let Err(e) = device.release().await {
                        log::warn!("Failed to release device {handle} cleanly: {e}");
                    }
                }
            }
        }
    }
}

#[derive(Default)]
pub struct HandleRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<HandleId, Entry>>,
}

fn not_found(handle: HandleId) -> BridgeError {
    BridgeError::HandleNotFound(handle.to_string())
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_handle(&self) -> HandleId {
        HandleId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn insert_device(&self, device_id: &str, device: Arc<dyn Device>) -> HandleId {
        let handle = self.next_handle();
        self.entries.lock().insert(
            handle,
            Entry::Device(DeviceEntry {
                device_id: device_id.to_string(),
                device,
                card: None,
            }),
        );
        log::debug!("Registered device '{device_id}' as {handle}");
        handle
    }

    /// Handle of an already acquired physical device
    pub fn find_device(&self, device_id: &str) -> Option<HandleId> {
        self.entries
            .lock()
            .iter()
            .find_map(|(handle, entry)| match entry {
                Entry::Device(device) if device.device_id == device_id => Some(*handle),
                _ => None,
            })
    }

    pub fn device(&self, handle: HandleId) -> Result<Arc<dyn Device>> {
        match self.entries.lock().get(&handle) {
            Some(Entry::Device(entry)) => Ok(Arc::clone(&entry.device)),
            _ => Err(not_found(handle)),
        }
    }

    pub fn card(&self, handle: HandleId) -> Result<Arc<dyn Card>> {
        match self.entries.lock().get(&handle) {
            Some(Entry::Card(entry)) => Ok(Arc::clone(&entry.card)),
            _ => Err(not_found(handle)),
        }
    }

    pub fn device_state(&self, handle: HandleId) -> Option<DeviceState> {
        match self.entries.lock().get(&handle) {
            Some(Entry::Device(entry)) if entry.card.is_some() => Some(DeviceState::SessionActive),
            Some(Entry::Device(_)) => Some(DeviceState::Idle),
            _ => None,
        }
    }

    /// Device handle owning the physical device `device_id`, with its active card session
    pub fn handles_for(&self, device_id: &str) -> Option<(HandleId, Option<HandleId>)> {
        self.entries
            .lock()
            .iter()
            .find_map(|(handle, entry)| match entry {
                Entry::Device(device) if device.device_id == device_id => {
                    Some((*handle, device.card))
                }
                _ => None,
            })
    }

    /// Register `card` as the session of `device`
    pub fn attach_card(&self, device: HandleId, card: Arc<dyn Card>) -> Result<HandleId> {
        let handle = self.next_handle();
        let mut entries = self.entries.lock();

        match entries.get_mut(&device) {
            Some(Entry::Device(entry)) => {
                if let Some(active) = entry.card {
                    return Err(BridgeError::DeviceBusy(format!(
                        "{} already has card session {active}",
                        entry.device_id
                    )));
                }
                entry.card = Some(handle);
            }
            _ => return Err(not_found(device)),
        }

        entries.insert(handle, Entry::Card(CardEntry { card, device }));
        log::debug!("Registered card session {handle} on {device}");
        Ok(handle)
    }

    pub fn release_card(&self, handle: HandleId) -> Result<Released> {
        let mut entries = self.entries.lock();

        let card = match entries.remove(&handle) {
            Some(Entry::Card(card)) => card,
            Some(other) => {
                entries.insert(handle, other);
                return Err(not_found(handle));
            }
            None => return Err(not_found(handle)),
        };

        if let Some(Entry::Device(device)) = entries.get_mut(&card.device) {
            device.card = None;
        }

        Ok(Released(vec![Disposable::Card(handle, card.card)]))
    }

    /// Remove a device and, first, its card session
    pub fn release_device(&self, handle: HandleId) -> Result<Released> {
        let mut entries = self.entries.lock();

        let device = match entries.remove(&handle) {
            Some(Entry::Device(device)) => device,
            Some(other) => {
                entries.insert(handle, other);
                return Err(not_found(handle));
            }
            None => return Err(not_found(handle)),
        };

        let mut released = Vec::with_capacity(2);
        if let Some(card_handle) = device.card {
            if let Some(Entry::Card(card)) = entries.remove(&card_handle) {
                released.push(Disposable::Card(card_handle, card.card));
            }
        }
        released.push(Disposable::Device(handle, device.device));

        Ok(Released(released))
    }

    /// Remove everything, cards ahead of devices
    pub fn drain(&self) -> Released {
        let mut entries = self.entries.lock();

        let mut cards = Vec::new();
        let mut devices = Vec::new();
        for (handle, entry) in entries.drain() {
            match entry {
                Entry::Card(card) => cards.push(Disposable::Card(handle, card.card)),
                Entry::Device(device) => devices.push(Disposable::Device(handle, device.device)),
            }
        }

        cards.extend(devices);
        Released(cards)
    }

    pub fn contains(&self, handle: HandleId) -> bool {
        self.entries.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::core::platform::DeviceDescriptor;

    struct CountingDevice {
        descriptor: DeviceDescriptor,
        releases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Device for CountingDevice {
        fn descriptor(&self) -> &DeviceDescriptor {
            &self.descriptor
        }
        async fn is_device_available(&self) -> Result<bool> {
            Ok(true)
        }
        async fn is_card_present(&self) -> Result<bool> {
            Ok(true)
        }
        async fn start_session(&self) -> Result<Box<dyn Card>> {
            Err(BridgeError::Internal("unused".to_string()))
        }
        async fn wait_for_card_presence(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        async fn release(&self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingCard {
        releases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Card for CountingCard {
        async fn get_atr(&self) -> Result<Vec<u8>> {
            Ok(vec![0x3B])
        }
        async fn transmit(&self, _command: &[u8]) -> Result<Vec<u8>> {
            Ok(vec![0x90, 0x00])
        }
        async fn reset(&self) -> Result<()> {
            Ok(())
        }
        async fn release(&self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn device(id: &str, releases: &Arc<AtomicUsize>) -> Arc<dyn Device> {
        Arc::new(CountingDevice {
            descriptor: DeviceDescriptor::new(id, id),
            releases: Arc::clone(releases),
        })
    }

    fn card(releases: &Arc<AtomicUsize>) -> Arc<dyn Card> {
        Arc::new(CountingCard {
            releases: Arc::clone(releases),
        })
    }

    #[test]
    fn test_device_lifecycle_states() {
        let registry = HandleRegistry::new();
        let releases = Arc::new(AtomicUsize::new(0));

        let dev = registry.insert_device("r0", device("r0", &releases));
        assert_eq!(registry.device_state(dev), Some(DeviceState::Idle));
        assert_eq!(registry.find_device("r0"), Some(dev));

        let session = registry.attach_card(dev, card(&releases)).unwrap();
        assert_eq!(registry.device_state(dev), Some(DeviceState::SessionActive));
        assert_eq!(registry.handles_for("r0"), Some((dev, Some(session))));

        registry.release_card(session).unwrap();
        assert_eq!(registry.device_state(dev), Some(DeviceState::Idle));
        assert!(registry.card(session).is_err());
    }

    #[test]
    fn test_second_session_is_busy() {
        let registry = HandleRegistry::new();
        let releases = Arc::new(AtomicUsize::new(0));
        let dev = registry.insert_device("r0", device("r0", &releases));

        registry.attach_card(dev, card(&releases)).unwrap();
        assert!(matches!(
            registry.attach_card(dev, card(&releases)),
            Err(BridgeError::DeviceBusy(_))
        ));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_device_release_cascades_to_card() {
        let registry = HandleRegistry::new();
        let card_releases = Arc::new(AtomicUsize::new(0));
        let device_releases = Arc::new(AtomicUsize::new(0));

        let dev = registry.insert_device("r0", device("r0", &device_releases));
        let session = registry.attach_card(dev, card(&card_releases)).unwrap();

        let released = registry.release_device(dev).unwrap();
        assert_eq!(released.handles(), vec![session, dev]);
        released.dispose().await;

        assert!(registry.is_empty());
        assert!(matches!(registry.card(session), Err(BridgeError::HandleNotFound(_))));
        assert_eq!(card_releases.load(Ordering::SeqCst), 1);
        assert_eq!(device_releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_release_is_handle_not_found() {
        let registry = HandleRegistry::new();
        let releases = Arc::new(AtomicUsize::new(0));
        let dev = registry.insert_device("r0", device("r0", &releases));

        assert!(registry.release_device(dev).is_ok());
        assert!(matches!(
            registry.release_device(dev),
            Err(BridgeError::HandleNotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wrong_kind_lookup_leaves_entry_alone() {
        let registry = HandleRegistry::new();
        let releases = Arc::new(AtomicUsize::new(0));
        let dev = registry.insert_device("r0", device("r0", &releases));
        let session = registry.attach_card(dev, card(&releases)).unwrap();

        assert!(registry.card(dev).is_err());
        assert!(registry.device(session).is_err());
        assert!(registry.release_card(dev).is_err());
        assert!(registry.release_device(session).is_err());
        assert!(registry.contains(dev));
        assert!(registry.contains(session));
    }

    #[tokio::test]
    async fn test_drain_releases_everything() {
        let registry = HandleRegistry::new();
        let releases = Arc::new(AtomicUsize::new(0));

        let first = registry.insert_device("r0", device("r0", &releases));
        registry.insert_device("r1", device("r1", &releases));
        let session = registry.attach_card(first, card(&releases)).unwrap();

        let released = registry.drain();
        assert_eq!(released.handles()[0], session);
        released.dispose().await;

        assert!(registry.is_empty());
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }
}

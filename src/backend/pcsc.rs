//! PC/SC-backed platform: real readers through the system smart card service.
//!
//! The `pcsc` crate is synchronous, so every call runs on tokio's blocking pool.
//! A monitor thread polls reader and card state and turns changes into
//! [`PlatformEvent`]s.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use pcsc::{Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State};
use tokio::sync::broadcast;

use crate::core::error::{BridgeError, Result};
use crate::core::platform::{Card, Device, DeviceDescriptor, Platform, PlatformEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Map a PC/SC failure onto the bridge taxonomy
fn map_pcsc_error(e: pcsc::Error, what: &str) -> BridgeError {
    let message = format!("{what}: {e}");
    match e {
        pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard | pcsc::Error::UnpoweredCard => {
            BridgeError::CardNotPresent(message)
        }
        pcsc::Error::SharingViolation => BridgeError::DeviceBusy(message),
        pcsc::Error::UnknownReader
        | pcsc::Error::ReaderUnavailable
        | pcsc::Error::NoReadersAvailable
        | pcsc::Error::NoService
        | pcsc::Error::ServiceStopped => BridgeError::DeviceNotAvailable(message),
        pcsc::Error::Timeout => BridgeError::Timeout(message),
        pcsc::Error::CommError
        | pcsc::Error::ResetCard
        | pcsc::Error::UnresponsiveCard
        | pcsc::Error::NotTransacted
        | pcsc::Error::ProtoMismatch => BridgeError::TransmissionFailed(message),
        _ => BridgeError::Internal(message),
    }
}

/// Run a blocking PC/SC call off the async runtime
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BridgeError::Internal(format!("PC/SC worker failed: {e}")))?
}

fn reader_cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| BridgeError::InvalidRequest(format!("Invalid reader name: {name}")))
}

fn list_reader_names(context: &Context) -> Result<Vec<String>> {
    match context.list_readers_owned() {
        Ok(readers) => Ok(readers
            .into_iter()
            .map(|name| name.to_string_lossy().to_string())
            .collect()),
        Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
        Err(e) => Err(map_pcsc_error(e, "Failed to list readers")),
    }
}

/// Current card presence for `reader`, without waiting
fn card_present(context: &Context, reader: &str) -> Result<bool> {
    let mut states = vec![ReaderState::new(reader_cstring(reader)?, State::UNAWARE)];
    context
        .get_status_change(Duration::ZERO, &mut states)
        .map_err(|e| map_pcsc_error(e, "Failed to get reader status"))?;
    Ok(states[0].event_state().contains(State::PRESENT))
}

fn describe_reader(name: &str) -> DeviceDescriptor {
    let descriptor = DeviceDescriptor::new(name, name);
    let lower = name.to_lowercase();
    if lower.contains("contactless") || lower.contains("picc") || lower.contains("nfc") {
        descriptor.contactless()
    } else {
        descriptor
    }
}

pub struct PcscPlatform {
    context: Context,
    events: broadcast::Sender<PlatformEvent>,
    monitoring: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl PcscPlatform {
    pub fn new(event_buffer: usize) -> Result<Self> {
        let context = Context::establish(Scope::User)
            .map_err(|e| map_pcsc_error(e, "Failed to establish PCSC context"))?;
        let (events, _) = broadcast::channel(event_buffer.max(1));

        Ok(Self {
            context,
            events,
            monitoring: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    fn start_monitor(&self) -> Result<()> {
        if self.monitoring.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let context = self.context.clone();
        let events = self.events.clone();
        let shutdown = Arc::clone(&self.shutdown);

        std::thread::Builder::new()
            .name("pcsc-monitor".to_string())
            .spawn(move || monitor_readers(context, events, shutdown))
            .map_err(|e| BridgeError::Internal(format!("Failed to start reader monitor: {e}")))?;

        log::info!("Started PC/SC reader monitor");
        Ok(())
    }
}

impl Drop for PcscPlatform {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Poll reader list and card presence, emitting an event per change
fn monitor_readers(
    context: Context,
    events: broadcast::Sender<PlatformEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let mut known: HashMap<String, bool> = HashMap::new();
    let mut first_pass = true;

    while !shutdown.load(Ordering::SeqCst) {
        let readers = match list_reader_names(&context) {
            Ok(readers) => readers,
            Err(e) => {
                log::warn!("Reader monitor: {e}");
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
        };

        let mut current = HashMap::with_capacity(readers.len());
        for reader in readers {
            let present = card_present(&context, &reader).unwrap_or(false);
            current.insert(reader, present);
        }

        if !first_pass {
            for (reader, present) in &current {
                match known.get(reader) {
                    None => {
                        let _ = events.send(PlatformEvent::DeviceAdded(describe_reader(reader)));
                        if *present {
                            let _ = events.send(PlatformEvent::CardInserted {
                                device_id: reader.clone(),
                            });
                        }
                    }
                    Some(was_present) if was_present != present => {
                        let device_id = reader.clone();
                        let _ = events.send(if *present {
                            PlatformEvent::CardInserted { device_id }
                        } else {
                            PlatformEvent::CardRemoved { device_id }
                        });
                    }
                    Some(_) => {}
                }
            }
            for reader in known.keys().filter(|reader| !current.contains_key(*reader)) {
                let _ = events.send(PlatformEvent::DeviceRemoved {
                    device_id: reader.clone(),
                });
            }
        }

        known = current;
        first_pass = false;
        std::thread::sleep(POLL_INTERVAL);
    }

    log::debug!("PC/SC reader monitor stopped");
}

#[async_trait]
impl Platform for PcscPlatform {
    async fn init(&self) -> Result<()> {
        let context = self.context.clone();
        blocking(move || {
            context
                .is_valid()
                .map_err(|e| map_pcsc_error(e, "PCSC context is not valid"))
        })
        .await?;
        self.start_monitor()
    }

    async fn get_device_info(&self) -> Result<Vec<DeviceDescriptor>> {
        let context = self.context.clone();
        let names = blocking(move || list_reader_names(&context)).await?;
        Ok(names.iter().map(|name| describe_reader(name)).collect())
    }

    async fn acquire_device(&self, id: &str) -> Result<Box<dyn Device>> {
        log::info!("Acquiring reader: {id}");
        Ok(Box::new(PcscDevice {
            context: self.context.clone(),
            descriptor: describe_reader(id),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }
}

struct PcscDevice {
    context: Context,
    descriptor: DeviceDescriptor,
}

#[async_trait]
impl Device for PcscDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn is_device_available(&self) -> Result<bool> {
        let context = self.context.clone();
        let id = self.descriptor.id.clone();
        blocking(move || Ok(list_reader_names(&context)?.contains(&id))).await
    }

    async fn is_card_present(&self) -> Result<bool> {
        let context = self.context.clone();
        let id = self.descriptor.id.clone();
        blocking(move || card_present(&context, &id)).await
    }

    async fn start_session(&self) -> Result<Box<dyn Card>> {
        let context = self.context.clone();
        let id = self.descriptor.id.clone();

        let card = blocking(move || {
            let reader = reader_cstring(&id)?;
            context
                .connect(&reader, ShareMode::Shared, Protocols::ANY)
                .map_err(|e| map_pcsc_error(e, &format!("Failed to connect to reader: {id}")))
        })
        .await?;

        log::info!("Successfully connected to reader: {}", self.descriptor.id);
        Ok(Box::new(PcscCard {
            reader: self.descriptor.id.clone(),
            card: Arc::new(Mutex::new(Some(card))),
        }))
    }

    async fn wait_for_card_presence(&self, timeout: Duration) -> Result<()> {
        let context = self.context.clone();
        let id = self.descriptor.id.clone();

        blocking(move || {
            let deadline = Instant::now() + timeout;
            let mut states = vec![ReaderState::new(reader_cstring(&id)?, State::UNAWARE)];

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match context.get_status_change(remaining, &mut states) {
                    Ok(()) => {}
                    Err(pcsc::Error::Timeout) => {
                        return Err(BridgeError::Timeout(format!(
                            "No card in '{id}' after {}ms",
                            timeout.as_millis()
                        )))
                    }
                    Err(e) => return Err(map_pcsc_error(e, "Failed to wait for card")),
                }

                if states[0].event_state().contains(State::PRESENT) {
                    return Ok(());
                }
                if remaining.is_zero() {
                    return Err(BridgeError::Timeout(format!("No card in '{id}'")));
                }
                states[0].sync_current_state();
            }
        })
        .await
    }

    async fn release(&self) -> Result<()> {
        log::info!("Released reader: {}", self.descriptor.id);
        Ok(())
    }
}

struct PcscCard {
    reader: String,
    card: Arc<Mutex<Option<pcsc::Card>>>,
}

impl PcscCard {
    /// Run `f` against the connected card on the blocking pool
    async fn with_card<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut pcsc::Card) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let card = Arc::clone(&self.card);
        let reader = self.reader.clone();
        blocking(move || match card.lock().as_mut() {
            Some(card) => f(card),
            None => Err(BridgeError::CardNotPresent(format!(
                "Session on '{reader}' already released"
            ))),
        })
        .await
    }
}

#[async_trait]
impl Card for PcscCard {
    async fn get_atr(&self) -> Result<Vec<u8>> {
        self.with_card(|card| {
            card.status2_owned()
                .map(|status| status.atr().to_vec())
                .map_err(|e| map_pcsc_error(e, "Failed to read ATR"))
        })
        .await
    }

    async fn transmit(&self, command: &[u8]) -> Result<Vec<u8>> {
        let command = command.to_vec();
        self.with_card(move |card| {
            let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
            card.transmit(&command, &mut buffer)
                .map(|response| response.to_vec())
                .map_err(|e| map_pcsc_error(e, "Failed to transmit APDU"))
        })
        .await
    }

    async fn reset(&self) -> Result<()> {
        self.with_card(|card| {
            card.reconnect(ShareMode::Shared, Protocols::ANY, Disposition::ResetCard)
                .map_err(|e| map_pcsc_error(e, "Failed to reset card"))
        })
        .await
    }

    async fn release(&self) -> Result<()> {
        let card = self.card.lock().take();
        let reader = self.reader.clone();

        blocking(move || {
            if let Some(card) = card {
                card.disconnect(Disposition::LeaveCard)
                    .map_err(|(_, e)| map_pcsc_error(e, "Failed to disconnect cleanly from card"))?;
            }
            log::info!("Disconnected from reader: {reader}");
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            map_pcsc_error(pcsc::Error::NoSmartcard, "connect"),
            BridgeError::CardNotPresent(_)
        ));
        assert!(matches!(
            map_pcsc_error(pcsc::Error::SharingViolation, "connect"),
            BridgeError::DeviceBusy(_)
        ));
        assert!(matches!(
            map_pcsc_error(pcsc::Error::UnknownReader, "connect"),
            BridgeError::DeviceNotAvailable(_)
        ));
        assert!(matches!(
            map_pcsc_error(pcsc::Error::CommError, "transmit"),
            BridgeError::TransmissionFailed(_)
        ));
        assert!(matches!(
            map_pcsc_error(pcsc::Error::InvalidHandle, "transmit"),
            BridgeError::Internal(_)
        ));
    }

    #[test]
    fn test_contactless_readers_are_detected() {
        assert!(describe_reader("ACS ACR122U PICC Interface 00 00").supports_contactless);
        assert!(!describe_reader("Gemalto USB Shell Token V2 00 00").supports_contactless);
    }

    #[tokio::test]
    #[serial]
    async fn test_list_readers_when_service_is_up() {
        // Skip on machines without a PC/SC service
        let Ok(platform) = PcscPlatform::new(8) else {
            return;
        };
        if let Ok(readers) = platform.get_device_info().await {
            for reader in readers {
                assert!(!reader.id.is_empty());
            }
        }
    }
}

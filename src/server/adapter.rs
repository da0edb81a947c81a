//! Hosts a real [`Platform`] behind a [`ServerTransport`].
//!
//! The adapter resolves each inbound call's target handle, invokes the real
//! method and turns the outcome into exactly one response. Stateful results
//! (devices, card sessions) are registered and returned as handles. Native
//! platform events are re-emitted on the transport, tagged with the handle
//! they concern. When the connection ends every handle it created is released.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::core::apdu::{CommandApdu, ResponseApdu};
use crate::core::error::{BridgeError, Result};
use crate::core::platform::{Platform, PlatformEvent};
use crate::rpc::envelope::{Event, HandleId, Method, Request, Response, Scope, Value};
use crate::rpc::transport::{RequestHandler, ServerTransport};
use crate::server::registry::{HandleRegistry, Released};

pub struct ServerAdapter {
    inner: Arc<Dispatcher>,
    transport: Arc<dyn ServerTransport>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// The request handler registered on the transport
struct Dispatcher {
    platform: Arc<dyn Platform>,
    registry: Arc<HandleRegistry>,
    acquire_lock: tokio::sync::Mutex<()>,
    config: ServerConfig,
}

impl ServerAdapter {
    pub fn new(platform: Arc<dyn Platform>, transport: Arc<dyn ServerTransport>) -> Self {
        Self::with_config(platform, transport, ServerConfig::default())
    }

    pub fn with_config(
        platform: Arc<dyn Platform>,
        transport: Arc<dyn ServerTransport>,
        config: ServerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Dispatcher {
                platform,
                registry: Arc::new(HandleRegistry::new()),
                acquire_lock: tokio::sync::Mutex::new(()),
                config,
            }),
            transport,
            forwarder: Mutex::new(None),
            reaper: Mutex::new(None),
        }
    }

    /// Register as the transport's handler, start forwarding platform events
    /// and begin serving calls.
    pub async fn start(&self) -> Result<()> {
        let handler: Arc<dyn RequestHandler> = self.inner.clone();
        self.transport.on_request(handler)?;

        let events = self.inner.platform.subscribe();
        let forwarder = tokio::spawn(forward_events(
            events,
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.transport),
        ));

        let closed = self.transport.closed();
        let registry = Arc::clone(&self.inner.registry);
        let reaper = tokio::spawn(async move {
            closed.cancelled().await;
            release_all(&registry).await;
        });

        *self.forwarder.lock() = Some(forwarder);
        *self.reaper.lock() = Some(reaper);

        if let Err(e) = self.transport.start().await {
            self.abort_tasks();
            return Err(e);
        }
        log::info!("Server adapter started");
        Ok(())
    }

    fn abort_tasks(&self) {
        for task in [self.forwarder.lock().take(), self.reaper.lock().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }

    /// Stop the transport and release every handle this connection owns
    pub async fn stop(&self) -> Result<()> {
        let result = self.transport.stop().await;

        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
        release_all(&self.inner.registry).await;

        log::info!("Server adapter stopped");
        result
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.inner.registry
    }

    /// Resolves once the underlying connection has ended
    pub async fn closed(&self) {
        self.transport.closed().cancelled().await;
    }
}

/// Dispose on a task of its own: the request that asked for the release may be
/// dropped mid-way when the connection ends, the remaining objects must not be.
async fn dispose_detached(released: Released) {
    if let Err(e) = tokio::spawn(released.dispose()).await {
        log::error!("Release task failed: {e}");
    }
}

async fn release_all(registry: &HandleRegistry) {
    let released = registry.drain();
    if !released.is_empty() {
        log::info!("Releasing {} handle(s) on disconnect", released.handles().len());
        released.dispose().await;
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<PlatformEvent>,
    registry: Arc<HandleRegistry>,
    transport: Arc<dyn ServerTransport>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Platform event stream lagged, {missed} event(s) lost");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        for outgoing in route_event(&event, &registry) {
            if transport.emit_event(outgoing).is_err() {
                log::debug!("Stopping event forwarding: connection closed");
                return;
            }
        }
    }
}

/// Fan one native event out to the platform scope and to every handle it concerns
fn route_event(event: &PlatformEvent, registry: &HandleRegistry) -> Vec<Event> {
    let name = event.name().to_string();
    let device_id = Value::Text(event.device_id().to_string());
    let handles = registry.handles_for(event.device_id());

    let mut routed = Vec::new();
    match event {
        PlatformEvent::DeviceAdded(descriptor) => routed.push(Event {
            source: None,
            name,
            payload: Value::Device(descriptor.clone()),
        }),
        PlatformEvent::DeviceRemoved { .. } => {
            routed.push(Event {
                source: None,
                name: name.clone(),
                payload: device_id.clone(),
            });
            if let Some((device, _)) = handles {
                routed.push(Event {
                    source: Some(device),
                    name,
                    payload: device_id,
                });
            }
        }
        PlatformEvent::CardInserted { .. } => {
            if let Some((device, _)) = handles {
                routed.push(Event {
                    source: Some(device),
                    name,
                    payload: device_id,
                });
            }
        }
        PlatformEvent::CardRemoved { .. } => {
            if let Some((device, card)) = handles {
                routed.push(Event {
                    source: Some(device),
                    name: name.clone(),
                    payload: device_id.clone(),
                });
                if let Some(card) = card {
                    routed.push(Event {
                        source: Some(card),
                        name,
                        payload: device_id,
                    });
                }
            }
        }
    }
    routed
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, request: Request) -> Response {
        let id = request.id;
        let method = request.method.clone();

        let outcome = AssertUnwindSafe(self.dispatch(request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                log::error!("Platform panicked while handling {method}");
                Err(BridgeError::Internal(format!("{method} panicked")))
            });

        match outcome {
            Ok(value) => Response::ok(id, value),
            Err(e) => {
                match e {
                    BridgeError::Internal(_) => log::error!("[{id}] {method} failed: {e}"),
                    _ => log::debug!("[{id}] {method} failed: {e}"),
                }
                Response::err(id, e.to_rpc())
            }
        }
    }
}

struct Args {
    method: Method,
    values: std::vec::IntoIter<Value>,
}

impl Args {
    fn next(&mut self) -> Result<Value> {
        self.values.next().ok_or_else(|| {
            BridgeError::InvalidRequest(format!("{} is missing an argument", self.method))
        })
    }

    fn text(&mut self) -> Result<String> {
        match self.next()? {
            Value::Text(text) => Ok(text),
            other => Err(self.mismatch("text", &other)),
        }
    }

    fn number(&mut self) -> Result<u64> {
        match self.next()? {
            Value::Number(n) => Ok(n),
            other => Err(self.mismatch("number", &other)),
        }
    }

    fn mismatch(&self, expected: &str, got: &Value) -> BridgeError {
        BridgeError::InvalidRequest(format!(
            "{} expects a {expected} argument, got {}",
            self.method,
            got.kind()
        ))
    }
}

impl Dispatcher {
    async fn dispatch(&self, request: Request) -> Result<Value> {
        let method: Method = request.method.parse()?;
        log::debug!("[{}] {} target={:?}", request.id, method, request.target);

        let target = match (method.scope(), request.target) {
            (Scope::Platform, _) => None,
            (_, Some(handle)) => Some(handle),
            (_, None) => {
                return Err(BridgeError::InvalidRequest(format!(
                    "{method} requires a target handle"
                )))
            }
        };
        let mut args = Args {
            method,
            values: request.args.into_iter(),
        };
        let handle = || target.ok_or_else(|| BridgeError::Internal("missing target".to_string()));

        match method {
            Method::PlatformInit => self.platform.init().await.map(|_| Value::Null),
            Method::PlatformGetDeviceInfo => {
                self.platform.get_device_info().await.map(Value::Devices)
            }
            Method::PlatformAcquireDevice => {
                let id = args.text()?;
                self.acquire_device(&id).await.map(Value::Handle)
            }
            Method::DeviceIsDeviceAvailable => {
                let device = self.registry.device(handle()?)?;
                device.is_device_available().await.map(Value::Bool)
            }
            Method::DeviceIsCardPresent => {
                let device = self.registry.device(handle()?)?;
                device.is_card_present().await.map(Value::Bool)
            }
            Method::DeviceStartSession => self.start_session(handle()?).await.map(Value::Handle),
            Method::DeviceWaitForCardPresence => {
                let millis = args.number()?;
                let device = self.registry.device(handle()?)?;
                let bound = Duration::from_millis(millis).min(self.config.max_wait);
                match tokio::time::timeout(bound, device.wait_for_card_presence(bound)).await {
                    Ok(result) => result.map(|_| Value::Null),
                    Err(_) => Err(BridgeError::Timeout(format!(
                        "No card presented within {}ms",
                        bound.as_millis()
                    ))),
                }
            }
            Method::DeviceRelease => {
                let released = self.registry.release_device(handle()?)?;
                dispose_detached(released).await;
                Ok(Value::Null)
            }
            Method::CardGetAtr => {
                let card = self.registry.card(handle()?)?;
                card.get_atr().await.map(Value::Bytes)
            }
            Method::CardTransmit => {
                let command = args.next()?;
                self.transmit(handle()?, command).await
            }
            Method::CardReset => {
                let card = self.registry.card(handle()?)?;
                card.reset().await.map(|_| Value::Null)
            }
            Method::CardRelease => {
                let released = self.registry.release_card(handle()?)?;
                dispose_detached(released).await;
                Ok(Value::Null)
            }
        }
    }

    /// One logical handle per physical device per connection
    async fn acquire_device(&self, id: &str) -> Result<HandleId> {
        let _guard = self.acquire_lock.lock().await;

        if let Some(handle) = self.registry.find_device(id) {
            log::debug!("Device '{id}' already acquired as {handle}");
            return Ok(handle);
        }

        let known = self.platform.get_device_info().await?;
        if !known.iter().any(|descriptor| descriptor.id == id) {
            return Err(BridgeError::HandleNotFound(format!("No device with id '{id}'")));
        }

        let device = self.platform.acquire_device(id).await?;
        let handle = self.registry.insert_device(id, Arc::from(device));
        log::info!("Acquired device '{id}' as {handle}");
        Ok(handle)
    }

    async fn start_session(&self, device_handle: HandleId) -> Result<HandleId> {
        let device = self.registry.device(device_handle)?;
        if let Some((_, Some(active))) = self.registry.handles_for(&device.descriptor().id) {
            return Err(BridgeError::DeviceBusy(format!(
                "{} already has card session {active}",
                device.descriptor().id
            )));
        }

        let card: Arc<dyn crate::core::platform::Card> = Arc::from(device.start_session().await?);
        match self.registry.attach_card(device_handle, Arc::clone(&card)) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                // Device released or another session won the race meanwhile
                if let Err(release_error) = card.release().await {
                    log::warn!("Failed to release orphaned card session: {release_error}");
                }
                Err(e)
            }
        }
    }

    /// Raw bytes in, raw bytes out; structured in, structured out
    async fn transmit(&self, card_handle: HandleId, command: Value) -> Result<Value> {
        let card = self.registry.card(card_handle)?;

        match command {
            Value::Bytes(raw) => card.transmit(&raw).await.map(Value::Bytes),
            Value::CommandApdu(apdu) => {
                let raw = CommandApdu::to_bytes(&apdu)?;
                let response = card.transmit(&raw).await?;
                ResponseApdu::from_bytes(&response)
                    .map(Value::ResponseApdu)
                    .map_err(|e| BridgeError::TransmissionFailed(e.message().to_string()))
            }
            other => Err(BridgeError::InvalidRequest(format!(
                "card.transmit expects bytes or commandApdu, got {}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use mockall::mock;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::core::error::ErrorCode;
    use crate::core::platform::{Card, Device, DeviceDescriptor};

    mock! {
        pub Platform {}

        #[async_trait]
        impl Platform for Platform {
            async fn init(&self) -> Result<()>;
            async fn get_device_info(&self) -> Result<Vec<DeviceDescriptor>>;
            async fn acquire_device(&self, id: &str) -> Result<Box<dyn Device>>;
            fn subscribe(&self) -> broadcast::Receiver<PlatformEvent>;
        }
    }

    mock! {
        pub Reader {}

        #[async_trait]
        impl Device for Reader {
            fn descriptor(&self) -> &DeviceDescriptor;
            async fn is_device_available(&self) -> Result<bool>;
            async fn is_card_present(&self) -> Result<bool>;
            async fn start_session(&self) -> Result<Box<dyn Card>>;
            async fn wait_for_card_presence(&self, timeout: Duration) -> Result<()>;
            async fn release(&self) -> Result<()>;
        }
    }

    mock! {
        pub Session {}

        #[async_trait]
        impl Card for Session {
            async fn get_atr(&self) -> Result<Vec<u8>>;
            async fn transmit(&self, command: &[u8]) -> Result<Vec<u8>>;
            async fn reset(&self) -> Result<()>;
            async fn release(&self) -> Result<()>;
        }
    }

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::new("r0", "Mock Reader 1")
    }

    struct PanickingCard;

    #[async_trait]
    impl Card for PanickingCard {
        async fn get_atr(&self) -> Result<Vec<u8>> {
            Ok(vec![0x3B, 0x00])
        }
        async fn transmit(&self, _command: &[u8]) -> Result<Vec<u8>> {
            panic!("driver exploded")
        }
        async fn reset(&self) -> Result<()> {
            Ok(())
        }
        async fn release(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Platform with a single reader whose card is produced by `make_card`
    fn platform_with(
        make_card: impl Fn() -> Box<dyn Card> + Send + Sync + 'static,
        device_releases: usize,
    ) -> Dispatcher {
        let make_card = Arc::new(make_card);
        let mut platform = MockPlatform::new();
        platform
            .expect_get_device_info()
            .returning(|| Ok(vec![descriptor()]));
        platform.expect_acquire_device().returning(move |_| {
            let make_card = Arc::clone(&make_card);
            let mut reader = MockReader::new();
            reader.expect_descriptor().return_const(descriptor());
            reader
                .expect_start_session()
                .returning(move || Ok(make_card()));
            reader
                .expect_release()
                .times(device_releases)
                .returning(|| Ok(()));
            Ok(Box::new(reader) as Box<dyn Device>)
        });

        Dispatcher {
            platform: Arc::new(platform),
            registry: Arc::new(HandleRegistry::new()),
            acquire_lock: tokio::sync::Mutex::new(()),
            config: ServerConfig::default(),
        }
    }

    fn request(id: u64, target: Option<HandleId>, method: Method, args: Vec<Value>) -> Request {
        Request::new(id, target, method, args)
    }

    async fn open_session(dispatcher: &Dispatcher) -> (HandleId, HandleId) {
        let device = dispatcher
            .handle(request(1, None, Method::PlatformAcquireDevice, vec![Value::Text("r0".into())]))
            .await
            .into_result()
            .unwrap()
            .into_handle()
            .unwrap();
        let card = dispatcher
            .handle(request(2, Some(device), Method::DeviceStartSession, vec![]))
            .await
            .into_result()
            .unwrap()
            .into_handle()
            .unwrap();
        (device, card)
    }

    #[tokio::test]
    async fn test_device_release_disposes_card_then_device_once() {
        let card_released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&card_released);
        let dispatcher = platform_with(
            move || {
                let flag = Arc::clone(&flag);
                let mut card = MockSession::new();
                card.expect_release().times(1).returning(move || {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                });
                Box::new(card) as Box<dyn Card>
            },
            1,
        );

        let (device, card) = open_session(&dispatcher).await;
        let released = dispatcher
            .handle(request(3, Some(device), Method::DeviceRelease, vec![]))
            .await;
        assert_ok!(released.into_result());
        assert!(card_released.load(Ordering::SeqCst));

        let after = dispatcher
            .handle(request(4, Some(card), Method::CardGetAtr, vec![]))
            .await;
        assert_eq!(after.error.unwrap().code, ErrorCode::HandleNotFound);

        let again = dispatcher
            .handle(request(5, Some(device), Method::DeviceRelease, vec![]))
            .await;
        assert_eq!(again.error.unwrap().code, ErrorCode::HandleNotFound);
    }

    /// Takes a while to let go of the session, then records it
    struct SlowReleaseCard {
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Card for SlowReleaseCard {
        async fn get_atr(&self) -> Result<Vec<u8>> {
            Ok(vec![0x3B, 0x00])
        }
        async fn transmit(&self, _command: &[u8]) -> Result<Vec<u8>> {
            Ok(vec![0x90, 0x00])
        }
        async fn reset(&self) -> Result<()> {
            Ok(())
        }
        async fn release(&self) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.released.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dropped_release_still_disposes_device() {
        let card_released = Arc::new(AtomicBool::new(false));
        let device_released = Arc::new(AtomicBool::new(false));

        let mut platform = MockPlatform::new();
        let (card_flag, device_flag) = (Arc::clone(&card_released), Arc::clone(&device_released));
        platform
            .expect_get_device_info()
            .returning(|| Ok(vec![descriptor()]));
        platform.expect_acquire_device().returning(move |_| {
            let card_flag = Arc::clone(&card_flag);
            let device_flag = Arc::clone(&device_flag);
            let mut reader = MockReader::new();
            reader.expect_descriptor().return_const(descriptor());
            reader.expect_start_session().returning(move || {
                Ok(Box::new(SlowReleaseCard {
                    released: Arc::clone(&card_flag),
                }) as Box<dyn Card>)
            });
            reader.expect_release().returning(move || {
                device_flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Ok(Box::new(reader) as Box<dyn Device>)
        });
        let dispatcher = Dispatcher {
            platform: Arc::new(platform),
            registry: Arc::new(HandleRegistry::new()),
            acquire_lock: tokio::sync::Mutex::new(()),
            config: ServerConfig::default(),
        };

        let (device, _) = open_session(&dispatcher).await;
        // Gives up while the card is still being released, as a closing connection does
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            dispatcher.handle(request(3, Some(device), Method::DeviceRelease, vec![])),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(card_released.load(Ordering::SeqCst));
        assert!(device_released.load(Ordering::SeqCst));
        assert!(dispatcher.registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_stops_background_tasks() {
        let (_client, server) = crate::rpc::memory::pair();
        let server = Arc::new(server);
        server.stop().await.unwrap();

        let mut platform = MockPlatform::new();
        platform
            .expect_subscribe()
            .returning(|| broadcast::channel(4).1);
        let adapter = ServerAdapter::new(Arc::new(platform), server);

        assert_err!(adapter.start().await);
        assert!(adapter.forwarder.lock().is_none());
        assert!(adapter.reaper.lock().is_none());
    }

    #[tokio::test]
    async fn test_panicking_card_becomes_internal_error() {
        let dispatcher = platform_with(|| Box::new(PanickingCard) as Box<dyn Card>, 0);

        let (_, card) = open_session(&dispatcher).await;
        let response = dispatcher
            .handle(request(
                3,
                Some(card),
                Method::CardTransmit,
                vec![Value::Bytes(vec![0x00, 0xA4, 0x04, 0x00])],
            ))
            .await;

        assert_eq!(response.id, 3);
        assert_eq!(response.error.unwrap().code, ErrorCode::InternalError);
    }

    #[tokio::test]
    async fn test_driver_errors_keep_their_kind() {
        let dispatcher = platform_with(
            || {
                let mut card = MockSession::new();
                card.expect_transmit()
                    .returning(|_| Err(BridgeError::CardNotPresent("r0".to_string())));
                card.expect_get_atr()
                    .returning(|| Err(BridgeError::TransmissionFailed("crc".to_string())));
                card.expect_release().returning(|| Ok(()));
                Box::new(card) as Box<dyn Card>
            },
            0,
        );

        let (_, card) = open_session(&dispatcher).await;
        let transmit = dispatcher
            .handle(request(
                3,
                Some(card),
                Method::CardTransmit,
                vec![Value::CommandApdu(CommandApdu::new(0x00, 0xB0, 0x00, 0x00))],
            ))
            .await;
        assert_eq!(
            assert_err!(transmit.into_result()),
            BridgeError::CardNotPresent("r0".to_string())
        );

        let atr = dispatcher
            .handle(request(4, Some(card), Method::CardGetAtr, vec![]))
            .await;
        assert_eq!(atr.error.unwrap().code, ErrorCode::TransmissionFailed);
    }

    #[tokio::test]
    async fn test_short_driver_response_fails_structured_transmit() {
        let dispatcher = platform_with(
            || {
                let mut card = MockSession::new();
                card.expect_transmit().returning(|_| Ok(vec![0x90]));
                card.expect_release().returning(|| Ok(()));
                Box::new(card) as Box<dyn Card>
            },
            0,
        );

        let (_, card) = open_session(&dispatcher).await;
        let structured = dispatcher
            .handle(request(
                3,
                Some(card),
                Method::CardTransmit,
                vec![Value::CommandApdu(CommandApdu::new(0x00, 0xA4, 0x04, 0x00))],
            ))
            .await;
        assert_eq!(structured.error.unwrap().code, ErrorCode::TransmissionFailed);

        // Raw callers get the bytes untouched
        let raw = dispatcher
            .handle(request(
                4,
                Some(card),
                Method::CardTransmit,
                vec![Value::Bytes(vec![0x00, 0xA4, 0x04, 0x00])],
            ))
            .await;
        assert_eq!(raw.into_result().unwrap(), Value::Bytes(vec![0x90]));
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let dispatcher = platform_with(|| Box::new(MockSession::new()) as Box<dyn Card>, 0);

        let unknown = dispatcher
            .handle(Request {
                id: 1,
                target: None,
                method: "platform.selfDestruct".to_string(),
                args: vec![],
            })
            .await;
        assert_eq!(unknown.error.unwrap().code, ErrorCode::InvalidRequest);

        let untargeted = dispatcher
            .handle(request(2, None, Method::DeviceIsCardPresent, vec![]))
            .await;
        assert_eq!(untargeted.error.unwrap().code, ErrorCode::InvalidRequest);

        let missing_arg = dispatcher
            .handle(request(3, None, Method::PlatformAcquireDevice, vec![]))
            .await;
        assert_eq!(missing_arg.error.unwrap().code, ErrorCode::InvalidRequest);

        let wrong_arg = dispatcher
            .handle(request(4, None, Method::PlatformAcquireDevice, vec![Value::Number(0)]))
            .await;
        assert_eq!(wrong_arg.error.unwrap().code, ErrorCode::InvalidRequest);

        let phantom = dispatcher
            .handle(request(5, None, Method::PlatformAcquireDevice, vec![Value::Text("missing".into())]))
            .await;
        assert_eq!(phantom.error.unwrap().code, ErrorCode::HandleNotFound);
        assert!(dispatcher.registry.is_empty());
    }

    #[tokio::test]
    async fn test_route_card_removed_reaches_device_and_card() {
        let dispatcher = platform_with(
            || {
                let mut card = MockSession::new();
                card.expect_release().returning(|| Ok(()));
                Box::new(card) as Box<dyn Card>
            },
            0,
        );
        let (device, card) = open_session(&dispatcher).await;

        let routed = route_event(
            &PlatformEvent::CardRemoved {
                device_id: "r0".to_string(),
            },
            &dispatcher.registry,
        );
        let sources: Vec<_> = routed.iter().map(|event| event.source).collect();
        assert_eq!(sources, vec![Some(device), Some(card)]);
        assert!(routed.iter().all(|event| event.name == "card-removed"));

        let unrelated = route_event(
            &PlatformEvent::CardInserted {
                device_id: "r9".to_string(),
            },
            &dispatcher.registry,
        );
        assert!(unrelated.is_empty());

        let added = route_event(
            &PlatformEvent::DeviceAdded(DeviceDescriptor::new("r9", "New")),
            &dispatcher.registry,
        );
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].source, None);
    }
}

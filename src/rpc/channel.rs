//! Transport endpoints built on a pair of envelope channels.
//!
//! Both concrete transports reduce to this: the in-memory transport wires two
//! endpoints together directly, the stream transport puts a framing task
//! between each endpoint and its socket. Dropping the outbound sender is how
//! an endpoint tells its peer the connection is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::core::error::{BridgeError, Result};
use crate::rpc::envelope::{CallId, Envelope, Event, Request, Response};
use crate::rpc::pending::PendingCalls;
use crate::rpc::transport::{ClientTransport, RequestHandler, ServerTransport};

type Outbound = Arc<Mutex<Option<mpsc::UnboundedSender<Envelope>>>>;

fn send(outbound: &Outbound, envelope: Envelope) -> Result<()> {
    match outbound.lock().as_ref() {
        Some(tx) => tx
            .send(envelope)
            .map_err(|_| BridgeError::connection_closed()),
        None => Err(BridgeError::connection_closed()),
    }
}

/// Client endpoint: correlates responses to calls and fans out events
pub struct ChannelClient {
    outbound: Outbound,
    next_id: AtomicU64,
    pending: Arc<PendingCalls>,
    events: broadcast::Sender<Event>,
    closed: CancellationToken,
}

impl ChannelClient {
    /// Must be called inside a tokio runtime; spawns the inbound router.
    pub fn new(
        outbound: mpsc::UnboundedSender<Envelope>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
        config: &ClientConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let client = Self {
            outbound: Arc::new(Mutex::new(Some(outbound))),
            next_id: AtomicU64::new(1),
            pending: Arc::new(PendingCalls::new()),
            events,
            closed: CancellationToken::new(),
        };

        tokio::spawn(route_inbound(
            inbound,
            Arc::clone(&client.outbound),
            Arc::clone(&client.pending),
            client.events.clone(),
            client.closed.clone(),
        ));

        client
    }

    /// Number of calls still waiting for a response
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

async fn route_inbound(
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    outbound: Outbound,
    pending: Arc<PendingCalls>,
    events: broadcast::Sender<Event>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            envelope = inbound.recv() => match envelope {
                Some(Envelope::Response(response)) => {
                    pending.complete(response);
                }
                Some(Envelope::Event(event)) => {
                    // No subscribers is fine
                    let _ = events.send(event);
                }
                Some(Envelope::Request(request)) => {
                    log::warn!("Ignoring request '{}' sent to a client endpoint", request.method);
                }
                None => {
                    log::info!("Connection closed by server");
                    break;
                }
            }
        }
    }

    closed.cancel();
    outbound.lock().take();
    pending.close();
}

/// Drops the pending entry of a call whose future went away before its response
struct Abandon<'a> {
    pending: &'a PendingCalls,
    id: CallId,
}

impl Drop for Abandon<'_> {
    fn drop(&mut self) {
        if self.pending.forget(self.id) {
            log::debug!("Call {} abandoned before its response", self.id);
        }
    }
}

#[async_trait]
impl ClientTransport for ChannelClient {
    fn next_call_id(&self) -> CallId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let id = request.id;
        let rx = self.pending.register(id)?;
        let _abandon = Abandon {
            pending: &self.pending,
            id,
        };

        log::debug!("-> [{}] {}", id, request.method);
        if let Err(e) = send(&self.outbound, Envelope::Request(request)) {
            self.pending.fail(id, e);
        }

        rx.await.unwrap_or_else(|_| Err(BridgeError::connection_closed()))
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.closed.cancel();
        self.pending.close();
        self.outbound.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Server endpoint: runs each inbound call on its own task
pub struct ChannelServer {
    outbound: Outbound,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    handler: OnceLock<Arc<dyn RequestHandler>>,
    closed: CancellationToken,
}

impl ChannelServer {
    pub fn new(
        outbound: mpsc::UnboundedSender<Envelope>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            outbound: Arc::new(Mutex::new(Some(outbound))),
            inbound: Mutex::new(Some(inbound)),
            handler: OnceLock::new(),
            closed: CancellationToken::new(),
        }
    }
}

async fn serve(
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    outbound: Outbound,
    handler: Arc<dyn RequestHandler>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            envelope = inbound.recv() => match envelope {
                Some(Envelope::Request(request)) => {
                    let handler = Arc::clone(&handler);
                    let outbound = Arc::clone(&outbound);
                    let closed = closed.clone();

                    tokio::spawn(async move {
                        let id = request.id;
                        let response = tokio::select! {
                            response = handler.handle(request) => response,
                            _ = closed.cancelled() => {
                                Response::err(id, BridgeError::connection_closed().to_rpc())
                            }
                        };
                        if send(&outbound, Envelope::Response(response)).is_err() {
                            log::debug!("Response to call {id} dropped: connection closed");
                        }
                    });
                }
                Some(_) => log::warn!("Ignoring non-request envelope sent to a server endpoint"),
                None => {
                    log::info!("Client disconnected");
                    break;
                }
            }
        }
    }

    closed.cancel();
    outbound.lock().take();
}

#[async_trait]
impl ServerTransport for ChannelServer {
    fn on_request(&self, handler: Arc<dyn RequestHandler>) -> Result<()> {
        self.handler
            .set(handler)
            .map_err(|_| BridgeError::Internal("A request handler is already registered".to_string()))
    }

    fn emit_event(&self, event: Event) -> Result<()> {
        send(&self.outbound, Envelope::Event(event))
    }

    async fn start(&self) -> Result<()> {
        let handler = self
            .handler
            .get()
            .cloned()
            .ok_or_else(|| BridgeError::Internal("No request handler registered".to_string()))?;

        if self.closed.is_cancelled() {
            return Err(BridgeError::connection_closed());
        }

        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| BridgeError::Internal("Transport already started".to_string()))?;

        tokio::spawn(serve(
            inbound,
            Arc::clone(&self.outbound),
            handler,
            self.closed.clone(),
        ));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.closed.cancel();
        self.outbound.lock().take();
        self.inbound.lock().take();
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

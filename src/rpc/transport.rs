//! The contract a network hop has to satisfy.
//!
//! Transports do not promise ordering: responses may arrive in any order and
//! are matched to their calls only by id. Concrete implementations live in
//! [`crate::rpc::memory`] (in-process) and [`crate::rpc::stream`] (any byte
//! stream, e.g. a TCP socket tunnelled through a relay).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::error::Result;
use crate::rpc::envelope::{CallId, Event, Request, Response};

/// Client side of a connection: makes calls, receives events
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Allocate a call id no other caller on this connection will be given
    fn next_call_id(&self) -> CallId;

    /// Send `request` and wait for the response carrying the same id.
    ///
    /// Fails with `ConnectionClosed` if the connection ends first. A response
    /// holding a typed error is still `Ok` here; decoding it is the caller's job.
    async fn call(&self, request: Request) -> Result<Response>;

    /// Receive every event pushed by the server from now on
    fn subscribe(&self) -> broadcast::Receiver<Event>;

    /// Release the connection and fail all pending calls with `ConnectionClosed`
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Handles one inbound call. Must always produce a response, typed errors included.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Server side of a connection: receives calls, emits events
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Register the request handler. Only one handler may ever be registered.
    fn on_request(&self, handler: Arc<dyn RequestHandler>) -> Result<()>;

    fn emit_event(&self, event: Event) -> Result<()>;

    /// Begin serving calls. Requires a registered handler.
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Cancelled when the connection ends, by `stop()` or by the peer going away
    fn closed(&self) -> CancellationToken;
}

//! RPC plumbing: envelope codec, transport contract, call correlation and the
//! concrete transports.

pub mod channel;
pub mod envelope;
pub mod memory;
pub mod pending;
pub mod stream;
pub mod transport;

pub use envelope::{CallId, Envelope, Event, HandleId, Method, Request, Response, Scope, Value};
pub use transport::{ClientTransport, RequestHandler, ServerTransport};

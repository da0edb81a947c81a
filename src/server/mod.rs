//! Server side of the bridge: exposes a local platform to one remote client.

pub mod adapter;
pub mod registry;

pub use adapter::ServerAdapter;
pub use registry::{DeviceState, HandleRegistry};

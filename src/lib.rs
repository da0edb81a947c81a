/// PCSC Bridge - remote smart card access over an RPC proxy
///
/// A server hosts a [`core::platform::Platform`] (real PC/SC readers or the
/// mock backend) behind a [`server::ServerAdapter`]; clients drive it through
/// [`client::PlatformProxy`] and the device/card proxies it hands out.
pub mod backend;
pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod rpc;
pub mod server;

// Re-export commonly used types
pub use client::{CardProxy, DeviceProxy, PlatformProxy, Subscription};
pub use config::{ClientConfig, ServerConfig, TransportConfig};
pub use crate::core::{
    apdu::{CommandApdu, ResponseApdu},
    error::{BridgeError, ErrorCode, Result},
    platform::{Card, Device, DeviceDescriptor, Platform, PlatformEvent},
    utils::{format_hex, parse_hex},
};
pub use server::ServerAdapter;

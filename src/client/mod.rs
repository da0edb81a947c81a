//! Client proxies: the same method surface as the hardware interface, each
//! call one round trip over a [`ClientTransport`](crate::rpc::ClientTransport).

pub mod card;
pub mod device;
pub mod events;
pub mod platform;
mod remote;

pub use card::CardProxy;
pub use device::DeviceProxy;
pub use events::{Subscription, ANY_EVENT};
pub use platform::PlatformProxy;

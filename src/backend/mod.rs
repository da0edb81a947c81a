//! Host-side [`Platform`](crate::core::platform::Platform) implementations a
//! server adapter can wrap.

pub mod mock;
#[cfg(feature = "pcsc")]
pub mod pcsc;

pub use mock::MockPlatform;
#[cfg(feature = "pcsc")]
pub use self::pcsc::PcscPlatform;

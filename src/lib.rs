//! # toiletlid
//!
//! Local control of Xiaomi Whale smart toilet covers (`xjx.toilet.pro`,
//! `xjx.toilet.pure`) over the miIO UDP protocol, without cloud access.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use toiletlid::{ApplianceController, DeviceBuilder, Model};
//!
//! # async fn run() -> toiletlid::error::Result<()> {
//! let client = DeviceBuilder::new("192.168.1.50", "00112233445566778899aabbccddeeff").build()?;
//! let mut lid = ApplianceController::new(client, Model::XjxToiletPro);
//! if let Some(status) = lid.refresh().await {
//!     println!("occupied: {:?}", status.is_on());
//! }
//! lid.set_light(true).await;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod device;
pub mod error;
pub mod model;
pub mod platform;
pub mod protocol;
pub mod status;

#[cfg(test)]
mod testing;

pub use config::{ApplianceConfig, Config};
pub use controller::{ApplianceController, CachedEntityState, EntityState};
pub use device::{DeviceBuilder, DeviceClient, DeviceIdentity, DeviceInfo};
pub use error::MiioError;
pub use model::Model;
pub use platform::{ApplianceRegistry, ServiceCall, ToiletlidEntity};
pub use status::DeviceStatus;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}

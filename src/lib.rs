//! wgcore - WireGuard protocol engine
//!
//! The protocol core of a WireGuard interface, independent of any TUN device
//! or routing table:
//!
//! - Noise IKpsk2 handshake with mac1/mac2 and cookie replies
//! - Per-peer stable/unstable sessions with lock-free data-path readers
//! - Transport encryption with a 2048-bit replay window
//! - Rekey, keepalive and give-up timers driven by [`Device::tick`]
//!
//! The engine talks to the outside world through three traits in
//! [`device::external`]; [`driver`] provides tokio implementations.
//!
//! # Usage
//!
//! ```no_run
//! use wgcore::driver::Driver;
//! use wgcore::DeviceConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DeviceConfig::from_file("wgcore.json")?;
//!     let driver = Driver::bind(&config).await?;
//!     let (tx, _rx) = tokio::sync::mpsc::channel(256);
//!     driver.run(tx, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod routing;

pub use config::{DeviceConfig, PeerConfig, Timing};
pub use device::{Device, DeviceStatus, PeerStatus};
pub use error::{Result, WgError};

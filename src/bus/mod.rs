pub mod bridge;
pub mod i2c;
pub mod sim;

use crate::config::{BusConfig, Interface};
use crate::errors::BusResult;
use async_trait::async_trait;
use tracing::info;

pub use bridge::BridgeChip;
pub use i2c::NativeBus;

/// Uniform register access to the fuel gauge, whatever the wire underneath.
///
/// Every operation takes `&mut self`: one transaction at a time. Transports
/// never retry on their own; that decision belongs to the fault policy.
#[async_trait]
pub trait BusTransport: Send {
    /// Human-readable bus label for diagnostics
    fn name(&self) -> &str;

    /// Read one 16-bit register (little-endian on the wire)
    async fn read_register(&mut self, target: u8, register: u8) -> BusResult<u16>;

    /// Write one 16-bit register, low byte first
    async fn write_register(&mut self, target: u8, register: u8, value: u16) -> BusResult<()>;

    /// Read `count` consecutive registers in one transaction (auto-increment)
    async fn read_words(&mut self, target: u8, register: u8, count: usize) -> BusResult<Vec<u16>>;

    /// Release the underlying handle. Calling it again is a no-op.
    fn close(&mut self) -> BusResult<()>;
}

/// Open the transport variant selected by configuration
pub fn open_transport(config: &BusConfig) -> BusResult<Box<dyn BusTransport>> {
    let transport: Box<dyn BusTransport> = match config.interface {
        Interface::Native => Box::new(NativeBus::open(config.number)?),
        Interface::Bridge => bridge::open_usb(config.number, &config.bridge)?,
        Interface::Simulated => {
            let link = sim::SimulatedLink::new(sim::SimulatedGauge::max1730x());
            Box::new(BridgeChip::open(link, &config.bridge)?)
        }
    };
    info!("[bus] opened {}", transport.name());
    Ok(transport)
}

use std::time::Duration;
use thiserror::Error;

/// Failures of the raw byte link to the bridge chip
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("USB I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("expected {expected} response bytes, received {received}")]
    Timeout { expected: usize, received: usize },
}

/// Byte pipe to an MPSSE engine.
///
/// Implemented by the USB device and by the simulated gauge used in tests.
pub trait MpsseLink: Send {
    /// Label for diagnostics, e.g. `ftdi:0403:6010/B`
    fn describe(&self) -> String;

    /// Queue a command batch; one USB transfer
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Fill `buf` completely or fail once `timeout` has elapsed
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), LinkError>;

    /// Drop anything buffered in either direction
    fn purge(&mut self) -> Result<(), LinkError>;

    fn close(&mut self) -> Result<(), LinkError>;
}

#[cfg(feature = "ftdi")]
pub use usb::FtdiLink;

#[cfg(feature = "ftdi")]
mod usb {
    use super::{LinkError, MpsseLink};
    use crate::config::BridgeConfig;
    use crate::errors::{BusError, BusResult};
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};
    use tracing::debug;

    /// FTDI device opened through libftdi, one MPSSE channel
    pub struct FtdiLink {
        device: Option<ftdi::Device>,
        label: String,
    }

    fn channel(index: u32) -> Option<(ftdi::Interface, char)> {
        match index {
            0 => Some((ftdi::Interface::A, 'A')),
            1 => Some((ftdi::Interface::B, 'B')),
            2 => Some((ftdi::Interface::C, 'C')),
            3 => Some((ftdi::Interface::D, 'D')),
            _ => None,
        }
    }

    impl FtdiLink {
        /// Open channel `bus_number` (0 = A, 1 = B, ...) and switch it to MPSSE
        pub fn open(bus_number: u32, config: &BridgeConfig) -> BusResult<Self> {
            let (interface, letter) = channel(bus_number).ok_or_else(|| {
                BusError::unavailable(
                    format!("ftdi/{}", bus_number),
                    "bridge channel must be 0-3 (A-D)",
                )
            })?;
            let label = format!(
                "ftdi:{:04x}:{:04x}/{}",
                config.usb_vendor_id, config.usb_product_id, letter
            );
            let unavailable = |e: ftdi::Error| BusError::unavailable(&label, e);

            let mut device = ftdi::find_by_vid_pid(config.usb_vendor_id, config.usb_product_id)
                .interface(interface)
                .open()
                .map_err(unavailable)?;
            device.usb_reset().map_err(unavailable)?;
            device.usb_purge_buffers().map_err(unavailable)?;
            device
                .set_latency_timer(config.latency_ms)
                .map_err(unavailable)?;
            device
                .set_bitmode(0, ftdi::BitMode::Reset)
                .map_err(unavailable)?;
            device
                .set_bitmode(0, ftdi::BitMode::Mpsse)
                .map_err(unavailable)?;
            // MPSSE needs a moment after the mode switch before it parses commands
            std::thread::sleep(Duration::from_millis(50));
            debug!("[bridge] {} in MPSSE mode", label);

            Ok(Self {
                device: Some(device),
                label,
            })
        }

        fn device(&mut self) -> Result<&mut ftdi::Device, LinkError> {
            self.device.as_mut().ok_or_else(|| {
                LinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "link is closed",
                ))
            })
        }
    }

    impl MpsseLink for FtdiLink {
        fn describe(&self) -> String {
            self.label.clone()
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
            self.device()?.write_all(bytes)?;
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), LinkError> {
            let deadline = Instant::now() + timeout;
            let device = self.device()?;
            let mut received = 0;
            while received < buf.len() {
                let n = device.read(&mut buf[received..])?;
                received += n;
                if n == 0 {
                    if Instant::now() >= deadline {
                        return Err(LinkError::Timeout {
                            expected: buf.len(),
                            received,
                        });
                    }
                    std::thread::sleep(Duration::from_micros(200));
                }
            }
            Ok(())
        }

        fn purge(&mut self) -> Result<(), LinkError> {
            self.device()?
                .usb_purge_buffers()
                .map_err(|e| LinkError::Io(std::io::Error::other(e.to_string())))
        }

        fn close(&mut self) -> Result<(), LinkError> {
            if let Some(mut device) = self.device.take() {
                device
                    .set_bitmode(0, ftdi::BitMode::Reset)
                    .map_err(|e| LinkError::Io(std::io::Error::other(e.to_string())))?;
            }
            Ok(())
        }
    }
}

use crate::bus::BusTransport;
use crate::errors::{BusError, BusResult, TransactionCause};
use async_trait::async_trait;
#[cfg(target_os = "linux")]
use i2cdev::core::I2CDevice;
#[cfg(target_os = "linux")]
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};
use tracing::debug;

/// Largest SMBus block transfer
const MAX_BLOCK_BYTES: usize = 32;

/// Native I2C/SMBus controller exposed by the OS as `/dev/i2c-N`
#[cfg(target_os = "linux")]
pub struct NativeBus {
    device: Option<LinuxI2CDevice>,
    path: String,
    current_target: Option<u8>,
}

#[cfg(not(target_os = "linux"))]
pub struct NativeBus {
    path: String,
}

pub fn device_path(bus_number: u32) -> String {
    format!("/dev/i2c-{}", bus_number)
}

#[cfg(target_os = "linux")]
impl NativeBus {
    pub fn open(bus_number: u32) -> BusResult<Self> {
        let path = device_path(bus_number);
        let device = LinuxI2CDevice::new(&path, 0).map_err(|e| BusError::unavailable(&path, e))?;
        debug!("[i2c] opened {}", path);
        Ok(Self {
            device: Some(device),
            path,
            current_target: None,
        })
    }

    fn device_for(&mut self, target: u8) -> BusResult<&mut LinuxI2CDevice> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| BusError::unavailable(&self.path, "bus is closed"))?;
        if self.current_target != Some(target) {
            device.set_slave_address(u16::from(target)).map_err(classify)?;
            self.current_target = Some(target);
        }
        Ok(device)
    }

    fn read_block(&mut self, target: u8, register: u8, len: usize) -> BusResult<Vec<u8>> {
        let device = self.device_for(target)?;
        let data = device
            .smbus_read_i2c_block_data(register, len as u8)
            .map_err(classify)?;
        if data.len() != len {
            return Err(BusError::transaction(
                TransactionCause::BusIo,
                format!("short read: expected {} bytes, got {}", len, data.len()),
            ));
        }
        Ok(data)
    }
}

/// Map a platform error onto a transaction cause.
#[cfg(target_os = "linux")]
fn classify(err: LinuxI2CError) -> BusError {
    // errno values from asm-generic/errno.h
    const ENXIO: i32 = 6;
    const ETIMEDOUT: i32 = 110;
    const EREMOTEIO: i32 = 121;

    let err = std::io::Error::from(err);
    let cause = match err.raw_os_error() {
        Some(ENXIO) | Some(EREMOTEIO) => TransactionCause::NoAck,
        Some(ETIMEDOUT) => TransactionCause::Timeout,
        _ => TransactionCause::BusIo,
    };
    BusError::transaction(cause, err.to_string())
}

#[cfg(target_os = "linux")]
#[async_trait]
impl BusTransport for NativeBus {
    fn name(&self) -> &str {
        &self.path
    }

    async fn read_register(&mut self, target: u8, register: u8) -> BusResult<u16> {
        let data = self.read_block(target, register, 2)?;
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    async fn write_register(&mut self, target: u8, register: u8, value: u16) -> BusResult<()> {
        let device = self.device_for(target)?;
        device
            .smbus_write_i2c_block_data(register, &value.to_le_bytes())
            .map_err(classify)
    }

    async fn read_words(&mut self, target: u8, register: u8, count: usize) -> BusResult<Vec<u16>> {
        let len = count * 2;
        if count == 0 || len > MAX_BLOCK_BYTES {
            return Err(BusError::transaction(
                TransactionCause::BusIo,
                format!("block read of {} words not supported", count),
            ));
        }
        let data = self.read_block(target, register, len)?;
        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn close(&mut self) -> BusResult<()> {
        if self.device.take().is_some() {
            debug!("[i2c] closed {}", self.path);
        }
        self.current_target = None;
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl NativeBus {
    pub fn open(bus_number: u32) -> BusResult<Self> {
        Err(BusError::unavailable(
            device_path(bus_number),
            "native I2C is only supported on Linux, use the bridge interface",
        ))
    }
}

#[cfg(not(target_os = "linux"))]
#[async_trait]
impl BusTransport for NativeBus {
    fn name(&self) -> &str {
        &self.path
    }

    async fn read_register(&mut self, _target: u8, _register: u8) -> BusResult<u16> {
        Err(BusError::unavailable(&self.path, "native I2C is only supported on Linux"))
    }

    async fn write_register(&mut self, _target: u8, _register: u8, _value: u16) -> BusResult<()> {
        Err(BusError::unavailable(&self.path, "native I2C is only supported on Linux"))
    }

    async fn read_words(&mut self, _target: u8, _register: u8, _count: usize) -> BusResult<Vec<u16>> {
        Err(BusError::unavailable(&self.path, "native I2C is only supported on Linux"))
    }

    fn close(&mut self) -> BusResult<()> {
        Ok(())
    }
}

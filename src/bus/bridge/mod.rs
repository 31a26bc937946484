//! I2C master bit-banged through an FTDI MPSSE engine.
//!
//! The chip has no I2C transaction primitive here: every bit is a handful of
//! GPIO commands. Commands for one byte (plus a pending START) travel in a
//! single USB write, and the pin samples for that byte come back in a single
//! read, which keeps a register read at six round trips.

pub mod framer;
pub mod link;
pub mod mpsse;

use crate::bus::BusTransport;
use crate::config::BridgeConfig;
use crate::errors::{BusError, BusResult, TransactionCause};
use async_trait::async_trait;
use framer::{I2cFramer, PinSample};
use link::{LinkError, MpsseLink};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Largest block read, in words
const MAX_WORDS: usize = 16;

impl From<LinkError> for BusError {
    fn from(err: LinkError) -> Self {
        let cause = match err {
            LinkError::Io(_) => TransactionCause::UsbIo,
            LinkError::Timeout { .. } => TransactionCause::Timeout,
        };
        BusError::transaction(cause, err.to_string())
    }
}

/// Bridge-chip transport over any [`MpsseLink`]
pub struct BridgeChip<L: MpsseLink> {
    link: L,
    framer: I2cFramer,
    label: String,
    timeout: Duration,
    open: bool,
    transfers: u64,
}

impl<L: MpsseLink> BridgeChip<L> {
    /// Synchronise with the MPSSE engine, program the clock and idle the bus.
    ///
    /// Any failure here is reported as `BusUnavailable`.
    pub fn open(link: L, config: &BridgeConfig) -> BusResult<Self> {
        let label = format!("bridge:{}", link.describe());
        let divisor = mpsse::clock_divisor(config.clock_hz).ok_or_else(|| {
            BusError::unavailable(&label, format!("clock of {} Hz is out of range", config.clock_hz))
        })?;

        let mut chip = Self {
            link,
            framer: I2cFramer::new(usize::from(config.hold_repeats)),
            label,
            timeout: Duration::from_millis(config.transfer_timeout_ms),
            open: true,
            transfers: 0,
        };
        if let Err(e) = chip.configure(divisor) {
            return Err(BusError::unavailable(&chip.label, e));
        }
        debug!(
            "[bridge] {} configured: {} Hz (divisor {})",
            chip.label, config.clock_hz, divisor
        );
        Ok(chip)
    }

    fn configure(&mut self, divisor: u16) -> BusResult<()> {
        self.framer.reset();
        self.transfers = 0;
        self.link.purge()?;

        self.link.write(&[mpsse::SYNC_OPCODE, mpsse::SEND_IMMEDIATE])?;
        let mut echo = [0u8; 2];
        self.link.read(&mut echo, self.timeout)?;
        if echo != [mpsse::BAD_COMMAND, mpsse::SYNC_OPCODE] {
            return Err(BusError::transaction(
                TransactionCause::UsbIo,
                format!("MPSSE sync failed, got {:02X?}", echo),
            ));
        }

        let [low, high] = divisor.to_le_bytes();
        self.framer.raw(&[
            mpsse::DISABLE_CLK_DIV5,
            mpsse::DISABLE_ADAPTIVE,
            mpsse::DISABLE_3PHASE,
            mpsse::LOOPBACK_OFF,
            mpsse::SET_CLOCK_DIVISOR,
            low,
            high,
        ]);
        self.framer.idle();
        self.transfer()?;
        Ok(())
    }

    /// Number of USB writes since open
    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(BusError::unavailable(&self.label, "bus is closed"))
        }
    }

    /// Send the pending batch and collect its pin samples
    fn transfer(&mut self) -> BusResult<Vec<u8>> {
        let (commands, expected) = self.framer.take_batch();
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.link.write(&commands)?;
        self.transfers += 1;

        let mut response = vec![0u8; expected];
        if expected > 0 {
            self.link.read(&mut response, self.timeout)?;
        }
        trace!(
            "[bridge] transfer {}: {} command bytes, {} samples",
            self.transfers,
            commands.len(),
            expected
        );
        Ok(response)
    }

    fn check_clock(sample: PinSample) -> BusResult<()> {
        if sample.scl_high {
            Ok(())
        } else {
            Err(BusError::transaction(
                TransactionCause::Timeout,
                "SCL held low by target past the sample point",
            ))
        }
    }

    fn send_byte(&mut self, byte: u8) -> BusResult<()> {
        self.framer.write_byte(byte);
        let response = self.transfer()?;
        let raw = response.first().copied().ok_or_else(|| {
            BusError::transaction(TransactionCause::UsbIo, "missing ACK sample")
        })?;
        let sample = PinSample::decode(raw);
        Self::check_clock(sample)?;
        if sample.sda_high {
            return Err(BusError::transaction(
                TransactionCause::NoAck,
                format!("no ACK for byte 0x{:02x}", byte),
            ));
        }
        Ok(())
    }

    fn receive_byte(&mut self, ack: bool) -> BusResult<u8> {
        self.framer.read_byte(ack);
        let response = self.transfer()?;
        if response.len() != 8 {
            return Err(BusError::transaction(
                TransactionCause::UsbIo,
                format!("expected 8 bit samples, got {}", response.len()),
            ));
        }
        let mut byte = 0u8;
        for raw in response {
            let sample = PinSample::decode(raw);
            Self::check_clock(sample)?;
            byte = (byte << 1) | u8::from(sample.sda_high);
        }
        Ok(byte)
    }

    /// START, address+W, register pointer
    fn address_register(&mut self, target: u8, register: u8) -> BusResult<()> {
        self.framer.start();
        self.send_byte(target << 1)?;
        self.send_byte(register)
    }

    fn read_bytes(&mut self, target: u8, register: u8, len: usize) -> BusResult<Vec<u8>> {
        self.address_register(target, register)?;
        self.framer.start();
        self.send_byte((target << 1) | 1)?;
        let mut data = Vec::with_capacity(len);
        for index in 0..len {
            // NACK the last byte to end the read
            data.push(self.receive_byte(index + 1 < len)?);
        }
        self.framer.stop();
        self.transfer()?;
        Ok(data)
    }

    fn write_bytes(&mut self, target: u8, register: u8, data: &[u8]) -> BusResult<()> {
        self.address_register(target, register)?;
        for byte in data {
            self.send_byte(*byte)?;
        }
        self.framer.stop();
        self.transfer()?;
        Ok(())
    }

    /// Run one transaction; on failure put the bus back to idle before
    /// handing the error up.
    fn transaction<T>(&mut self, op: impl FnOnce(&mut Self) -> BusResult<T>) -> BusResult<T> {
        self.ensure_open()?;
        let result = op(self);
        if let Err(err) = &result {
            self.recover(err);
        }
        result
    }

    fn recover(&mut self, err: &BusError) {
        if let Err(e) = self.link.purge() {
            warn!("[bridge] {} purge failed during recovery: {}", self.label, e);
        }
        match err.cause() {
            // Target let go of SDA by itself; a plain STOP ends the frame
            Some(TransactionCause::NoAck) => self.framer.stop(),
            _ => self.framer.recover(),
        }
        if let Err(e) = self.transfer() {
            warn!("[bridge] {} could not release the bus: {}", self.label, e);
        }
    }
}

#[async_trait]
impl<L: MpsseLink> BusTransport for BridgeChip<L> {
    fn name(&self) -> &str {
        &self.label
    }

    async fn read_register(&mut self, target: u8, register: u8) -> BusResult<u16> {
        let data = self.transaction(|chip| chip.read_bytes(target, register, 2))?;
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    async fn write_register(&mut self, target: u8, register: u8, value: u16) -> BusResult<()> {
        self.transaction(|chip| chip.write_bytes(target, register, &value.to_le_bytes()))
    }

    async fn read_words(&mut self, target: u8, register: u8, count: usize) -> BusResult<Vec<u16>> {
        if count == 0 || count > MAX_WORDS {
            return Err(BusError::transaction(
                TransactionCause::UsbIo,
                format!("block read of {} words not supported", count),
            ));
        }
        let data = self.transaction(|chip| chip.read_bytes(target, register, count * 2))?;
        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn close(&mut self) -> BusResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.framer.idle();
        let released = self.transfer();
        self.link.close()?;
        debug!("[bridge] {} closed after {} transfers", self.label, self.transfers);
        released.map(|_| ())
    }
}

/// Open the USB bridge on channel `bus_number`
#[cfg(feature = "ftdi")]
pub fn open_usb(bus_number: u32, config: &BridgeConfig) -> BusResult<Box<dyn BusTransport>> {
    let link = link::FtdiLink::open(bus_number, config)?;
    Ok(Box::new(BridgeChip::open(link, config)?))
}

#[cfg(not(feature = "ftdi"))]
pub fn open_usb(bus_number: u32, _config: &BridgeConfig) -> BusResult<Box<dyn BusTransport>> {
    Err(BusError::unavailable(
        format!("ftdi/{}", bus_number),
        "built without the `ftdi` feature",
    ))
}

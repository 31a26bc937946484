//! In-process stand-in for a bridge chip wired to a fuel gauge.
//!
//! [`SimulatedLink`] interprets the MPSSE commands the bridge driver sends,
//! resolves the open-drain SCL/SDA levels, and feeds the resulting wire
//! events to a [`SimulatedGauge`] (an I2C target with a word register file)
//! and to a [`BusMonitor`] that records what appeared on the bus. It backs the
//! `simulated` interface for dry runs.

use crate::bus::bridge::link::{LinkError, MpsseLink};
use crate::bus::bridge::mpsse;
use crate::registers::{PRIMARY_TARGET, SECONDARY_TARGET};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

/// What a logic analyser would report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    Start,
    /// Data bit, in the order clocked
    Bit(bool),
    /// Ninth clock of a byte; `acked` when SDA was low
    AckSlot { acked: bool },
    Stop,
}

// Raw edges decoded from the line levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireEvent {
    Start,
    Stop,
    /// A full clock pulse, with the SDA level seen while SCL was high
    Clock(bool),
}

/// Records START/bit/ACK/STOP events while a frame is open
#[derive(Debug, Default)]
pub struct BusMonitor {
    events: Vec<BusEvent>,
    in_frame: bool,
    bit_index: u8,
}

impl BusMonitor {
    fn observe(&mut self, event: WireEvent) {
        match event {
            WireEvent::Start => {
                self.in_frame = true;
                self.bit_index = 0;
                self.events.push(BusEvent::Start);
            }
            WireEvent::Stop => {
                if self.in_frame {
                    self.events.push(BusEvent::Stop);
                }
                self.in_frame = false;
            }
            WireEvent::Clock(level) if self.in_frame => {
                if self.bit_index == 8 {
                    self.events.push(BusEvent::AckSlot { acked: !level });
                    self.bit_index = 0;
                } else {
                    self.events.push(BusEvent::Bit(level));
                    self.bit_index += 1;
                }
            }
            WireEvent::Clock(_) => {}
        }
    }

    pub fn events(&self) -> &[BusEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<BusEvent> {
        std::mem::take(&mut self.events)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetPhase {
    Idle,
    /// Shifting in an address or data byte
    Receiving { bits: u8, value: u8, address: bool },
    /// Holding SDA for our ACK, then either listen or talk
    Acking { then_transmit: bool },
    /// Shifting out `value`, `bits` already clocked
    Transmitting { bits: u8, value: u8 },
    /// Waiting for the controller's ACK/NACK
    AwaitingAck,
    /// Not addressed, or NACKed: sit out until the next START/STOP
    Ignoring,
}

/// I2C target answering on one or more 7-bit addresses with a 16-bit
/// little-endian register file and an auto-incrementing pointer
#[derive(Debug)]
pub struct SimulatedGauge {
    addresses: BTreeSet<u8>,
    registers: BTreeMap<(u8, u8), u16>,
    nack_registers: BTreeSet<(u8, u8)>,
    phase: TargetPhase,
    selected: u8,
    pointer: u8,
    pointer_set: bool,
    pending_low: Option<u8>,
    high_next: bool,
    sda_low: bool,
}

impl SimulatedGauge {
    pub fn new(addresses: &[u8]) -> Self {
        Self {
            addresses: addresses.iter().copied().collect(),
            registers: BTreeMap::new(),
            nack_registers: BTreeSet::new(),
            phase: TargetPhase::Idle,
            selected: 0,
            pointer: 0,
            pointer_set: false,
            pending_low: None,
            high_next: false,
            sda_low: false,
        }
    }

    /// A MAX1730x at rest: ~3.7 V cell, 75 % charge, 25 C
    pub fn max1730x() -> Self {
        let mut gauge = Self::new(&[PRIMARY_TARGET, SECONDARY_TARGET]);
        let seed: &[(u16, u16)] = &[
            (0x000, 0x0002), // Status
            (0x005, 0x0BB8), // RepCap
            (0x006, 0x4B00), // RepSOC
            (0x017, 0x0012), // Cycles
            (0x018, 0x0FA0), // DesignCap
            (0x01A, 0xB980), // VCell
            (0x01B, 0x1900), // Temp
            (0x01C, 0xFF38), // Current
            (0x021, 0x4061), // DevName
            (0x1B3, 0x0FA0), // nDesignCap
            (0x108, 0x0BA6), // sTemperature
            (0x109, 0x0E7E), // sPackVoltage
            (0x10D, 0x004B), // sRelSOC
        ];
        for (address, value) in seed {
            let target = if address & 0x100 != 0 {
                SECONDARY_TARGET
            } else {
                PRIMARY_TARGET
            };
            gauge.set(target, (address & 0xFF) as u8, *value);
        }
        gauge
    }

    pub fn set(&mut self, target: u8, register: u8, value: u16) {
        self.registers.insert((target, register), value);
    }

    pub fn get(&self, target: u8, register: u8) -> u16 {
        self.registers.get(&(target, register)).copied().unwrap_or(0)
    }

    /// Refuse the register pointer byte for this register
    pub fn nack_register(&mut self, target: u8, register: u8) {
        self.nack_registers.insert((target, register));
    }

    fn is_idle(&self) -> bool {
        matches!(self.phase, TargetPhase::Idle | TargetPhase::Ignoring) && !self.sda_low
    }

    fn next_read_byte(&mut self) -> u8 {
        let [low, high] = self.get(self.selected, self.pointer).to_le_bytes();
        if self.high_next {
            self.high_next = false;
            self.pointer = self.pointer.wrapping_add(1);
            high
        } else {
            self.high_next = true;
            low
        }
    }

    fn begin_transmit(&mut self) {
        let value = self.next_read_byte();
        self.sda_low = value & 0x80 == 0;
        self.phase = TargetPhase::Transmitting { bits: 0, value };
    }

    // Called at the end of each complete byte the controller wrote to us
    fn accept_byte(&mut self, value: u8, address: bool) -> Option<bool> {
        if address {
            if !self.addresses.contains(&(value >> 1)) {
                return None;
            }
            self.selected = value >> 1;
            self.pointer_set = false;
            self.high_next = false;
            self.pending_low = None;
            return Some(value & 1 == 1);
        }
        if !self.pointer_set {
            if self.nack_registers.contains(&(self.selected, value)) {
                return None;
            }
            self.pointer = value;
            self.pointer_set = true;
        } else if let Some(low) = self.pending_low.take() {
            self.set(self.selected, self.pointer, u16::from_le_bytes([low, value]));
            self.pointer = self.pointer.wrapping_add(1);
        } else {
            self.pending_low = Some(value);
        }
        Some(false)
    }

    fn on_wire(&mut self, event: WireEvent) {
        let level = match event {
            WireEvent::Start => {
                self.sda_low = false;
                self.phase = TargetPhase::Receiving { bits: 0, value: 0, address: true };
                return;
            }
            WireEvent::Stop => {
                self.sda_low = false;
                self.phase = TargetPhase::Idle;
                return;
            }
            WireEvent::Clock(level) => level,
        };

        let phase = self.phase;
        self.phase = match phase {
            TargetPhase::Receiving { bits, value, address } => {
                let value = (value << 1) | u8::from(level);
                if bits + 1 < 8 {
                    TargetPhase::Receiving { bits: bits + 1, value, address }
                } else {
                    match self.accept_byte(value, address) {
                        Some(transmit) => {
                            self.sda_low = true;
                            TargetPhase::Acking { then_transmit: transmit }
                        }
                        None => TargetPhase::Ignoring,
                    }
                }
            }
            TargetPhase::Acking { then_transmit } => {
                self.sda_low = false;
                if then_transmit {
                    self.begin_transmit();
                    self.phase
                } else {
                    TargetPhase::Receiving { bits: 0, value: 0, address: false }
                }
            }
            TargetPhase::Transmitting { bits, value } => {
                let bits = bits + 1;
                if bits < 8 {
                    self.sda_low = (value << bits) & 0x80 == 0;
                    TargetPhase::Transmitting { bits, value }
                } else {
                    self.sda_low = false;
                    TargetPhase::AwaitingAck
                }
            }
            TargetPhase::AwaitingAck => {
                if level {
                    TargetPhase::Ignoring
                } else {
                    self.begin_transmit();
                    self.phase
                }
            }
            phase @ (TargetPhase::Idle | TargetPhase::Ignoring) => phase,
        };
    }
}

/// MPSSE engine plus wiring: SCL on ADBUS0, SDA on ADBUS1 tied to ADBUS2
#[derive(Debug)]
pub struct SimulatedLink {
    gauge: SimulatedGauge,
    monitor: BusMonitor,
    input: Vec<u8>,
    responses: VecDeque<u8>,
    direction: u8,
    scl: bool,
    sda: bool,
    // SDA level seen at the last SCL rising edge, cleared by START/STOP
    latched: Option<bool>,
    divisor: Option<u16>,
    hold_clock: bool,
    fail_next_write: bool,
    mute: bool,
    closed: bool,
}

impl SimulatedLink {
    pub fn new(gauge: SimulatedGauge) -> Self {
        Self {
            gauge,
            monitor: BusMonitor::default(),
            input: Vec::new(),
            responses: VecDeque::new(),
            direction: 0,
            scl: true,
            sda: true,
            latched: None,
            divisor: None,
            hold_clock: false,
            fail_next_write: false,
            mute: false,
            closed: false,
        }
    }

    pub fn gauge(&self) -> &SimulatedGauge {
        &self.gauge
    }

    pub fn gauge_mut(&mut self) -> &mut SimulatedGauge {
        &mut self.gauge
    }

    pub fn monitor(&self) -> &BusMonitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut BusMonitor {
        &mut self.monitor
    }

    /// Clock divisor last programmed by the controller
    pub fn divisor(&self) -> Option<u16> {
        self.divisor
    }

    /// Both lines high and the target not mid-frame
    pub fn lines_idle(&self) -> bool {
        self.scl && self.sda && self.gauge.is_idle()
    }

    /// Target stretches the clock indefinitely while set
    pub fn hold_clock(&mut self, hold: bool) {
        self.hold_clock = hold;
        self.settle();
    }

    /// Make the next write fail as a USB error would
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    /// Swallow every response, like a chip that is not in MPSSE mode
    pub fn mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    fn respond(&mut self, bytes: &[u8]) {
        if !self.mute {
            self.responses.extend(bytes);
        }
    }

    fn resolve(&self) -> (bool, bool) {
        let scl = self.direction & mpsse::SCL == 0 && !self.hold_clock;
        let sda = self.direction & mpsse::SDA_OUT == 0 && !self.gauge.sda_low;
        (scl, sda)
    }

    fn dispatch(&mut self, event: WireEvent) {
        self.monitor.observe(event);
        self.gauge.on_wire(event);
    }

    /// Recompute line levels and emit whatever edges that produces
    fn settle(&mut self) {
        let (scl, sda) = self.resolve();
        let (old_scl, old_sda) = (self.scl, self.sda);
        self.scl = scl;
        self.sda = sda;

        if old_scl && scl && old_sda != sda {
            self.latched = None;
            self.dispatch(if sda { WireEvent::Stop } else { WireEvent::Start });
        } else if !old_scl && scl {
            self.latched = Some(sda);
        } else if old_scl && !scl {
            if let Some(level) = self.latched.take() {
                self.dispatch(WireEvent::Clock(level));
            }
        }
        // The target may have changed SDA in response; SCL is low then, so
        // this only updates the level.
        self.sda = self.resolve().1;
    }

    fn pins(&self) -> u8 {
        let mut pins = 0;
        if self.scl {
            pins |= mpsse::SCL;
        }
        if self.sda {
            pins |= mpsse::SDA_OUT | mpsse::SDA_IN;
        }
        pins
    }

    // Execute complete commands from the input buffer; keep a trailing
    // partial command for the next write.
    fn execute(&mut self) {
        let mut cursor = 0;
        while cursor < self.input.len() {
            let opcode = self.input[cursor];
            let needed = match opcode {
                mpsse::SET_BITS_LOW | mpsse::SET_CLOCK_DIVISOR => 3,
                _ => 1,
            };
            if cursor + needed > self.input.len() {
                break;
            }
            let args = [
                self.input.get(cursor + 1).copied().unwrap_or(0),
                self.input.get(cursor + 2).copied().unwrap_or(0),
            ];
            cursor += needed;

            match opcode {
                mpsse::SET_BITS_LOW => {
                    self.direction = args[1];
                    self.settle();
                }
                mpsse::GET_BITS_LOW => {
                    let pins = self.pins();
                    self.respond(&[pins]);
                }
                mpsse::SET_CLOCK_DIVISOR => {
                    self.divisor = Some(u16::from_le_bytes(args));
                }
                mpsse::SEND_IMMEDIATE
                | mpsse::DISABLE_CLK_DIV5
                | mpsse::DISABLE_3PHASE
                | mpsse::DISABLE_ADAPTIVE
                | mpsse::LOOPBACK_OFF => {}
                unknown => self.respond(&[mpsse::BAD_COMMAND, unknown]),
            }
        }
        self.input.drain(..cursor);
    }

    fn closed_error() -> LinkError {
        LinkError::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "simulated link is closed",
        ))
    }
}

impl MpsseLink for SimulatedLink {
    fn describe(&self) -> String {
        "simulated".to_string()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.closed {
            return Err(Self::closed_error());
        }
        if std::mem::take(&mut self.fail_next_write) {
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected USB fault",
            )));
        }
        self.input.extend_from_slice(bytes);
        self.execute();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<(), LinkError> {
        if self.closed {
            return Err(Self::closed_error());
        }
        if self.responses.len() < buf.len() {
            return Err(LinkError::Timeout {
                expected: buf.len(),
                received: self.responses.len(),
            });
        }
        for slot in buf.iter_mut() {
            *slot = self.responses.pop_front().unwrap_or(0);
        }
        Ok(())
    }

    fn purge(&mut self) -> Result<(), LinkError> {
        self.input.clear();
        self.responses.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), LinkError> {
        self.closed = true;
        Ok(())
    }
}

//! MPSSE opcodes and the command buffer used to drive the GPIO lines.

/// Set ADBUS value and direction: `[0x80, value, direction]`
pub const SET_BITS_LOW: u8 = 0x80;
/// Read ADBUS pin levels, returns one byte
pub const GET_BITS_LOW: u8 = 0x81;
pub const LOOPBACK_OFF: u8 = 0x85;
/// `[0x86, divisor_low, divisor_high]`
pub const SET_CLOCK_DIVISOR: u8 = 0x86;
/// Flush the chip's response buffer to the host now
pub const SEND_IMMEDIATE: u8 = 0x87;
pub const DISABLE_CLK_DIV5: u8 = 0x8A;
pub const DISABLE_3PHASE: u8 = 0x8D;
pub const DISABLE_ADAPTIVE: u8 = 0x97;
/// Prefix the chip echoes back before an unknown opcode
pub const BAD_COMMAND: u8 = 0xFA;
/// Deliberately invalid opcode used to synchronise with the chip
pub const SYNC_OPCODE: u8 = 0xAB;

/// ADBUS0
pub const SCL: u8 = 0x01;
/// ADBUS1, driven side of SDA
pub const SDA_OUT: u8 = 0x02;
/// ADBUS2, tied to ADBUS1 to read SDA back
pub const SDA_IN: u8 = 0x04;

/// Base clock with the divide-by-5 prescaler disabled
pub const BASE_CLOCK_HZ: u32 = 60_000_000;

/// Clock divisor for a target bus frequency, `None` when out of range
pub fn clock_divisor(clock_hz: u32) -> Option<u16> {
    let half_period = clock_hz.checked_mul(2).filter(|hz| *hz > 0)?;
    let divisor = (BASE_CLOCK_HZ / half_period).checked_sub(1)?;
    u16::try_from(divisor).ok()
}

/// Open-drain line state. The bridge never drives a line high.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Low,
    Released,
}

impl Line {
    pub fn from_bit(bit: bool) -> Self {
        if bit {
            Line::Released
        } else {
            Line::Low
        }
    }
}

/// Pending MPSSE commands for one USB transfer
#[derive(Debug, Default)]
pub struct CommandBuffer {
    bytes: Vec<u8>,
    samples: usize,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull lines low by making them outputs at level 0; release by making
    /// them inputs so the pull-ups win.
    pub fn drive(&mut self, scl: Line, sda: Line) {
        let mut direction = 0;
        if scl == Line::Low {
            direction |= SCL;
        }
        if sda == Line::Low {
            direction |= SDA_OUT;
        }
        self.bytes.extend_from_slice(&[SET_BITS_LOW, 0x00, direction]);
    }

    /// Queue a pin read; each one yields one response byte
    pub fn sample(&mut self) {
        self.bytes.push(GET_BITS_LOW);
        self.samples += 1;
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn expected_samples(&self) -> usize {
        self.samples
    }

    /// Finish the batch and hand back `(commands, response bytes expected)`
    pub fn take(&mut self) -> (Vec<u8>, usize) {
        if self.samples > 0 {
            self.bytes.push(SEND_IMMEDIATE);
        }
        let samples = std::mem::take(&mut self.samples);
        (std::mem::take(&mut self.bytes), samples)
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.samples = 0;
    }
}

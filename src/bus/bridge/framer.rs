//! I2C framing over bit-banged GPIO.
//!
//! The framer walks `Idle -> Start -> Shift(7..0) -> AckSlot -> ... -> Stop ->
//! Idle` and turns each step into MPSSE pin commands. It never touches the
//! link: the driver decides when a batch is flushed and interprets the
//! sampled pin bytes that come back.

use super::mpsse::{CommandBuffer, Line, SCL, SDA_IN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Start,
    /// Clocking the given bit, 7 (MSB) down to 0
    Shift(u8),
    AckSlot,
    Stop,
}

impl FramePhase {
    /// Legal transitions. `Stop` is reachable from anywhere so a broken
    /// transaction can always release the bus.
    pub fn can_enter(self, next: FramePhase) -> bool {
        use FramePhase::*;
        match (self, next) {
            (Idle, Start) | (AckSlot, Start) => true,
            (Start, Shift(7)) | (AckSlot, Shift(7)) => true,
            (Shift(bit), Shift(next_bit)) => bit > 0 && next_bit == bit - 1,
            (Shift(0), AckSlot) => true,
            (Stop, Idle) => true,
            (_, Stop) => true,
            _ => false,
        }
    }
}

/// Pin levels read back by one sample command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinSample {
    pub scl_high: bool,
    pub sda_high: bool,
}

impl PinSample {
    pub fn decode(byte: u8) -> Self {
        Self {
            scl_high: byte & SCL != 0,
            sda_high: byte & SDA_IN != 0,
        }
    }
}

/// Bit-level protocol state for one open bridge session
#[derive(Debug)]
pub struct I2cFramer {
    phase: FramePhase,
    scl: Line,
    sda: Line,
    hold: usize,
    commands: CommandBuffer,
}

impl I2cFramer {
    /// `hold` is how many times the START/STOP line states are repeated
    pub fn new(hold: usize) -> Self {
        Self {
            phase: FramePhase::Idle,
            scl: Line::Released,
            sda: Line::Released,
            hold: hold.max(1),
            commands: CommandBuffer::new(),
        }
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    fn enter(&mut self, next: FramePhase) {
        debug_assert!(
            self.phase.can_enter(next),
            "illegal frame transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    fn set(&mut self, scl: Line, sda: Line, repeats: usize) {
        // SCL and SDA never move in the same command
        debug_assert!(self.scl == scl || self.sda == sda);
        for _ in 0..repeats {
            self.commands.drive(scl, sda);
        }
        self.scl = scl;
        self.sda = sda;
    }

    /// Release both lines without framing anything (session setup)
    pub fn idle(&mut self) {
        self.set(self.scl, Line::Released, 1);
        self.set(Line::Released, Line::Released, 1);
        self.phase = FramePhase::Idle;
    }

    /// START, or repeated START when a frame is already open
    pub fn start(&mut self) {
        self.enter(FramePhase::Start);
        if self.scl == Line::Low {
            self.set(Line::Low, Line::Released, 1);
        }
        self.set(Line::Released, Line::Released, self.hold);
        self.set(Line::Released, Line::Low, self.hold);
        self.set(Line::Low, Line::Low, 1);
    }

    /// Shift out one byte MSB first, then sample the target's ACK
    pub fn write_byte(&mut self, byte: u8) {
        for bit in (0..8u8).rev() {
            self.enter(FramePhase::Shift(bit));
            let level = Line::from_bit((byte >> bit) & 1 == 1);
            self.set(Line::Low, level, 1);
            self.set(Line::Released, level, 1);
            self.set(Line::Low, level, 1);
        }
        self.enter(FramePhase::AckSlot);
        self.set(Line::Low, Line::Released, 1);
        self.set(Line::Released, Line::Released, 1);
        self.commands.sample();
        self.set(Line::Low, Line::Released, 1);
    }

    /// Clock in one byte (eight samples), then ACK it or NACK it
    pub fn read_byte(&mut self, ack: bool) {
        for bit in (0..8u8).rev() {
            self.enter(FramePhase::Shift(bit));
            self.set(Line::Low, Line::Released, 1);
            self.set(Line::Released, Line::Released, 1);
            self.commands.sample();
            self.set(Line::Low, Line::Released, 1);
        }
        self.enter(FramePhase::AckSlot);
        let level = if ack { Line::Low } else { Line::Released };
        self.set(Line::Low, level, 1);
        self.set(Line::Released, level, 1);
        self.set(Line::Low, level, 1);
        self.set(Line::Low, Line::Released, 1);
    }

    /// STOP: SDA rises while SCL is high
    pub fn stop(&mut self) {
        self.enter(FramePhase::Stop);
        if self.scl == Line::Released {
            self.set(Line::Low, self.sda, 1);
        }
        self.set(Line::Low, Line::Low, 1);
        self.set(Line::Released, Line::Low, self.hold);
        self.set(Line::Released, Line::Released, self.hold);
        self.enter(FramePhase::Idle);
    }

    /// Bus clear: nine clocks with SDA released, then STOP. Frees a target
    /// that was left mid-byte holding SDA low.
    pub fn recover(&mut self) {
        self.commands.clear();
        self.set(Line::Low, self.sda, 1);
        self.set(Line::Low, Line::Released, 1);
        for _ in 0..9 {
            self.set(Line::Released, Line::Released, 1);
            self.set(Line::Low, Line::Released, 1);
        }
        self.phase = FramePhase::Stop;
        self.set(Line::Low, Line::Low, 1);
        self.set(Line::Released, Line::Low, self.hold);
        self.set(Line::Released, Line::Released, self.hold);
        self.phase = FramePhase::Idle;
    }

    pub fn has_pending(&self) -> bool {
        !self.commands.is_empty()
    }

    pub fn expected_samples(&self) -> usize {
        self.commands.expected_samples()
    }

    /// Take the pending commands as one transfer
    pub fn take_batch(&mut self) -> (Vec<u8>, usize) {
        self.commands.take()
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.commands.raw(bytes);
    }

    /// Forget everything, as on a fresh open
    pub fn reset(&mut self) {
        self.commands.clear();
        self.phase = FramePhase::Idle;
        self.scl = Line::Released;
        self.sda = Line::Released;
    }
}

#[cfg(test)]
mod tests {
    use super::super::mpsse::{GET_BITS_LOW, SEND_IMMEDIATE, SET_BITS_LOW};
    use super::*;

    #[test]
    fn shift_counts_down_to_ack() {
        use FramePhase::*;
        assert!(Idle.can_enter(Start));
        assert!(Start.can_enter(Shift(7)));
        assert!(Shift(7).can_enter(Shift(6)));
        assert!(!Shift(6).can_enter(Shift(4)));
        assert!(Shift(0).can_enter(AckSlot));
        assert!(!Shift(1).can_enter(AckSlot));
        assert!(AckSlot.can_enter(Start));
        assert!(Shift(3).can_enter(Stop));
        assert!(!Idle.can_enter(Shift(7)));
        assert!(!Stop.can_enter(Start));
    }

    #[test]
    fn write_byte_batches_one_ack_sample() {
        let mut framer = I2cFramer::new(1);
        assert!(!framer.has_pending());
        framer.start();
        framer.write_byte(0x6C);
        assert_eq!(framer.phase(), FramePhase::AckSlot);
        assert!(framer.has_pending());

        let (bytes, samples) = framer.take_batch();
        assert!(!framer.has_pending());
        assert_eq!(samples, 1);
        assert_eq!(bytes.last(), Some(&SEND_IMMEDIATE));
        assert_eq!(bytes.iter().filter(|b| **b == GET_BITS_LOW).count(), 1);
        // start: 3 states, 8 bits x 3 states, ack slot: 3 states
        assert_eq!(bytes.iter().filter(|b| **b == SET_BITS_LOW).count(), 3 + 24 + 3);
    }

    #[test]
    fn read_byte_samples_every_bit() {
        let mut framer = I2cFramer::new(1);
        framer.start();
        framer.write_byte(0x6D);
        framer.take_batch();
        framer.read_byte(false);
        assert_eq!(framer.expected_samples(), 8);
        framer.stop();
        assert_eq!(framer.phase(), FramePhase::Idle);
    }

    #[test]
    fn pin_sample_decodes_scl_and_sda_in() {
        assert_eq!(
            PinSample::decode(SCL | SDA_IN),
            PinSample { scl_high: true, sda_high: true }
        );
        assert_eq!(
            PinSample::decode(SCL),
            PinSample { scl_high: true, sda_high: false }
        );
    }
}

//! What to do when a register read fails.

use crate::config::SamplingConfig;
use crate::errors::BusError;

/// Value logged for a register that could not be read
pub const SENTINEL: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Log the sentinel and keep sampling
    Continue,
    /// Stop at the first read that still fails after its retries
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Retry,
    SkipRegister,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultPolicy {
    pub mode: FaultMode,
    /// Extra attempts per read
    pub retries: u32,
}

impl FaultPolicy {
    pub fn new(mode: FaultMode, retries: u32) -> Self {
        Self { mode, retries }
    }

    pub fn from_config(config: &SamplingConfig) -> Self {
        let mode = if config.exit_on_bus_error {
            FaultMode::Strict
        } else {
            FaultMode::Continue
        };
        Self::new(mode, config.retries)
    }

    /// Decide on a failure. `attempt` counts from 0 for the first try.
    pub fn handle(&self, error: &BusError, attempt: u32) -> FaultAction {
        match error {
            BusError::BusUnavailable { .. } => FaultAction::Abort,
            BusError::Transaction { .. } if attempt < self.retries => FaultAction::Retry,
            BusError::Transaction { .. } => match self.mode {
                FaultMode::Continue => FaultAction::SkipRegister,
                FaultMode::Strict => FaultAction::Abort,
            },
        }
    }
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self::new(FaultMode::Continue, 0)
    }
}

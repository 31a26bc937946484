use std::fmt;
use thiserror::Error;

/// What went wrong inside a single bus transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionCause {
    /// Target left SDA high during an ACK slot (or the controller reported a NACK)
    NoAck,
    /// No response within the transfer window, or the clock was held low too long
    Timeout,
    /// USB transfer to or from the bridge chip failed
    UsbIo,
    /// Native controller reported an I/O error (clock-stretch violation, arbitration loss)
    BusIo,
}

impl fmt::Display for TransactionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            TransactionCause::NoAck => "no-ack",
            TransactionCause::Timeout => "timeout",
            TransactionCause::UsbIo => "usb-io",
            TransactionCause::BusIo => "bus-io",
        };
        f.write_str(tag)
    }
}

/// Errors surfaced by a bus transport. Platform errors never escape raw.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus '{bus}' unavailable: {reason}")]
    BusUnavailable { bus: String, reason: String },

    #[error("Bus transaction failed ({cause}): {detail}")]
    Transaction {
        cause: TransactionCause,
        detail: String,
    },
}

impl BusError {
    pub fn unavailable(bus: impl Into<String>, reason: impl fmt::Display) -> Self {
        BusError::BusUnavailable {
            bus: bus.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transaction(cause: TransactionCause, detail: impl Into<String>) -> Self {
        BusError::Transaction {
            cause,
            detail: detail.into(),
        }
    }

    /// Cause tag for transaction errors, `None` for open failures
    pub fn cause(&self) -> Option<TransactionCause> {
        match self {
            BusError::Transaction { cause, .. } => Some(*cause),
            BusError::BusUnavailable { .. } => None,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from '{path}': {source}")]
    LoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration format: {0}")]
    FormatError(#[from] toml::de::Error),

    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unsupported device family: '{family}'")]
    UnsupportedDevice { family: String },
}

/// Output sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to create output file '{path}': {source}")]
    CreateError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV write failed: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Output flush failed: {0}")]
    FlushError(#[from] std::io::Error),

    #[error("Row has {actual} values, header has {expected} columns")]
    RowWidth { expected: usize, actual: usize },
}

/// Top-level errors for the logger application
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Output error: {0}")]
    Sink(#[from] SinkError),

    #[error("Failed to communicate with device at 0x{target:02x}: {source}")]
    ProbeFailed {
        target: u8,
        #[source]
        source: BusError,
    },
}

/// Result type aliases for convenience
pub type BusResult<T> = Result<T, BusError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type SinkResult<T> = Result<T, SinkError>;
pub type LoggerResult<T> = Result<T, LoggerError>;

use num_enum::IntoPrimitive;
use strum_macros::Display;
use thiserror::Error;

use crate::p25::OperationStatus;

/// Self-test failure codes, matching the adapter status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive)]
#[repr(u8)]
pub enum LineFault {
    #[strum(to_string = "DATA stuck low")]
    DataStuckLow = 0x01,
    #[strum(to_string = "SENSE stuck low")]
    SenseStuckLow = 0x02,
    #[strum(to_string = "DATA stuck high")]
    DataStuckHigh = 0x03,
    #[strum(to_string = "SENSE stuck high")]
    SenseStuckHigh = 0x04,
}

/// The primary error type for the protocol core.
///
/// Every failure a public operation can hit maps onto exactly one of
/// these variants; nothing is swallowed internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KfdError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("line fault: {0}")]
    LineFault(LineFault),

    #[error("no READY response from radio after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },

    #[error("radio did not respond within {timeout_ms} ms")]
    ProtocolTimeout { timeout_ms: u64 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("radio rejected command: {status}")]
    NegativeAck { status: OperationStatus },

    #[error("key {index} rejected: {status}")]
    KeyRejected { index: usize, status: OperationStatus },

    #[error("aborted by user")]
    Aborted,
}

impl KfdError {
    /// TIA status code carried by the error, where one applies.
    pub fn status(&self) -> Option<OperationStatus> {
        match self {
            KfdError::NegativeAck { status } | KfdError::KeyRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

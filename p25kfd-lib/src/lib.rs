//! P25 manual rekeying core.
//!
//! Implements the TIA-102.AACD-A three-wire interface (TWI/3WI) that a
//! Key Fill Device uses to load, erase, and inventory encryption keys
//! in land-mobile radios: a bit-banged physical layer on two GPIO
//! lines, byte framing with reversed bits and parity, the KMM envelope
//! with its un-complemented CRC-16, and the session state machine that
//! drives keyload operations end to end.
//!
//! The stack is generic over a [`hal::Platform`], so the same code runs
//! against real pins or the simulated wire in [`sim`].

pub mod config;
pub mod container;
pub mod crc;
pub mod error;
pub mod framer;
pub mod hal;
pub mod line;
pub mod link;
pub mod messages;
pub mod p25;
pub mod protocol;
pub mod sim;

pub use config::{StopBits, TwiConfig};
pub use error::{KfdError, LineFault};
pub use link::{PeerKind, SessionState};
pub use p25::{AlgorithmId, InventoryType, KeyItem, KeyStatus, MessageId, OperationStatus};
pub use protocol::{AbortHandle, KfdProtocol, OpResult, Progress};

#[cfg(test)]
mod tests;

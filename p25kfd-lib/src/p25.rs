//! TIA-102.AACD-A protocol definitions: algorithm identifiers, KMM
//! message identifiers, operation status codes, three-wire opcodes, and
//! the key item carried by keyload operations.

use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use strum_macros::Display;

use crate::error::KfdError;

/// First SLN of the Key Encryption Key range; everything below is TEK.
pub const KEK_SLN_START: u16 = 0xF000;

/// Broadcast RSI used for all three-wire sessions.
pub const BROADCAST_RSI: [u8; 3] = [0xFF, 0xFF, 0xFF];

/// Three-wire link opcodes (TIA-102.AACD-A).
pub mod opcode {
    /// KFD -> MR: ready request, sent right after the key signature.
    pub const READY_REQ: u8 = 0xC0;
    /// Bidirectional: transfer done.
    pub const TRANSFER_DONE: u8 = 0xC1;
    /// A KMM envelope follows.
    pub const KMM: u8 = 0xC2;
    /// MR -> KFD: ready, general mode (mobile radio).
    pub const READY_MR: u8 = 0xD0;
    /// MR -> KFD: ready, general mode (KVL).
    pub const READY_KVL: u8 = 0xD1;
    /// KFD -> MR: disconnect.
    pub const DISCONNECT: u8 = 0x92;
    /// MR -> KFD: disconnect acknowledge.
    pub const DISCONNECT_ACK: u8 = 0x90;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum AlgorithmId {
    #[strum(to_string = "CLEAR")]
    Clear = 0x80,
    #[strum(to_string = "DES-OFB")]
    DesOfb = 0x81,
    #[strum(to_string = "2-KEY 3DES")]
    TdesTwoKey = 0x82,
    #[strum(to_string = "3-KEY 3DES")]
    TdesThreeKey = 0x83,
    #[strum(to_string = "AES-256")]
    Aes256 = 0x84,
    #[strum(to_string = "AES-128")]
    Aes128 = 0x85,
    #[strum(to_string = "AES-CBC")]
    AesCbc = 0x86,
    #[strum(to_string = "ADP")]
    Adp = 0xAA,
    #[num_enum(catch_all)]
    #[strum(to_string = "UNKNOWN")]
    Unknown(u8),
}

impl AlgorithmId {
    /// Expected key material length in bytes; `None` for unrecognized ids.
    pub fn key_length(self) -> Option<usize> {
        match self {
            AlgorithmId::Clear => Some(0),
            AlgorithmId::DesOfb => Some(8),
            AlgorithmId::TdesTwoKey => Some(16),
            AlgorithmId::TdesThreeKey => Some(24),
            AlgorithmId::Aes256 => Some(32),
            AlgorithmId::Aes128 => Some(16),
            AlgorithmId::AesCbc => Some(32),
            AlgorithmId::Adp => Some(5),
            AlgorithmId::Unknown(_) => None,
        }
    }
}

/// KMM message identifiers used over the three-wire interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum MessageId {
    InventoryCommand = 0x00,
    InventoryResponse = 0x01,
    ModifyKeyCommand = 0x04,
    RekeyAcknowledgment = 0x07,
    NegativeAcknowledgment = 0x08,
    ZeroizeCommand = 0x0A,
    ChangeoverCommand = 0x0D,
    ChangeRsiCommand = 0x0E,
    ZeroizeResponse = 0x0F,
    ChangeoverResponse = 0x11,
    ChangeRsiResponse = 0x12,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Inventory sub-command selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum InventoryType {
    Null = 0x00,
    SendCurrentDateTime = 0x01,
    ListActiveKsetIds = 0x02,
    ListInactiveKsetIds = 0x03,
    ListActiveKeyIds = 0x04,
    ListInactiveKeyIds = 0x05,
    ListAllKsetTagging = 0x06,
    ListAllUniqueKeyInfo = 0x07,
    ListActiveKeys = 0xFD,
    ListMnp = 0xFE,
    ListKmfRsi = 0xFF,
}

/// Operation status codes (TIA-102.AACD-A table 7.4), surfaced verbatim
/// from RekeyAck per-key entries and NegativeAck bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum OperationStatus {
    #[strum(to_string = "command performed")]
    CommandPerformed = 0x00,
    #[strum(to_string = "key not loaded")]
    KeyNotLoaded = 0x01,
    #[strum(to_string = "key overwritten")]
    KeyOverwritten = 0x02,
    #[strum(to_string = "key storage full")]
    KeyStorageFull = 0x03,
    #[strum(to_string = "key previously erased")]
    KeyPreviouslyErased = 0x04,
    #[strum(to_string = "invalid message id")]
    InvalidMessageId = 0x05,
    #[strum(to_string = "invalid MAC")]
    InvalidMac = 0x06,
    #[strum(to_string = "invalid crypto header")]
    InvalidCryptoHeader = 0x07,
    #[strum(to_string = "invalid key id")]
    InvalidKeyId = 0x08,
    #[strum(to_string = "invalid algorithm id")]
    InvalidAlgorithmId = 0x09,
    #[strum(to_string = "invalid message number")]
    InvalidMessageNumber = 0x0A,
    #[strum(to_string = "invalid key length")]
    InvalidKeyLength = 0x0B,
    #[strum(to_string = "invalid keyset id")]
    InvalidKeysetId = 0x0C,
    #[strum(to_string = "unsupported feature")]
    UnsupportedFeature = 0x0D,
    #[strum(to_string = "keyset not found")]
    KeysetNotFound = 0x0E,
    #[strum(to_string = "algorithm not supported")]
    AlgorithmNotSupported = 0x0F,
    #[strum(to_string = "key not found")]
    KeyNotFound = 0x10,
    #[strum(to_string = "internal error")]
    InternalError = 0xFF,
    #[num_enum(catch_all)]
    #[strum(to_string = "unknown status")]
    Unknown(u8) = 0x11,
}

/// One key as loaded into (or erased from) a radio slot.
///
/// The KEK/TEK distinction is carried entirely by the SLN range; there
/// is no separate flag to get out of sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyItem {
    pub keyset_id: u8,
    pub sln: u16,
    pub key_id: u16,
    pub algorithm_id: AlgorithmId,
    pub material: Vec<u8>,
    pub erase: bool,
}

impl KeyItem {
    /// A key to load. Fails if the material length does not match the
    /// algorithm's expected length or the keyset id is out of range.
    pub fn new(
        keyset_id: u8,
        sln: u16,
        key_id: u16,
        algorithm_id: AlgorithmId,
        material: Vec<u8>,
    ) -> Result<Self, KfdError> {
        let item = Self { keyset_id, sln, key_id, algorithm_id, material, erase: false };
        item.validate()?;
        Ok(item)
    }

    /// An erase request for a slot. No key material travels; the radio
    /// clears the SLN.
    pub fn erase(keyset_id: u8, sln: u16) -> Self {
        Self {
            keyset_id,
            sln,
            key_id: 0,
            algorithm_id: AlgorithmId::Clear,
            material: Vec::new(),
            erase: true,
        }
    }

    pub fn is_kek(&self) -> bool {
        self.sln >= KEK_SLN_START
    }

    pub fn validate(&self) -> Result<(), KfdError> {
        if self.keyset_id == 0 {
            return Err(KfdError::Config("keyset id must be 1-255".into()));
        }
        if self.erase {
            if !self.material.is_empty() {
                return Err(KfdError::Config("erase request must carry no key material".into()));
            }
            return Ok(());
        }
        match self.algorithm_id.key_length() {
            Some(expected) if expected == self.material.len() => Ok(()),
            Some(expected) => Err(KfdError::Config(format!(
                "{} expects {} key bytes, got {}",
                self.algorithm_id,
                expected,
                self.material.len()
            ))),
            None => Err(KfdError::Config(format!(
                "unrecognized algorithm id 0x{:02X}",
                u8::from(self.algorithm_id)
            ))),
        }
    }
}

/// Per-key status entry from a RekeyAck body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStatus {
    pub key_id: u16,
    pub algorithm_id: AlgorithmId,
    pub status: OperationStatus,
}

//! KMM command body builders and response body parsers.
//!
//! Builders produce the body that goes inside the inner KMM frame; the
//! session link adds the frame header and envelope. Parsers take the
//! inner frame the link hands back.

use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use zerocopy::byteorder::big_endian::U16;
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::error::KfdError;
use crate::p25::{AlgorithmId, InventoryType, KeyItem, KeyStatus, MessageId, OperationStatus};

/// Key format octet of a ModifyKeyCommand key entry.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyFormat {
    #[skip]
    __: B5,
    pub erase: bool,
    #[skip]
    __: B1,
    pub kek: bool,
}

/// A parsed inner KMM frame.
#[derive(Debug, Clone, PartialEq)]
pub struct KmmMessage {
    pub message_id: MessageId,
    pub body: Bytes,
}

impl KmmMessage {
    /// Split an inner frame (as returned by the session link) into
    /// message id and body. The header is ten bytes: id, length(2,BE),
    /// format, destination RSI(3), source RSI(3); length counts the
    /// format octet, both RSIs, and the body.
    pub fn parse(kmm: Bytes) -> Result<Self, KfdError> {
        if kmm.len() < 10 {
            return Err(KfdError::ProtocolViolation(format!(
                "short KMM frame ({} bytes)",
                kmm.len()
            )));
        }
        let message_id = MessageId::from(kmm[0]);
        let message_length = usize::from(u16::from_be_bytes([kmm[1], kmm[2]]));
        let body_len = message_length
            .checked_sub(7)
            .ok_or_else(|| KfdError::ProtocolViolation(format!(
                "bad KMM message length {message_length}"
            )))?;
        if 10 + body_len > kmm.len() {
            return Err(KfdError::ProtocolViolation(format!(
                "KMM message length {message_length} exceeds frame ({} bytes)",
                kmm.len()
            )));
        }
        let body = kmm.slice(10..10 + body_len);
        Ok(Self { message_id, body })
    }
}

/// Build a ModifyKeyCommand body. All keys in one command must share
/// keyset, algorithm, and key length; the radio receives those once in
/// the header. Erase entries travel as `key_length` zero bytes.
pub fn modify_key_command(keys: &[KeyItem]) -> Result<Bytes, KfdError> {
    let first = keys
        .first()
        .ok_or_else(|| KfdError::Config("no keys in ModifyKeyCommand".into()))?;
    let key_length = keys
        .iter()
        .find(|key| !key.erase)
        .map(|key| key.material.len())
        .unwrap_or(0);
    for key in keys {
        key.validate()?;
        if key.keyset_id != first.keyset_id || key.algorithm_id != first.algorithm_id {
            return Err(KfdError::Config(
                "keys in one ModifyKeyCommand must share keyset and algorithm".into(),
            ));
        }
        if !key.erase && key.material.len() != key_length {
            return Err(KfdError::Config(
                "keys in one ModifyKeyCommand must share key length".into(),
            ));
        }
    }

    let mut body = BytesMut::with_capacity(9 + keys.len() * (5 + key_length));
    body.put_u8(0x00); // decryption instruction format
    body.put_u8(0x00); // extended decryption instruction format
    body.put_u8(AlgorithmId::Clear.into()); // KEK algorithm: keys travel unwrapped
    body.put_u16(0x0000); // KEK key id
    body.put_u8(first.keyset_id);
    body.put_u8(first.algorithm_id.into());
    body.put_u8(key_length as u8);
    body.put_u8(keys.len() as u8);
    for key in keys {
        let format = KeyFormat::new().with_erase(key.erase).with_kek(key.is_kek());
        body.put_u8(format.into_bytes()[0]);
        body.put_u16(key.sln);
        body.put_u16(key.key_id);
        if key.erase {
            body.put_bytes(0x00, key_length);
        } else {
            body.put_slice(&key.material);
        }
    }
    Ok(body.freeze())
}

/// ZeroizeCommand body: the single zeroize instruction octet.
pub fn zeroize_command() -> Bytes {
    Bytes::from_static(&[0x0A])
}

/// InventoryCommand body: the inventory type selector.
pub fn inventory_command(inventory_type: InventoryType) -> Bytes {
    Bytes::copy_from_slice(&[inventory_type.into()])
}

/// ChangeoverCommand body: superseded and activated keyset ids.
pub fn changeover_command(superseded: u8, activated: u8) -> Bytes {
    Bytes::copy_from_slice(&[superseded, activated])
}

/// ChangeRsiCommand body: 24-bit RSI and message number.
pub fn change_rsi_command(rsi: u32, message_number: u16) -> Bytes {
    let mut body = BytesMut::with_capacity(5);
    body.put_u8((rsi >> 16) as u8);
    body.put_u8((rsi >> 8) as u8);
    body.put_u8(rsi as u8);
    body.put_u16(message_number);
    body.freeze()
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct KeyStatusRaw {
    key_id: U16,
    algorithm_id: u8,
    status: u8,
}

/// Per-key status triples from a RekeyAck body. Radios that ack without
/// detail produce an empty list.
pub fn parse_rekey_ack(body: &[u8]) -> Vec<KeyStatus> {
    body.chunks_exact(4)
        .filter_map(|chunk| KeyStatusRaw::ref_from_bytes(chunk).ok())
        .map(|raw| KeyStatus {
            key_id: raw.key_id.get(),
            algorithm_id: AlgorithmId::from(raw.algorithm_id),
            status: OperationStatus::from(raw.status),
        })
        .collect()
}

/// NegativeAck body: acknowledged message id, then the status code.
pub fn parse_negative_ack(body: &[u8]) -> (MessageId, OperationStatus) {
    match *body {
        [acked, status, ..] => (MessageId::from(acked), OperationStatus::from(status)),
        [status] => (MessageId::Unknown(0), OperationStatus::from(status)),
        [] => (MessageId::Unknown(0), OperationStatus::InternalError),
    }
}

/// InventoryResponse body: the echoed inventory type, then the listing.
pub fn parse_inventory_response(
    body: &[u8],
    expected: InventoryType,
) -> Result<Vec<u8>, KfdError> {
    match body.first() {
        Some(&echo) if echo == u8::from(expected) => Ok(body[1..].to_vec()),
        Some(&echo) => Err(KfdError::ProtocolViolation(format!(
            "inventory response type 0x{echo:02X} does not match request 0x{:02X}",
            u8::from(expected)
        ))),
        None => Err(KfdError::ProtocolViolation("empty inventory response".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aes256_test_key() -> KeyItem {
        KeyItem::new(1, 0x00CA, 0x00CA, AlgorithmId::Aes256, (0x11..=0x30).collect()).unwrap()
    }

    #[test]
    fn modify_key_body_for_one_aes256_key() {
        let body = modify_key_command(&[aes256_test_key()]).unwrap();
        assert_eq!(body.len(), 48);
        assert_eq!(
            &body[..14],
            &[0x00, 0x00, 0x80, 0x00, 0x00, 0x01, 0x84, 0x20, 0x01, 0x00, 0x00, 0xCA, 0x00, 0xCA]
        );
        assert_eq!(&body[14..], (0x11..=0x30u8).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn kek_bit_follows_sln_range() {
        for sln in [0x0000u16, 0x1234, 0xEFFF] {
            let key = KeyItem::new(1, sln, 1, AlgorithmId::Adp, vec![0; 5]).unwrap();
            let body = modify_key_command(std::slice::from_ref(&key)).unwrap();
            assert_eq!(body[9] & 0x80, 0, "sln 0x{sln:04X}");
        }
        for sln in [0xF000u16, 0xFFFF] {
            let key = KeyItem::new(1, sln, 1, AlgorithmId::Adp, vec![0; 5]).unwrap();
            let body = modify_key_command(std::slice::from_ref(&key)).unwrap();
            assert_ne!(body[9] & 0x80, 0, "sln 0x{sln:04X}");
        }
    }

    #[test]
    fn erase_entry_sets_bit5_and_zero_fills() {
        let body = modify_key_command(&[KeyItem::erase(1, 0x00CA)]).unwrap();
        // header(9) + format + sln(2) + key id(2), key_length 0
        assert_eq!(body.len(), 14);
        assert_eq!(body[7], 0x00); // key length
        assert_eq!(body[9], 0x20); // erase bit
        assert_eq!(&body[10..12], &[0x00, 0xCA]);

        // Grouped with a real key, the erase entry pads to the group length.
        let keys = [
            KeyItem::new(1, 1, 1, AlgorithmId::Adp, vec![0xAA; 5]).unwrap(),
            KeyItem { algorithm_id: AlgorithmId::Adp, ..KeyItem::erase(1, 2) },
        ];
        let body = modify_key_command(&keys).unwrap();
        assert_eq!(body[7], 5);
        assert_eq!(body[8], 2);
        assert_eq!(&body[body.len() - 5..], &[0x00; 5]);
    }

    #[test]
    fn multi_key_commands_must_share_fields() {
        let a = KeyItem::new(1, 1, 1, AlgorithmId::Aes256, vec![0; 32]).unwrap();
        let b = KeyItem::new(2, 2, 2, AlgorithmId::Aes256, vec![0; 32]).unwrap();
        assert!(modify_key_command(&[a.clone(), b]).is_err());
        let c = KeyItem::new(1, 3, 3, AlgorithmId::Aes128, vec![0; 16]).unwrap();
        assert!(modify_key_command(&[a, c]).is_err());
        assert!(modify_key_command(&[]).is_err());
    }

    #[test]
    fn rekey_ack_triples_parse() {
        let statuses = parse_rekey_ack(&[0x00, 0xCA, 0x84, 0x00, 0x01, 0x02, 0x84, 0x02]);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].key_id, 0x00CA);
        assert_eq!(statuses[0].algorithm_id, AlgorithmId::Aes256);
        assert_eq!(statuses[0].status, OperationStatus::CommandPerformed);
        assert_eq!(statuses[1].key_id, 0x0102);
        assert_eq!(statuses[1].status, OperationStatus::KeyOverwritten);
        assert!(parse_rekey_ack(&[]).is_empty());
    }

    #[test]
    fn negative_ack_surfaces_status_verbatim() {
        let (acked, status) = parse_negative_ack(&[0x04, 0x0B]);
        assert_eq!(acked, MessageId::ModifyKeyCommand);
        assert_eq!(status, OperationStatus::InvalidKeyLength);
        let (_, status) = parse_negative_ack(&[0x04, 0x77]);
        assert_eq!(status, OperationStatus::Unknown(0x77));
    }

    #[test]
    fn changeover_and_change_rsi_bodies() {
        assert_eq!(&changeover_command(1, 2)[..], &[0x01, 0x02]);
        assert_eq!(
            &change_rsi_command(0x123456, 0x0001)[..],
            &[0x12, 0x34, 0x56, 0x00, 0x01]
        );
    }

    #[test]
    fn inventory_response_checks_echoed_type() {
        let data =
            parse_inventory_response(&[0x02, 0x00, 0x01, 0x01], InventoryType::ListActiveKsetIds)
                .unwrap();
        assert_eq!(data, vec![0x00, 0x01, 0x01]);
        assert!(
            parse_inventory_response(&[0x03], InventoryType::ListActiveKsetIds).is_err()
        );
    }

    #[test]
    fn kmm_message_split() {
        let kmm = Bytes::copy_from_slice(&[
            0x07, 0x00, 0x0B, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0xCA, 0x84, 0x00,
        ]);
        let msg = KmmMessage::parse(kmm).unwrap();
        assert_eq!(msg.message_id, MessageId::RekeyAcknowledgment);
        assert_eq!(&msg.body[..], &[0x00, 0xCA, 0x84, 0x00]);

        assert!(KmmMessage::parse(Bytes::copy_from_slice(&[0x07, 0x00])).is_err());
        // Length field shorter than the fixed header tail.
        let bad = Bytes::copy_from_slice(&[0x07, 0x00, 0x03, 0, 0, 0, 0, 0, 0, 0]);
        assert!(KmmMessage::parse(bad).is_err());
    }
}

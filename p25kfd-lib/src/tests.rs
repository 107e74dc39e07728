//! End-to-end tests: the full stack against the simulated radio.

use crate::config::{StopBits, TwiConfig};
use crate::framer::ByteFramer;
use crate::link::{build_kmm_frame, PeerKind, ResponseKind, SessionState};
use crate::p25::{opcode, AlgorithmId, InventoryType, KeyItem, MessageId, OperationStatus};
use crate::protocol::KfdProtocol;
use crate::sim::{Reply, SimPlatform, SimRadio};

fn protocol_with(radio: SimRadio) -> KfdProtocol<SimPlatform> {
    KfdProtocol::new(SimPlatform::new(radio), TwiConfig::default()).unwrap()
}

fn aes256_key() -> KeyItem {
    KeyItem::new(1, 0x00CA, 0x00CA, AlgorithmId::Aes256, (0x11..=0x30).collect()).unwrap()
}

fn adp_key(sln: u16, key_id: u16) -> KeyItem {
    KeyItem::new(1, sln, key_id, AlgorithmId::Adp, vec![0x01, 0x02, 0x03, 0x04, 0x05]).unwrap()
}

/// Line level at time `t`, reconstructed from the KFD transition log.
fn level_at(log: &[(u64, bool)], t: u64) -> bool {
    let mut low = false;
    for &(ts, is_low) in log {
        if ts <= t {
            low = is_low;
        } else {
            break;
        }
    }
    !low
}

#[test]
fn bit_reversal_is_an_involution() {
    for byte in 0..=255u8 {
        assert_eq!(byte.reverse_bits().reverse_bits(), byte);
    }
}

#[test]
fn transmit_frame_cell_layout() {
    for stop_bits in [StopBits::Busy, StopBits::Idle] {
        for byte in [0x00u8, 0x01, 0x80, 0xA5, 0xC0, 0xFF] {
            let config = TwiConfig { stop_bits, ..TwiConfig::default() };
            let mut framer = ByteFramer::new(SimPlatform::new(SimRadio::default()), &config);
            framer.send_byte(byte);

            let log = framer.platform().tx_transitions().to_vec();
            let t0 = log.iter().find(|&&(_, low)| low).expect("no start cell").0;
            let bit = u64::from(config.tx_bit_us());
            let cell = |k: u64| level_at(&log, t0 + k * bit + bit / 2);

            assert!(!cell(0), "start cell must be low");
            let reversed = byte.reverse_bits();
            for j in 0..8u64 {
                assert_eq!(
                    cell(1 + j),
                    reversed & (1 << j) != 0,
                    "data cell {j} of 0x{byte:02X}"
                );
            }
            let highs = (0..8u64).filter(|&j| cell(1 + j)).count() + usize::from(cell(9));
            assert_eq!(highs % 2, 0, "data+parity highs must be even for 0x{byte:02X}");
            for k in 10..14u64 {
                assert_eq!(cell(k), stop_bits == StopBits::Idle, "stop cell {k}");
            }
            assert!(level_at(&log, t0 + 15 * bit), "line must return to idle");
        }
    }
}

#[test]
fn receive_returns_every_transmitted_octet() {
    let config = TwiConfig::default();
    let mut framer = ByteFramer::new(SimPlatform::new(SimRadio::default()), &config);
    let all: Vec<u8> = (0..=255).collect();
    framer.platform_mut().queue_radio_bytes(&all);
    for expected in all {
        assert_eq!(framer.receive_byte(1000), Some(expected));
    }
    assert_eq!(framer.receive_byte(50), None);
}

#[test]
fn handshake_detects_mobile_radio() {
    let mut kfd = protocol_with(SimRadio::default());
    assert_eq!(kfd.detect_peer(), Some(PeerKind::MobileRadio));
    assert_eq!(kfd.session_state(), SessionState::Idle);
    assert!(!kfd.is_operation_in_progress());

    let platform = kfd.platform();
    assert!(platform.preemption_balanced());
    assert_eq!(platform.radio.key_signatures, 1);
    assert!(platform.radio.decoded.contains(&opcode::READY_REQ));
}

#[test]
fn handshake_detects_kvl_peer() {
    let radio = SimRadio { ready_byte: Some(opcode::READY_KVL), ..SimRadio::default() };
    let mut kfd = protocol_with(radio);
    assert_eq!(kfd.detect_peer(), Some(PeerKind::OtherKfd));
}

#[test]
fn silent_radio_gets_three_attempts_then_handshake_timeout() {
    let radio = SimRadio { ready_byte: None, ack_teardown: false, ..SimRadio::default() };
    let mut kfd = protocol_with(radio);
    let result = kfd.keyload(&aes256_key());
    assert!(!result.success);
    assert!(!result.aborted);
    assert!(result.message.contains("3 attempts"), "{}", result.message);
    assert_eq!(kfd.session_state(), SessionState::Idle);
    assert!(!kfd.is_operation_in_progress());
    // The whole signature + READY_REQ sequence is re-emitted each time.
    assert_eq!(kfd.platform().radio.key_signatures, 3);
    assert_eq!(kfd.platform().radio.ready_reqs_seen, 3);
}

#[test]
fn handshake_retry_succeeds_on_third_attempt() {
    let radio = SimRadio { ignore_ready_reqs: 2, ..SimRadio::default() };
    let mut kfd = protocol_with(radio);
    let result = kfd.keyload(&aes256_key());
    assert!(result.success, "{}", result.message);
    assert_eq!(kfd.platform().radio.key_signatures, 3);
}

#[test]
fn unexpected_ready_byte_fails_without_retry() {
    let radio = SimRadio { ready_byte: Some(0xAA), ack_teardown: false, ..SimRadio::default() };
    let mut kfd = protocol_with(radio);
    let result = kfd.keyload(&aes256_key());
    assert!(!result.success);
    assert!(result.message.contains("0xAA"), "{}", result.message);
    assert_eq!(kfd.platform().radio.key_signatures, 1);
}

#[test]
fn keyload_round_trip() {
    let mut kfd = protocol_with(SimRadio::default());
    let result = kfd.keyload(&aes256_key());
    assert!(result.success, "{}", result.message);
    assert_eq!(result.status, OperationStatus::CommandPerformed);
    assert_eq!(kfd.session_state(), SessionState::Idle);
    assert!(kfd.is_radio_connected(), "SENSE stays asserted between sessions");
    assert!(kfd.platform().data_released(), "DATA idle after the operation");

    let radio = &kfd.platform().radio;
    assert_eq!(radio.frames.len(), 1);
    let frame = &radio.frames[0];
    assert_eq!(frame[0], opcode::KMM);
    assert_eq!(frame[7], u8::from(MessageId::ModifyKeyCommand));
    // 7 header bytes + the 48-byte ModifyKey body for one AES-256 key.
    assert_eq!(u16::from_be_bytes([frame[8], frame[9]]), 0x0037);
    // Teardown ran: TRANSFER_DONE then DISCONNECT.
    assert_eq!(radio.decoded.last(), Some(&opcode::DISCONNECT));
    assert!(kfd.platform().preemption_balanced());
}

#[test]
fn keyload_surfaces_negative_ack_status() {
    let mut radio = SimRadio::default();
    radio.replies.push_back(Reply::Kmm {
        message_id: MessageId::NegativeAcknowledgment,
        body: vec![u8::from(MessageId::ModifyKeyCommand), 0x0C],
    });
    let mut kfd = protocol_with(radio);
    let result = kfd.keyload(&aes256_key());
    assert!(!result.success);
    assert_eq!(result.status, OperationStatus::InvalidKeysetId);
    assert_eq!(kfd.session_state(), SessionState::Idle);
}

#[test]
fn keyload_times_out_on_silent_exchange() {
    let mut radio = SimRadio::default();
    radio.replies.push_back(Reply::Silent);
    let mut kfd = protocol_with(radio);
    let result = kfd.keyload(&aes256_key());
    assert!(!result.success);
    assert!(result.message.contains("did not respond"), "{}", result.message);
    assert_eq!(kfd.session_state(), SessionState::Idle);
}

#[test]
fn corrupted_crc_is_a_protocol_violation() {
    let mut bad = build_kmm_frame(
        MessageId::RekeyAcknowledgment,
        ResponseKind::Immediate,
        &[0x00, 0xCA, 0x84, 0x00],
    )
    .to_vec();
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;

    let mut radio = SimRadio::default();
    radio.replies.push_back(Reply::Raw(bad));
    let mut kfd = protocol_with(radio);
    let result = kfd.keyload(&aes256_key());
    assert!(!result.success);
    assert!(result.message.contains("CRC mismatch"), "{}", result.message);
    assert_eq!(kfd.session_state(), SessionState::Idle);
}

#[test]
fn multi_key_load_reports_progress() {
    let keys = vec![adp_key(1, 1), adp_key(2, 2), adp_key(3, 3)];
    let mut kfd = protocol_with(SimRadio::default());

    let mut steps: Vec<(usize, usize, String)> = Vec::new();
    let mut on_progress =
        |current: usize, total: usize, message: &str| steps.push((current, total, message.into()));
    let result = kfd.keyload_multiple(&keys, Some(&mut on_progress));

    assert!(result.success, "{}", result.message);
    assert_eq!(result.message, "3 keys loaded successfully");
    assert_eq!(kfd.platform().radio.frames.len(), 3);
    // One session for the whole batch.
    assert_eq!(kfd.platform().radio.key_signatures, 1);
    assert_eq!(steps.first().map(|s| s.2.as_str()), Some("connecting to radio"));
    assert_eq!(steps.last(), Some(&(3, 3, "complete".to_string())));
}

#[test]
fn multi_key_partial_failure_identifies_third_key() {
    let mut radio = SimRadio::default();
    radio.replies.push_back(Reply::Kmm {
        message_id: MessageId::RekeyAcknowledgment,
        body: vec![0x00, 0x01, 0xAA, 0x00],
    });
    radio.replies.push_back(Reply::Kmm {
        message_id: MessageId::RekeyAcknowledgment,
        body: vec![0x00, 0x02, 0xAA, 0x00],
    });
    radio.replies.push_back(Reply::Kmm {
        message_id: MessageId::NegativeAcknowledgment,
        body: vec![u8::from(MessageId::ModifyKeyCommand), 0x0B],
    });

    let keys = vec![adp_key(1, 1), adp_key(2, 2), adp_key(3, 3)];
    let mut kfd = protocol_with(radio);
    let result = kfd.keyload_multiple(&keys, None);

    assert!(!result.success);
    assert!(result.message.contains("key 3"), "{}", result.message);
    assert!(result.message.contains("2 of 3"), "{}", result.message);
    assert_eq!(result.status, OperationStatus::InvalidKeyLength);
    // Keys 1 and 2 were exchanged and acknowledged before the failure.
    assert_eq!(kfd.platform().radio.frames.len(), 3);
    assert_eq!(kfd.session_state(), SessionState::Idle);
}

#[test]
fn empty_key_list_never_opens_a_session() {
    let mut kfd = protocol_with(SimRadio::default());
    let result = kfd.keyload_multiple(&[], None);
    assert!(!result.success);
    assert_eq!(result.message, "no keys to load");
    assert_eq!(kfd.platform().radio.key_signatures, 0);
}

#[test]
fn abort_between_keys_stops_the_batch() {
    let keys = vec![adp_key(1, 1), adp_key(2, 2), adp_key(3, 3)];
    let mut kfd = protocol_with(SimRadio::default());
    let handle = kfd.abort_handle();

    let mut on_progress = move |current: usize, _total: usize, _message: &str| {
        if current == 1 {
            handle.abort();
        }
    };
    let result = kfd.keyload_multiple(&keys, Some(&mut on_progress));

    assert!(!result.success);
    assert!(result.aborted);
    assert!(result.message.contains("2 of 3"), "{}", result.message);
    // Key 3 never went on the wire; teardown still ran.
    assert_eq!(kfd.platform().radio.frames.len(), 2);
    assert_eq!(kfd.session_state(), SessionState::Idle);
}

#[test]
fn erase_key_round_trip() {
    let mut kfd = protocol_with(SimRadio::default());
    let result = kfd.erase_key(1, 0x00CA);
    assert!(result.success, "{}", result.message);

    let radio = &kfd.platform().radio;
    let frame = &radio.frames[0];
    // Inner body starts after the 7-byte envelope head and 10-byte KMM
    // header; the key entry's format octet has the erase bit set.
    assert_eq!(frame[17 + 9] & 0x20, 0x20);
}

#[test]
fn erasing_twice_surfaces_previously_erased_as_success() {
    let mut radio = SimRadio::default();
    radio.replies.push_back(Reply::Kmm {
        message_id: MessageId::RekeyAcknowledgment,
        body: vec![0x00, 0x00, 0x80, 0x04],
    });
    let mut kfd = protocol_with(radio);
    let result = kfd.erase_key(1, 0x00CA);
    assert!(result.success, "{}", result.message);
    assert_eq!(result.status, OperationStatus::KeyPreviouslyErased);
}

#[test]
fn erase_all_keys_accepts_any_affirmative_response() {
    let mut kfd = protocol_with(SimRadio::default());
    let result = kfd.erase_all_keys();
    assert!(result.success, "{}", result.message);

    let radio = &kfd.platform().radio;
    let frame = &radio.frames[0];
    assert_eq!(frame[7], u8::from(MessageId::ZeroizeCommand));
    assert_eq!(frame[17], 0x0A); // zeroize instruction octet
}

#[test]
fn erase_all_keys_propagates_negative_ack() {
    let mut radio = SimRadio::default();
    radio.replies.push_back(Reply::Kmm {
        message_id: MessageId::NegativeAcknowledgment,
        body: vec![u8::from(MessageId::ZeroizeCommand), 0x0D],
    });
    let mut kfd = protocol_with(radio);
    let result = kfd.erase_all_keys();
    assert!(!result.success);
    assert_eq!(result.status, OperationStatus::UnsupportedFeature);
}

#[test]
fn inventory_returns_listing_after_echoed_type() {
    let mut radio = SimRadio::default();
    radio.replies.push_back(Reply::Kmm {
        message_id: MessageId::InventoryResponse,
        body: vec![0x02, 0x00, 0x02, 0x01, 0x02],
    });
    let mut kfd = protocol_with(radio);
    let data = kfd.inventory(InventoryType::ListActiveKsetIds).unwrap();
    assert_eq!(data, vec![0x00, 0x02, 0x01, 0x02]);
    assert_eq!(kfd.session_state(), SessionState::Idle);
}

#[test]
fn self_test_reports_stuck_lines() {
    let mut kfd = protocol_with(SimRadio::default());
    assert_eq!(kfd.self_test(), 0x00);

    kfd.platform_mut().force_data_level = Some(false);
    assert_eq!(kfd.self_test(), 0x01);
    kfd.platform_mut().force_data_level = Some(true);
    assert_eq!(kfd.self_test(), 0x03);
    kfd.platform_mut().force_data_level = None;

    kfd.platform_mut().force_sense_level = Some(false);
    assert_eq!(kfd.self_test(), 0x02);
    kfd.platform_mut().force_sense_level = Some(true);
    assert_eq!(kfd.self_test(), 0x04);
}

#[test]
fn init_is_idempotent_and_setters_validate() {
    let mut kfd = protocol_with(SimRadio::default());
    kfd.init(TwiConfig::default()).unwrap();
    kfd.init(TwiConfig::default()).unwrap();
    assert_eq!(*kfd.config(), TwiConfig::default());

    assert!(kfd.set_tx_kilobaud(0).is_err());
    assert!(kfd.set_tx_kilobaud(10).is_err());
    kfd.set_tx_kilobaud(8).unwrap();
    assert_eq!(kfd.config().tx_kilobaud, 8);
    assert_eq!(kfd.config().tx_bit_us(), 125);

    kfd.set_stop_bits(StopBits::Idle).unwrap();
    kfd.set_post_ready_delay_us(1500).unwrap();
    kfd.set_fast_send(false).unwrap();
    assert_eq!(kfd.config().stop_bits, StopBits::Idle);
    assert_eq!(kfd.config().post_ready_delay_us, 1500);
    assert!(!kfd.config().fast_send);
}

#[test]
fn slow_send_mode_still_loads_keys() {
    let mut kfd = protocol_with(SimRadio::default());
    kfd.set_fast_send(false).unwrap();
    let result = kfd.keyload(&adp_key(5, 5));
    assert!(result.success, "{}", result.message);
}

#[test]
fn idle_stop_bits_work_end_to_end() {
    let config = TwiConfig { stop_bits: StopBits::Idle, ..TwiConfig::default() };
    let mut kfd = KfdProtocol::new(SimPlatform::new(SimRadio::default()), config).unwrap();
    let result = kfd.keyload(&adp_key(7, 7));
    assert!(result.success, "{}", result.message);
}

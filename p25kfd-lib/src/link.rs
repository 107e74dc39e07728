//! TWI session link: wake/READY handshake, KMM envelope transport, and
//! session teardown.
//!
//! Envelope layout in both directions:
//!
//! ```text
//! opcode(1)=0xC2  length(2,BE)  control(1)=0x00  dest_rsi(3)=FF FF FF
//! kmm(N)  crc16(2, low byte first)
//! ```
//!
//! `length` counts everything after itself including the CRC. The CRC
//! covers control + dest RSI + kmm and is not complemented.

use bytes::{BufMut, Bytes, BytesMut};
use strum_macros::Display;
use tracing::{debug, warn};

use crate::crc::crc16;
use crate::error::KfdError;
use crate::framer::ByteFramer;
use crate::hal::Platform;
use crate::p25::{opcode, MessageId, BROADCAST_RSI};

pub const HANDSHAKE_ATTEMPTS: u32 = 3;
pub const READY_TIMEOUT_MS: u64 = 2000;
const RETRY_PAUSE_MS: u32 = 500;
const TEARDOWN_TIMEOUT_MS: u64 = 1000;

/// Envelope length field bounds; anything outside is a framing error.
const MIN_FRAME_LEN: u16 = 6;
const MAX_FRAME_LEN: u16 = 512;

/// Bytes to pull off the wire for the log when a frame goes sideways.
const VIOLATION_DRAIN_LIMIT: usize = 16;
const VIOLATION_DRAIN_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    KeySigSent,
    Ready,
    KmmExchange,
    TearDown,
}

/// What answered the READY request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PeerKind {
    #[strum(to_string = "mobile radio")]
    MobileRadio,
    #[strum(to_string = "KVL")]
    OtherKfd,
}

/// Response-kind bits of the inner KMM format octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseKind {
    Immediate = 0xC0,
    Delayed = 0x80,
}

/// Wrap a raw kmm payload in the TWI envelope.
pub fn build_envelope(kmm: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(4 + kmm.len());
    body.put_u8(0x00); // control
    body.put_slice(&BROADCAST_RSI);
    body.put_slice(kmm);

    let crc = crc16(&body);

    let mut frame = BytesMut::with_capacity(3 + body.len() + 2);
    frame.put_u8(opcode::KMM);
    frame.put_u16(body.len() as u16 + 2);
    frame.put_slice(&body);
    frame.put_u8(crc as u8); // low byte first
    frame.put_u8((crc >> 8) as u8);
    frame.freeze()
}

/// Build the inner KMM frame for a command body and wrap it in the
/// envelope. `message_length` counts the format octet, both RSIs, and
/// the body (7 + body). Three-wire transport carries no preamble.
pub fn build_kmm_frame(message_id: MessageId, kind: ResponseKind, body: &[u8]) -> Bytes {
    let mut inner = BytesMut::with_capacity(10 + body.len());
    inner.put_u8(message_id.into());
    inner.put_u16(7 + body.len() as u16);
    inner.put_u8(kind as u8);
    inner.put_slice(&BROADCAST_RSI); // destination RSI
    inner.put_slice(&BROADCAST_RSI); // source RSI
    inner.put_slice(body);
    build_envelope(&inner)
}

pub struct SessionLink<P: Platform> {
    phy: ByteFramer<P>,
    state: SessionState,
    post_ready_delay_us: u32,
    fast_send: bool,
}

impl<P: Platform> SessionLink<P> {
    pub fn new(phy: ByteFramer<P>, post_ready_delay_us: u32, fast_send: bool) -> Self {
        Self { phy, state: SessionState::Idle, post_ready_delay_us, fast_send }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_post_ready_delay_us(&mut self, us: u32) {
        self.post_ready_delay_us = us;
    }

    pub fn set_fast_send(&mut self, fast: bool) {
        self.fast_send = fast;
    }

    pub fn phy(&self) -> &ByteFramer<P> {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut ByteFramer<P> {
        &mut self.phy
    }

    /// One key signature + READY_REQ exchange.
    pub fn handshake_once(&mut self, timeout_ms: u64) -> Result<PeerKind, KfdError> {
        self.state = SessionState::KeySigSent;
        self.phy.send_key_signature_and_ready_req();
        match self.phy.receive_byte(timeout_ms) {
            Some(opcode::READY_MR) => self.peer_ready(PeerKind::MobileRadio),
            Some(opcode::READY_KVL) => self.peer_ready(PeerKind::OtherKfd),
            Some(other) => {
                warn!("unexpected READY response 0x{:02X}", other);
                self.state = SessionState::Idle;
                Err(KfdError::ProtocolViolation(format!(
                    "unexpected READY response 0x{other:02X}"
                )))
            }
            None => {
                self.state = SessionState::Idle;
                Err(KfdError::HandshakeTimeout { attempts: 1 })
            }
        }
    }

    fn peer_ready(&mut self, peer: PeerKind) -> Result<PeerKind, KfdError> {
        debug!("peer ready: {}", peer);
        if self.post_ready_delay_us > 0 {
            self.phy.delay_micros(self.post_ready_delay_us);
        }
        self.state = SessionState::Ready;
        Ok(peer)
    }

    /// Open a session, retrying the whole signature + READY_REQ
    /// sequence when the radio stays silent. An unexpected byte fails
    /// immediately; only silence is retried.
    pub fn begin_session(&mut self) -> Result<PeerKind, KfdError> {
        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            if attempt > 1 {
                debug!("handshake retry {attempt}");
                self.phy.delay_millis(RETRY_PAUSE_MS);
            }
            match self.handshake_once(READY_TIMEOUT_MS) {
                Ok(peer) => return Ok(peer),
                Err(KfdError::HandshakeTimeout { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
        self.state = SessionState::Idle;
        Err(KfdError::HandshakeTimeout { attempts: HANDSHAKE_ATTEMPTS })
    }

    /// Send one KMM command inside the envelope.
    pub fn send_kmm(&mut self, message_id: MessageId, body: &[u8]) {
        let frame = build_kmm_frame(message_id, ResponseKind::Immediate, body);
        debug!("tx KMM frame ({} bytes): {:02X?}", frame.len(), &frame[..]);
        self.state = SessionState::KmmExchange;
        if self.fast_send {
            self.phy.send_bytes_fast(&frame);
        } else {
            self.phy.send_bytes(&frame);
        }
    }

    /// Receive one envelope and return the inner KMM frame (message id
    /// through body), with control/RSI stripped and the CRC verified.
    /// `timeout_ms` bounds the wait for each byte.
    pub fn receive_kmm(&mut self, timeout_ms: u64) -> Result<Bytes, KfdError> {
        let op = self
            .phy
            .receive_byte(timeout_ms)
            .ok_or(KfdError::ProtocolTimeout { timeout_ms })?;
        if op != opcode::KMM {
            return Err(self.violation(op, "unexpected opcode"));
        }

        let len_hi = self.recv_byte(timeout_ms)?;
        let len_lo = self.recv_byte(timeout_ms)?;
        let len = u16::from_be_bytes([len_hi, len_lo]);
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(self.violation(op, &format!("length {len} out of range")));
        }

        let mut body = vec![0u8; usize::from(len)];
        for slot in body.iter_mut() {
            *slot = self.recv_byte(timeout_ms)?;
        }

        let (payload, crc_bytes) = body.split_at(body.len() - 2);
        let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let computed = crc16(payload);
        if received != computed {
            warn!(
                "rx CRC mismatch: got 0x{:04X}, computed 0x{:04X}, frame {:02X?}",
                received, computed, body
            );
            return Err(KfdError::ProtocolViolation(format!(
                "CRC mismatch (got 0x{received:04X}, computed 0x{computed:04X})"
            )));
        }

        debug!("rx KMM frame ({} bytes)", body.len());
        self.state = SessionState::Ready;
        Ok(Bytes::copy_from_slice(&payload[4..]))
    }

    fn recv_byte(&mut self, timeout_ms: u64) -> Result<u8, KfdError> {
        self.phy
            .receive_byte(timeout_ms)
            .ok_or(KfdError::ProtocolTimeout { timeout_ms })
    }

    fn violation(&mut self, first: u8, what: &str) -> KfdError {
        // Pull whatever else the radio is saying for the log before the
        // session goes down.
        let mut raw = vec![first];
        while raw.len() < VIOLATION_DRAIN_LIMIT {
            match self.phy.receive_byte(VIOLATION_DRAIN_TIMEOUT_MS) {
                Some(byte) => raw.push(byte),
                None => break,
            }
        }
        warn!("{what}; raw bytes {:02X?}", raw);
        KfdError::ProtocolViolation(format!("{what} (0x{first:02X})"))
    }

    /// Close the session: TRANSFER_DONE both ways, then DISCONNECT and
    /// its ack. Missing acks are tolerated. SENSE stays asserted so the
    /// radio remains in keyload mode between sessions.
    pub fn end_session(&mut self) {
        self.state = SessionState::TearDown;
        self.phy.send_byte(opcode::TRANSFER_DONE);
        if self.phy.receive_byte(TEARDOWN_TIMEOUT_MS) == Some(opcode::TRANSFER_DONE) {
            self.phy.send_byte(opcode::DISCONNECT);
            let _ = self.phy.receive_byte(TEARDOWN_TIMEOUT_MS);
        }
        self.state = SessionState::Idle;
        debug!("session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16_wire;

    #[test]
    fn envelope_of_empty_kmm() {
        let frame = build_envelope(&[]);
        let crc = crc16_wire(&[0x00, 0xFF, 0xFF, 0xFF]);
        assert_eq!(
            &frame[..],
            &[0xC2, 0x00, 0x06, 0x00, 0xFF, 0xFF, 0xFF, crc[0], crc[1]]
        );
    }

    #[test]
    fn inner_frame_header_layout() {
        let frame = build_kmm_frame(MessageId::InventoryCommand, ResponseKind::Immediate, &[0x02]);
        // opcode + length(2) + control + dest rsi(3), then the inner frame
        assert_eq!(frame[3], 0x00);
        assert_eq!(&frame[4..7], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(frame[7], 0x00); // InventoryCommand
        assert_eq!(u16::from_be_bytes([frame[8], frame[9]]), 8); // 7 + body
        assert_eq!(frame[10], 0xC0); // immediate response requested
        assert_eq!(&frame[11..14], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&frame[14..17], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(frame[17], 0x02);
    }

    #[test]
    fn envelope_length_counts_crc_not_header() {
        let frame = build_kmm_frame(MessageId::ModifyKeyCommand, ResponseKind::Immediate, &[0; 48]);
        let len = u16::from_be_bytes([frame[1], frame[2]]);
        assert_eq!(usize::from(len), frame.len() - 3);
    }
}

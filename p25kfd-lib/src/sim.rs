//! Simulated wire: a [`Platform`] with a virtual microsecond clock and
//! a scripted radio on the far end of the DATA line.
//!
//! The radio decodes the framer's actual bit cells from the recorded
//! line transitions and answers with properly framed bytes, so tests
//! and the CLI demo exercise the full stack (line driver, framer,
//! link, protocol) with no hardware attached.

use std::collections::VecDeque;

use crate::config::TwiConfig;
use crate::hal::Platform;
use crate::link::{build_kmm_frame, ResponseKind};
use crate::p25::{opcode, MessageId};

/// A low pulse at least this long is a key signature, not a start bit.
const KEY_SIG_MIN_US: u64 = 50_000;

/// One scripted answer to a received KMM frame.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Inner KMM response wrapped in the standard envelope.
    Kmm { message_id: MessageId, body: Vec<u8> },
    /// Raw bytes framed and sent verbatim (malformed-frame tests).
    Raw(Vec<u8>),
    /// Say nothing and let the KFD time out.
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxState {
    Opcode,
    LenHi,
    LenLo,
    Body,
}

/// The radio model. Field defaults describe a cooperative mobile radio
/// at 4 kbaud; tests flip fields to script misbehavior.
#[derive(Debug)]
pub struct SimRadio {
    pub bit_us: u64,
    /// Turnaround between finishing a decode and starting the reply.
    /// Must exceed the framer's post-frame settle delay or the first
    /// response byte lands while the KFD is not yet listening.
    pub response_delay_us: u64,
    /// Swallow this many READY_REQs before answering.
    pub ignore_ready_reqs: u32,
    /// Byte answered to READY_REQ; `None` never answers.
    pub ready_byte: Option<u8>,
    /// Scripted replies to KMM frames, consumed in order.
    pub replies: VecDeque<Reply>,
    /// Synthesize RekeyAck / ZeroizeResponse / InventoryResponse when
    /// the script runs dry.
    pub auto_ack: bool,
    pub ack_teardown: bool,

    /// Every byte decoded off the wire, in order.
    pub decoded: Vec<u8>,
    /// Complete KMM envelope frames received.
    pub frames: Vec<Vec<u8>>,
    pub key_signatures: u32,
    pub ready_reqs_seen: u32,

    pub(crate) awake: bool,
    pub(crate) rx: RxState,
    pub(crate) partial: Vec<u8>,
    pub(crate) frame_remaining: usize,
}

impl Default for SimRadio {
    fn default() -> Self {
        Self {
            bit_us: 250,
            response_delay_us: 2000,
            ignore_ready_reqs: 0,
            ready_byte: Some(opcode::READY_MR),
            replies: VecDeque::new(),
            auto_ack: true,
            ack_teardown: true,
            decoded: Vec::new(),
            frames: Vec::new(),
            key_signatures: 0,
            ready_reqs_seen: 0,
            awake: false,
            rx: RxState::Opcode,
            partial: Vec::new(),
            frame_remaining: 0,
        }
    }
}

impl SimRadio {
    fn on_key_signature(&mut self, sense_connected: bool) {
        if !sense_connected {
            return;
        }
        self.awake = true;
        self.key_signatures += 1;
        self.rx = RxState::Opcode;
        self.partial.clear();
    }

    fn on_byte(&mut self, byte: u8) -> Option<Vec<u8>> {
        self.decoded.push(byte);
        match self.rx {
            RxState::Opcode => match byte {
                opcode::READY_REQ => {
                    self.ready_reqs_seen += 1;
                    if !self.awake || self.ready_reqs_seen <= self.ignore_ready_reqs {
                        return None;
                    }
                    self.ready_byte.map(|ready| vec![ready])
                }
                opcode::KMM => {
                    self.partial = vec![byte];
                    self.rx = RxState::LenHi;
                    None
                }
                opcode::TRANSFER_DONE => {
                    self.ack_teardown.then(|| vec![opcode::TRANSFER_DONE])
                }
                opcode::DISCONNECT => {
                    self.ack_teardown.then(|| vec![opcode::DISCONNECT_ACK])
                }
                _ => None,
            },
            RxState::LenHi => {
                self.partial.push(byte);
                self.rx = RxState::LenLo;
                None
            }
            RxState::LenLo => {
                self.partial.push(byte);
                let len = u16::from_be_bytes([self.partial[1], self.partial[2]]);
                self.frame_remaining = usize::from(len);
                self.rx = if len == 0 { RxState::Opcode } else { RxState::Body };
                None
            }
            RxState::Body => {
                self.partial.push(byte);
                self.frame_remaining -= 1;
                if self.frame_remaining > 0 {
                    return None;
                }
                self.rx = RxState::Opcode;
                let frame = std::mem::take(&mut self.partial);
                let reply = self.reply_for(&frame);
                self.frames.push(frame);
                reply
            }
        }
    }

    fn reply_for(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if let Some(reply) = self.replies.pop_front() {
            return match reply {
                Reply::Kmm { message_id, body } => {
                    Some(build_kmm_frame(message_id, ResponseKind::Immediate, &body).to_vec())
                }
                Reply::Raw(bytes) => Some(bytes),
                Reply::Silent => None,
            };
        }
        if self.auto_ack {
            self.auto_reply(frame)
        } else {
            None
        }
    }

    /// Cooperative answers derived from the received command.
    fn auto_reply(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let inner = frame.get(7..frame.len().checked_sub(2)?)?;
        let message_id = MessageId::from(*inner.first()?);
        let body = inner.get(10..)?;
        let reply = match message_id {
            MessageId::ModifyKeyCommand => {
                let algorithm = *body.get(6)?;
                let key_length = usize::from(*body.get(7)?);
                let count = usize::from(*body.get(8)?);
                let mut ack = Vec::with_capacity(count * 4);
                let mut offset = 9;
                for _ in 0..count {
                    ack.push(*body.get(offset + 3)?);
                    ack.push(*body.get(offset + 4)?);
                    ack.push(algorithm);
                    ack.push(0x00);
                    offset += 5 + key_length;
                }
                build_kmm_frame(MessageId::RekeyAcknowledgment, ResponseKind::Immediate, &ack)
            }
            MessageId::ZeroizeCommand => {
                build_kmm_frame(MessageId::ZeroizeResponse, ResponseKind::Immediate, &[])
            }
            MessageId::InventoryCommand => {
                let echo = *body.first()?;
                build_kmm_frame(MessageId::InventoryResponse, ResponseKind::Immediate, &[echo])
            }
            _ => return None,
        };
        Some(reply.to_vec())
    }
}

/// Virtual board: two pins, a simulated clock, and the radio.
pub struct SimPlatform {
    now_us: u64,
    data_pin: u8,
    sense_pin: u8,
    data_output: bool,
    kfd_data_low: bool,
    sense_high: bool,
    preemption_depth: u32,

    pub radio: SimRadio,
    /// Unconsumed KFD line transitions `(time, pulled_low)`.
    edges: VecDeque<(u64, bool)>,
    /// Full KFD transition history for waveform assertions.
    tx_log: Vec<(u64, bool)>,
    /// Intervals where the radio pulls DATA low.
    radio_drive: VecDeque<(u64, u64)>,

    /// Fault injection for self-test coverage: force the read level of
    /// a line regardless of drivers.
    pub force_data_level: Option<bool>,
    pub force_sense_level: Option<bool>,
}

impl SimPlatform {
    pub fn new(radio: SimRadio) -> Self {
        let config = TwiConfig::default();
        Self {
            now_us: 0,
            data_pin: config.data_pin,
            sense_pin: config.sense_pin,
            data_output: false,
            kfd_data_low: false,
            sense_high: true,
            preemption_depth: 0,
            radio,
            edges: VecDeque::new(),
            tx_log: Vec::new(),
            radio_drive: VecDeque::new(),
            force_data_level: None,
            force_sense_level: None,
        }
    }

    pub fn now(&self) -> u64 {
        self.now_us
    }

    /// KFD-side DATA transitions since start, `(micros, pulled_low)`.
    pub fn tx_transitions(&self) -> &[(u64, bool)] {
        &self.tx_log
    }

    pub fn preemption_balanced(&self) -> bool {
        self.preemption_depth == 0
    }

    /// True when the KFD side is not driving DATA.
    pub fn data_released(&self) -> bool {
        !self.kfd_data_low
    }

    /// Have the radio transmit raw bytes, unprompted.
    pub fn queue_radio_bytes(&mut self, bytes: &[u8]) {
        self.schedule_reply(bytes.to_vec());
    }

    fn sense_connected(&self) -> bool {
        !self.sense_high
    }

    fn set_kfd_data_low(&mut self, low: bool) {
        if self.kfd_data_low != low {
            self.kfd_data_low = low;
            self.edges.push_back((self.now_us, low));
            self.tx_log.push((self.now_us, low));
        }
    }

    fn advance(&mut self, us: u64) {
        self.now_us += us;
        self.service();
    }

    fn radio_low_now(&mut self) -> bool {
        while let Some(&(_, end)) = self.radio_drive.front() {
            if end <= self.now_us {
                self.radio_drive.pop_front();
            } else {
                break;
            }
        }
        matches!(self.radio_drive.front(), Some(&(start, _)) if start <= self.now_us)
    }

    /// Let the radio catch up with whatever the KFD has put on the wire.
    fn service(&mut self) {
        loop {
            let Some(&(t0, low)) = self.edges.front() else { break };
            if !low {
                self.edges.pop_front();
                continue;
            }
            let rise = self
                .edges
                .iter()
                .skip(1)
                .find(|&&(_, is_low)| !is_low)
                .map(|&(t, _)| t);
            match rise {
                Some(t1) if t1 - t0 >= KEY_SIG_MIN_US => {
                    let connected = self.sense_connected();
                    self.radio.on_key_signature(connected);
                    while let Some(&(t, _)) = self.edges.front() {
                        if t <= t1 {
                            self.edges.pop_front();
                        } else {
                            break;
                        }
                    }
                }
                Some(_) => {
                    let span = self.radio.bit_us * 14;
                    if self.now_us < t0 + span {
                        break;
                    }
                    let byte = self.decode_byte(t0);
                    while let Some(&(t, _)) = self.edges.front() {
                        if t < t0 + span {
                            self.edges.pop_front();
                        } else {
                            break;
                        }
                    }
                    if let Some(reply) = self.radio.on_byte(byte) {
                        self.schedule_reply(reply);
                    }
                }
                None => break,
            }
        }
    }

    /// Sample the KFD's cells at their centers, exactly as a radio's
    /// UART would.
    fn decode_byte(&self, t0: u64) -> u8 {
        let bit = self.radio.bit_us;
        let mut reversed = 0u8;
        for cell in 1..=8u64 {
            let ts = t0 + cell * bit + bit / 2;
            let mut low = false;
            for &(t, is_low) in &self.edges {
                if t <= ts {
                    low = is_low;
                } else {
                    break;
                }
            }
            if !low {
                reversed |= 1 << (cell - 1);
            }
        }
        reversed.reverse_bits()
    }

    fn schedule_reply(&mut self, bytes: Vec<u8>) {
        let bit = self.radio.bit_us;
        let mut t = self.now_us + self.radio.response_delay_us;
        if let Some(&(_, end)) = self.radio_drive.back() {
            t = t.max(end + bit * 2);
        }
        for &byte in &bytes {
            t = self.schedule_byte(t, byte);
        }
    }

    /// Radios answer with standard asynchronous framing: four idle
    /// stop cells, then the inter-byte gap.
    fn schedule_byte(&mut self, t: u64, byte: u8) -> u64 {
        let bit = self.radio.bit_us;
        let reversed = byte.reverse_bits();
        let parity_high = byte.count_ones() % 2 == 1;

        self.push_low(t, t + bit); // start cell
        for cell in 0..8u64 {
            if reversed & (1 << cell) == 0 {
                self.push_low(t + (cell + 1) * bit, t + (cell + 2) * bit);
            }
        }
        if !parity_high {
            self.push_low(t + 9 * bit, t + 10 * bit);
        }
        t + 10 * bit + 4 * bit + 2 * bit
    }

    fn push_low(&mut self, start: u64, end: u64) {
        if let Some(last) = self.radio_drive.back_mut() {
            if last.1 == start {
                last.1 = end;
                return;
            }
        }
        self.radio_drive.push_back((start, end));
    }
}

impl Platform for SimPlatform {
    fn pin_output(&mut self, pin: u8) {
        if pin == self.data_pin {
            self.data_output = true;
        }
    }

    fn pin_input_pullup(&mut self, pin: u8) {
        if pin == self.data_pin {
            self.data_output = false;
            self.set_kfd_data_low(false);
        }
    }

    fn pin_write(&mut self, pin: u8, high: bool) {
        if pin == self.data_pin {
            if self.data_output {
                self.set_kfd_data_low(!high);
            }
        } else if pin == self.sense_pin {
            self.sense_high = high;
        }
    }

    fn pin_read(&mut self, pin: u8) -> bool {
        self.service();
        if pin == self.data_pin {
            if let Some(level) = self.force_data_level {
                return level;
            }
            let radio_low = self.radio_low_now();
            !(self.kfd_data_low || radio_low)
        } else if pin == self.sense_pin {
            if let Some(level) = self.force_sense_level {
                return level;
            }
            self.sense_high
        } else {
            true
        }
    }

    fn now_micros(&mut self) -> u64 {
        // Reading the clock costs a tick, so polling loops make
        // progress against simulated time.
        self.advance(1);
        self.now_us
    }

    fn delay_micros(&mut self, us: u32) {
        self.advance(u64::from(us));
    }

    fn suspend_preemption(&mut self) {
        self.preemption_depth += 1;
    }

    fn resume_preemption(&mut self) {
        self.preemption_depth = self.preemption_depth.saturating_sub(1);
    }
}

//! Public operation surface for manual rekeying.
//!
//! One `KfdProtocol` owns the whole stack down to the pins. Operations
//! are strictly sequential: a guard flag refuses a second operation
//! while one is running, and a caller-held [`AbortHandle`] can cancel
//! at the next byte boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{validate_kilobaud, StopBits, TwiConfig};
use crate::crc::crc16;
use crate::error::KfdError;
use crate::framer::ByteFramer;
use crate::hal::Platform;
use crate::link::{PeerKind, SessionLink, SessionState, READY_TIMEOUT_MS};
use crate::messages::{
    inventory_command, modify_key_command, parse_inventory_response, parse_negative_ack,
    parse_rekey_ack, zeroize_command, KmmMessage,
};
use crate::p25::{InventoryType, KeyItem, MessageId, OperationStatus};

/// Per-byte receive timeout for a single-key load response.
const KEYLOAD_TIMEOUT_MS: u64 = 10_000;
/// Per-byte receive timeout for each key of a multi-key load.
const MULTI_KEY_TIMEOUT_MS: u64 = 5_000;
/// Zeroize takes the radio a while; give it the long window.
const ZEROIZE_TIMEOUT_MS: u64 = 10_000;
const INVENTORY_TIMEOUT_MS: u64 = 5_000;

/// Progress callback for multi-key operations: `(current, total,
/// status message)`. Invoked synchronously; keep it fast.
pub type Progress<'a> = &'a mut dyn FnMut(usize, usize, &str);

/// Outcome of a public operation. `status` carries the TIA status code
/// verbatim where the peer supplied one; `aborted` distinguishes user
/// cancellation from failures so callers can skip the error dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpResult {
    pub success: bool,
    pub message: String,
    pub status: OperationStatus,
    pub aborted: bool,
}

impl OpResult {
    fn ok(message: impl Into<String>) -> Self {
        Self::ok_with(message, OperationStatus::CommandPerformed)
    }

    fn ok_with(message: impl Into<String>, status: OperationStatus) -> Self {
        Self { success: true, message: message.into(), status, aborted: false }
    }

    fn fail(message: impl Into<String>, status: OperationStatus) -> Self {
        Self { success: false, message: message.into(), status, aborted: false }
    }

    fn from_error(error: &KfdError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            status: error.status().unwrap_or(OperationStatus::InternalError),
            aborted: matches!(error, KfdError::Aborted),
        }
    }
}

/// Cancels the running operation from outside the blocking call.
/// Honored between keys and between the send and receive halves of an
/// exchange, never mid-byte: that would corrupt the wire.
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct KfdProtocol<P: Platform> {
    link: SessionLink<P>,
    config: TwiConfig,
    abort_flag: Arc<AtomicBool>,
    in_progress: Arc<AtomicBool>,
}

impl<P: Platform> KfdProtocol<P> {
    /// Bring up the stack: validates the configuration, claims the
    /// pins, and leaves the interface enabled (SENSE asserted).
    pub fn new(platform: P, config: TwiConfig) -> Result<Self, KfdError> {
        config.validate()?;
        let phy = ByteFramer::new(platform, &config);
        let link = SessionLink::new(phy, config.post_ready_delay_us, config.fast_send);
        debug!("CRC check vector: 0x{:04X}", crc16(b"123456789"));
        Ok(Self {
            link,
            config,
            abort_flag: Arc::new(AtomicBool::new(false)),
            in_progress: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Re-initialize with a new configuration. Idempotent for an
    /// unchanged configuration; refused while an operation is running.
    pub fn init(&mut self, config: TwiConfig) -> Result<(), KfdError> {
        self.ensure_idle()?;
        config.validate()?;
        self.link.phy_mut().apply_config(&config);
        self.link.set_post_ready_delay_us(config.post_ready_delay_us);
        self.link.set_fast_send(config.fast_send);
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &TwiConfig {
        &self.config
    }

    pub fn session_state(&self) -> SessionState {
        self.link.state()
    }

    /// Borrow the board behind the stack (the simulated wire, in tests
    /// and the demo).
    pub fn platform(&self) -> &P {
        self.link.phy().platform()
    }

    pub fn platform_mut(&mut self) -> &mut P {
        self.link.phy_mut().platform_mut()
    }

    pub fn is_operation_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Request cancellation of the current operation.
    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::SeqCst);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.abort_flag))
    }

    /// SENSE line check: is something attached and held active?
    pub fn is_radio_connected(&mut self) -> bool {
        self.link.phy_mut().sense_is_connected()
    }

    /// Adapter self-test. 0x00 on pass, otherwise the fault code
    /// (0x01 DATA stuck low, 0x02 SENSE stuck low, 0x03 DATA stuck
    /// high, 0x04 SENSE stuck high).
    pub fn self_test(&mut self) -> u8 {
        if self.is_operation_in_progress() {
            warn!("self-test refused: operation in progress");
            return 0xFF;
        }
        match self.link.phy_mut().self_test() {
            Ok(()) => 0x00,
            Err(fault) => {
                warn!("self-test failed: {fault}");
                u8::from(fault)
            }
        }
    }

    /// Run only the signature + READY_REQ handshake and report what
    /// answered, tearing the session down immediately.
    pub fn detect_peer(&mut self) -> Option<PeerKind> {
        let Some(_guard) = OpGuard::acquire(&self.in_progress) else {
            warn!("detect refused: operation in progress");
            return None;
        };
        match self.link.handshake_once(READY_TIMEOUT_MS) {
            Ok(peer) => {
                self.link.end_session();
                Some(peer)
            }
            Err(err) => {
                debug!("no peer detected: {err}");
                None
            }
        }
    }

    /// Load one key: session, one ModifyKey exchange, teardown.
    /// Success requires a RekeyAck whose status for this key is
    /// accepted or overwritten (or previously-erased for an erase).
    pub fn keyload(&mut self, key: &KeyItem) -> OpResult {
        let Some(_guard) = OpGuard::acquire(&self.in_progress) else {
            return OpResult::fail("operation in progress", OperationStatus::InternalError);
        };
        if let Err(err) = key.validate() {
            return OpResult::from_error(&err);
        }
        self.abort_flag.store(false, Ordering::SeqCst);
        info!(
            "keyload: keyset {} sln 0x{:04X} key id 0x{:04X} {}{}",
            key.keyset_id,
            key.sln,
            key.key_id,
            key.algorithm_id,
            if key.erase { " (erase)" } else { "" }
        );

        let outcome =
            self.with_session(|link, abort| modify_key_exchange(link, abort, key, KEYLOAD_TIMEOUT_MS));
        match outcome {
            Ok(status) if key.erase => OpResult::ok_with(format!("key erased ({status})"), status),
            Ok(status) => OpResult::ok_with("key loaded successfully", status),
            Err(err) => OpResult::from_error(&err),
        }
    }

    /// Load several keys over one session, one ModifyKey exchange per
    /// key. Stops at the first failure and reports which key failed;
    /// honors abort between keys.
    pub fn keyload_multiple(&mut self, keys: &[KeyItem], mut progress: Option<Progress<'_>>) -> OpResult {
        let Some(_guard) = OpGuard::acquire(&self.in_progress) else {
            return OpResult::fail("operation in progress", OperationStatus::InternalError);
        };
        if keys.is_empty() {
            return OpResult::fail("no keys to load", OperationStatus::InternalError);
        }
        for key in keys {
            if let Err(err) = key.validate() {
                return OpResult::from_error(&err);
            }
        }
        self.abort_flag.store(false, Ordering::SeqCst);

        let total = keys.len();
        report(&mut progress, 0, total, "connecting to radio");

        let mut loaded = 0usize;
        let outcome = self.with_session(|link, abort| {
            for (index, key) in keys.iter().enumerate() {
                if abort.load(Ordering::SeqCst) {
                    return Err(KfdError::Aborted);
                }
                report(
                    &mut progress,
                    index,
                    total,
                    &format!("loading key {} of {}", index + 1, total),
                );
                modify_key_exchange(link, abort, key, MULTI_KEY_TIMEOUT_MS).map_err(|err| {
                    match err {
                        KfdError::KeyRejected { status, .. } => {
                            KfdError::KeyRejected { index: index + 1, status }
                        }
                        KfdError::NegativeAck { status } => {
                            KfdError::KeyRejected { index: index + 1, status }
                        }
                        other => other,
                    }
                })?;
                loaded += 1;
            }
            Ok(())
        });

        match outcome {
            Ok(()) => {
                report(&mut progress, total, total, "complete");
                OpResult::ok(format!("{total} keys loaded successfully"))
            }
            Err(err) => {
                let mut result = OpResult::from_error(&err);
                result.message = format!("{} ({loaded} of {total} keys loaded)", result.message);
                result
            }
        }
    }

    /// Erase one slot. Erasing an already-empty slot is legal; the
    /// peer's "previously erased" status is surfaced as success.
    pub fn erase_key(&mut self, keyset_id: u8, sln: u16) -> OpResult {
        self.keyload(&KeyItem::erase(keyset_id, sln))
    }

    /// Zeroize: erase every key in the radio. Any non-negative
    /// response within the window counts as success.
    pub fn erase_all_keys(&mut self) -> OpResult {
        let Some(_guard) = OpGuard::acquire(&self.in_progress) else {
            return OpResult::fail("operation in progress", OperationStatus::InternalError);
        };
        self.abort_flag.store(false, Ordering::SeqCst);
        info!("zeroize: erasing all keys");

        let outcome = self.with_session(|link, _abort| {
            link.send_kmm(MessageId::ZeroizeCommand, &zeroize_command());
            let msg = KmmMessage::parse(link.receive_kmm(ZEROIZE_TIMEOUT_MS)?)?;
            match msg.message_id {
                MessageId::NegativeAcknowledgment => {
                    let (_, status) = parse_negative_ack(&msg.body);
                    Err(KfdError::NegativeAck { status })
                }
                other => {
                    debug!("zeroize answered with 0x{:02X}", u8::from(other));
                    Ok(())
                }
            }
        });
        match outcome {
            Ok(()) => OpResult::ok("all keys erased"),
            Err(err) => OpResult::from_error(&err),
        }
    }

    /// Run one inventory exchange and return the raw listing after the
    /// echoed type octet.
    pub fn inventory(&mut self, inventory_type: InventoryType) -> Result<Vec<u8>, KfdError> {
        let _guard = OpGuard::acquire(&self.in_progress)
            .ok_or_else(|| KfdError::Config("operation in progress".into()))?;
        self.abort_flag.store(false, Ordering::SeqCst);

        self.with_session(|link, _abort| {
            link.send_kmm(MessageId::InventoryCommand, &inventory_command(inventory_type));
            let msg = KmmMessage::parse(link.receive_kmm(INVENTORY_TIMEOUT_MS)?)?;
            match msg.message_id {
                MessageId::InventoryResponse => parse_inventory_response(&msg.body, inventory_type),
                MessageId::NegativeAcknowledgment => {
                    let (_, status) = parse_negative_ack(&msg.body);
                    Err(KfdError::NegativeAck { status })
                }
                other => Err(KfdError::ProtocolViolation(format!(
                    "unexpected response message id 0x{:02X}",
                    u8::from(other)
                ))),
            }
        })
    }

    pub fn set_fast_send(&mut self, fast: bool) -> Result<(), KfdError> {
        self.ensure_idle()?;
        self.config.fast_send = fast;
        self.link.set_fast_send(fast);
        Ok(())
    }

    pub fn set_post_ready_delay_us(&mut self, us: u32) -> Result<(), KfdError> {
        self.ensure_idle()?;
        self.config.post_ready_delay_us = us;
        self.link.set_post_ready_delay_us(us);
        Ok(())
    }

    pub fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), KfdError> {
        self.ensure_idle()?;
        self.config.stop_bits = stop_bits;
        self.link.phy_mut().set_stop_bits(stop_bits);
        Ok(())
    }

    pub fn set_tx_kilobaud(&mut self, kilobaud: u8) -> Result<(), KfdError> {
        self.ensure_idle()?;
        validate_kilobaud(kilobaud)?;
        self.config.tx_kilobaud = kilobaud;
        let bit_us = self.config.tx_bit_us();
        self.link.phy_mut().set_tx_bit_us(bit_us);
        Ok(())
    }

    pub fn set_rx_kilobaud(&mut self, kilobaud: u8) -> Result<(), KfdError> {
        self.ensure_idle()?;
        validate_kilobaud(kilobaud)?;
        self.config.rx_kilobaud = kilobaud;
        let bit_us = self.config.rx_bit_us();
        self.link.phy_mut().set_rx_bit_us(bit_us);
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), KfdError> {
        if self.is_operation_in_progress() {
            Err(KfdError::Config("operation in progress".into()))
        } else {
            Ok(())
        }
    }

    /// Run `f` inside a session. The session is always torn down on
    /// success, failure, or abort, and teardown is attempted even
    /// when the handshake itself failed.
    fn with_session<R>(
        &mut self,
        f: impl FnOnce(&mut SessionLink<P>, &AtomicBool) -> Result<R, KfdError>,
    ) -> Result<R, KfdError> {
        if let Err(err) = self.link.begin_session() {
            self.link.end_session();
            return Err(err);
        }
        let result = f(&mut self.link, &self.abort_flag);
        self.link.end_session();
        result
    }
}

/// One ModifyKey exchange for a single key. Returns the key's status on
/// acceptance.
fn modify_key_exchange<P: Platform>(
    link: &mut SessionLink<P>,
    abort: &AtomicBool,
    key: &KeyItem,
    timeout_ms: u64,
) -> Result<OperationStatus, KfdError> {
    let body = modify_key_command(std::slice::from_ref(key))?;
    link.send_kmm(MessageId::ModifyKeyCommand, &body);
    if abort.load(Ordering::SeqCst) {
        return Err(KfdError::Aborted);
    }
    let msg = KmmMessage::parse(link.receive_kmm(timeout_ms)?)?;
    match msg.message_id {
        MessageId::RekeyAcknowledgment => {
            let statuses = parse_rekey_ack(&msg.body);
            let status = statuses
                .iter()
                .find(|entry| entry.key_id == key.key_id)
                .map(|entry| entry.status)
                // A bare ack with no per-key detail still means the radio
                // took the key.
                .unwrap_or(OperationStatus::CommandPerformed);
            let accepted = matches!(
                status,
                OperationStatus::CommandPerformed | OperationStatus::KeyOverwritten
            ) || (key.erase && status == OperationStatus::KeyPreviouslyErased);
            if accepted {
                Ok(status)
            } else {
                Err(KfdError::KeyRejected { index: 1, status })
            }
        }
        MessageId::NegativeAcknowledgment => {
            let (acked, status) = parse_negative_ack(&msg.body);
            debug!("NAK for message 0x{:02X}", u8::from(acked));
            Err(KfdError::NegativeAck { status })
        }
        other => Err(KfdError::ProtocolViolation(format!(
            "unexpected response message id 0x{:02X}",
            u8::from(other)
        ))),
    }
}

fn report(progress: &mut Option<Progress<'_>>, current: usize, total: usize, message: &str) {
    if let Some(callback) = progress.as_mut() {
        callback(current, total, message);
    }
}

struct OpGuard {
    flag: Arc<AtomicBool>,
}

impl OpGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag: Arc::clone(flag) })
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

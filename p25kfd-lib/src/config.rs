use crate::error::KfdError;

/// Stop-cell polarity for transmitted bytes.
///
/// Both peers must agree; KFDtool hardware drives the four stop cells
/// BUSY (low) while standard asynchronous framing leaves them IDLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    Busy,
    Idle,
}

/// Three-wire interface configuration.
///
/// Created once at init; mutable afterwards only through the protocol
/// setters, which refuse changes while an operation is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwiConfig {
    pub data_pin: u8,
    pub sense_pin: u8,
    /// Transmit speed in kilobaud, 1-9 (4 is the standard rate).
    pub tx_kilobaud: u8,
    /// Receive speed in kilobaud, 1-9.
    pub rx_kilobaud: u8,
    pub stop_bits: StopBits,
    /// Hold after the radio's READY byte before the first KMM octet.
    /// Device dependent and empirically tuned; 0 works for most radios.
    pub post_ready_delay_us: u32,
    /// Send whole frames in one pass instead of byte-at-a-time with
    /// per-byte logging.
    pub fast_send: bool,
}

impl Default for TwiConfig {
    fn default() -> Self {
        Self {
            data_pin: 11,
            sense_pin: 10,
            tx_kilobaud: 4,
            rx_kilobaud: 4,
            stop_bits: StopBits::Busy,
            post_ready_delay_us: 0,
            fast_send: true,
        }
    }
}

impl TwiConfig {
    pub fn validate(&self) -> Result<(), KfdError> {
        if self.data_pin == self.sense_pin {
            return Err(KfdError::Config("DATA and SENSE must be distinct pins".into()));
        }
        validate_kilobaud(self.tx_kilobaud)?;
        validate_kilobaud(self.rx_kilobaud)?;
        Ok(())
    }

    /// Transmit bit period in microseconds.
    pub fn tx_bit_us(&self) -> u32 {
        1000 / u32::from(self.tx_kilobaud)
    }

    /// Receive bit period in microseconds.
    pub fn rx_bit_us(&self) -> u32 {
        1000 / u32::from(self.rx_kilobaud)
    }
}

pub(crate) fn validate_kilobaud(kilobaud: u8) -> Result<(), KfdError> {
    if (1..=9).contains(&kilobaud) {
        Ok(())
    } else {
        Err(KfdError::Config(format!("unsupported speed {kilobaud} kbaud (expected 1-9)")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_4_kbaud_250_us() {
        let config = TwiConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tx_bit_us(), 250);
        assert_eq!(config.rx_bit_us(), 250);
    }

    #[test]
    fn rejects_bad_speed_and_shared_pin() {
        let mut config = TwiConfig { tx_kilobaud: 0, ..TwiConfig::default() };
        assert!(config.validate().is_err());
        config.tx_kilobaud = 4;
        config.sense_pin = config.data_pin;
        assert!(config.validate().is_err());
    }
}

//! # Modbus Session Configuration
//!
//! Per-device settings of a Modbus RTU session: which device address to talk
//! to and how long to wait for the link.
//!
//! ## Timeouts
//!
//! - **Read timeout**: maximum time without *progress* while accumulating a
//!   reply. Every byte received restarts the window, so a slow but steady
//!   device never times out mid-reply.
//! - **Write timeout**: maximum time to hand a complete request to the link.

use std::time::Duration;

use crate::constants::{DEFAULT_DEVICE_ADDRESS, DEFAULT_READ_TIMEOUT_MS, DEFAULT_WRITE_TIMEOUT_MS};

/// Settings of one Modbus device session.
///
/// # Example
///
/// ```rust
/// use voltage_serial::ModbusConfig;
///
/// let config = ModbusConfig::new()
///     .with_device_address(17)
///     .with_read_timeout_ms(250);
///
/// assert_eq!(config.device_address, 17);
/// assert_eq!(config.write_timeout_ms, 1000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusConfig {
    /// Device (slave) address. 1..=247 by convention; not range-checked.
    pub device_address: u8,
    /// Reply window without progress (milliseconds).
    pub read_timeout_ms: u64,
    /// Request transmission budget (milliseconds).
    pub write_timeout_ms: u64,
}

impl ModbusConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for slow links such as radio modems or long RS-485 runs:
    /// 3 s read and write windows.
    pub fn slow_link() -> Self {
        Self {
            read_timeout_ms: 3000,
            write_timeout_ms: 3000,
            ..Self::default()
        }
    }

    /// Set the device address.
    pub fn with_device_address(mut self, address: u8) -> Self {
        self.device_address = address;
        self
    }

    /// Set the read timeout in milliseconds.
    pub fn with_read_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.read_timeout_ms = timeout_ms;
        self
    }

    /// Set the write timeout in milliseconds.
    pub fn with_write_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.write_timeout_ms = timeout_ms;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            device_address: DEFAULT_DEVICE_ADDRESS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

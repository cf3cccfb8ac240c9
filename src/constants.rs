//! Protocol and transport constants
//!
//! Modbus limits are derived from the official specification:
//! - Maximum PDU size: 253 bytes (RS485 ADU limit of 256 bytes minus
//!   slave address and CRC)
//! - Register/coil limits are calculated to fit within the PDU size constraint

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// RTU framing overhead: slave address (1) + CRC (2)
pub const RTU_OVERHEAD: usize = 3;

/// Length of an exception reply PDU: function code | 0x80, error code
pub const EXCEPTION_REPLY_LEN: usize = 2;

/// Bit marking a reply function code as an exception
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03 (Read Holding Registers)
///
/// Response PDU: 1 (FC) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: 1 (FC) + 2 (address) + 2 (quantity) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 123
pub const MAX_WRITE_REGISTERS: u16 = 123;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01 (Read Coils)
///
/// Response PDU: 1 (FC) + 1 (byte count) + ceil(N / 8) ≤ 253 → N ≤ 2008,
/// the specification rounds this down to 2000.
pub const MAX_READ_COILS: u16 = 2000;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Wire value of a coil switched ON in FC05
pub const COIL_ON: u16 = 0xFF00;

/// Wire value of a coil switched OFF in FC05
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// Connection Descriptor
// ============================================================================

/// Prefix selecting the raw TCP backend: `tcp-raw/<host>/<port>`
pub const TCP_RAW_PREFIX: &str = "tcp-raw";

/// Field separator in connection strings
pub const CONN_SEPARATOR: char = '/';

// ============================================================================
// Timing Defaults
// ============================================================================

/// Default budget for a Modbus reply with no progress
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Default budget for transmitting a Modbus request
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1000;

/// Default Modbus device address
pub const DEFAULT_DEVICE_ADDRESS: u8 = 1;

/// Granularity of the reply accumulation loop
pub const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Margin added to on-wire transfer time estimates
pub const TRANSFER_TIMEOUT_MARGIN_MS: u64 = 10;

/// Bits per character assumed when a backend cannot report its frame format
pub const FALLBACK_CHAR_BITS: u32 = 10;

/// Baud rate assumed when a backend cannot report its frame format
pub const FALLBACK_BAUD_RATE: u32 = 9600;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS as usize * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS as usize * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits() {
        let read_coil_bytes = (MAX_READ_COILS as usize).div_ceil(8);
        let read_coil_pdu = 1 + 1 + read_coil_bytes;
        assert!(read_coil_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_exception_flag() {
        assert_eq!(FC_READ_HOLDING_REGISTERS | EXCEPTION_FLAG, 0x83);
        assert_eq!(FC_WRITE_MULTIPLE_REGISTERS | EXCEPTION_FLAG, 0x90);
    }
}

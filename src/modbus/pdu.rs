//! Modbus PDU encoding and reply validation
//!
//! The shape of every supported function lives in one table,
//! [`FUNCTION_TABLE`]: request quantity limits and how the reply relates to
//! the request. Encoding, reply length prediction and reply validation are
//! all driven from it.
//!
//! | Function | Request | Success reply | Exception reply |
//! |---|---|---|---|
//! | Read coils | `01 addr count` | `01 n data[n]`, `n = ceil(count/8)` | `81 code` |
//! | Read holding registers | `03 addr count` | `03 n data[n]`, `n = 2*count` | `83 code` |
//! | Write coil | `05 addr value` | echo of request | `85 code` |
//! | Write multiple registers | `10 addr count n data[n]` | `10 addr count` | `90 code` |

use std::fmt;

use tracing::debug;

use crate::constants::{
    COIL_OFF, COIL_ON, EXCEPTION_FLAG, EXCEPTION_REPLY_LEN, FC_READ_COILS,
    FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, MAX_PDU_SIZE,
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};
use crate::error::{LinkError, LinkResult};

// ============================================================================
// PDU buffer
// ============================================================================

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> LinkResult<Self> {
        let mut pdu = Self::new();
        pdu.extend(data)?;
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> LinkResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(LinkError::argument("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> LinkResult<()> {
        self.extend(&value.to_be_bytes())
    }

    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> LinkResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(LinkError::argument(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code().is_some_and(is_exception_function)
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a reply's first byte marks a device exception
#[inline]
pub fn is_exception_function(byte: u8) -> bool {
    byte & EXCEPTION_FLAG != 0
}

// ============================================================================
// Function table
// ============================================================================

/// Supported function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = FC_READ_COILS,
    ReadHoldingRegisters = FC_READ_HOLDING_REGISTERS,
    WriteCoil = FC_WRITE_SINGLE_COIL,
    WriteMultipleRegisters = FC_WRITE_MULTIPLE_REGISTERS,
}

impl FunctionCode {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        FUNCTION_TABLE
            .iter()
            .find(|shape| shape.code.to_u8() == code)
            .map(|shape| shape.code)
    }

    pub fn shape(self) -> &'static FunctionShape {
        // The table has one row per variant
        match self {
            Self::ReadCoils => &FUNCTION_TABLE[0],
            Self::ReadHoldingRegisters => &FUNCTION_TABLE[1],
            Self::WriteCoil => &FUNCTION_TABLE[2],
            Self::WriteMultipleRegisters => &FUNCTION_TABLE[3],
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.shape().name, self.to_u8())
    }
}

/// Width of one addressed item in a byte-counted reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemWidth {
    /// Packed 8 per byte, LSB first
    Bit,
    /// Big-endian 16-bit word
    Word,
}

impl ItemWidth {
    /// Data bytes needed for `quantity` items
    pub fn data_len(self, quantity: u16) -> usize {
        match self {
            Self::Bit => (quantity as usize).div_ceil(8),
            Self::Word => quantity as usize * 2,
        }
    }
}

/// How a success reply relates to its request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyForm {
    /// Function code, byte count, then data sized by the request quantity
    ByteCounted(ItemWidth),
    /// Byte-for-byte echo of the request
    Echo,
    /// Echo of the request's function, address and quantity
    HeaderEcho,
}

/// One row of the function table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionShape {
    pub code: FunctionCode,
    pub name: &'static str,
    /// Largest quantity a single request may carry
    pub max_quantity: u16,
    pub reply: ReplyForm,
}

/// Request/reply shapes of every supported function
pub static FUNCTION_TABLE: [FunctionShape; 4] = [
    FunctionShape {
        code: FunctionCode::ReadCoils,
        name: "Read Coils",
        max_quantity: MAX_READ_COILS,
        reply: ReplyForm::ByteCounted(ItemWidth::Bit),
    },
    FunctionShape {
        code: FunctionCode::ReadHoldingRegisters,
        name: "Read Holding Registers",
        max_quantity: MAX_READ_REGISTERS,
        reply: ReplyForm::ByteCounted(ItemWidth::Word),
    },
    FunctionShape {
        code: FunctionCode::WriteCoil,
        name: "Write Single Coil",
        max_quantity: 1,
        reply: ReplyForm::Echo,
    },
    FunctionShape {
        code: FunctionCode::WriteMultipleRegisters,
        name: "Write Multiple Registers",
        max_quantity: MAX_WRITE_REGISTERS,
        reply: ReplyForm::HeaderEcho,
    },
];

/// Length of the request header echoed by [`ReplyForm::HeaderEcho`]
const HEADER_LEN: usize = 5;

// ============================================================================
// Requests
// ============================================================================

/// A validated Modbus request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    WriteCoil { address: u16, value: bool },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    pub fn read_coils(address: u16, count: u16) -> LinkResult<Self> {
        let request = Self::ReadCoils { address, count };
        request.validate()?;
        Ok(request)
    }

    pub fn read_holding_registers(address: u16, count: u16) -> LinkResult<Self> {
        let request = Self::ReadHoldingRegisters { address, count };
        request.validate()?;
        Ok(request)
    }

    pub fn write_coil(address: u16, value: bool) -> Self {
        Self::WriteCoil { address, value }
    }

    pub fn write_multiple_registers(address: u16, values: &[u16]) -> LinkResult<Self> {
        let request = Self::WriteMultipleRegisters {
            address,
            values: values.to_vec(),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Self::ReadCoils { .. } => FunctionCode::ReadCoils,
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::WriteCoil { .. } => FunctionCode::WriteCoil,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Self::ReadCoils { address, .. }
            | Self::ReadHoldingRegisters { address, .. }
            | Self::WriteCoil { address, .. }
            | Self::WriteMultipleRegisters { address, .. } => *address,
        }
    }

    /// Number of addressed items, saturating for oversized register writes
    pub fn quantity(&self) -> u16 {
        match self {
            Self::ReadCoils { count, .. } | Self::ReadHoldingRegisters { count, .. } => *count,
            Self::WriteCoil { .. } => 1,
            Self::WriteMultipleRegisters { values, .. } => {
                u16::try_from(values.len()).unwrap_or(u16::MAX)
            }
        }
    }

    /// Reject quantities outside `1..=max` for the function
    pub fn validate(&self) -> LinkResult<()> {
        let shape = self.function().shape();
        let too_many = match self {
            Self::WriteMultipleRegisters { values, .. } => values.len() > shape.max_quantity as usize,
            _ => self.quantity() > shape.max_quantity,
        };
        if self.quantity() == 0 || too_many {
            return Err(LinkError::argument(format!(
                "{}: quantity must be 1..={}, got {}",
                shape.name,
                shape.max_quantity,
                match self {
                    Self::WriteMultipleRegisters { values, .. } => values.len(),
                    _ => self.quantity() as usize,
                }
            )));
        }
        Ok(())
    }

    /// Encode the request PDU
    pub fn encode(&self) -> LinkResult<ModbusPdu> {
        self.validate()?;
        let mut pdu = ModbusPdu::new();
        pdu.push(self.function().to_u8())?;
        pdu.push_u16(self.address())?;
        match self {
            Self::ReadCoils { count, .. } | Self::ReadHoldingRegisters { count, .. } => {
                pdu.push_u16(*count)?;
            }
            Self::WriteCoil { value, .. } => {
                pdu.push_u16(if *value { COIL_ON } else { COIL_OFF })?;
            }
            Self::WriteMultipleRegisters { values, .. } => {
                pdu.push_u16(self.quantity())?;
                pdu.push((values.len() * 2) as u8)?;
                for value in values {
                    pdu.push_u16(*value)?;
                }
            }
        }
        debug!(
            "PDU built: FC={:02X} ({}), total_len={}",
            self.function().to_u8(),
            self.function().shape().name,
            pdu.len()
        );
        Ok(pdu)
    }

    /// Length of a success reply PDU
    pub fn expected_reply_len(&self) -> usize {
        match self.function().shape().reply {
            ReplyForm::ByteCounted(width) => 2 + width.data_len(self.quantity()),
            ReplyForm::Echo => HEADER_LEN,
            ReplyForm::HeaderEcho => HEADER_LEN,
        }
    }

    /// Reply length implied by its first byte: exceptions collapse to two
    /// bytes whatever was requested
    pub fn reply_len(&self, first_byte: u8) -> usize {
        if is_exception_function(first_byte) {
            EXCEPTION_REPLY_LEN
        } else {
            self.expected_reply_len()
        }
    }

    /// Validate a complete reply PDU against this request
    pub fn decode_reply(&self, reply: &[u8]) -> LinkResult<Reply> {
        let Some(&function) = reply.first() else {
            return Err(LinkError::protocol("empty reply"));
        };

        if is_exception_function(function) {
            let code = reply
                .get(1)
                .copied()
                .ok_or_else(|| LinkError::protocol("exception reply without error code"))?;
            return Err(LinkError::device(function & !EXCEPTION_FLAG, code));
        }

        let expected = self.function();
        if function != expected.to_u8() {
            return Err(LinkError::protocol(format!(
                "expected function 0x{:02X}, reply carries 0x{:02X}",
                expected.to_u8(),
                function
            )));
        }

        match expected.shape().reply {
            ReplyForm::ByteCounted(width) => self.decode_byte_counted(width, reply),
            ReplyForm::Echo => {
                let request = self.encode()?;
                if reply != request.as_slice() {
                    return Err(LinkError::protocol(format!(
                        "write reply is not an echo of the request: {:02X?}",
                        reply
                    )));
                }
                match self {
                    Self::WriteCoil { address, value } => Ok(Reply::CoilWritten {
                        address: *address,
                        value: *value,
                    }),
                    _ => Err(LinkError::protocol("echo reply for a non-echo request")),
                }
            }
            ReplyForm::HeaderEcho => {
                let request = self.encode()?;
                if reply.len() != HEADER_LEN || reply != &request.as_slice()[..HEADER_LEN] {
                    return Err(LinkError::protocol(format!(
                        "write reply header does not match the request: {:02X?}",
                        reply
                    )));
                }
                Ok(Reply::RegistersWritten {
                    address: self.address(),
                    count: self.quantity(),
                })
            }
        }
    }

    fn decode_byte_counted(&self, width: ItemWidth, reply: &[u8]) -> LinkResult<Reply> {
        let expected = width.data_len(self.quantity());
        let declared = reply
            .get(1)
            .copied()
            .ok_or_else(|| LinkError::protocol("reply without byte count"))?
            as usize;
        if declared != expected {
            return Err(LinkError::protocol(format!(
                "byte count {} does not match the {} bytes requested",
                declared, expected
            )));
        }
        let data = &reply[2..];
        if data.len() != expected {
            return Err(LinkError::protocol(format!(
                "reply carries {} data bytes, expected {}",
                data.len(),
                expected
            )));
        }

        let count = self.quantity() as usize;
        Ok(match width {
            ItemWidth::Bit => Reply::Coils(
                (0..count)
                    .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
                    .collect(),
            ),
            ItemWidth::Word => Reply::Registers(
                data.chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect(),
            ),
        })
    }
}

/// A validated success reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Coils(Vec<bool>),
    Registers(Vec<u16>),
    CoilWritten { address: u16, value: bool },
    RegistersWritten { address: u16, count: u16 },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExceptionCode;
    use proptest::prelude::*;

    #[test]
    fn test_pdu_basic_operations() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.is_empty());

        pdu.push(0x03).unwrap();
        assert_eq!(pdu.function_code(), Some(0x03));
        assert!(!pdu.is_exception());

        pdu.push_u16(0x0100).unwrap();
        pdu.push_u16(0x000A).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);

        assert!(ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE + 1]).is_err());
    }

    #[test]
    fn test_function_table_is_consistent() {
        for shape in FUNCTION_TABLE {
            assert_eq!(shape.code.shape(), &shape);
            assert_eq!(FunctionCode::from_u8(shape.code.to_u8()), Some(shape.code));
        }
        assert_eq!(FunctionCode::from_u8(0x04), None);
        assert_eq!(
            FunctionCode::ReadHoldingRegisters.to_string(),
            "Read Holding Registers (0x03)"
        );
    }

    #[test]
    fn test_encode_requests() {
        let pdu = Request::read_coils(0x0013, 0x0025).unwrap().encode().unwrap();
        assert_eq!(pdu.as_slice(), &[0x01, 0x00, 0x13, 0x00, 0x25]);

        let pdu = Request::read_holding_registers(0x006B, 3).unwrap().encode().unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);

        let pdu = Request::write_coil(0x00AC, true).encode().unwrap();
        assert_eq!(pdu.as_slice(), &[0x05, 0x00, 0xAC, 0xFF, 0x00]);
        let pdu = Request::write_coil(0x00AC, false).encode().unwrap();
        assert_eq!(pdu.as_slice(), &[0x05, 0x00, 0xAC, 0x00, 0x00]);

        let pdu = Request::write_multiple_registers(0x0001, &[0x000A, 0x0102])
            .unwrap()
            .encode()
            .unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_quantity_bounds() {
        assert!(Request::read_coils(0, 0).unwrap_err().is_argument_error());
        assert!(Request::read_coils(0, 2000).is_ok());
        assert!(Request::read_coils(0, 2001).unwrap_err().is_argument_error());
        assert!(Request::read_holding_registers(0, 125).is_ok());
        assert!(Request::read_holding_registers(0, 126).unwrap_err().is_argument_error());
        assert!(Request::write_multiple_registers(0, &[]).unwrap_err().is_argument_error());
        assert!(Request::write_multiple_registers(0, &[0; 123]).is_ok());
        assert!(Request::write_multiple_registers(0, &[0; 124])
            .unwrap_err()
            .is_argument_error());

        // Directly built variants are checked on encode
        let raw = Request::WriteMultipleRegisters {
            address: 0,
            values: vec![0; 70_000],
        };
        assert!(raw.encode().unwrap_err().is_argument_error());
    }

    #[test]
    fn test_decode_registers() {
        let request = Request::read_holding_registers(0, 2).unwrap();
        let reply = request
            .decode_reply(&[0x03, 0x04, 0x12, 0x34, 0xAB, 0xCD])
            .unwrap();
        assert_eq!(reply, Reply::Registers(vec![0x1234, 0xABCD]));

        // Declared byte count disagrees with the request
        let err = request.decode_reply(&[0x03, 0x02, 0x12, 0x34]).unwrap_err();
        assert!(matches!(err, LinkError::Protocol { .. }));
        // Wrong function echoed
        let err = request
            .decode_reply(&[0x04, 0x04, 0x12, 0x34, 0xAB, 0xCD])
            .unwrap_err();
        assert!(matches!(err, LinkError::Protocol { .. }));
    }

    #[test]
    fn test_decode_coils() {
        let request = Request::read_coils(0x0013, 10).unwrap();
        let reply = request.decode_reply(&[0x01, 0x02, 0b1100_1101, 0b0000_0001]).unwrap();
        assert_eq!(
            reply,
            Reply::Coils(vec![
                true, false, true, true, false, false, true, true, true, false
            ])
        );
    }

    #[test]
    fn test_decode_write_replies() {
        let coil = Request::write_coil(0x00AC, true);
        assert_eq!(
            coil.decode_reply(&[0x05, 0x00, 0xAC, 0xFF, 0x00]).unwrap(),
            Reply::CoilWritten {
                address: 0x00AC,
                value: true
            }
        );
        assert!(matches!(
            coil.decode_reply(&[0x05, 0x00, 0xAC, 0x00, 0x00]).unwrap_err(),
            LinkError::Protocol { .. }
        ));

        let regs = Request::write_multiple_registers(0x0001, &[1, 2]).unwrap();
        assert_eq!(
            regs.decode_reply(&[0x10, 0x00, 0x01, 0x00, 0x02]).unwrap(),
            Reply::RegistersWritten {
                address: 1,
                count: 2
            }
        );
        assert!(matches!(
            regs.decode_reply(&[0x10, 0x00, 0x02, 0x00, 0x02]).unwrap_err(),
            LinkError::Protocol { .. }
        ));
    }

    #[test]
    fn test_decode_exception() {
        let request = Request::read_holding_registers(0, 4).unwrap();
        let err = request.decode_reply(&[0x83, 0x02]).unwrap_err();
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));
        assert!(matches!(err, LinkError::Device { function: 0x03, .. }));

        let err = request.decode_reply(&[0x83, 0x42]).unwrap_err();
        assert_eq!(err.exception_code(), Some(ExceptionCode::Unknown(0x42)));
    }

    proptest! {
        #[test]
        fn prop_coil_reply_len(count in 1u16..=2000) {
            let request = Request::read_coils(0, count).unwrap();
            prop_assert_eq!(request.expected_reply_len(), 2 + (count as usize).div_ceil(8));
            prop_assert_eq!(request.reply_len(FC_READ_COILS), request.expected_reply_len());
        }

        #[test]
        fn prop_register_reply_len(count in 1u16..=125) {
            let request = Request::read_holding_registers(0, count).unwrap();
            prop_assert_eq!(request.expected_reply_len(), 2 + 2 * count as usize);
        }

        #[test]
        fn prop_high_bit_is_device_error(
            first in 0x80u8..=0xFF,
            code in any::<u8>(),
            tail in proptest::collection::vec(any::<u8>(), 0..16),
            count in 1u16..=125,
        ) {
            let request = Request::read_holding_registers(0, count).unwrap();
            prop_assert_eq!(request.reply_len(first), 2);

            let mut reply = vec![first, code];
            reply.extend(tail);
            let err = request.decode_reply(&reply).unwrap_err();
            let is_device = matches!(err, LinkError::Device { .. });
            prop_assert!(is_device);
            prop_assert_eq!(err.exception_code().map(|c| c.to_u8()), Some(code));
        }
    }
}

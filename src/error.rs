//! Error types for the transport layer and the Modbus engine
//!
//! Every operation in this crate reports one of two outcome classes besides
//! success:
//!
//! - **Argument** errors are caller bugs (out-of-range counts, malformed
//!   connection strings, empty buffers, I/O on a closed handle). They are never
//!   retried by this layer and retrying them unchanged will fail again.
//! - **Recoverable** errors come from the link or the device (connect failure,
//!   timeout, malformed reply, device exception). The caller may re-issue the
//!   request.
//!
//! None of the layers in this crate retry automatically.

use std::fmt;

use thiserror::Error;

use crate::constants::{
    EXCEPTION_ACKNOWLEDGE, EXCEPTION_GATEWAY_PATH_UNAVAILABLE, EXCEPTION_GATEWAY_TARGET_FAILED,
    EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE, EXCEPTION_ILLEGAL_FUNCTION,
    EXCEPTION_MEMORY_PARITY_ERROR, EXCEPTION_SERVER_DEVICE_BUSY, EXCEPTION_SERVER_DEVICE_FAILURE,
};

/// Result alias used across the crate
pub type LinkResult<T> = Result<T, LinkError>;

/// Outcome class of a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller bug, never retried automatically
    Argument,
    /// Link or device failure, the caller may retry
    Recoverable,
}

/// Error codes a Modbus device may return in an exception reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    /// Any code outside the standard table; real devices do send these
    Unknown(u8),
}

impl ExceptionCode {
    /// Wire value of the code
    pub fn to_u8(self) -> u8 {
        match self {
            Self::IllegalFunction => EXCEPTION_ILLEGAL_FUNCTION,
            Self::IllegalDataAddress => EXCEPTION_ILLEGAL_DATA_ADDRESS,
            Self::IllegalDataValue => EXCEPTION_ILLEGAL_DATA_VALUE,
            Self::SlaveDeviceFailure => EXCEPTION_SERVER_DEVICE_FAILURE,
            Self::Acknowledge => EXCEPTION_ACKNOWLEDGE,
            Self::SlaveDeviceBusy => EXCEPTION_SERVER_DEVICE_BUSY,
            Self::MemoryParityError => EXCEPTION_MEMORY_PARITY_ERROR,
            Self::GatewayPathUnavailable => EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
            Self::GatewayTargetFailedToRespond => EXCEPTION_GATEWAY_TARGET_FAILED,
            Self::Unknown(code) => code,
        }
    }

    /// Whether the code is one of the standard table entries
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => Self::IllegalFunction,
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Self::IllegalDataAddress,
            EXCEPTION_ILLEGAL_DATA_VALUE => Self::IllegalDataValue,
            EXCEPTION_SERVER_DEVICE_FAILURE => Self::SlaveDeviceFailure,
            EXCEPTION_ACKNOWLEDGE => Self::Acknowledge,
            EXCEPTION_SERVER_DEVICE_BUSY => Self::SlaveDeviceBusy,
            EXCEPTION_MEMORY_PARITY_ERROR => Self::MemoryParityError,
            EXCEPTION_GATEWAY_PATH_UNAVAILABLE => Self::GatewayPathUnavailable,
            EXCEPTION_GATEWAY_TARGET_FAILED => Self::GatewayTargetFailedToRespond,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "ILLEGAL FUNCTION"),
            Self::IllegalDataAddress => write!(f, "ILLEGAL DATA ADDRESS"),
            Self::IllegalDataValue => write!(f, "ILLEGAL DATA VALUE"),
            Self::SlaveDeviceFailure => write!(f, "SLAVE DEVICE FAILURE"),
            Self::Acknowledge => write!(f, "ACKNOWLEDGE"),
            Self::SlaveDeviceBusy => write!(f, "SLAVE DEVICE BUSY"),
            Self::MemoryParityError => write!(f, "MEMORY PARITY ERROR"),
            Self::GatewayPathUnavailable => write!(f, "GATEWAY PATH UNAVAILABLE"),
            Self::GatewayTargetFailedToRespond => {
                write!(f, "GATEWAY TARGET DEVICE FAILED TO RESPOND")
            }
            Self::Unknown(code) => write!(f, "unrecognized error code 0x{:02X}", code),
        }
    }
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum LinkError {
    /// Caller supplied an invalid argument
    #[error("Invalid argument: {message}")]
    Argument { message: String },

    /// Operation on a handle that is not open
    #[error("Transport handle is not open: {operation}")]
    NotOpen { operation: &'static str },

    /// Open/connect/socket failure reported by the link
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Underlying OS I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reply does not have the shape the request implies
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Device answered with an exception reply
    #[error("Device error on function 0x{function:02X}: {code}")]
    Device { function: u8, code: ExceptionCode },

    /// No progress within the configured window
    #[error("Timeout during {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Optional capability the backend does not provide
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },
}

impl LinkError {
    pub fn argument<S: Into<String>>(message: S) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn unsupported(operation: &'static str, backend: &'static str) -> Self {
        Self::Unsupported { operation, backend }
    }

    pub fn device(function: u8, code: u8) -> Self {
        Self::Device {
            function,
            code: ExceptionCode::from(code),
        }
    }

    /// Outcome class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Argument { .. } | Self::NotOpen { .. } => ErrorClass::Argument,
            _ => ErrorClass::Recoverable,
        }
    }

    /// True for caller bugs
    pub fn is_argument_error(&self) -> bool {
        self.class() == ErrorClass::Argument
    }

    /// True for link/device failures the caller may retry
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Exception code carried by a device error
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            Self::Device { code, .. } => Some(*code),
            _ => None,
        }
    }
}

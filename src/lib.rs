//! # Voltage Serial - Instrument Link Layer
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Backend-agnostic transport layer and Modbus RTU request engine for
//! measurement instruments. Heterogeneous physical links (a native serial
//! port, a TCP socket carrying a serial stream) are driven through one
//! capability interface, and the Modbus engine turns their byte streams into
//! validated, typed transactions.
//!
//! ## Features
//!
//! - **One interface, several links**: `Transport` trait with native serial
//!   and raw TCP backends, selected from a connection string
//! - **Bounded I/O**: non-blocking and deadline-bounded reads and writes,
//!   short counts instead of hidden retries
//! - **Reactor friendly**: hand a handle's readiness source to an external
//!   event loop instead of blocking
//! - **Modbus RTU**: read coils, read holding registers, write coil, write
//!   multiple registers, with device exceptions surfaced by code
//!
//! ## Connection Strings
//!
//! | String | Backend |
//! |--------|---------|
//! | `tcp-raw/<host>/<port>` | raw TCP |
//! | `/dev/ttyUSB0`, `COM3`, ... | native serial (feature `serial`) |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_serial::{Backends, ConnectionSpec, FrameParams, LinkResult, ModbusConfig, ModbusDevice, OpenMode};
//!
//! #[tokio::main]
//! async fn main() -> LinkResult<()> {
//!     let backends = Backends::standard();
//!     let spec = ConnectionSpec::parse("/dev/ttyUSB0")?;
//!     let mut handle = backends.open(&spec, OpenMode::ReadWrite).await?;
//!     handle.set_frame_params(&"9600/8n1".parse::<FrameParams>()?)?;
//!
//!     let mut device = ModbusDevice::new(handle, ModbusConfig::new().with_device_address(1));
//!     let values = device.read_holding_registers(0, 10).await?;
//!     println!("Read registers: {:?}", values);
//!
//!     device.into_handle().close().await?;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error types and outcome classes
pub mod error;

/// Protocol constants, limits and defaults
pub mod constants;

/// Packet logging helpers
pub mod logging;

/// Connection string parsing
pub mod descriptor;

/// Transport capability interface and backends
pub mod transport;

/// Bridge to externally owned event loops
pub mod event;

/// Modbus session configuration
pub mod config;

/// Modbus RTU request engine
pub mod modbus;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_serial::tokio) ===
pub use tokio;

// === Error handling ===
pub use error::{ErrorClass, ExceptionCode, LinkError, LinkResult};

// === Transport ===
pub use descriptor::ConnectionSpec;
pub use transport::{
    Backend, Backends, FlowControl, FrameFormat, FrameParams, IoMode, OpenMode, Parity, Resource,
    Transport, TransportHandle,
};

// === Events ===
pub use event::{EventCallback, HandleId, Interest, RawSource, Reactor};

// === Modbus ===
pub use config::ModbusConfig;
pub use modbus::{scan, ModbusDevice, PendingReply, Probe, Reply, Request, ScanOptions};

// === Protocol limits (commonly needed constants) ===
pub use constants::{MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Serial v{} - instrument transport and Modbus RTU engine by Evan Liu",
        VERSION
    )
}

//! Modbus RTU request engine
//!
//! [`ModbusDevice`] issues requests to one device address over any
//! [`TransportHandle`] and turns the byte stream that comes back into
//! validated, typed replies. It contains no backend-specific code.
//!
//! ## Reply accumulation
//!
//! ```text
//!  AwaitingFirstByte ──1 byte──▶ AwaitingRemainder ──all bytes──▶ Complete
//!         │                            │
//!         └────── no byte for read_timeout ─────▶ TimedOut
//! ```
//!
//! The first PDU byte decides the reply length: with the exception bit set
//! the reply collapses to two bytes whatever was requested. Every byte
//! received restarts the read-timeout window, and nothing past the expected
//! length is consumed.
//!
//! ## Split transactions
//!
//! [`ModbusDevice::send`] transmits a request and returns a [`PendingReply`];
//! [`ModbusDevice::receive`] accumulates and validates the reply later, for
//! example once an external reactor reported the handle readable. Only one
//! request may be outstanding per device.
//!
//! ```rust,no_run
//! use voltage_serial::{Backends, ConnectionSpec, ModbusConfig, ModbusDevice, OpenMode};
//!
//! # async fn example() -> voltage_serial::LinkResult<()> {
//! let backends = Backends::standard();
//! let spec = ConnectionSpec::parse("tcp-raw/10.0.0.5/4001")?;
//! let handle = backends.open(&spec, OpenMode::ReadWrite).await?;
//!
//! let mut device = ModbusDevice::new(handle, ModbusConfig::new().with_device_address(1));
//! let registers = device.read_holding_registers(0, 4).await?;
//! device.write_coil(0x10, true).await?;
//! println!("{:?}", registers);
//! # Ok(())
//! # }
//! ```

pub mod pdu;
pub mod rtu;

pub use pdu::{FunctionCode, ModbusPdu, Reply, Request};
pub use rtu::RtuLink;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ModbusConfig;
use crate::descriptor::ConnectionSpec;
use crate::error::{LinkError, LinkResult};
use crate::transport::{Backends, FrameParams, OpenMode, Resource, TransportHandle};

/// Position of the reply accumulation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    Idle,
    AwaitingFirstByte,
    AwaitingRemainder { expected: usize },
    Complete,
    TimedOut,
}

/// A request on the wire whose reply has not been read yet
#[must_use = "the reply of a sent request must be received or cancelled"]
#[derive(Debug)]
pub struct PendingReply {
    request: Request,
    sent_at: Instant,
}

impl PendingReply {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }
}

/// One Modbus device reached through one transport handle
#[derive(Debug)]
pub struct ModbusDevice {
    link: RtuLink,
    config: ModbusConfig,
    state: ReplyState,
    outstanding: bool,
}

impl ModbusDevice {
    pub fn new(handle: TransportHandle, config: ModbusConfig) -> Self {
        Self {
            link: RtuLink::new(handle, &config),
            config,
            state: ReplyState::Idle,
            outstanding: false,
        }
    }

    pub fn config(&self) -> &ModbusConfig {
        &self.config
    }

    pub fn address(&self) -> u8 {
        self.link.address()
    }

    pub fn handle(&self) -> &TransportHandle {
        self.link.handle()
    }

    pub fn handle_mut(&mut self) -> &mut TransportHandle {
        self.link.handle_mut()
    }

    /// Give the handle back, for closing or reuse with another address
    pub fn into_handle(self) -> TransportHandle {
        self.link.into_handle()
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    // ========================================================================
    // Split transactions
    // ========================================================================

    /// Validate and transmit `request` without waiting for the reply
    pub async fn send(&mut self, request: Request) -> LinkResult<PendingReply> {
        if self.outstanding {
            return Err(LinkError::argument(
                "the previous request's reply has not been received",
            ));
        }
        let pdu = request.encode()?;
        self.link.send_pdu(pdu.as_slice()).await?;
        self.outstanding = true;
        self.state = ReplyState::AwaitingFirstByte;
        debug!(
            "Sent {} to device {} ({} PDU bytes)",
            request.function(),
            self.address(),
            pdu.len()
        );
        Ok(PendingReply {
            request,
            sent_at: Instant::now(),
        })
    }

    /// Accumulate and validate the reply to `pending`.
    ///
    /// A reply that breaks off or fails framing leaves its unread bytes
    /// discarded, so the next request starts on a clean link. Device
    /// exceptions are complete frames and need no cleanup.
    pub async fn receive(&mut self, pending: PendingReply) -> LinkResult<Reply> {
        self.outstanding = false;
        let result = self.read_reply(&pending.request).await;
        match &result {
            Ok(_) => debug!(
                "Reply to {} from device {} after {:?}",
                pending.request.function(),
                self.address(),
                pending.sent_at.elapsed()
            ),
            Err(LinkError::Device { .. }) => {}
            Err(e) => {
                debug!("Reply to {} failed: {}", pending.request.function(), e);
                self.state = if e.is_timeout() {
                    ReplyState::TimedOut
                } else {
                    ReplyState::Idle
                };
                if let Err(flush_err) = self.link.handle_mut().flush().await {
                    debug!("Discarding unread reply bytes failed: {}", flush_err);
                }
            }
        }
        result
    }

    /// Give up on `pending` and discard whatever part of its reply arrived
    pub async fn cancel(&mut self, pending: PendingReply) -> LinkResult<()> {
        self.outstanding = false;
        self.state = ReplyState::Idle;
        debug!("Cancelled {}", pending.request.function());
        self.link.handle_mut().flush().await
    }

    /// Send `request` and wait for its reply
    pub async fn transact(&mut self, request: Request) -> LinkResult<Reply> {
        let pending = self.send(request).await?;
        self.receive(pending).await
    }

    async fn read_reply(&mut self, request: &Request) -> LinkResult<Reply> {
        self.link.read_address().await?;
        let pdu = self.accumulate_pdu(request).await?;
        self.link.read_and_verify_crc(pdu.as_slice()).await?;
        request.decode_reply(pdu.as_slice())
    }

    /// Run the accumulation state machine for one reply PDU
    async fn accumulate_pdu(&mut self, request: &Request) -> LinkResult<ModbusPdu> {
        let mut buf = [0u8; crate::constants::MAX_PDU_SIZE];

        self.state = ReplyState::AwaitingFirstByte;
        self.link.read_exact(&mut buf[..1], "reply function code").await?;

        let expected = request.reply_len(buf[0]);
        if expected > buf.len() {
            return Err(LinkError::protocol(format!(
                "reply of {} bytes exceeds the PDU limit",
                expected
            )));
        }
        self.state = ReplyState::AwaitingRemainder { expected };
        self.link.read_exact(&mut buf[1..expected], "reply data").await?;

        self.state = ReplyState::Complete;
        ModbusPdu::from_slice(&buf[..expected])
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    /// Read `count` (1..=2000) coils starting at `address`
    pub async fn read_coils(&mut self, address: u16, count: u16) -> LinkResult<Vec<bool>> {
        match self.transact(Request::read_coils(address, count)?).await? {
            Reply::Coils(coils) => Ok(coils),
            other => Err(unexpected(other)),
        }
    }

    /// Read `count` (1..=125) holding registers starting at `address`
    pub async fn read_holding_registers(&mut self, address: u16, count: u16) -> LinkResult<Vec<u16>> {
        match self
            .transact(Request::read_holding_registers(address, count)?)
            .await?
        {
            Reply::Registers(registers) => Ok(registers),
            other => Err(unexpected(other)),
        }
    }

    /// Switch one coil; the device must echo the request verbatim
    pub async fn write_coil(&mut self, address: u16, value: bool) -> LinkResult<()> {
        match self.transact(Request::write_coil(address, value)).await? {
            Reply::CoilWritten { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Write 1..=123 consecutive holding registers starting at `address`
    pub async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> LinkResult<()> {
        match self
            .transact(Request::write_multiple_registers(address, values)?)
            .await?
        {
            Reply::RegistersWritten { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Reply) -> LinkError {
    LinkError::protocol(format!("unexpected reply kind: {:?}", reply))
}

// ============================================================================
// Scan
// ============================================================================

/// Handshake run against each scan candidate
#[async_trait]
pub trait Probe: Send {
    /// Return `true` when the device behind `device` is the expected one
    async fn probe(&mut self, device: &mut ModbusDevice) -> bool;
}

/// What to scan and how to talk to each candidate
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Probe only this connection instead of enumerating
    pub connection: Option<ConnectionSpec>,
    /// Line parameters applied before probing
    pub frame_params: Option<FrameParams>,
    pub config: ModbusConfig,
}

impl ScanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(mut self, spec: ConnectionSpec) -> Self {
        self.connection = Some(spec);
        self
    }

    pub fn with_frame_params(mut self, params: FrameParams) -> Self {
        self.frame_params = Some(params);
        self
    }

    pub fn with_config(mut self, config: ModbusConfig) -> Self {
        self.config = config;
        self
    }
}

/// Probe every candidate resource and return those that answered.
///
/// Each candidate is opened, configured, probed and closed again whatever the
/// probe outcome. Candidates that fail to open are skipped.
pub async fn scan<P>(backends: &Backends, options: &ScanOptions, probe: &mut P) -> LinkResult<Vec<Resource>>
where
    P: Probe + ?Sized,
{
    let candidates = match &options.connection {
        Some(spec) => vec![Resource {
            spec: spec.clone(),
            description: "explicit connection".to_string(),
            backend: spec.backend_name(),
            usb_id: None,
        }],
        None => backends.enumerate()?,
    };

    let mut found = Vec::new();
    for resource in candidates {
        let mut handle = match backends.open(&resource.spec, OpenMode::ReadWrite).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!("Scan: skipping {}: {}", resource.spec, e);
                continue;
            }
        };

        let configured = match &options.frame_params {
            Some(params) => match handle.set_frame_params(params) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Scan: cannot configure {}: {}", resource.spec, e);
                    false
                }
            },
            None => true,
        };

        let mut device = ModbusDevice::new(handle, options.config);
        let answered = configured && probe.probe(&mut device).await;

        let mut handle = device.into_handle();
        if let Err(e) = handle.close().await {
            debug!("Scan: closing {} failed: {}", resource.spec, e);
        }

        if answered {
            info!("Scan: device found on {}", resource.spec);
            found.push(resource);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::rtu::encode_frame;
    use super::*;
    use crate::error::ExceptionCode;
    use crate::transport::mock::{MockBackend, MockTransport};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const ADDR: u8 = 0x01;

    async fn device(config: ModbusConfig) -> (ModbusDevice, MockTransport) {
        let mock = MockTransport::new();
        let mut handle = TransportHandle::new(
            ConnectionSpec::parse("/dev/ttyMOCK0").unwrap(),
            Box::new(mock.clone()),
        );
        handle.open(OpenMode::ReadWrite).await.unwrap();
        (ModbusDevice::new(handle, config), mock)
    }

    fn frame(pdu: &[u8]) -> Vec<u8> {
        encode_frame(ADDR, pdu).unwrap().to_vec()
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    #[tokio::test]
    async fn test_read_holding_registers_end_to_end() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        mock.expect(
            &frame(&[0x03, 0x00, 0x00, 0x00, 0x04]),
            &frame(&[0x03, 0x08, 0x00, 0x0A, 0x01, 0x02, 0xFF, 0xFF, 0x80, 0x00]),
        );

        let registers = device.read_holding_registers(0, 4).await.unwrap();
        assert_eq!(registers, vec![0x000A, 0x0102, 0xFFFF, 0x8000]);
        assert_eq!(device.state(), ReplyState::Complete);
    }

    #[tokio::test]
    async fn test_read_coils() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        mock.expect(
            &frame(&[0x01, 0x00, 0x13, 0x00, 0x0A]),
            &frame(&[0x01, 0x02, 0xCD, 0x01]),
        );
        let coils = device.read_coils(0x13, 10).await.unwrap();
        assert_eq!(coils.len(), 10);
        assert_eq!(&coils[..4], &[true, false, true, true]);
        assert!(coils[8]);
    }

    #[tokio::test]
    async fn test_write_coil_is_idempotent() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        let request = frame(&[0x05, 0x00, 0xAC, 0xFF, 0x00]);
        mock.expect(&request, &request);
        mock.expect(&request, &request);

        assert_ok!(device.write_coil(0xAC, true).await);
        let state_after_first = device.state();
        assert_ok!(device.write_coil(0xAC, true).await);
        assert_eq!(device.state(), state_after_first);

        let written = mock.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], written[1]);
    }

    #[tokio::test]
    async fn test_write_multiple_registers() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        mock.expect(
            &frame(&[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]),
            &frame(&[0x10, 0x00, 0x01, 0x00, 0x02]),
        );
        assert_ok!(device.write_multiple_registers(1, &[0x000A, 0x0102]).await);
    }

    #[tokio::test]
    async fn test_write_multiple_registers_bounds_checked_before_io() {
        let (mut device, mock) = device(ModbusConfig::new()).await;

        let err = device.write_multiple_registers(0, &[]).await.unwrap_err();
        assert!(err.is_argument_error());
        let err = device.write_multiple_registers(0, &[0u16; 124]).await.unwrap_err();
        assert!(err.is_argument_error());
        let err = device.read_holding_registers(0, 126).await.unwrap_err();
        assert!(err.is_argument_error());

        assert!(mock.written().is_empty());
    }

    #[tokio::test]
    async fn test_device_error_collapses_reply() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        mock.set_chunk_size(1);
        // Exception reply, followed by bytes that belong to nobody
        let mut reply = frame(&[0x83, 0x02]);
        reply.extend_from_slice(&[0xDE, 0xAD]);
        mock.expect(&frame(&[0x03, 0x00, 0x00, 0x00, 0x7D]), &reply);

        let err = device.read_holding_registers(0, 125).await.unwrap_err();
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));
        assert!(matches!(err, LinkError::Device { function: 0x03, .. }));
        // Only address + 2 PDU bytes + CRC were consumed
        assert_eq!(mock.pending_input(), 2);
    }

    #[tokio::test]
    async fn test_crc_mismatch_is_protocol_error() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        let mut reply = frame(&[0x03, 0x02, 0x00, 0x01]);
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        mock.expect(&frame(&[0x03, 0x00, 0x00, 0x00, 0x01]), &reply);

        let err = device.read_holding_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, LinkError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let (mut device, _mock) = device(ModbusConfig::new().with_read_timeout_ms(60)).await;

        let start = Instant::now();
        let err = device.read_holding_registers(0, 1).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout());
        assert!(err.is_recoverable());
        assert!(elapsed >= Duration::from_millis(60));
        assert_eq!(device.state(), ReplyState::TimedOut);
    }

    #[tokio::test]
    async fn test_slow_device_progress_restarts_window() {
        let (mut device, mock) = device(ModbusConfig::new().with_read_timeout_ms(60)).await;
        let reply = frame(&[0x03, 0x02, 0x12, 0x34]);

        let feeder = mock.clone();
        let writer = tokio::spawn(async move {
            // The whole reply takes longer than the window, each gap does not
            for byte in reply {
                tokio::time::sleep(Duration::from_millis(15)).await;
                feeder.push_input(&[byte]);
            }
        });

        let registers = device.read_holding_registers(0, 1).await.unwrap();
        assert_eq!(registers, vec![0x1234]);
        writer.await.unwrap();
    }

    // ========================================================================
    // Split transactions
    // ========================================================================

    #[tokio::test]
    async fn test_send_then_receive() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        mock.expect(
            &frame(&[0x03, 0x00, 0x10, 0x00, 0x01]),
            &frame(&[0x03, 0x02, 0xBE, 0xEF]),
        );

        let pending = device
            .send(Request::read_holding_registers(0x10, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(device.state(), ReplyState::AwaitingFirstByte);
        assert_eq!(pending.request().function(), FunctionCode::ReadHoldingRegisters);

        // A second request while one is outstanding is refused
        let err = device.send(Request::write_coil(0, true)).await.unwrap_err();
        assert!(err.is_argument_error());

        let reply = device.receive(pending).await.unwrap();
        assert_eq!(reply, Reply::Registers(vec![0xBEEF]));
    }

    #[tokio::test]
    async fn test_cancel_discards_partial_reply() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        mock.reply_next(&[ADDR, 0x03]);

        let pending = device.send(Request::read_coils(0, 1).unwrap()).await.unwrap();
        device.cancel(pending).await.unwrap();
        assert_eq!(mock.pending_input(), 0);
        assert_eq!(device.state(), ReplyState::Idle);
        assert_ok!(device.send(Request::write_coil(0, false)).await.map(|_| ()));
    }

    #[tokio::test]
    async fn test_reply_from_wrong_address() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        let reply = encode_frame(0x02, &[0x05, 0x00, 0x01, 0x00, 0x00]).unwrap();
        mock.reply_next(&reply);
        assert_err!(device.write_coil(1, false).await);
    }

    #[tokio::test]
    async fn test_failed_reply_does_not_leak_into_next_transaction() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        mock.reply_next(&encode_frame(0x02, &[0x03, 0x02, 0x00, 0x07]).unwrap());
        mock.reply_next(&frame(&[0x03, 0x02, 0x00, 0x2A]));

        let err = device.read_holding_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, LinkError::Protocol { .. }));
        assert_eq!(device.state(), ReplyState::Idle);
        assert_eq!(mock.pending_input(), 0);

        let registers = device.read_holding_registers(0, 1).await.unwrap();
        assert_eq!(registers, vec![0x2A]);
        assert_eq!(device.state(), ReplyState::Complete);
    }

    #[tokio::test]
    async fn test_crc_failure_discards_rest_of_input() {
        let (mut device, mock) = device(ModbusConfig::new()).await;
        let mut reply = frame(&[0x03, 0x02, 0x00, 0x01]);
        reply[3] ^= 0x01;
        reply.extend_from_slice(&[0xEE, 0xEE, 0xEE]);
        mock.reply_next(&reply);

        let err = device.read_holding_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, LinkError::Protocol { .. }));
        assert_eq!(mock.pending_input(), 0);
        assert_eq!(device.state(), ReplyState::Idle);
    }

    #[tokio::test]
    async fn test_timeout_after_partial_reply_discards_fragment() {
        let (mut device, mock) = device(ModbusConfig::new().with_read_timeout_ms(40)).await;
        // Address and function code arrive, the rest never does
        mock.reply_next(&[ADDR, 0x03]);

        let err = device.read_holding_registers(0, 4).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(device.state(), ReplyState::TimedOut);

        mock.reply_next(&frame(&[0x05, 0x00, 0x01, 0xFF, 0x00]));
        assert_ok!(device.write_coil(1, true).await);
    }

    // ========================================================================
    // Scan
    // ========================================================================

    struct ReadsRegisterZero;

    #[async_trait]
    impl Probe for ReadsRegisterZero {
        async fn probe(&mut self, device: &mut ModbusDevice) -> bool {
            device.read_holding_registers(0, 1).await.is_ok()
        }
    }

    fn mock_resource(path: &str) -> Resource {
        Resource {
            spec: ConnectionSpec::parse(path).unwrap(),
            description: "mock".to_string(),
            backend: "mock",
            usb_id: None,
        }
    }

    #[tokio::test]
    async fn test_scan_collects_answering_devices() {
        let mock = MockTransport::new();
        // First candidate answers, second stays silent
        mock.expect(
            &frame(&[0x03, 0x00, 0x00, 0x00, 0x01]),
            &frame(&[0x03, 0x02, 0x00, 0x2A]),
        );
        let backends = Backends::new().with(
            MockBackend::new(mock.clone())
                .with_resource(mock_resource("/dev/ttyMOCK0"))
                .with_resource(mock_resource("/dev/ttyMOCK1")),
        );
        let options = ScanOptions::new()
            .with_frame_params(FrameParams::new(19200))
            .with_config(ModbusConfig::new().with_read_timeout_ms(30));

        let found = scan(&backends, &options, &mut ReadsRegisterZero).await.unwrap();
        assert_eq!(found, vec![mock_resource("/dev/ttyMOCK0")]);
        assert_eq!(mock.open_count(), 2);
        assert!(!mock.is_open());
        assert_eq!(mock.frame_params(), Some(FrameParams::new(19200)));
    }

    #[tokio::test]
    async fn test_scan_explicit_connection() {
        let mock = MockTransport::new();
        let backends = Backends::new().with(MockBackend::new(mock.clone()));
        let spec = ConnectionSpec::parse("/dev/ttyACM7").unwrap();
        let options = ScanOptions::new()
            .with_connection(spec.clone())
            .with_config(ModbusConfig::new().with_read_timeout_ms(20));

        let found = scan(&backends, &options, &mut ReadsRegisterZero).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(mock.open_count(), 1);
        assert!(!mock.is_open());
    }
}

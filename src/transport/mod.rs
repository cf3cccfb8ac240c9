//! Transport capability interface
//!
//! Every physical link is driven through the same [`Transport`] trait, so
//! protocol engines never branch on the backend. A [`TransportHandle`] wraps
//! one backend instance and enforces the usage rules shared by all of them:
//!
//! - I/O is only valid between a successful `open` and `close`; afterwards it
//!   fails with [`LinkError::NotOpen`] instead of silently doing nothing.
//! - Writes on a read-only handle and empty buffers are argument errors.
//! - At most one event registration is live per handle, and closing the
//!   handle makes it inert.
//!
//! Backends are created through an explicitly constructed [`Backends`] set:
//!
//! ```rust,no_run
//! use voltage_serial::descriptor::ConnectionSpec;
//! use voltage_serial::transport::{Backends, IoMode, OpenMode};
//! use std::time::Duration;
//!
//! # async fn example() -> voltage_serial::LinkResult<()> {
//! let backends = Backends::standard();
//! let spec = ConnectionSpec::parse("tcp-raw/192.168.1.100/502")?;
//! let mut handle = backends.open(&spec, OpenMode::ReadWrite).await?;
//!
//! handle.write(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A], IoMode::NonBlocking).await?;
//! let mut buf = [0u8; 7];
//! let n = handle.read(&mut buf, IoMode::Blocking(Duration::from_millis(500))).await?;
//! println!("received {} bytes", n);
//! handle.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod params;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp_raw;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use params::{FlowControl, FrameFormat, FrameParams, Parity};

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace};

use crate::constants::{FALLBACK_BAUD_RATE, FALLBACK_CHAR_BITS, TRANSFER_TIMEOUT_MARGIN_MS};
use crate::descriptor::ConnectionSpec;
use crate::error::{LinkError, LinkResult};
use crate::event::{EventCallback, EventSlot, HandleId, Interest, RawSource, Reactor};
use crate::logging::{log_packet, Direction};

/// Access mode requested at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        self == Self::ReadWrite
    }
}

/// Blocking contract of a single read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Resolve on the first poll with whatever the link can take or give now
    NonBlocking,
    /// Keep going until the buffer is done or the limit elapses
    Blocking(Duration),
}

impl IoMode {
    fn deadline(self) -> Instant {
        match self {
            Self::NonBlocking => Instant::now(),
            Self::Blocking(limit) => Instant::now() + limit,
        }
    }
}

/// Operations every backend implements
///
/// Methods are called through [`TransportHandle`], which has already checked
/// that the handle is open and the arguments are sane.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Backend name used in logs and errors
    fn backend(&self) -> &'static str;

    async fn open(&mut self, mode: OpenMode) -> LinkResult<()>;

    async fn close(&mut self) -> LinkResult<()>;

    /// Returns the number of bytes accepted, which may be short
    async fn write(&mut self, data: &[u8], mode: IoMode) -> LinkResult<usize>;

    /// Returns the number of bytes read; zero is a valid non-blocking result
    async fn read(&mut self, buf: &mut [u8], mode: IoMode) -> LinkResult<usize>;

    /// Apply line parameters. Links without line control accept and succeed.
    fn set_frame_params(&mut self, params: &FrameParams) -> LinkResult<()>;

    /// Drive the RTS/DTR lines; `None` leaves a line untouched
    fn set_handshake_lines(&mut self, rts: Option<bool>, dtr: Option<bool>) -> LinkResult<()>;

    /// Currently applied character shape, when the link has one
    fn frame_format(&self) -> LinkResult<FrameFormat>;

    /// Bytes received but not read yet
    async fn queued_input_size(&mut self) -> LinkResult<usize>;

    /// Discard queued, unread input
    async fn flush(&mut self) -> LinkResult<()>;

    /// Wait until queued output has left the host
    async fn drain(&mut self) -> LinkResult<()>;

    /// Native waitable handed to an external reactor
    fn event_source(&self) -> LinkResult<RawSource>;
}

/// A candidate link found by enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub spec: ConnectionSpec,
    pub description: String,
    pub backend: &'static str,
    /// USB vendor and product id, when the link sits on a USB bridge
    pub usb_id: Option<(u16, u16)>,
}

/// Factory for one kind of transport
pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether this backend serves the given connection spec
    fn accepts(&self, spec: &ConnectionSpec) -> bool;

    /// Create a closed transport for `spec`
    fn create(&self, spec: &ConnectionSpec) -> LinkResult<Box<dyn Transport>>;

    fn enumerate(&self) -> LinkResult<Vec<Resource>> {
        Err(LinkError::unsupported("enumerate", self.name()))
    }

    fn find_by_identity(&self, vendor_id: u16, product_id: u16) -> LinkResult<Vec<Resource>> {
        let _ = (vendor_id, product_id);
        Err(LinkError::unsupported("find_by_identity", self.name()))
    }
}

/// The set of backends available to a session, built explicitly at startup
#[derive(Debug, Default)]
pub struct Backends {
    backends: Vec<Box<dyn Backend>>,
}

impl Backends {
    /// An empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Native serial (feature `serial`) and raw TCP
    pub fn standard() -> Self {
        let set = Self::new();
        #[cfg(feature = "serial")]
        let set = set.with(serial::SerialBackend);
        set.with(tcp_raw::TcpRawBackend)
    }

    pub fn with<B: Backend + 'static>(mut self, backend: B) -> Self {
        self.backends.push(Box::new(backend));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Create a closed handle for `spec` using the first backend accepting it
    pub fn handle(&self, spec: &ConnectionSpec) -> LinkResult<TransportHandle> {
        let backend = self
            .backends
            .iter()
            .find(|b| b.accepts(spec))
            .ok_or_else(|| LinkError::argument(format!("no backend available for '{}'", spec)))?;
        let transport = backend.create(spec)?;
        Ok(TransportHandle::new(spec.clone(), transport))
    }

    /// Create and open a handle for `spec`
    pub async fn open(&self, spec: &ConnectionSpec, mode: OpenMode) -> LinkResult<TransportHandle> {
        let mut handle = self.handle(spec)?;
        handle.open(mode).await?;
        Ok(handle)
    }

    /// Resources of every backend that can enumerate; others are skipped
    pub fn enumerate(&self) -> LinkResult<Vec<Resource>> {
        self.collect(|b| b.enumerate())
    }

    /// Resources with the given USB identity, across all backends
    pub fn find_by_identity(&self, vendor_id: u16, product_id: u16) -> LinkResult<Vec<Resource>> {
        self.collect(|b| b.find_by_identity(vendor_id, product_id))
    }

    fn collect<F>(&self, mut query: F) -> LinkResult<Vec<Resource>>
    where
        F: FnMut(&dyn Backend) -> LinkResult<Vec<Resource>>,
    {
        let mut resources = Vec::new();
        for backend in &self.backends {
            match query(backend.as_ref()) {
                Ok(found) => resources.extend(found),
                Err(LinkError::Unsupported { operation, .. }) => {
                    trace!("Backend {} does not support {}", backend.name(), operation);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resources)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Closed,
    Open(OpenMode),
}

/// Exclusive, per-connection state of one link
#[derive(Debug)]
pub struct TransportHandle {
    id: HandleId,
    spec: ConnectionSpec,
    transport: Box<dyn Transport>,
    state: HandleState,
    frame_params: Option<FrameParams>,
    events: EventSlot,
    packet_logging: bool,
}

impl TransportHandle {
    /// Wrap a closed transport
    pub fn new(spec: ConnectionSpec, transport: Box<dyn Transport>) -> Self {
        Self {
            id: HandleId::next(),
            spec,
            transport,
            state: HandleState::Closed,
            frame_params: None,
            events: EventSlot::default(),
            packet_logging: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    pub fn backend(&self) -> &'static str {
        self.transport.backend()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, HandleState::Open(_))
    }

    pub fn open_mode(&self) -> Option<OpenMode> {
        match self.state {
            HandleState::Open(mode) => Some(mode),
            HandleState::Closed => None,
        }
    }

    /// Parameters applied by the last successful `set_frame_params`
    pub fn frame_params(&self) -> Option<&FrameParams> {
        self.frame_params.as_ref()
    }

    /// Log every successful read and write as a hex dump at `debug` level
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn ensure_open(&self, operation: &'static str) -> LinkResult<OpenMode> {
        match self.state {
            HandleState::Open(mode) => Ok(mode),
            HandleState::Closed => Err(LinkError::NotOpen { operation }),
        }
    }

    pub async fn open(&mut self, mode: OpenMode) -> LinkResult<()> {
        if self.is_open() {
            return Err(LinkError::argument(format!("'{}' is already open", self.spec)));
        }
        self.transport.open(mode).await?;
        self.state = HandleState::Open(mode);
        info!("Opened {} ({:?}) via {} backend", self.spec, mode, self.backend());
        Ok(())
    }

    /// Close the link. Closing a closed handle is an error, not a crash.
    pub async fn close(&mut self) -> LinkResult<()> {
        self.ensure_open("close")?;
        self.state = HandleState::Closed;
        self.events.disarm();
        self.transport.close().await?;
        info!("Closed {}", self.spec);
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8], mode: IoMode) -> LinkResult<usize> {
        let open_mode = self.ensure_open("write")?;
        if !open_mode.is_writable() {
            return Err(LinkError::argument(format!(
                "'{}' is open read-only",
                self.spec
            )));
        }
        if data.is_empty() {
            return Err(LinkError::argument("write buffer is empty"));
        }

        let written = self.transport.write(data, mode).await?;
        if self.packet_logging && written > 0 {
            log_packet(self.backend(), Direction::Send, &data[..written]);
        }
        Ok(written)
    }

    /// Write all of `data`, looping over short writes until `limit` elapses
    pub async fn write_all(&mut self, data: &[u8], limit: Duration) -> LinkResult<()> {
        let deadline = Instant::now() + limit;
        let mut sent = 0;
        while sent < data.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LinkError::timeout(
                    format!("write of {} bytes ({} sent)", data.len(), sent),
                    limit.as_millis() as u64,
                ));
            }
            sent += self.write(&data[sent..], IoMode::Blocking(remaining)).await?;
        }
        Ok(())
    }

    pub async fn read(&mut self, buf: &mut [u8], mode: IoMode) -> LinkResult<usize> {
        self.ensure_open("read")?;
        if buf.is_empty() {
            return Err(LinkError::argument("read buffer is empty"));
        }

        let read = self.transport.read(buf, mode).await?;
        if self.packet_logging && read > 0 {
            log_packet(self.backend(), Direction::Receive, &buf[..read]);
        }
        Ok(read)
    }

    pub fn set_frame_params(&mut self, params: &FrameParams) -> LinkResult<()> {
        self.ensure_open("set_frame_params")?;
        params.validate()?;
        self.transport.set_frame_params(params)?;
        debug!("{}: frame parameters {}", self.spec, params);
        self.frame_params = Some(*params);
        Ok(())
    }

    pub fn set_handshake_lines(&mut self, rts: Option<bool>, dtr: Option<bool>) -> LinkResult<()> {
        self.ensure_open("set_handshake_lines")?;
        self.transport.set_handshake_lines(rts, dtr)
    }

    pub fn frame_format(&self) -> LinkResult<FrameFormat> {
        self.ensure_open("frame_format")?;
        self.transport.frame_format()
    }

    /// Time `bytes` characters take on the wire plus a fixed margin.
    ///
    /// Falls back to 10-bit characters at 9600 baud when the backend cannot
    /// report a frame format.
    pub fn transfer_timeout(&self, bytes: usize) -> Duration {
        let format = self
            .frame_format()
            .unwrap_or(FrameFormat {
                baud_rate: FALLBACK_BAUD_RATE,
                bits: FALLBACK_CHAR_BITS,
            });
        format.transfer_time(bytes) + Duration::from_millis(TRANSFER_TIMEOUT_MARGIN_MS)
    }

    /// Best effort: 0 when closed or when the backend cannot tell
    pub async fn queued_input_size(&mut self) -> usize {
        if !self.is_open() {
            return 0;
        }
        match self.transport.queued_input_size().await {
            Ok(n) => n,
            Err(e) => {
                debug!("{}: queued input size unavailable: {}", self.spec, e);
                0
            }
        }
    }

    pub async fn flush(&mut self) -> LinkResult<()> {
        self.ensure_open("flush")?;
        self.transport.flush().await
    }

    pub async fn drain(&mut self) -> LinkResult<()> {
        self.ensure_open("drain")?;
        self.transport.drain().await
    }

    /// Hand this handle's waitable to an external reactor
    pub fn register_for_events(
        &mut self,
        reactor: &mut dyn Reactor,
        interest: Interest,
        timeout: Option<Duration>,
        callback: EventCallback,
    ) -> LinkResult<()> {
        self.ensure_open("register_for_events")?;
        let source = self.transport.event_source()?;
        self.events
            .register(reactor, self.id, source, interest, timeout, callback)
    }

    pub fn unregister_from_events(&mut self, reactor: &mut dyn Reactor) -> LinkResult<()> {
        self.events.unregister(reactor, self.id)
    }

    /// Whether an event registration is live
    pub fn has_event_registration(&self) -> bool {
        self.events.is_active()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.events.disarm();
    }
}

/// Read from a stream honouring `mode`: take whatever is ready, and when
/// blocking keep filling `buf` until it is full or the deadline passes.
/// A peer EOF before any byte is reported as `UnexpectedEof`.
pub(crate) async fn read_stream<R>(reader: &mut R, buf: &mut [u8], mode: IoMode) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = mode.deadline();
    let mut filled = 0;
    while filled < buf.len() {
        match timeout_at(deadline, reader.read(&mut buf[filled..])).await {
            Ok(Ok(0)) if filled == 0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) if filled == 0 => return Err(e),
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }
    Ok(filled)
}

/// Write to a stream honouring `mode`. A failure with no progress is an
/// error; with partial progress the partial count is returned.
pub(crate) async fn write_stream<W>(writer: &mut W, data: &[u8], mode: IoMode) -> io::Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let deadline = mode.deadline();
    let mut sent = 0;
    while sent < data.len() {
        match timeout_at(deadline, writer.write(&data[sent..])).await {
            Ok(Ok(0)) if sent == 0 => return Err(io::ErrorKind::WriteZero.into()),
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => sent += n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) if sent == 0 => return Err(e),
            Ok(Err(e)) => {
                debug!("Short write after {} bytes: {}", sent, e);
                break;
            }
            Err(_) => break,
        }
    }
    Ok(sent)
}

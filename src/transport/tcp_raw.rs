//! Raw TCP backend
//!
//! Presents a TCP connection as a serial link so protocol engines stay
//! backend-agnostic. A stream has no physical framing or control lines, so
//! `set_frame_params` and `set_handshake_lines` are accepted and succeed.
//!
//! Blocking reads wait on socket readiness up to the deadline and return
//! whatever has accumulated by then; a short count is not an error.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::{
    read_stream, write_stream, Backend, FrameFormat, FrameParams, IoMode, OpenMode, Transport,
};
use crate::constants::TCP_RAW_PREFIX;
use crate::descriptor::ConnectionSpec;
use crate::error::{LinkError, LinkResult};
use crate::event::RawSource;
use std::io;
use std::time::Duration;

const BACKEND: &str = TCP_RAW_PREFIX;

/// Upper bound on what `queued_input_size` can observe in one peek
const PEEK_WINDOW: usize = 4096;

/// Raw TCP transport
#[derive(Debug)]
pub struct TcpRawTransport {
    host: String,
    port: String,
    stream: Option<TcpStream>,
}

impl TcpRawTransport {
    pub fn new<H: Into<String>, P: Into<String>>(host: H, port: P) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
            stream: None,
        }
    }

    /// `host:port` as handed to the resolver
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn stream(&mut self) -> LinkResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(LinkError::NotOpen {
            operation: "socket access",
        })
    }

    fn map_io(&self, e: io::Error) -> LinkError {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                LinkError::transport(format!("{} closed the connection", self.address()))
            }
            _ => LinkError::Io(e),
        }
    }
}

#[async_trait]
impl Transport for TcpRawTransport {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn open(&mut self, _mode: OpenMode) -> LinkResult<()> {
        let address = self.address();
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| LinkError::transport(format!("connect to {} failed: {}", address, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY not applied on {}: {}", address, e);
        }
        self.stream = Some(stream);
        info!("Connected to {}", address);
        Ok(())
    }

    async fn close(&mut self) -> LinkResult<()> {
        let mut stream = self
            .stream
            .take()
            .ok_or(LinkError::NotOpen { operation: "close" })?;
        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.address(), e);
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8], mode: IoMode) -> LinkResult<usize> {
        let stream = self.stream()?;
        match write_stream(stream, data, mode).await {
            Ok(n) => Ok(n),
            Err(e) => Err(self.map_io(e)),
        }
    }

    async fn read(&mut self, buf: &mut [u8], mode: IoMode) -> LinkResult<usize> {
        let stream = self.stream()?;
        match read_stream(stream, buf, mode).await {
            Ok(n) => Ok(n),
            Err(e) => Err(self.map_io(e)),
        }
    }

    fn set_frame_params(&mut self, params: &FrameParams) -> LinkResult<()> {
        trace!("{}: ignoring frame parameters {}", self.address(), params);
        Ok(())
    }

    fn set_handshake_lines(&mut self, rts: Option<bool>, dtr: Option<bool>) -> LinkResult<()> {
        trace!(
            "{}: ignoring handshake lines rts={:?} dtr={:?}",
            self.address(),
            rts,
            dtr
        );
        Ok(())
    }

    fn frame_format(&self) -> LinkResult<FrameFormat> {
        Err(LinkError::unsupported("frame_format", BACKEND))
    }

    async fn queued_input_size(&mut self) -> LinkResult<usize> {
        let stream = self.stream()?;
        let mut window = [0u8; PEEK_WINDOW];
        match timeout(Duration::ZERO, stream.peek(&mut window)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(LinkError::Io(e)),
            Err(_) => Ok(0),
        }
    }

    async fn flush(&mut self) -> LinkResult<()> {
        let stream = self.stream()?;
        let mut scratch = [0u8; PEEK_WINDOW];
        let mut discarded = 0;
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(LinkError::Io(e)),
            }
        }
        trace!("Discarded {} queued bytes", discarded);
        Ok(())
    }

    async fn drain(&mut self) -> LinkResult<()> {
        self.stream()?.flush().await?;
        Ok(())
    }

    #[cfg(unix)]
    fn event_source(&self) -> LinkResult<RawSource> {
        use std::os::unix::io::AsRawFd;
        self.stream
            .as_ref()
            .map(|s| s.as_raw_fd())
            .ok_or(LinkError::NotOpen {
                operation: "event_source",
            })
    }

    #[cfg(not(unix))]
    fn event_source(&self) -> LinkResult<RawSource> {
        Err(LinkError::unsupported("event_source", BACKEND))
    }
}

/// Backend for `tcp-raw/<host>/<port>` connection strings
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpRawBackend;

impl Backend for TcpRawBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn accepts(&self, spec: &ConnectionSpec) -> bool {
        matches!(spec, ConnectionSpec::TcpRaw { .. })
    }

    fn create(&self, spec: &ConnectionSpec) -> LinkResult<Box<dyn Transport>> {
        match spec {
            ConnectionSpec::TcpRaw { host, port } => {
                Ok(Box::new(TcpRawTransport::new(host.clone(), port.clone())))
            }
            other => Err(LinkError::argument(format!(
                "{} backend cannot open '{}'",
                BACKEND, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    async fn connected_pair() -> (TcpRawTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut transport = TcpRawTransport::new("127.0.0.1", port.to_string());
        let (opened, accepted) = tokio::join!(transport.open(OpenMode::ReadWrite), listener.accept());
        opened.unwrap();
        (transport, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = TcpRawTransport::new("127.0.0.1", port.to_string());
        let err = transport.open(OpenMode::ReadWrite).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_write_and_blocking_read() {
        let (mut transport, mut peer) = connected_pair().await;

        let n = transport
            .write(&[0x01, 0x03, 0x00], IoMode::Blocking(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(n, 3);
        let mut got = [0u8; 3];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(got, [0x01, 0x03, 0x00]);

        peer.write_all(&[0xAA, 0xBB]).await.unwrap();
        let mut buf = [0u8; 2];
        let n = transport
            .read(&mut buf, IoMode::Blocking(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf, [0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn test_blocking_read_returns_short_count_at_deadline() {
        let (mut transport, mut peer) = connected_pair().await;
        peer.write_all(&[0x11]).await.unwrap();

        let start = Instant::now();
        let mut buf = [0u8; 4];
        let n = transport
            .read(&mut buf, IoMode::Blocking(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_nonblocking_read_without_data() {
        let (mut transport, _peer) = connected_pair().await;
        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf, IoMode::NonBlocking).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_is_transport_error() {
        let (mut transport, peer) = connected_pair().await;
        drop(peer);
        let mut buf = [0u8; 4];
        let err = transport
            .read(&mut buf, IoMode::Blocking(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_line_control_is_accepted() {
        let (mut transport, _peer) = connected_pair().await;
        transport
            .set_frame_params(&FrameParams::new(115200))
            .unwrap();
        transport.set_handshake_lines(Some(true), Some(false)).unwrap();
        assert!(matches!(
            transport.frame_format().unwrap_err(),
            LinkError::Unsupported { .. }
        ));
    }

    #[tokio::test]
    async fn test_drain_after_write() {
        let (mut transport, mut peer) = connected_pair().await;
        let n = transport
            .write(&[0x01, 0x05, 0x00, 0x10], IoMode::Blocking(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(n, 4);
        transport.drain().await.unwrap();

        let mut got = [0u8; 4];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(got, [0x01, 0x05, 0x00, 0x10]);

        transport.close().await.unwrap();
        assert!(transport.drain().await.is_err());
    }

    #[tokio::test]
    async fn test_queued_input_and_flush() {
        let (mut transport, mut peer) = connected_pair().await;
        peer.write_all(&[1, 2, 3, 4]).await.unwrap();

        // Wait for the bytes to land in the socket buffer
        let deadline = Instant::now() + Duration::from_secs(1);
        while transport.queued_input_size().await.unwrap() < 4 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.queued_input_size().await.unwrap(), 4);

        transport.flush().await.unwrap();
        assert_eq!(transport.queued_input_size().await.unwrap(), 0);
    }

    #[test]
    fn test_backend_create() {
        let backend = TcpRawBackend;
        let spec = ConnectionSpec::parse("tcp-raw/localhost/5020").unwrap();
        assert!(backend.accepts(&spec));
        assert!(backend.create(&spec).is_ok());
        assert!(backend.enumerate().is_err());

        let serial = ConnectionSpec::parse("/dev/ttyUSB0").unwrap();
        assert!(!backend.accepts(&serial));
        assert!(backend.create(&serial).unwrap_err().is_argument_error());
    }
}

//! Scripted in-memory transport for driver and engine tests
//!
//! A [`MockTransport`] is cheap to clone; clones share state, so a test keeps
//! one copy for inspection after boxing another into a [`TransportHandle`].
//!
//! ```rust,ignore
//! use voltage_serial::transport::mock::MockTransport;
//!
//! let mock = MockTransport::new();
//! // Reply to this exact request once it has been written
//! mock.expect(&[0x01, 0x05, 0x00, 0x10, 0xFF, 0x00], &[0x01, 0x05, 0x00, 0x10, 0xFF, 0x00]);
//! ```
//!
//! [`TransportHandle`]: super::TransportHandle

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::time::sleep;

use super::{Backend, FrameFormat, FrameParams, IoMode, OpenMode, Resource, Transport};
use crate::descriptor::ConnectionSpec;
use crate::error::{LinkError, LinkResult};
use crate::event::RawSource;

const BACKEND: &str = "mock";

#[derive(Debug)]
struct Exchange {
    /// `None` answers whatever is written next
    request: Option<Vec<u8>>,
    reply: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    open_count: usize,
    fail_next_open: bool,
    script: VecDeque<Exchange>,
    input: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    frame_params: Option<FrameParams>,
    handshake: (Option<bool>, Option<bool>),
    chunk_size: Option<usize>,
    reads: usize,
}

/// In-memory transport driven by a script of request/reply exchanges
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `reply` to become readable once `request` has been written
    pub fn expect(&self, request: &[u8], reply: &[u8]) {
        self.state().script.push_back(Exchange {
            request: Some(request.to_vec()),
            reply: reply.to_vec(),
        });
    }

    /// Queue `reply` for the next write, whatever it contains
    pub fn reply_next(&self, reply: &[u8]) {
        self.state().script.push_back(Exchange {
            request: None,
            reply: reply.to_vec(),
        });
    }

    /// Make bytes readable right away
    pub fn push_input(&self, data: &[u8]) {
        self.state().input.extend(data);
    }

    /// Deliver at most `size` bytes per read
    pub fn set_chunk_size(&self, size: usize) {
        self.state().chunk_size = Some(size.max(1));
    }

    pub fn fail_next_open(&self) {
        self.state().fail_next_open = true;
    }

    /// Every buffer written so far, one entry per write
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state().open_count
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Number of read calls that returned at least one byte
    pub fn read_count(&self) -> usize {
        self.state().reads
    }

    pub fn frame_params(&self) -> Option<FrameParams> {
        self.state().frame_params
    }

    pub fn handshake_lines(&self) -> (Option<bool>, Option<bool>) {
        self.state().handshake
    }

    /// Scripted exchanges not consumed yet
    pub fn pending_exchanges(&self) -> usize {
        self.state().script.len()
    }

    /// Bytes readable but not read yet
    pub fn pending_input(&self) -> usize {
        self.state().input.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn open(&mut self, _mode: OpenMode) -> LinkResult<()> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_open) {
            return Err(LinkError::transport("mock open refused"));
        }
        state.open = true;
        state.open_count += 1;
        Ok(())
    }

    async fn close(&mut self) -> LinkResult<()> {
        self.state().open = false;
        Ok(())
    }

    async fn write(&mut self, data: &[u8], _mode: IoMode) -> LinkResult<usize> {
        let mut state = self.state();
        state.written.push(data.to_vec());

        let matches = match state.script.front() {
            Some(Exchange { request: None, .. }) => true,
            Some(Exchange {
                request: Some(request),
                ..
            }) => request.as_slice() == data,
            None => false,
        };
        if matches {
            if let Some(exchange) = state.script.pop_front() {
                state.input.extend(exchange.reply);
            }
        }
        Ok(data.len())
    }

    async fn read(&mut self, buf: &mut [u8], mode: IoMode) -> LinkResult<usize> {
        let read = {
            let mut state = self.state();
            let limit = state.chunk_size.unwrap_or(buf.len()).min(buf.len());
            let n = limit.min(state.input.len());
            for (slot, byte) in buf.iter_mut().zip(state.input.drain(..n)) {
                *slot = byte;
            }
            if n > 0 {
                state.reads += 1;
            }
            n
        };

        // Silence: a blocking read waits out its whole window
        if read == 0 {
            if let IoMode::Blocking(limit) = mode {
                sleep(limit).await;
            }
        }
        Ok(read)
    }

    fn set_frame_params(&mut self, params: &FrameParams) -> LinkResult<()> {
        self.state().frame_params = Some(*params);
        Ok(())
    }

    fn set_handshake_lines(&mut self, rts: Option<bool>, dtr: Option<bool>) -> LinkResult<()> {
        self.state().handshake = (rts, dtr);
        Ok(())
    }

    fn frame_format(&self) -> LinkResult<FrameFormat> {
        self.state()
            .frame_params
            .map(|params| params.frame_format())
            .ok_or_else(|| LinkError::unsupported("frame_format", BACKEND))
    }

    async fn queued_input_size(&mut self) -> LinkResult<usize> {
        Ok(self.state().input.len())
    }

    async fn flush(&mut self) -> LinkResult<()> {
        self.state().input.clear();
        Ok(())
    }

    async fn drain(&mut self) -> LinkResult<()> {
        Ok(())
    }

    fn event_source(&self) -> LinkResult<RawSource> {
        Ok(RawSource::default())
    }
}

/// Backend handing out clones of one [`MockTransport`] for every spec
#[derive(Debug, Default)]
pub struct MockBackend {
    transport: MockTransport,
    resources: Vec<Resource>,
}

impl MockBackend {
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            resources: Vec::new(),
        }
    }

    /// Report `resource` from `enumerate`
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn accepts(&self, _spec: &ConnectionSpec) -> bool {
        true
    }

    fn create(&self, _spec: &ConnectionSpec) -> LinkResult<Box<dyn Transport>> {
        Ok(Box::new(self.transport.clone()))
    }

    fn enumerate(&self) -> LinkResult<Vec<Resource>> {
        Ok(self.resources.clone())
    }

    fn find_by_identity(&self, vendor_id: u16, product_id: u16) -> LinkResult<Vec<Resource>> {
        Ok(self
            .resources
            .iter()
            .filter(|r| r.usb_id == Some((vendor_id, product_id)))
            .cloned()
            .collect())
    }
}

//! Modbus RTU framing over a transport handle
//!
//! An RTU frame is the device address, the PDU and a CRC-16/MODBUS trailer
//! transmitted little-endian:
//!
//! ```text
//! ┌─────────┬──────────────────────┬─────────┬─────────┐
//! │ address │ PDU (function, data) │ CRC lo  │ CRC hi  │
//! └─────────┴──────────────────────┴─────────┴─────────┘
//! ```
//!
//! [`RtuLink`] owns the handle and provides the progress-bounded read used by
//! the reply accumulation in [`ModbusDevice`](super::ModbusDevice).

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tokio::time::Instant;
use tracing::trace;

use crate::config::ModbusConfig;
use crate::constants::{MAX_PDU_SIZE, REPLY_POLL_INTERVAL, RTU_OVERHEAD};
use crate::error::{LinkError, LinkResult};
use crate::transport::{IoMode, TransportHandle};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Build an RTU frame around `pdu`
pub fn encode_frame(address: u8, pdu: &[u8]) -> LinkResult<BytesMut> {
    if pdu.is_empty() || pdu.len() > MAX_PDU_SIZE {
        return Err(LinkError::argument(format!(
            "PDU length must be 1..={}, got {}",
            MAX_PDU_SIZE,
            pdu.len()
        )));
    }
    let mut frame = BytesMut::with_capacity(pdu.len() + RTU_OVERHEAD);
    frame.put_u8(address);
    frame.put_slice(pdu);
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    Ok(frame)
}

/// Split a complete RTU frame into address and PDU, checking the CRC
pub fn decode_frame(frame: &[u8]) -> LinkResult<(u8, &[u8])> {
    if frame.len() < RTU_OVERHEAD + 1 {
        return Err(LinkError::protocol(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    verify_crc(body, [trailer[0], trailer[1]])?;
    Ok((body[0], &body[1..]))
}

/// Compare the received little-endian trailer with the CRC of `body`
pub fn verify_crc(body: &[u8], trailer: [u8; 2]) -> LinkResult<()> {
    let expected = crc16(body);
    let received = u16::from_le_bytes(trailer);
    if expected != received {
        return Err(LinkError::protocol(format!(
            "CRC mismatch: expected 0x{:04X}, received 0x{:04X}",
            expected, received
        )));
    }
    Ok(())
}

/// RTU framing link to one device address
#[derive(Debug)]
pub struct RtuLink {
    handle: TransportHandle,
    address: u8,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RtuLink {
    pub fn new(handle: TransportHandle, config: &ModbusConfig) -> Self {
        Self {
            handle,
            address: config.device_address,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn handle(&self) -> &TransportHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut TransportHandle {
        &mut self.handle
    }

    pub fn into_handle(self) -> TransportHandle {
        self.handle
    }

    /// Frame and transmit a request PDU completely within the write timeout
    pub async fn send_pdu(&mut self, pdu: &[u8]) -> LinkResult<()> {
        let frame = encode_frame(self.address, pdu)?;
        trace!("RTU send to {}: {} bytes", self.address, frame.len());
        self.handle.write_all(&frame, self.write_timeout).await
    }

    /// Read exactly `buf.len()` bytes.
    ///
    /// Fails with a timeout once no byte has arrived for the read timeout;
    /// every byte received restarts that window. Never reads past `buf`.
    pub async fn read_exact(&mut self, buf: &mut [u8], operation: &str) -> LinkResult<()> {
        let window = REPLY_POLL_INTERVAL.min(self.read_timeout);
        let mut last_progress = Instant::now();
        let mut filled = 0;

        while filled < buf.len() {
            let n = self
                .handle
                .read(&mut buf[filled..], IoMode::Blocking(window))
                .await?;
            if n > 0 {
                filled += n;
                last_progress = Instant::now();
                continue;
            }
            if last_progress.elapsed() >= self.read_timeout {
                return Err(LinkError::timeout(
                    format!("{} ({} of {} bytes)", operation, filled, buf.len()),
                    self.read_timeout.as_millis() as u64,
                ));
            }
        }
        Ok(())
    }

    /// Read the address byte that opens a reply frame
    pub async fn read_address(&mut self) -> LinkResult<u8> {
        let mut address = [0u8; 1];
        self.read_exact(&mut address, "reply address").await?;
        if address[0] != self.address {
            return Err(LinkError::protocol(format!(
                "reply from address {}, expected {}",
                address[0], self.address
            )));
        }
        Ok(address[0])
    }

    /// Read the CRC trailer and check it against the received PDU
    pub async fn read_and_verify_crc(&mut self, pdu: &[u8]) -> LinkResult<()> {
        let mut trailer = [0u8; 2];
        self.read_exact(&mut trailer, "reply CRC").await?;

        let mut body = BytesMut::with_capacity(pdu.len() + 1);
        body.put_u8(self.address);
        body.put_slice(pdu);
        verify_crc(&body, trailer)
    }
}

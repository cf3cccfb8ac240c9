//! Native serial backend
//!
//! Drives a physical or virtual serial device through `tokio-serial`. Opening
//! only resolves the device path; callers apply line parameters with
//! `set_frame_params` before speaking a typed protocol.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_serial::{
    available_ports, ClearBuffer, DataBits, SerialPort, SerialPortType, SerialStream, StopBits,
};
use tracing::{debug, info};

use super::{
    read_stream, write_stream, Backend, FlowControl, FrameFormat, FrameParams, IoMode, OpenMode,
    Parity, Resource, Transport,
};
use crate::constants::FALLBACK_BAUD_RATE;
use crate::descriptor::ConnectionSpec;
use crate::error::{LinkError, LinkResult};
use crate::event::RawSource;

const BACKEND: &str = "serial";

fn serial_error(action: &str, path: &str, e: tokio_serial::Error) -> LinkError {
    LinkError::transport(format!("{} {}: {}", action, path, e))
}

fn to_data_bits(bits: u8) -> LinkResult<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(LinkError::argument(format!("unsupported data bits {}", other))),
    }
}

fn to_stop_bits(bits: u8) -> LinkResult<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(LinkError::argument(format!("unsupported stop bits {}", other))),
    }
}

fn to_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    }
}

fn to_flow_control(flow: FlowControl) -> tokio_serial::FlowControl {
    match flow {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        FlowControl::Software => tokio_serial::FlowControl::Software,
    }
}

/// Serial device transport
#[derive(Debug)]
pub struct SerialTransport {
    path: String,
    port: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self {
            path: path.into(),
            port: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn port(&self) -> LinkResult<&SerialStream> {
        self.port.as_ref().ok_or(LinkError::NotOpen {
            operation: "serial port access",
        })
    }

    fn port_mut(&mut self) -> LinkResult<&mut SerialStream> {
        self.port.as_mut().ok_or(LinkError::NotOpen {
            operation: "serial port access",
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn open(&mut self, mode: OpenMode) -> LinkResult<()> {
        // The builder needs a baud rate; the real line setup comes from
        // set_frame_params.
        let builder = tokio_serial::new(&self.path, FALLBACK_BAUD_RATE);
        let port = SerialStream::open(&builder).map_err(|e| serial_error("open", &self.path, e))?;
        self.port = Some(port);
        info!("Serial port {} opened ({:?})", self.path, mode);
        Ok(())
    }

    async fn close(&mut self) -> LinkResult<()> {
        match self.port.take() {
            Some(_) => {
                debug!("Serial port {} closed", self.path);
                Ok(())
            }
            None => Err(LinkError::NotOpen { operation: "close" }),
        }
    }

    async fn write(&mut self, data: &[u8], mode: IoMode) -> LinkResult<usize> {
        let port = self.port_mut()?;
        Ok(write_stream(port, data, mode).await?)
    }

    async fn read(&mut self, buf: &mut [u8], mode: IoMode) -> LinkResult<usize> {
        let port = self.port_mut()?;
        Ok(read_stream(port, buf, mode).await?)
    }

    fn set_frame_params(&mut self, params: &FrameParams) -> LinkResult<()> {
        let data_bits = to_data_bits(params.data_bits)?;
        let stop_bits = to_stop_bits(params.stop_bits)?;
        let path = self.path.clone();
        let port = self.port_mut()?;

        port.set_baud_rate(params.baud_rate)
            .map_err(|e| serial_error("set baud rate on", &path, e))?;
        port.set_data_bits(data_bits)
            .map_err(|e| serial_error("set data bits on", &path, e))?;
        port.set_parity(to_parity(params.parity))
            .map_err(|e| serial_error("set parity on", &path, e))?;
        port.set_stop_bits(stop_bits)
            .map_err(|e| serial_error("set stop bits on", &path, e))?;
        port.set_flow_control(to_flow_control(params.flow_control))
            .map_err(|e| serial_error("set flow control on", &path, e))?;

        self.set_handshake_lines(params.rts, params.dtr)
    }

    fn set_handshake_lines(&mut self, rts: Option<bool>, dtr: Option<bool>) -> LinkResult<()> {
        let path = self.path.clone();
        let port = self.port_mut()?;
        if let Some(level) = rts {
            port.write_request_to_send(level)
                .map_err(|e| serial_error("drive RTS on", &path, e))?;
        }
        if let Some(level) = dtr {
            port.write_data_terminal_ready(level)
                .map_err(|e| serial_error("drive DTR on", &path, e))?;
        }
        Ok(())
    }

    fn frame_format(&self) -> LinkResult<FrameFormat> {
        let port = self.port()?;
        let query = |e: tokio_serial::Error| serial_error("query", &self.path, e);

        let baud_rate = port.baud_rate().map_err(query)?;
        let data_bits = match port.data_bits().map_err(query)? {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        let parity = port.parity().map_err(query)? != tokio_serial::Parity::None;
        let stop_bits = match port.stop_bits().map_err(query)? {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        Ok(FrameFormat::new(baud_rate, data_bits, parity, stop_bits))
    }

    async fn queued_input_size(&mut self) -> LinkResult<usize> {
        let port = self.port()?;
        let queued = port
            .bytes_to_read()
            .map_err(|e| serial_error("query input queue of", &self.path, e))?;
        Ok(queued as usize)
    }

    async fn flush(&mut self) -> LinkResult<()> {
        let port = self.port()?;
        port.clear(ClearBuffer::Input)
            .map_err(|e| serial_error("flush", &self.path, e))
    }

    async fn drain(&mut self) -> LinkResult<()> {
        self.port_mut()?.flush().await?;
        Ok(())
    }

    #[cfg(unix)]
    fn event_source(&self) -> LinkResult<RawSource> {
        use std::os::unix::io::AsRawFd;
        Ok(self.port()?.as_raw_fd())
    }

    #[cfg(not(unix))]
    fn event_source(&self) -> LinkResult<RawSource> {
        Err(LinkError::unsupported("event_source", BACKEND))
    }
}

/// Backend for native serial paths
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialBackend;

impl Backend for SerialBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn accepts(&self, spec: &ConnectionSpec) -> bool {
        matches!(spec, ConnectionSpec::Serial { .. })
    }

    fn create(&self, spec: &ConnectionSpec) -> LinkResult<Box<dyn Transport>> {
        match spec {
            ConnectionSpec::Serial { path } => Ok(Box::new(SerialTransport::new(path.clone()))),
            other => Err(LinkError::argument(format!(
                "serial backend cannot open '{}'",
                other
            ))),
        }
    }

    fn enumerate(&self) -> LinkResult<Vec<Resource>> {
        let ports = available_ports()
            .map_err(|e| LinkError::transport(format!("serial port enumeration failed: {}", e)))?;

        Ok(ports
            .into_iter()
            .map(|info| {
                let (description, usb_id) = match &info.port_type {
                    SerialPortType::UsbPort(usb) => {
                        let label = match (&usb.manufacturer, &usb.product) {
                            (Some(m), Some(p)) => format!("{} {}", m, p),
                            (None, Some(p)) => p.clone(),
                            (Some(m), None) => m.clone(),
                            (None, None) => "USB serial port".to_string(),
                        };
                        (
                            format!("{} [{:04x}:{:04x}]", label, usb.vid, usb.pid),
                            Some((usb.vid, usb.pid)),
                        )
                    }
                    SerialPortType::PciPort => ("PCI serial port".to_string(), None),
                    SerialPortType::BluetoothPort => ("Bluetooth serial port".to_string(), None),
                    SerialPortType::Unknown => ("serial port".to_string(), None),
                };
                Resource {
                    spec: ConnectionSpec::Serial {
                        path: info.port_name,
                    },
                    description,
                    backend: BACKEND,
                    usb_id,
                }
            })
            .collect())
    }

    fn find_by_identity(&self, vendor_id: u16, product_id: u16) -> LinkResult<Vec<Resource>> {
        let mut found = self.enumerate()?;
        found.retain(|r| r.usb_id == Some((vendor_id, product_id)));
        Ok(found)
    }
}

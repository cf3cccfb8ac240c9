//! Serial line parameters
//!
//! [`FrameParams`] is what a caller applies with `set_frame_params`;
//! [`FrameFormat`] is the derived, read-only view a backend reports back for
//! timing estimates.
//!
//! Parameters can be written in the compact form instrument drivers use:
//!
//! ```rust
//! use voltage_serial::transport::{FrameParams, Parity};
//!
//! let params: FrameParams = "115200/8e1/rts=0/dtr=1".parse().unwrap();
//! assert_eq!(params.baud_rate, 115200);
//! assert_eq!(params.parity, Parity::Even);
//! assert_eq!(params.dtr, Some(true));
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LinkError, LinkResult};

/// Parity bit mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl Parity {
    fn letter(self) -> char {
        match self {
            Self::None => 'n',
            Self::Odd => 'o',
            Self::Even => 'e',
        }
    }

    fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'n' => Some(Self::None),
            'o' => Some(Self::Odd),
            'e' => Some(Self::Even),
            _ => None,
        }
    }
}

/// Flow control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowControl {
    #[default]
    None,
    /// RTS/CTS
    Hardware,
    /// XON/XOFF
    Software,
}

impl FlowControl {
    fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Hardware => 1,
            Self::Software => 2,
        }
    }
}

/// Requested serial line configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameParams {
    pub baud_rate: u32,
    /// 5..=8
    pub data_bits: u8,
    pub parity: Parity,
    /// 1..=2
    pub stop_bits: u8,
    pub flow_control: FlowControl,
    /// `None` leaves the line as it is
    pub rts: Option<bool>,
    /// `None` leaves the line as it is
    pub dtr: Option<bool>,
}

impl FrameParams {
    /// 8 data bits, no parity, 1 stop bit at the given baud rate
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
            rts: None,
            dtr: None,
        }
    }

    pub fn with_data_bits(mut self, data_bits: u8) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: u8) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    pub fn with_rts(mut self, rts: bool) -> Self {
        self.rts = Some(rts);
        self
    }

    pub fn with_dtr(mut self, dtr: bool) -> Self {
        self.dtr = Some(dtr);
        self
    }

    /// Reject values no serial line can carry
    pub fn validate(&self) -> LinkResult<()> {
        if self.baud_rate == 0 {
            return Err(LinkError::argument("baud rate must be non-zero"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(LinkError::argument(format!(
                "data bits must be 5..=8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(LinkError::argument(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    /// Character shape these parameters produce on the wire
    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat::new(
            self.baud_rate,
            self.data_bits,
            self.parity != Parity::None,
            self.stop_bits,
        )
    }
}

impl Default for FrameParams {
    fn default() -> Self {
        Self::new(9600)
    }
}

fn parse_flag(key: &str, value: &str) -> LinkResult<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(LinkError::argument(format!(
            "{}= expects 0 or 1, got '{}'",
            key, value
        ))),
    }
}

impl FromStr for FrameParams {
    type Err = LinkError;

    /// Parse `<baud>/<databits><parity><stopbits>[/rts=x][/dtr=x][/flow=x]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split('/');

        let baud = fields.next().unwrap_or_default();
        let baud_rate: u32 = baud
            .parse()
            .map_err(|_| LinkError::argument(format!("invalid baud rate '{}' in '{}'", baud, s)))?;
        let mut params = FrameParams::new(baud_rate);

        let shape = fields.next().unwrap_or_default();
        let chars: Vec<char> = shape.chars().collect();
        if chars.len() != 3 {
            return Err(LinkError::argument(format!(
                "frame shape must look like 8n1, got '{}'",
                shape
            )));
        }
        params.data_bits = chars[0]
            .to_digit(10)
            .ok_or_else(|| LinkError::argument(format!("invalid data bits in '{}'", shape)))?
            as u8;
        params.parity = Parity::from_letter(chars[1])
            .ok_or_else(|| LinkError::argument(format!("invalid parity in '{}'", shape)))?;
        params.stop_bits = chars[2]
            .to_digit(10)
            .ok_or_else(|| LinkError::argument(format!("invalid stop bits in '{}'", shape)))?
            as u8;

        for option in fields {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| LinkError::argument(format!("expected key=value, got '{}'", option)))?;
            match key {
                "rts" => params.rts = Some(parse_flag(key, value)?),
                "dtr" => params.dtr = Some(parse_flag(key, value)?),
                "flow" => {
                    params.flow_control = match value {
                        "0" => FlowControl::None,
                        "1" => FlowControl::Hardware,
                        "2" => FlowControl::Software,
                        _ => {
                            return Err(LinkError::argument(format!(
                                "flow= expects 0, 1 or 2, got '{}'",
                                value
                            )))
                        }
                    }
                }
                _ => {
                    return Err(LinkError::argument(format!(
                        "unknown serial option '{}'",
                        key
                    )))
                }
            }
        }

        params.validate()?;
        Ok(params)
    }
}

impl fmt::Display for FrameParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{}{}",
            self.baud_rate,
            self.data_bits,
            self.parity.letter(),
            self.stop_bits
        )?;
        if let Some(rts) = self.rts {
            write!(f, "/rts={}", rts as u8)?;
        }
        if let Some(dtr) = self.dtr {
            write!(f, "/dtr={}", dtr as u8)?;
        }
        if self.flow_control != FlowControl::None {
            write!(f, "/flow={}", self.flow_control.code())?;
        }
        Ok(())
    }
}

/// Baud rate and total bits per character (start + data + parity + stop)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameFormat {
    pub baud_rate: u32,
    pub bits: u32,
}

impl FrameFormat {
    pub fn new(baud_rate: u32, data_bits: u8, parity: bool, stop_bits: u8) -> Self {
        Self {
            baud_rate,
            bits: 1 + data_bits as u32 + parity as u32 + stop_bits as u32,
        }
    }

    /// On-wire time of `bytes` characters, rounded up to whole milliseconds
    pub fn transfer_time(&self, bytes: usize) -> Duration {
        if self.baud_rate == 0 {
            return Duration::ZERO;
        }
        let bit_ms = bytes as u64 * self.bits as u64 * 1000;
        Duration::from_millis(bit_ms.div_ceil(self.baud_rate as u64))
    }
}

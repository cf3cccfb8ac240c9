//! Packet logging helpers
//!
//! Handles opt into packet logging with
//! [`TransportHandle::set_packet_logging`](crate::transport::TransportHandle::set_packet_logging);
//! every successful read and write is then emitted at `debug` level as a hex
//! dump tagged with the backend name.

use tracing::debug;

/// Direction of a logged packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "recv",
        }
    }
}

/// Format raw bytes as space separated uppercase hex
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log one packet with direction and backend tag
pub fn log_packet(backend: &str, direction: Direction, data: &[u8]) {
    debug!(
        "[LINK-{}] {} {}",
        backend,
        direction.as_str(),
        format_hex_packet(data)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[]), "");
        assert_eq!(format_hex_packet(&[0x01, 0xAB, 0x00]), "01 AB 00");
    }
}

//! Connection descriptor parsing
//!
//! A connection string selects a backend and carries its parameters:
//!
//! | Form | Backend |
//! |------|---------|
//! | `tcp-raw/<host>/<port>` | raw TCP socket driven like a serial port |
//! | anything else, e.g. `/dev/ttyUSB0`, `COM3` | native serial device path |
//!
//! Fields are separated by `/` and the prefix is case-sensitive. Trailing
//! fields after the mandatory ones are accepted, ignored and reported with a
//! warning; they are reserved for future options. Parsing performs no I/O.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::constants::{CONN_SEPARATOR, TCP_RAW_PREFIX};
use crate::error::{LinkError, LinkResult};

/// Parsed connection descriptor, consumed once at open time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionSpec {
    /// Native serial device
    Serial { path: String },
    /// Raw TCP stream; the port stays textual and is resolved at connect time
    TcpRaw { host: String, port: String },
}

impl ConnectionSpec {
    /// Parse a connection string
    pub fn parse(conn: &str) -> LinkResult<Self> {
        if conn.is_empty() {
            return Err(LinkError::argument("empty connection string"));
        }

        let mut fields = conn.split(CONN_SEPARATOR);
        let prefix = fields.next().unwrap_or_default();
        if prefix != TCP_RAW_PREFIX {
            return Ok(Self::Serial {
                path: conn.to_string(),
            });
        }

        let host = fields.next().unwrap_or_default();
        let port = fields.next().unwrap_or_default();
        if host.is_empty() || port.is_empty() {
            return Err(LinkError::argument(format!(
                "'{}' needs both host and port: {}/<host>/<port>",
                conn, TCP_RAW_PREFIX
            )));
        }

        let extra: Vec<&str> = fields.collect();
        if !extra.is_empty() {
            warn!(
                "Connection string '{}': ignoring {} extra field(s) {:?}, reserved for future use",
                conn,
                extra.len(),
                extra
            );
        }

        Ok(Self::TcpRaw {
            host: host.to_string(),
            port: port.to_string(),
        })
    }

    /// Name of the backend this spec selects
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Serial { .. } => "serial",
            Self::TcpRaw { .. } => TCP_RAW_PREFIX,
        }
    }
}

impl FromStr for ConnectionSpec {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { path } => write!(f, "{}", path),
            Self::TcpRaw { host, port } => write!(f, "{}/{}/{}", TCP_RAW_PREFIX, host, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_parse_tcp_raw() {
        let spec = ConnectionSpec::parse("tcp-raw/127.0.0.1/5020").unwrap();
        assert_eq!(
            spec,
            ConnectionSpec::TcpRaw {
                host: "127.0.0.1".to_string(),
                port: "5020".to_string(),
            }
        );
        assert_eq!(spec.backend_name(), "tcp-raw");
        assert_eq!(spec.to_string(), "tcp-raw/127.0.0.1/5020");
    }

    #[test]
    fn test_parse_missing_fields() {
        for conn in [
            "tcp-raw",
            "tcp-raw/",
            "tcp-raw/5020",
            "tcp-raw//5020",
            "tcp-raw/host/",
            "",
        ] {
            let err = ConnectionSpec::parse(conn).unwrap_err();
            assert!(err.is_argument_error(), "{conn:?} gave {err}");
        }
    }

    #[traced_test]
    #[test]
    fn test_parse_extra_fields_warns() {
        let spec = ConnectionSpec::parse("tcp-raw/h/p/extra").unwrap();
        assert_eq!(spec, ConnectionSpec::parse("tcp-raw/h/p").unwrap());
        assert!(logs_contain("reserved for future use"));
    }

    #[traced_test]
    #[test]
    fn test_parse_two_fields_does_not_warn() {
        ConnectionSpec::parse("tcp-raw/h/p").unwrap();
        assert!(!logs_contain("reserved for future use"));
    }

    #[test]
    fn test_parse_serial_paths() {
        for path in ["/dev/ttyUSB0", "COM3", "/dev/serial/by-id/usb-FTDI-if00"] {
            let spec: ConnectionSpec = path.parse().unwrap();
            assert_eq!(
                spec,
                ConnectionSpec::Serial {
                    path: path.to_string()
                }
            );
            assert_eq!(spec.to_string(), path);
        }
    }

    #[test]
    fn test_prefix_is_case_sensitive() {
        let spec = ConnectionSpec::parse("TCP-RAW/h/p").unwrap();
        assert_eq!(spec.backend_name(), "serial");
    }
}

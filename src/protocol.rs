//! Control-plane wire format and shared data model
//!
//! Every control datagram carries exactly one ASCII message of the form
//! `TOKEN` or `TOKEN;field;...`. A trailing newline is tolerated so the same
//! format can be framed in a byte stream.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::ProtocolError;

const DISCOVER: &str = "DISCOVER";
const RESPONSE: &str = "RESPONSE";
const CONNECT: &str = "CONNECT";
const ACCEPT: &str = "ACCEPT";
const REJECT: &str = "REJECT";
const DISCONNECT: &str = "DISCONNECT";

/// Field separator on the wire
const SEPARATOR: char = ';';

/// A single control-plane message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Broadcast probe
    Discover,
    /// Reply to a probe, advertising the audio service
    Response { service_port: u16, device_name: String },
    /// Sender asks permission to stream
    Connect { device_name: String },
    /// Permission granted
    Accept,
    /// Permission denied
    Reject,
    /// Tear down an active session
    Disconnect,
}

impl ControlMessage {
    /// Encode as the on-wire text (no trailing newline)
    pub fn encode(&self) -> String {
        match self {
            Self::Discover => DISCOVER.to_string(),
            Self::Response {
                service_port,
                device_name,
            } => format!(
                "{RESPONSE}{SEPARATOR}{service_port}{SEPARATOR}{}",
                sanitize_field(device_name)
            ),
            Self::Connect { device_name } => {
                format!("{CONNECT}{SEPARATOR}{}", sanitize_field(device_name))
            }
            Self::Accept => ACCEPT.to_string(),
            Self::Reject => REJECT.to_string(),
            Self::Disconnect => DISCONNECT.to_string(),
        }
    }

    /// Encode to bytes ready for a datagram
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }

    /// Parse one datagram payload
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotText)?;
        if !text.is_ascii() {
            return Err(ProtocolError::NotText);
        }
        let text = text.trim_end_matches(['\r', '\n', '\0']).trim();
        if text.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut fields = text.split(SEPARATOR);
        let token = fields.next().unwrap_or_default();

        match token {
            DISCOVER => Ok(Self::Discover),
            RESPONSE => {
                let port = fields.next().ok_or(ProtocolError::MissingField {
                    token: RESPONSE,
                    field: "servicePort",
                })?;
                let service_port = port
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| ProtocolError::InvalidPort(port.to_string()))?;
                let device_name = fields.next().ok_or(ProtocolError::MissingField {
                    token: RESPONSE,
                    field: "deviceName",
                })?;
                Ok(Self::Response {
                    service_port,
                    device_name: device_name.to_string(),
                })
            }
            CONNECT => {
                let device_name = fields.next().ok_or(ProtocolError::MissingField {
                    token: CONNECT,
                    field: "deviceName",
                })?;
                Ok(Self::Connect {
                    device_name: device_name.to_string(),
                })
            }
            ACCEPT => Ok(Self::Accept),
            REJECT => Ok(Self::Reject),
            DISCONNECT => Ok(Self::Disconnect),
            other => Err(ProtocolError::UnknownToken(other.to_string())),
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Field values must not contain the separator or line breaks
fn sanitize_field(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            SEPARATOR => '_',
            '\r' | '\n' => ' ',
            c if c.is_ascii() => c,
            _ => '?',
        })
        .collect()
}

/// Outcome of a connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectOutcome {
    Accepted,
    Rejected,
    Timeout,
}

/// A receiver found by discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receiver {
    /// Address-derived identifier
    pub id: String,
    pub name: String,
    /// IPv4 dotted string
    pub address: String,
    pub port: u16,
    pub is_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
}

impl Receiver {
    pub fn new(address: IpAddr, port: u16, name: impl Into<String>) -> Self {
        let address = address.to_string();
        Self {
            id: address.clone(),
            name: name.into(),
            address,
            port,
            is_available: true,
            latency_ms: None,
            bitrate_kbps: None,
        }
    }

    /// Data-channel endpoint of this receiver
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = self.address.parse::<IpAddr>().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }
}

/// Audio endpoint information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    /// Monitor/loopback input capturing system output
    pub is_monitor: bool,
}

/// Data-plane security/transport profile
///
/// Audio always travels over TCP; `Udp` in the names is the control plane.
/// The `*Auth` modes wrap the stream in TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    TcpOnly,
    TcpUdpNoAuth,
    TcpUdpAuth,
    TlsUdpAuth,
}

impl TransportMode {
    pub const ALL: [TransportMode; 4] = [
        Self::TcpOnly,
        Self::TcpUdpNoAuth,
        Self::TcpUdpAuth,
        Self::TlsUdpAuth,
    ];

    /// Whether the audio socket is wrapped in TLS
    pub fn uses_tls(&self) -> bool {
        matches!(self, Self::TcpUdpAuth | Self::TlsUdpAuth)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TcpOnly => "tcp_only",
            Self::TcpUdpNoAuth => "tcp_udp_no_auth",
            Self::TcpUdpAuth => "tcp_udp_auth",
            Self::TlsUdpAuth => "tls_udp_auth",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "tcp_only" => Ok(Self::TcpOnly),
            "tcp_udp" | "tcp_udp_no_auth" => Ok(Self::TcpUdpNoAuth),
            "tcp_udp_auth" => Ok(Self::TcpUdpAuth),
            "tls" | "tls_udp_auth" => Ok(Self::TlsUdpAuth),
            other => Err(format!("unknown transport mode `{other}`")),
        }
    }
}

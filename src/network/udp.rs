//! UDP socket helpers for the control plane

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::constants::{MAX_DATAGRAM_SIZE, POLL_INTERVAL};
use crate::error::NetworkError;
use crate::protocol::ControlMessage;

/// Options for a control socket
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    /// Share the port with other listeners (responders)
    pub reuse_address: bool,
    pub broadcast: bool,
    /// Read timeout; loops use it to check their running flag
    pub read_timeout: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_address: false,
            broadcast: false,
            read_timeout: Some(POLL_INTERVAL),
        }
    }
}

/// Create a UDP socket bound to `addr`
pub fn create_socket(addr: SocketAddr, options: SocketOptions) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if options.reuse_address {
        socket.set_reuse_address(true)?;
    }
    if options.broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind(&SockAddr::from(addr))?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(options.read_timeout)?;
    Ok(socket)
}

/// Bind the wildcard address on `port`
pub fn bind_any(port: u16, options: SocketOptions) -> io::Result<UdpSocket> {
    create_socket(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        options,
    )
}

/// Bind `port`, or an ephemeral port if it is taken
pub fn bind_preferred(port: u16, options: SocketOptions) -> io::Result<UdpSocket> {
    match bind_any(port, options) {
        Ok(socket) => Ok(socket),
        Err(e) if port != 0 => {
            tracing::debug!(port, error = %e, "Preferred control port busy, using ephemeral port");
            bind_any(0, options)
        }
        Err(e) => Err(e),
    }
}

/// Send one control message from `socket`
pub fn send_message(
    socket: &UdpSocket,
    message: &ControlMessage,
    target: SocketAddr,
) -> Result<(), NetworkError> {
    socket
        .send_to(&message.to_bytes(), target)
        .map(|_| ())
        .map_err(|e| NetworkError::SendFailed(format!("{message} to {target}: {e}")))
}

/// Send one control message from a fresh ephemeral socket
pub fn send_control(message: &ControlMessage, target: SocketAddr) -> Result<(), NetworkError> {
    let socket = bind_any(0, SocketOptions::default())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    send_message(&socket, message, target)?;
    tracing::debug!(%message, %target, "Control message sent");
    Ok(())
}

/// One received datagram
pub enum Received {
    Message(ControlMessage, SocketAddr),
    /// Unparseable datagram, already logged
    Ignored,
    /// Read timeout elapsed with nothing to read
    Idle,
}

/// Receive and parse a single datagram
///
/// Timeouts come back as `Received::Idle`; only real socket errors are `Err`.
pub fn recv_message(socket: &UdpSocket, buf: &mut [u8; MAX_DATAGRAM_SIZE]) -> io::Result<Received> {
    match socket.recv_from(buf) {
        Ok((len, from)) => match ControlMessage::parse(&buf[..len]) {
            Ok(message) => Ok(Received::Message(message, from)),
            Err(e) => {
                tracing::debug!(%from, error = %e, "Ignoring malformed datagram");
                Ok(Received::Ignored)
            }
        },
        Err(e) if is_timeout(&e) => Ok(Received::Idle),
        Err(e) => Err(e),
    }
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

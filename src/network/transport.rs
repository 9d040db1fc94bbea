//! Audio data channel: raw s16le PCM over TCP, optionally inside TLS
//!
//! There is no framing; the byte stream is the payload and connection close
//! ends it. Both ends disable Nagle so every chunk leaves immediately.

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConfig, ServerConnection, StreamOwned};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::error::NetworkError;
use crate::network::tls;
use crate::protocol::TransportMode;

/// Longest time a TLS handshake may take before the peer is dropped
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected data channel, plain or TLS
pub enum AudioStream {
    Plain(TcpStream),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl AudioStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(s) => s,
            Self::TlsClient(s) => &s.sock,
            Self::TlsServer(s) => &s.sock,
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Self::Plain(_))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    /// Handle to the underlying socket; shutting it down unblocks a reader
    pub fn shutdown_handle(&self) -> io::Result<TcpStream> {
        self.tcp().try_clone()
    }

    /// Orderly close: TLS close_notify if any, then TCP shutdown
    pub fn close(&mut self) {
        match self {
            Self::Plain(_) => {}
            Self::TlsClient(s) => {
                s.conn.send_close_notify();
                let _ = s.conn.complete_io(&mut s.sock);
            }
            Self::TlsServer(s) => {
                s.conn.send_close_notify();
                let _ = s.conn.complete_io(&mut s.sock);
            }
        }
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for AudioStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::TlsClient(s) => s.read(buf),
            Self::TlsServer(s) => s.read(buf),
        }
    }
}

impl Write for AudioStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::TlsClient(s) => s.write(buf),
            Self::TlsServer(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::TlsClient(s) => s.flush(),
            Self::TlsServer(s) => s.flush(),
        }
    }
}

/// Open the data channel to `addr` as `mode` requires
pub fn connect(
    addr: SocketAddr,
    mode: TransportMode,
    timeout: Duration,
) -> Result<AudioStream, NetworkError> {
    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| NetworkError::ConnectionFailed(format!("{addr}: {e}")))?;
    tcp.set_nodelay(true)
        .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

    if !mode.uses_tls() {
        tracing::info!(%addr, "Data channel connected (TCP)");
        return Ok(AudioStream::Plain(tcp));
    }

    let config = tls::insecure_client_config()?;
    let conn = ClientConnection::new(config, ServerName::from(addr.ip()))
        .map_err(|e| NetworkError::Tls(e.to_string()))?;
    let mut stream = StreamOwned::new(conn, tcp);
    complete_handshake(&mut stream.conn, &mut stream.sock)?;
    tracing::info!(%addr, "Data channel connected (TLS)");
    Ok(AudioStream::TlsClient(Box::new(stream)))
}

fn complete_handshake<C, S>(conn: &mut C, sock: &mut TcpStream) -> Result<(), NetworkError>
where
    C: std::ops::DerefMut<Target = rustls::ConnectionCommon<S>>,
    S: rustls::SideData,
{
    sock.set_read_timeout(Some(TLS_HANDSHAKE_TIMEOUT))
        .map_err(|e| NetworkError::Tls(e.to_string()))?;
    while conn.is_handshaking() {
        conn.complete_io(sock)
            .map_err(|e| NetworkError::Tls(format!("handshake failed: {e}")))?;
    }
    sock.set_read_timeout(None)
        .map_err(|e| NetworkError::Tls(e.to_string()))?;
    Ok(())
}

/// Server socket for the data channel
pub struct AudioListener {
    listener: TcpListener,
    tls: Option<Arc<ServerConfig>>,
    local_addr: SocketAddr,
}

impl AudioListener {
    /// Bind `addr`; accept polls, it never blocks
    ///
    /// A TLS mode whose certificate cannot be built falls back to plain TCP.
    pub fn bind(addr: SocketAddr, mode: TransportMode) -> Result<Self, NetworkError> {
        let tls = if mode.uses_tls() {
            match tls::self_signed_server_config() {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(error = %e, "TLS setup failed, listening in plain TCP");
                    None
                }
            }
        } else {
            None
        };

        let listener = bind_tcp(addr).map_err(|e| NetworkError::BindFailed(format!("{addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        tracing::info!(%local_addr, tls = tls.is_some(), "Audio listener bound");
        Ok(Self {
            listener,
            tls,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accept a pending client, if any
    ///
    /// A client failing the TLS handshake is dropped and reported as an error;
    /// the listener itself stays usable.
    pub fn accept(&self) -> io::Result<Option<(AudioStream, SocketAddr)>> {
        let (tcp, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };
        tcp.set_nonblocking(false)?;
        tcp.set_nodelay(true)?;

        let Some(config) = &self.tls else {
            return Ok(Some((AudioStream::Plain(tcp), peer)));
        };
        let conn = ServerConnection::new(config.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let mut stream = StreamOwned::new(conn, tcp);
        complete_handshake(&mut stream.conn, &mut stream.sock)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Some((AudioStream::TlsServer(Box::new(stream)), peer)))
    }
}

fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(8)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn accept_blocking(listener: &AudioListener) -> AudioStream {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some((stream, _)) = listener.accept().unwrap() {
                return stream;
            }
            assert!(Instant::now() < deadline, "no client connected");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn round_trip(mode: TransportMode) {
        let listener = AudioListener::bind("127.0.0.1:0".parse().unwrap(), mode).unwrap();
        assert_eq!(listener.is_tls(), mode.uses_tls());
        let addr = listener.local_addr();

        let client = thread::spawn(move || {
            let mut stream = connect(addr, mode, Duration::from_secs(2)).unwrap();
            stream.write_all(&[7u8; 4096]).unwrap();
            stream.flush().unwrap();
            stream.close();
        });

        let mut server = accept_blocking(&listener);
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match server.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        client.join().unwrap();
        assert_eq!(received, vec![7u8; 4096]);
    }

    #[test]
    fn test_plain_round_trip() {
        round_trip(TransportMode::TcpOnly);
    }

    #[test]
    fn test_tls_round_trip() {
        round_trip(TransportMode::TlsUdpAuth);
    }

    #[test]
    fn test_accept_without_client_returns_none() {
        let listener =
            AudioListener::bind("127.0.0.1:0".parse().unwrap(), TransportMode::TcpOnly).unwrap();
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        assert!(matches!(
            connect(addr, TransportMode::TcpOnly, Duration::from_secs(1)),
            Err(NetworkError::ConnectionFailed(_))
        ));
    }
}

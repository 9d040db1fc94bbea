//! Network subsystem: UDP control plane and TCP/TLS audio data plane

pub mod discovery;
pub mod handshake;
pub mod receiver;
pub mod sender;
pub mod tls;
pub mod transport;
pub mod udp;

pub use discovery::{broadcast_target, discover, local_addresses, Responder};
pub use handshake::{request_connect_and_wait, ConnectDecision, ControlChannel, Coordinator, PendingRequest};
pub use receiver::{AudioServer, ReceiveEnd, ServerOptions, SessionHandler};
pub use sender::{SendEnd, SendSession, SessionStats};
pub use transport::{AudioListener, AudioStream};
pub use udp::send_control;

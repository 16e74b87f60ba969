//! Message transport to stagers.
//!
//! The coordinator only sees the [`Transport`] trait: every call is non-blocking and any
//! inbound traffic (or a connection loss) comes back as an [`InboundEvent`].

pub mod errors;
pub mod tcp;

pub use errors::TransportError;
pub use tcp::{TcpTransport, TcpTransportConfig};

use crate::protocol::{InboundMessage, JobId, OutboundMessage, PeerAddr};
use std::path::Path;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Connection identity, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub enum PeerEventKind {
    Message(InboundMessage),
    Closed,
}

#[derive(Debug)]
pub struct InboundEvent {
    pub peer: PeerId,
    pub kind: PeerEventKind,
}

pub trait Transport {
    /// Starts connecting to `addr`. Failure to connect is reported later as `Closed`.
    fn connect(&mut self, addr: &PeerAddr) -> Result<PeerId>;

    fn send(&mut self, peer: PeerId, msg: OutboundMessage) -> Result<()>;

    /// Queues a `WARC_FILE` transfer of the file at `path`.
    fn send_file(&mut self, peer: PeerId, job: &JobId, path: &Path) -> Result<()>;

    fn close(&mut self, peer: PeerId);

    fn send_or_log(&mut self, peer: PeerId, msg: OutboundMessage) -> bool {
        let command = msg.name();
        match self.send(peer, msg) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(%peer, command, error = %err, "dropping outbound message");
                false
            }
        }
    }
}

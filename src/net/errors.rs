use crate::net::PeerId;

#[derive(Debug)]
pub enum TransportError {
    UnknownPeer(PeerId),
    QueueFull(PeerId),
    Closed(PeerId),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownPeer(peer) => write!(f, "unknown peer {peer}"),
            Self::QueueFull(peer) => write!(f, "outbound queue full for peer {peer}"),
            Self::Closed(peer) => write!(f, "connection to peer {peer} is closed"),
        }
    }
}

impl std::error::Error for TransportError {}

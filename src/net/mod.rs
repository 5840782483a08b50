pub mod connection;

use tokio::sync::mpsc;

use crate::protocol::Message;

pub use connection::Listener;

/// Connection identifier, unique for the lifetime of the process.
pub type ConnId = u64;

/// Which listener a connection arrived on. Clients and agents speak the same
/// wire format but different command sets; the server routes on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Client,
    Agent,
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerKind::Client => write!(f, "client"),
            PeerKind::Agent => write!(f, "agent"),
        }
    }
}

/// Events forwarded from connection tasks to the single server loop. Each
/// connection's events arrive in the order they happened on the socket; the
/// shared channel preserves per-connection ordering.
#[derive(Debug)]
pub enum ConnEvent {
    /// A peer connected; `outbound` is the handle for writing to it.
    Connected {
        conn: ConnId,
        kind: PeerKind,
        outbound: mpsc::UnboundedSender<Message>,
    },
    /// One decoded message from the peer.
    Inbound { conn: ConnId, message: Message },
    /// The socket closed, errored, or sent a malformed frame.
    Closed { conn: ConnId },
}

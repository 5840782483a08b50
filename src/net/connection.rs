use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnEvent, ConnId, PeerKind};
use crate::error::Result;
use crate::protocol::{Message, WireCodec};

/// Connection ids are shared across both listeners so a `ConnId` alone
/// identifies a peer.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// One accept loop. Each accepted socket gets its own task that frames the
/// stream with [`WireCodec`] and forwards decoded messages into the server's
/// event channel; the server stays single-threaded over its state.
pub struct Listener {
    listener: TcpListener,
    kind: PeerKind,
    events: mpsc::Sender<ConnEvent>,
    shutdown: CancellationToken,
}

impl Listener {
    pub async fn bind(
        addr: std::net::SocketAddr,
        kind: PeerKind,
        events: mpsc::Sender<ConnEvent>,
        shutdown: CancellationToken,
    ) -> Result<Listener> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, %kind, "listening");
        Ok(Listener {
            listener,
            kind,
            events,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until shutdown. Accept errors are transient (fd exhaustion,
    /// aborted handshakes) and logged rather than fatal.
    pub async fn run(self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let conn = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
                            debug!(conn, %peer, kind = %self.kind, "connection accepted");
                            tokio::spawn(connection_task(
                                stream,
                                conn,
                                self.kind,
                                self.events.clone(),
                                self.shutdown.clone(),
                            ));
                        }
                        Err(e) => warn!(error = %e, kind = %self.kind, "accept failed"),
                    }
                }
                _ = self.shutdown.cancelled() => {
                    debug!(kind = %self.kind, "listener stopped");
                    return;
                }
            }
        }
    }
}

/// Pump one socket: decoded frames go to the server loop, queued replies and
/// directives come back through `outbound`. Exits on EOF, socket error, a
/// malformed frame, or shutdown; the server learns of all four the same way,
/// through `Closed`.
async fn connection_task(
    stream: TcpStream,
    conn: ConnId,
    kind: PeerKind,
    events: mpsc::Sender<ConnEvent>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, WireCodec);
    let mut writer = FramedWrite::new(write_half, WireCodec);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    if events
        .send(ConnEvent::Connected {
            conn,
            kind,
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        return; // server is gone
    }

    loop {
        tokio::select! {
            frame = reader.next() => {
                match frame {
                    Some(Ok(message)) => {
                        if events.send(ConnEvent::Inbound { conn, message }).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        // A peer that cannot frame correctly gets dropped;
                        // resynchronizing inside a byte stream is not possible.
                        warn!(conn, error = %e, "dropping connection on bad frame");
                        break;
                    }
                    None => {
                        debug!(conn, "connection closed by peer");
                        break;
                    }
                }
            }
            queued = outbound_rx.recv() => {
                match queued {
                    Some(message) => {
                        if let Err(e) = writer.send(message).await {
                            warn!(conn, error = %e, "write failed");
                            break;
                        }
                    }
                    // Server dropped the sender: it wants this peer gone.
                    None => break,
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    let _ = events.send(ConnEvent::Closed { conn }).await;
}

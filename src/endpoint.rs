//! The receive loop tying one socket to the handler map

use std::net::SocketAddr;
use std::sync::Arc;
use std::io;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tracing::{debug, error};

use crate::buffer::BufferPool;
use crate::dispatch::Dispatcher;
use crate::registry::HandlerMap;
use crate::shared::CloseReason;
use crate::MAX_RECEIVE_PACKET_SIZE;

/// Pool headroom; a single receive loop rarely has more than a couple of
/// buffers in flight.
const POOL_CACHE: usize = 4;

/// The receive side of a shared UDP socket
///
/// Owns the socket for reading; connection handlers may write to their own
/// clone of the socket concurrently, that is not this type's concern.
/// [`run`](Self::run) reads datagrams until the socket fails, feeding each
/// one to the [`Dispatcher`].
pub struct Endpoint {
    socket: UdpSocket,
    map: Arc<HandlerMap>,
    dispatcher: Dispatcher,
    pool: BufferPool,
}

impl Endpoint {
    /// Wrap a bound socket and the registry its packets route through
    pub fn new(socket: UdpSocket, map: Arc<HandlerMap>) -> Self {
        Self {
            socket,
            dispatcher: Dispatcher::new(map.clone()),
            map,
            pool: BufferPool::new(MAX_RECEIVE_PACKET_SIZE, POOL_CACHE),
        }
    }

    /// Get the local `SocketAddr` the underlying socket is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The registry this endpoint routes through
    pub fn handler_map(&self) -> &Arc<HandlerMap> {
        &self.map
    }

    /// Read datagrams until the socket fails
    ///
    /// Per-packet errors are logged and do not stop the loop; a malformed
    /// or misrouted datagram must not take the rest of the system down. A
    /// read error is terminal: it closes the handler map, destroying every
    /// remaining connection with the error as the reason. Deliberate
    /// shutdown works the same way from the outside: abort the task running
    /// this future (or close the socket) and call
    /// [`HandlerMap::close`](crate::HandlerMap::close).
    pub async fn run(self) {
        loop {
            let mut buf = self.pool.take();
            match self.socket.recv_from(&mut buf).await {
                Ok((n, remote)) => {
                    // Hand the dispatcher an owned copy; the read buffer
                    // goes straight back to the pool. Datagrams larger
                    // than the buffer arrive truncated and get dropped
                    // downstream as undecodable.
                    let data = BytesMut::from(&buf[..n]);
                    self.pool.put(buf);
                    if let Err(e) = self.dispatcher.handle_datagram(remote, data).await {
                        debug!(%remote, "error handling packet: {e}");
                    }
                }
                // Undefined for QUIC and may be injected by an attacker;
                // never fatal
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    self.pool.put(buf);
                    continue;
                }
                Err(e) => {
                    error!("socket read failed: {e}");
                    self.map.close(CloseReason::SocketError(Arc::new(e))).await;
                    return;
                }
            }
        }
    }
}

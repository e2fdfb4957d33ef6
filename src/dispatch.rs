//! Per-datagram routing and delivery
//!
//! The dispatcher is the only consumer of [`HandlerMap::route`]: it decides
//! where a datagram goes using nothing but the invariant header prefix,
//! then finishes parsing and delivers outside the registry lock. Every
//! error here is contained to the one datagram that caused it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use thiserror::Error;
use tracing::trace;

use crate::cid::ConnectionId;
use crate::packet::{Header, PacketDecodeError, PartialDecode};
use crate::registry::{HandlerMap, Route};
use crate::shared::{CloseReason, ConnectionHandler, ReceivedPacket, ServerHandler};
use crate::Side;

/// Routes datagrams from one socket to the connections sharing it
pub struct Dispatcher {
    map: Arc<HandlerMap>,
}

enum Delivery {
    Connection(Arc<dyn ConnectionHandler>),
    Server(Arc<dyn ServerHandler>),
}

impl Dispatcher {
    /// Create a dispatcher feeding the given registry's handlers
    pub fn new(map: Arc<HandlerMap>) -> Self {
        Self { map }
    }

    /// Route one datagram and deliver it
    ///
    /// Errors mean the datagram was dropped; they are diagnostics for an
    /// observability channel, never grounds for stopping the receive loop,
    /// and never answered on the wire.
    pub async fn handle_datagram(
        &self,
        remote: SocketAddr,
        data: BytesMut,
    ) -> Result<(), DispatchError> {
        let rcv_time = Instant::now();
        let decode = PartialDecode::new(data, self.map.local_cid_len())?;
        let dst_cid = decode.dst_cid();

        // Routing decision under the shared lock; everything past this
        // match runs with the lock released.
        let (delivery, sender, version) = match self.map.route(&decode) {
            Route::Connection {
                handler,
                sender,
                version,
            } => (Delivery::Connection(handler), sender, version),
            Route::Server { server, version } => (Delivery::Server(server), Side::Client, version),
            Route::Reset { handler } => {
                trace!(%dst_cid, %remote, "stateless reset");
                handler.destroy(CloseReason::StatelessReset).await;
                return Ok(());
            }
            Route::Unknown => return Err(DispatchError::UnknownConnection(dst_cid)),
            Route::NoServer => return Err(DispatchError::NoServer(dst_cid)),
        };

        let packet = decode.finish(sender, version)?;
        let mut payload = packet.payload;
        if let Header::Long { length, number, .. } = &packet.header {
            let pn_len = number.len() as u64;
            if *length < pn_len {
                return Err(DispatchError::LengthMismatch {
                    declared: *length,
                    actual: pn_len,
                });
            }
            if (payload.len() as u64) < length - pn_len {
                return Err(DispatchError::LengthMismatch {
                    declared: *length,
                    actual: payload.len() as u64 + pn_len,
                });
            }
            // Anything coalesced after the first packet is not this
            // layer's business
            payload.truncate((length - pn_len) as usize);
        }

        let packet = ReceivedPacket {
            remote,
            header: packet.header,
            payload,
            rcv_time,
        };
        match delivery {
            Delivery::Connection(handler) => handler.handle_packet(packet),
            Delivery::Server(server) => server.handle_packet(packet),
        }
        Ok(())
    }
}

/// Why a datagram was dropped instead of delivered
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The header could not be parsed far enough to route
    #[error("error parsing header: {0}")]
    Malformed(#[from] PacketDecodeError),
    /// Short header for an unknown ID, and the tail matched no reset token
    #[error("short header packet with an unexpected connection ID {0}")]
    UnknownConnection(ConnectionId),
    /// Long header for an unknown ID with no server listening
    #[error("packet with an unexpected connection ID {0} and no server")]
    NoServer(ConnectionId),
    /// The long header's declared length disagrees with the bytes captured
    #[error("packet length {actual} bytes smaller than the declared length {declared} bytes")]
    LengthMismatch {
        /// Declared packet number plus payload length
        declared: u64,
        /// Packet number length plus bytes actually present
        actual: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{long_packet, short_packet, MockConnection, MockServer};
    use crate::{HandlerMap, MIN_STATELESS_RESET_SIZE, RESET_TOKEN_SIZE};
    use crate::{ConnectionId, ResetToken};

    const CID_LEN: usize = 8;

    fn remote() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    #[tokio::test]
    async fn delivers_to_owning_connection() {
        let map = HandlerMap::new(CID_LEN);
        let dispatcher = Dispatcher::new(map.clone());
        let conn = MockConnection::new(Side::Server);
        let id = ConnectionId::random(CID_LEN);
        map.insert(id, conn.clone());

        dispatcher
            .handle_datagram(remote(), short_packet(&id, b"hello"))
            .await
            .unwrap();

        let packets = conn.packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].remote, remote());
        assert_eq!(&packets[0].payload[..], b"hello");
        assert!(matches!(packets[0].header, Header::Short { .. }));
    }

    #[tokio::test]
    async fn unknown_long_header_goes_to_server() {
        let map = HandlerMap::new(CID_LEN);
        let dispatcher = Dispatcher::new(map.clone());
        let server = MockServer::new();
        map.set_server(server.clone());

        let payload = b"client hello";
        let length = 1 + payload.len() as u64; // one-byte packet number
        let data = long_packet(&[1; CID_LEN], &[2; CID_LEN], 7, length, payload);
        dispatcher.handle_datagram(remote(), data).await.unwrap();

        let packets = server.packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        match &packets[0].header {
            Header::Long { version, .. } => assert_eq!(*version, 7),
            h => panic!("unexpected header {h:?}"),
        }
        assert_eq!(&packets[0].payload[..], payload);
    }

    #[tokio::test]
    async fn unknown_long_header_without_server_is_dropped() {
        let map = HandlerMap::new(CID_LEN);
        let dispatcher = Dispatcher::new(map);
        let data = long_packet(&[1; CID_LEN], &[2; CID_LEN], 7, 2, b"x");
        match dispatcher.handle_datagram(remote(), data).await {
            Err(DispatchError::NoServer(id)) => assert_eq!(id, ConnectionId::new(&[1; CID_LEN])),
            other => panic!("expected routing miss, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn matching_reset_token_destroys_without_delivery() {
        let map = HandlerMap::new(CID_LEN);
        let dispatcher = Dispatcher::new(map.clone());
        let conn = MockConnection::new(Side::Client);
        let id = ConnectionId::random(CID_LEN);
        let token = ResetToken::from([0x5a; RESET_TOKEN_SIZE]);
        map.insert_with_reset_token(id, conn.clone(), token);

        // Unknown destination ID; the token rides in the trailing bytes
        let mut data = short_packet(&[0xee; CID_LEN], &[0; MIN_STATELESS_RESET_SIZE]);
        let tail = data.len() - RESET_TOKEN_SIZE;
        data[tail..].copy_from_slice(&token);

        dispatcher.handle_datagram(remote(), data).await.unwrap();
        assert_eq!(conn.destroy_count(), 1);
        assert!(matches!(
            conn.destroys.lock().unwrap()[0],
            CloseReason::StatelessReset
        ));
        assert_eq!(conn.packet_count(), 0);
    }

    #[tokio::test]
    async fn non_matching_short_header_is_dropped() {
        let map = HandlerMap::new(CID_LEN);
        let dispatcher = Dispatcher::new(map);
        let data = short_packet(&[0xee; CID_LEN], &[0; MIN_STATELESS_RESET_SIZE]);
        assert!(matches!(
            dispatcher.handle_datagram(remote(), data).await,
            Err(DispatchError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn long_header_payload_truncated_to_declared_length() {
        let map = HandlerMap::new(CID_LEN);
        let dispatcher = Dispatcher::new(map.clone());
        let conn = MockConnection::new(Side::Client);
        let id = ConnectionId::new(&[3; CID_LEN]);
        map.insert(id, conn.clone());

        // Declared 5 = 1 (packet number) + 4 (payload); 9 bytes captured
        let data = long_packet(&id, &[4; CID_LEN], 1, 5, &[0xaa; 9]);
        dispatcher.handle_datagram(remote(), data).await.unwrap();
        assert_eq!(conn.packets.lock().unwrap()[0].payload.len(), 4);
    }

    #[tokio::test]
    async fn long_header_length_mismatch_is_dropped() {
        let map = HandlerMap::new(CID_LEN);
        let dispatcher = Dispatcher::new(map.clone());
        let conn = MockConnection::new(Side::Client);
        let id = ConnectionId::new(&[3; CID_LEN]);
        map.insert(id, conn.clone());

        // Declared 10 = 1 + 9 payload bytes, but only 4 captured
        let data = long_packet(&id, &[4; CID_LEN], 1, 10, &[0xaa; 4]);
        match dispatcher.handle_datagram(remote(), data).await {
            Err(DispatchError::LengthMismatch { declared, actual }) => {
                assert_eq!(declared, 10);
                assert_eq!(actual, 5);
            }
            other => panic!("expected length mismatch, got {other:?}"),
        }
        assert_eq!(conn.packet_count(), 0);

        // Declared length smaller than the packet number itself
        let data = long_packet(&id, &[4; CID_LEN], 1, 0, b"");
        assert!(matches!(
            dispatcher.handle_datagram(remote(), data).await,
            Err(DispatchError::LengthMismatch { declared: 0, .. })
        ));
    }

    #[tokio::test]
    async fn malformed_header_is_dropped() {
        let map = HandlerMap::new(CID_LEN);
        let dispatcher = Dispatcher::new(map);
        let data = BytesMut::from(&[0x40, 0x01][..]); // short header cut mid-CID
        assert!(matches!(
            dispatcher.handle_datagram(remote(), data).await,
            Err(DispatchError::Malformed(_))
        ));
    }
}

//! Connection routing for a QUIC endpoint sharing one UDP socket.
//!
//! A single socket may host many logical connections, each identified by one
//! or more connection IDs chosen independently of the network address. This
//! crate implements the layer that sits between the socket and those
//! connections: a receive loop reads datagrams, a dispatcher extracts the
//! minimal routing header and decides which connection (or listening server)
//! owns each packet, and a shared [`HandlerMap`] tracks the ID-to-handler
//! association together with stateless reset tokens and shutdown state.
//!
//! The crate performs no crypto and no stream processing. Connections are
//! represented by the [`ConnectionHandler`] trait; whatever runs behind it
//! owns its own lifecycle and is only required to accept parsed packets and
//! to terminate when asked.
//!
//! The entry point is [`Endpoint`], which drives the receive loop, and
//! [`HandlerMap`], which connection and server lifecycles mutate directly.

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

use std::{ops, time::Duration};

mod buffer;
mod cid;
mod coding;
mod dispatch;
mod endpoint;
mod packet;
mod registry;
mod shared;

pub use crate::cid::{ConnectionId, ResetToken};
pub use crate::coding::UnexpectedEnd;
pub use crate::dispatch::{DispatchError, Dispatcher};
pub use crate::endpoint::Endpoint;
pub use crate::packet::{Header, Packet, PacketDecodeError, PacketNumber, PartialDecode};
pub use crate::registry::HandlerMap;
pub use crate::shared::{CloseReason, ConnectionHandler, ReceivedPacket, ServerHandler};

/// The maximum length of a connection ID
pub const MAX_CID_SIZE: usize = 20;

/// The length of a stateless reset token
pub const RESET_TOKEN_SIZE: usize = 16;

/// The smallest datagram that can carry a stateless reset
///
/// Short header byte, maximum-length connection ID, maximum-length packet
/// number, and the token itself.
pub const MIN_STATELESS_RESET_SIZE: usize = 1 + MAX_CID_SIZE + 4 + RESET_TOKEN_SIZE;

/// The largest datagram the receive loop will accept
///
/// Reads are capped at this size; anything longer arrives truncated and is
/// dropped downstream as undecodable.
pub const MAX_RECEIVE_PACKET_SIZE: usize = 1452;

/// How long a retired connection ID stays routable
///
/// Reordered packets for a retired ID may still be in flight; the mapping is
/// kept for this long before the delayed removal fires.
pub const RETIRE_CONNECTION_ID_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether an endpoint initiated or accepted a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil;

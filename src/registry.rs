//! The connection-ID registry shared by the receive path and all lifecycles
//!
//! One readers-writer lock guards the primary ID map, the reset-token index,
//! the listening-server slot, and the closed flag as a single logical unit:
//! a token must never outlive the entry that owns it, and lookups must never
//! observe the server slot and the maps in inconsistent states. Packet
//! lookups take the lock shared and release it before any handler is
//! invoked.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::cid::{ConnectionId, ResetToken};
use crate::packet::PartialDecode;
use crate::shared::{CloseReason, ConnectionHandler, ServerHandler};
use crate::{Side, RETIRE_CONNECTION_ID_TIMEOUT};

struct Entry {
    handler: Arc<dyn ConnectionHandler>,
    reset_token: Option<ResetToken>,
}

struct State {
    handlers: FxHashMap<ConnectionId, Entry>,
    reset_tokens: FxHashMap<ResetToken, Arc<dyn ConnectionHandler>>,
    server: Option<Arc<dyn ServerHandler>>,
    closed: bool,
}

impl State {
    /// Drop `id` and, in the same critical section, any token it owns
    fn remove(&mut self, id: &ConnectionId) {
        if let Some(entry) = self.handlers.remove(id) {
            if let Some(token) = entry.reset_token {
                self.reset_tokens.remove(&token);
            }
        }
    }
}

/// Routes connection IDs to their owning handlers
///
/// Stores every connection sharing one socket, keyed by connection ID, plus
/// the stateless reset tokens those connections have advertised and the
/// optional listening server for unrecognized long-header packets. Used by
/// the server to store accepted connections and by clients multiplexing
/// outgoing connections over one socket.
///
/// Connections call back into the map as their ID set evolves: registering
/// fresh IDs with [`insert`](Self::insert) and retiring rotated-out ones
/// with [`retire`](Self::retire).
pub struct HandlerMap {
    state: RwLock<State>,
    local_cid_len: usize,
    retire_timeout: Duration,
}

impl HandlerMap {
    /// Create an empty map for an endpoint issuing IDs of `local_cid_len`
    /// bytes
    pub fn new(local_cid_len: usize) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(State {
                handlers: FxHashMap::default(),
                reset_tokens: FxHashMap::default(),
                server: None,
                closed: false,
            }),
            local_cid_len,
            retire_timeout: RETIRE_CONNECTION_ID_TIMEOUT,
        })
    }

    /// The fixed length of locally-issued connection IDs
    ///
    /// Short headers do not carry an ID length; this is what the dispatcher
    /// slices off.
    pub fn local_cid_len(&self) -> usize {
        self.local_cid_len
    }

    /// Route packets for `id` to `handler`
    ///
    /// Last write wins if `id` is already present; avoiding collisions is
    /// the caller's responsibility. Ignored once the map is closed.
    pub fn insert(&self, id: ConnectionId, handler: Arc<dyn ConnectionHandler>) {
        let mut state = self.state.write().unwrap();
        if state.closed {
            trace!(%id, "insert on closed handler map ignored");
            return;
        }
        // An overwritten entry must not leave its token behind
        state.remove(&id);
        state.handlers.insert(
            id,
            Entry {
                handler,
                reset_token: None,
            },
        );
    }

    /// Route packets for `id` to `handler` and index its reset token
    ///
    /// Both maps are updated under a single lock acquisition, so no lookup
    /// can see the token without the entry or vice versa.
    pub fn insert_with_reset_token(
        &self,
        id: ConnectionId,
        handler: Arc<dyn ConnectionHandler>,
        token: ResetToken,
    ) {
        let mut state = self.state.write().unwrap();
        if state.closed {
            trace!(%id, "insert on closed handler map ignored");
            return;
        }
        state.remove(&id);
        state.handlers.insert(
            id,
            Entry {
                handler: handler.clone(),
                reset_token: Some(token),
            },
        );
        state.reset_tokens.insert(token, handler);
    }

    /// Stop routing `id`, along with its reset token if it has one
    ///
    /// A no-op if `id` is not mapped.
    pub fn remove(&self, id: ConnectionId) {
        self.state.write().unwrap().remove(&id);
    }

    /// Schedule removal of `id` after the retirement grace period
    ///
    /// The ID stays routable until the timer fires so that reordered
    /// packets still in flight reach their connection. Does not block; the
    /// eventual removal is unconditional and harmless if the entry is
    /// already gone. Re-inserting a retired ID does not cancel the pending
    /// removal.
    pub fn retire(self: &Arc<Self>, id: ConnectionId) {
        trace!(%id, "retiring connection ID");
        let map = Arc::clone(self);
        let delay = self.retire_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            map.remove(id);
        });
    }

    /// Install the listening server for unrecognized long-header packets
    pub fn set_server(&self, server: Arc<dyn ServerHandler>) {
        self.state.write().unwrap().server = Some(server);
    }

    /// Shut down the accepting side
    ///
    /// Clears the server slot, then gracefully closes every handler whose
    /// side is [`Side::Server`], concurrently, retiring each ID once its
    /// close completes. Client-side connections are untouched. Returns only
    /// after every affected connection has actually stopped.
    pub async fn close_server(self: &Arc<Self>) {
        let targets = {
            let mut state = self.state.write().unwrap();
            state.server = None;
            state
                .handlers
                .iter()
                .filter(|(_, entry)| entry.handler.side() == Side::Server)
                .map(|(id, entry)| (*id, entry.handler.clone()))
                .collect::<Vec<_>>()
        };
        debug!(connections = targets.len(), "closing server-side connections");
        let mut closing = JoinSet::new();
        for (id, handler) in targets {
            let map = Arc::clone(self);
            closing.spawn(async move {
                // Resolves once the connection's run loop has stopped
                handler.close().await;
                map.retire(id);
            });
        }
        while closing.join_next().await.is_some() {}
    }

    /// Terminal shutdown: destroy every remaining handler with `reason`
    ///
    /// Idempotent; the first call marks the map closed, tears every handler
    /// down concurrently, closes the server slot if one is installed, and
    /// returns once all teardowns have completed. Later calls return
    /// immediately.
    pub async fn close(&self, reason: CloseReason) {
        let (handlers, server) = {
            let mut state = self.state.write().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let handlers = state
                .handlers
                .values()
                .map(|entry| entry.handler.clone())
                .collect::<Vec<_>>();
            (handlers, state.server.take())
        };
        debug!(connections = handlers.len(), %reason, "closing handler map");
        let mut destructions = JoinSet::new();
        for handler in handlers {
            let reason = reason.clone();
            destructions.spawn(async move { handler.destroy(reason).await });
        }
        if let Some(server) = server {
            server.close_with_error(reason).await;
        }
        while destructions.join_next().await.is_some() {}
    }

    /// Whether terminal shutdown has begun
    pub fn is_closed(&self) -> bool {
        self.state.read().unwrap().closed
    }

    /// The routing decision for a partially decoded datagram
    ///
    /// Takes the lock shared; the returned handles outlive the critical
    /// section so the caller can finish parsing and deliver without holding
    /// the lock.
    pub(crate) fn route(&self, decode: &PartialDecode) -> Route {
        let state = self.state.read().unwrap();
        if let Some(entry) = state.handlers.get(&decode.dst_cid()) {
            // The sender sits on the opposite side of the local handler
            return Route::Connection {
                handler: entry.handler.clone(),
                sender: !entry.handler.side(),
                version: entry.handler.version(),
            };
        }
        if !decode.is_long_header() {
            if let Some(token) = ResetToken::from_tail(decode.datagram()) {
                if let Some(handler) = state.reset_tokens.get(&token) {
                    return Route::Reset {
                        handler: handler.clone(),
                    };
                }
            }
            return Route::Unknown;
        }
        match &state.server {
            Some(server) => Route::Server {
                server: server.clone(),
                version: decode.wire_version().unwrap_or(0),
            },
            None => Route::NoServer,
        }
    }

    #[cfg(test)]
    pub(crate) fn lookup(&self, id: &ConnectionId) -> Option<Arc<dyn ConnectionHandler>> {
        let state = self.state.read().unwrap();
        state.handlers.get(id).map(|entry| entry.handler.clone())
    }

    #[cfg(test)]
    pub(crate) fn known_handlers(&self) -> usize {
        self.state.read().unwrap().handlers.len()
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let state = self.state.read().unwrap();
        for (token, handler) in &state.reset_tokens {
            let owned = state.handlers.values().any(|entry| {
                entry.reset_token.as_ref() == Some(token) && Arc::ptr_eq(&entry.handler, handler)
            });
            assert!(owned, "reset token without a matching registry entry");
        }
        let tokens_in_entries = state
            .handlers
            .values()
            .filter(|entry| entry.reset_token.is_some())
            .count();
        assert_eq!(tokens_in_entries, state.reset_tokens.len());
    }
}

/// Outcome of a registry lookup, decided under one read-lock acquisition
pub(crate) enum Route {
    /// An existing connection claims the destination ID
    Connection {
        handler: Arc<dyn ConnectionHandler>,
        sender: Side,
        version: u32,
    },
    /// Unknown long-header destination with a listening server installed
    Server {
        server: Arc<dyn ServerHandler>,
        version: u32,
    },
    /// The datagram tail matched an advertised reset token
    Reset { handler: Arc<dyn ConnectionHandler> },
    /// Unknown short-header destination with no matching token
    Unknown,
    /// Unknown long-header destination and no server listening
    NoServer,
}

//! Mock handlers and packet builders shared by unit tests

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

use crate::{CloseReason, ConnectionHandler, ReceivedPacket, ServerHandler, Side};

pub(crate) fn subscribe() -> DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

pub(crate) struct MockConnection {
    side: Side,
    version: u32,
    pub(crate) packets: Mutex<Vec<ReceivedPacket>>,
    pub(crate) closes: Mutex<Vec<()>>,
    pub(crate) destroys: Mutex<Vec<CloseReason>>,
}

impl MockConnection {
    pub(crate) fn new(side: Side) -> Arc<Self> {
        Arc::new(Self {
            side,
            version: 1,
            packets: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            destroys: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn packet_count(&self) -> usize {
        self.packets.lock().unwrap().len()
    }

    pub(crate) fn destroy_count(&self) -> usize {
        self.destroys.lock().unwrap().len()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.lock().unwrap().len()
    }
}

#[async_trait]
impl ConnectionHandler for MockConnection {
    fn handle_packet(&self, packet: ReceivedPacket) {
        self.packets.lock().unwrap().push(packet);
    }

    fn side(&self) -> Side {
        self.side
    }

    fn version(&self) -> u32 {
        self.version
    }

    async fn close(&self) {
        self.closes.lock().unwrap().push(());
    }

    async fn destroy(&self, reason: CloseReason) {
        self.destroys.lock().unwrap().push(reason);
    }
}

#[derive(Default)]
pub(crate) struct MockServer {
    pub(crate) packets: Mutex<Vec<ReceivedPacket>>,
    pub(crate) closes: Mutex<Vec<CloseReason>>,
}

impl MockServer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ServerHandler for MockServer {
    fn handle_packet(&self, packet: ReceivedPacket) {
        self.packets.lock().unwrap().push(packet);
    }

    async fn close_with_error(&self, reason: CloseReason) {
        self.closes.lock().unwrap().push(reason);
    }
}

const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

/// A short-header packet with a one-byte packet number and the given payload
pub(crate) fn short_packet(dst: &[u8], payload: &[u8]) -> BytesMut {
    let mut buf = vec![FIXED_BIT];
    buf.extend_from_slice(dst);
    buf.push(0x01); // packet number
    buf.extend_from_slice(payload);
    BytesMut::from(&buf[..])
}

/// A long-header packet with a one-byte packet number
///
/// `length` declares the packet number plus payload size and must fit a
/// single-byte varint.
pub(crate) fn long_packet(dst: &[u8], src: &[u8], version: u32, length: u64, payload: &[u8]) -> BytesMut {
    assert!(length < 64);
    let mut buf = vec![LONG_HEADER_FORM | FIXED_BIT];
    buf.extend_from_slice(&version.to_be_bytes());
    let nibble = |len: usize| {
        assert!(len == 0 || (4..=18).contains(&len));
        if len == 0 {
            0
        } else {
            len as u8 - 3
        }
    };
    buf.push(nibble(dst.len()) << 4 | nibble(src.len()));
    buf.extend_from_slice(dst);
    buf.extend_from_slice(src);
    buf.push(length as u8);
    buf.push(0x01); // packet number
    buf.extend_from_slice(payload);
    BytesMut::from(&buf[..])
}

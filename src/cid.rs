//! Connection identifiers and stateless reset tokens

use std::fmt;

use bytes::Buf;
use rand::RngCore;

use crate::{MAX_CID_SIZE, MIN_STATELESS_RESET_SIZE, RESET_TOKEN_SIZE};

/// Identifier for a logical connection, independent of network address
///
/// An opaque byte string of up to [`MAX_CID_SIZE`] bytes. Equality is
/// byte-exact; the routing layer never interprets the contents.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct from a slice of at most [`MAX_CID_SIZE`] bytes
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Generate a random ID of the given length
    pub fn random(len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rand::thread_rng().fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// Read a fixed-length ID off the front of `buf`
    ///
    /// The caller has already checked that `len` bytes remain.
    pub(crate) fn from_buf(buf: &mut impl Buf, len: usize) -> Self {
        debug_assert!(buf.remaining() >= len);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        buf.copy_to_slice(&mut res.bytes[..len]);
        res
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Stateless reset token
///
/// A 16-byte value a connection may advertise so that a peer which has lost
/// all connection state can still signal a reset. Incoming resets arrive in
/// otherwise-unroutable short-header packets with the token in the trailing
/// bytes.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    /// Extract the candidate token from the tail of a datagram
    ///
    /// Returns `None` if the datagram is too short to be a stateless reset.
    pub fn from_tail(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < MIN_STATELESS_RESET_SIZE {
            return None;
        }
        let tail = &datagram[datagram.len() - RESET_TOKEN_SIZE..];
        Some(Self(tail.try_into().unwrap()))
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl ::std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

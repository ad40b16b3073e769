//! A process-wide recycling pool for packet envelopes.
//!
//! Tunnels move packets around constantly; acquiring each envelope from a
//! shared shelf keeps the hot path free of allocator churn. The pool is
//! injected at tunnel construction rather than reached through a global,
//! so ownership of the shared state stays explicit.

use std::sync::{Arc, Mutex};

use crate::packet::{Packet, PacketError};

/// A bounded shelf of reusable [`Packet`] envelopes, safe for concurrent
/// use. Releasing beyond the bound simply drops the envelope.
pub struct PacketPool {
    shelf: Mutex<Vec<Packet>>,
    capacity: usize,
}

impl PacketPool {
    /// Creates a pool that retains at most `capacity` idle envelopes.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            shelf: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        })
    }

    /// Takes a cleared envelope off the shelf, or allocates a fresh one.
    pub fn acquire(&self) -> Packet {
        self.shelf
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(Packet::empty)
    }

    /// Returns an envelope to the shelf. Fields are reset first so stale
    /// state cannot leak into the next use.
    pub fn release(&self, mut packet: Packet) {
        packet.reset();
        let mut shelf = self.shelf.lock().unwrap();
        if shelf.len() < self.capacity {
            shelf.push(packet);
        }
    }

    /// Decodes a wire frame into a pooled envelope.
    pub fn decode(&self, bytes: &[u8]) -> Result<Packet, PacketError> {
        let mut packet = self.acquire();
        match packet.decode_into(bytes) {
            Ok(()) => Ok(packet),
            Err(e) => {
                self.release(packet);
                Err(e)
            }
        }
    }

    /// How many idle envelopes are currently shelved.
    pub fn idle(&self) -> usize {
        self.shelf.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Flags;

    #[test]
    fn recycles_and_resets() {
        let pool = PacketPool::new(4);
        let mut packet = pool.acquire();
        packet.seq = 9;
        packet.flag = Flags::SYN;
        packet.content.extend_from_slice(b"payload");
        pool.release(packet);
        assert_eq!(pool.idle(), 1);

        let packet = pool.acquire();
        assert_eq!(pool.idle(), 0);
        assert_eq!(packet.seq, 0);
        assert!(packet.flag.is_empty());
        assert!(packet.content.is_empty());
    }

    #[test]
    fn bounded_shelf() {
        let pool = PacketPool::new(2);
        for _ in 0..5 {
            pool.release(Packet::empty());
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn decode_failure_returns_envelope() {
        let pool = PacketPool::new(2);
        assert!(pool.decode(&[1, 2, 3]).is_err());
        assert_eq!(pool.idle(), 1);
    }
}

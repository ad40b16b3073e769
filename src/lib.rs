//! A reliable, ordered byte-stream transport over an unreliable datagram
//! substrate, paired with a symmetric stream-cipher wrapper that turns any
//! bidirectional byte stream into an encrypted one. Together they form a
//! lightweight tunneling primitive: a TCP-shaped reliability engine
//! (connection establishment and teardown, congestion control,
//! retransmission, selective acknowledgement) and a per-connection
//! encryption layer bootstrapped by a bidirectional IV exchange.
//!
//! # Organization
//!
//! - [`packet`] defines the packet envelope and its wire codec
//! - [`pool`] recycles packet envelopes without allocator churn
//! - [`queue`] keeps packets ordered by sequence number
//! - [`tunnel`] is the reliability engine and its driving task
//! - [`crypt`] wraps a byte stream in a CFB stream cipher after an IV
//!   exchange
//!
//! # Collaborators
//!
//! The datagram multiplexer that routes inbound frames to the right tunnel,
//! the front-end that accepts user connections, logging setup, and key
//! sourcing all live outside this crate. A tunnel touches the world through
//! exactly two channels: an input channel of decoded [`packet::Packet`]s
//! and an output channel of packets to be put on the wire.

pub mod config;
pub mod crypt;
pub mod packet;
pub mod pool;
pub mod queue;
pub mod tunnel;

pub(crate) mod seq;

pub use config::TunnelConfig;
pub use crypt::{new_block, Block, CryptStream, HandshakeError, Method};
pub use packet::{Flags, Packet, PacketError};
pub use pool::PacketPool;
pub use tunnel::{EndReason, Initiation, Status, TunnelHandle, TunnelStats};

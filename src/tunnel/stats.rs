//! Per-tunnel traffic counters. Written only by the tunnel's own task; a
//! snapshot is published for the handle after every loop turn.

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub received_packets: u64,
    pub received_bytes: u64,
    /// Segments sent more than once, by timeout or fast retransmit.
    pub retransmitted: u64,
    /// Selective acknowledgments received.
    pub sacks_received: u64,
    /// Packets dropped for framing or protocol violations.
    pub dropped: u64,
}

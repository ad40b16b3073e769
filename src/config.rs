//! Tunnel configuration.

use std::time::Duration;

/// Knobs consumed by the reliability engine. Loading these from files or
/// flags is a front-end concern; the engine only reads the struct.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Maximum payload bytes per data packet.
    pub mss: usize,
    /// Timer granularity.
    pub tick: Duration,
    /// How long the peer may stay silent before the tunnel resets.
    pub keepalive: Duration,
    /// Bound on the SYN / SYN-ACK wait.
    pub connect_timeout: Duration,
    /// How long a closing tunnel lingers in TIME-WAIT.
    pub finwait: Duration,
    /// Coalesce ACKs into the next tick instead of answering per packet.
    pub delayed_ack: bool,
    /// Consecutive selective acks that trigger a fast retransmit.
    pub retrans_sackcount: u32,
    /// Multiplier applied to in-flight bytes when deriving the new
    /// slow-start threshold on fast retransmit. In (0, 1].
    pub backrate: f32,
    /// Receive buffer size, advertised to the peer as the window.
    pub window: u32,
    /// Timeout-based retransmissions tolerated before the tunnel gives up.
    pub retrans_limit: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mss: 512,
            tick: Duration::from_millis(100),
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
            finwait: Duration::from_secs(30),
            delayed_ack: true,
            retrans_sackcount: 2,
            backrate: 0.5,
            window: 256 * 1024,
            retrans_limit: 10,
        }
    }
}

/// The tunnel connection state machine. It follows TCP's established shape
/// with two simplifications: there is no LISTEN state (a passive tunnel
/// sits in CLOSED until its first SYN arrives), and the passive close skips
/// CLOSE-WAIT by answering a FIN with FIN|ACK immediately, jumping straight
/// to LAST-ACK.
///
/// ```text
///                          +---------+ --------\      active open
///                          |  CLOSED |           \    -----------
///                          +---------+<-------\   \     snd SYN
///                            |      ^          \   \
///                  rcv SYN   |      | finwait   \   \
///                ----------- |      | expiry     \   v
///                snd SYN,ACK |      |         +---------+
///                            v      |         | SYNSENT |
///                      +---------+  |         +---------+
///                      | SYNRCVD |  |              |
///                      +---------+  | rcv SYN,ACK  |
///                 rcv ACK    |      | -----------  |
///                 -------    |      |   snd ACK    |
///                            v      |              v
///                         +--------------------------+
///                         |       ESTABLISHED        |
///                         +--------------------------+
///                 close()   |                 |  rcv FIN
///                --------   |                 |  -----------
///                 snd FIN   |                 |  snd FIN,ACK
///                           v                 v
///                     +----------+       +---------+
///                     | FINWAIT1 |       | LASTACK |
///                     +----------+       +---------+
///      rcv ACK of FIN   |      \  rcv FIN     |  rcv ACK of FIN
///      --------------   |       \ -------     |  --------------
///                       v        \ snd ACK    v        x
///                 +----------+    \       (to CLOSED)
///                 | FINWAIT2 |     v
///                 +----------+   +---------+
///           rcv FIN     |        | CLOSING |
///           -------     |        +---------+
///           snd ACK     |             |  rcv ACK of FIN
///                       v             v  --------------
///                     +--------------------+
///                     |      TIMEWAIT      | ---> CLOSED on finwait expiry
///                     +--------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// No connection. Both the resting state of a passive tunnel and the
    /// terminal state of every tunnel.
    Closed,
    /// Waiting for a matching SYN|ACK after having sent a SYN.
    SynSent,
    /// Waiting for the acknowledgment that completes a passive open.
    SynRcvd,
    /// The data-transfer state.
    Established,
    /// Sent our FIN, waiting for it to be acknowledged or for the peer's
    /// own FIN to cross it.
    FinWait1,
    /// Our FIN is acknowledged; waiting for the peer's FIN.
    FinWait2,
    /// FINs crossed; waiting for the acknowledgment of ours.
    Closing,
    /// Lingering until the finwait timer expires so stray retransmissions
    /// die out. Never emits data.
    TimeWait,
    /// Answered the peer's FIN with our own; waiting for the final ACK.
    LastAck,
}

//! Outbound path: segmentation under the congestion and flow windows,
//! acknowledgment emission and coalescing, selective acks, and the final
//! stamping every wire-bound packet receives.

use std::time::Instant;

use crate::packet::{Flags, Packet};
use crate::seq::seq_diff;

use super::{Status, Tunnel};

/// Upper bound on ids carried by one selective ack.
const MAX_SACK_IDS: usize = 64;

impl Tunnel {
    /// Segmentizes buffered application bytes while the windows allow, and
    /// emits the pending FIN once a close has drained the buffer.
    pub(crate) fn pump_send(&mut self) {
        if self.done.is_some() {
            return;
        }
        while !self.writebuf.is_empty() && self.status == Status::Established {
            let quota = self.send_quota();
            if quota <= 0 {
                break;
            }
            let n = self.cfg.mss.min(self.writebuf.len()).min(quota as usize);
            let mut packet = self.pool.acquire();
            packet.content.extend(self.writebuf.drain(..n));
            packet.seq = self.sendseq;
            if self.timer.dack != 0 || self.recvack != self.recvseq {
                // Coalesce the pending acknowledgment onto this segment.
                packet.flag = Flags::ACK;
            }
            self.sendseq = self.sendseq.wrapping_add(n as i32);
            self.transmit(packet);
        }
        if self.closing && self.writebuf.is_empty() && self.status == Status::Established {
            self.closing = false;
            self.send_ctl(Flags::FIN | Flags::ACK);
            self.transition(Status::FinWait1);
        }
    }

    /// How many more bytes may enter the air right now.
    fn send_quota(&self) -> i32 {
        let in_flight = self
            .sendbuf
            .head_seq()
            .map(|head| seq_diff(self.sendseq, head))
            .unwrap_or(0);
        self.cwnd.min(self.sendwnd) - in_flight
    }

    /// Emits a pure acknowledgment immediately.
    pub(crate) fn send_ack(&mut self) {
        let mut packet = self.pool.acquire();
        packet.seq = self.sendseq;
        packet.flag = Flags::ACK;
        self.emit(packet);
    }

    /// Owes the peer an acknowledgment: either coalesced into the next
    /// tick or sent right away, per configuration.
    pub(crate) fn ack_soon(&mut self) {
        if self.cfg.delayed_ack {
            if self.timer.dack == 0 {
                self.timer.dack = self.cfg.tick.as_millis() as i64;
            }
        } else {
            self.send_ack();
        }
    }

    /// Reports the reorder buffer to the peer so it can retransmit into
    /// the gap without waiting for a timeout.
    pub(crate) fn send_sack(&mut self) {
        let ids: Vec<i32> = self
            .recvbuf
            .iter()
            .map(|packet| packet.seq)
            .take(MAX_SACK_IDS)
            .collect();
        if ids.is_empty() {
            return;
        }
        let mut packet = self.pool.acquire();
        packet.seq = self.sendseq;
        // No ACK bit: a cumulative ack would count as a clean ack at the
        // peer and reset its sack episode.
        packet.flag = Flags::SACK;
        packet.set_sack_ids(&ids);
        self.emit(packet);
    }

    pub(crate) fn send_rst(&mut self) {
        let mut packet = self.pool.acquire();
        packet.seq = self.sendseq;
        packet.flag = Flags::RST;
        self.emit(packet);
    }

    /// Sends a control packet that occupies one sequence unit and must be
    /// acknowledged (SYN, SYN|ACK, FIN|ACK).
    pub(crate) fn send_ctl(&mut self, flags: Flags) {
        let mut packet = self.pool.acquire();
        packet.seq = self.sendseq;
        packet.flag = flags;
        self.sendseq = self.sendseq.wrapping_add(1);
        self.transmit(packet);
    }

    /// First transmission of a retransmittable packet: stamp the send
    /// time, arm the retransmit timer, put a copy on the wire and the
    /// original into the send buffer.
    fn transmit(&mut self, mut packet: Packet) {
        packet.t = Instant::now();
        if self.timer.rexmt == 0 {
            self.timer.rexmt = self.rto.max(1);
        }
        self.emit(packet.clone());
        if let Some(duplicate) = self.sendbuf.push(packet) {
            self.pool.release(duplicate);
        }
    }

    /// Puts a copy of an already-buffered packet back on the wire.
    pub(crate) fn retransmit(&mut self, packet: Packet) {
        self.stats.retransmitted += 1;
        self.emit(packet);
    }

    /// Final stamping for every wire-bound packet: fill in the
    /// acknowledgment if one is carried, advertise the current window, and
    /// queue it for the task to forward.
    fn emit(&mut self, mut packet: Packet) {
        if packet.flag.ack() {
            packet.ack = self.recvseq;
            self.recvack = self.recvseq;
            self.timer.dack = 0;
        }
        packet.window = self.recv_window();
        self.stats.sent_packets += 1;
        if !packet.flag.sack() {
            self.stats.sent_bytes += packet.content.len() as u64;
        }
        tracing::trace!(packet = ?packet, "send");
        self.outgoing.push_back(packet);
    }
}

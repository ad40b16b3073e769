//! Inbound packet processing: the packet state machine, acknowledgment
//! and round-trip estimation, and selective-ack fast retransmit.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::Instant;

use crate::packet::{Flags, Packet, PacketError};
use crate::queue::PacketQueue;
use crate::seq::{seq_diff, seq_lt};

use super::{EndReason, Status, Tunnel};

impl Tunnel {
    /// Processes one decoded inbound packet. Ownership of the packet
    /// transfers here; it is recycled or buffered before returning.
    pub(crate) fn on_packet(&mut self, mut pkt: Packet) {
        if self.done.is_some() {
            self.pool.release(pkt);
            return;
        }
        tracing::trace!(packet = ?pkt, "recv");
        self.stats.received_packets += 1;
        self.timer.keep = self.cfg.keepalive.as_millis() as i64;

        if pkt.flag.rst() {
            self.pool.release(pkt);
            self.terminate(EndReason::Reset);
            return;
        }

        let diff = seq_diff(pkt.seq, self.recvseq);
        let size = pkt.content.len();

        // Fast path: the next in-order data segment, with nothing buffered
        // right behind it that would need draining.
        if self.status == Status::Established
            && pkt.flag.is_empty()
            && diff == 0
            && size != 0
            && self.recvbuf.head_seq() != Some(pkt.seq.wrapping_add(size as i32))
        {
            self.recv_data(&mut pkt);
            self.pool.release(pkt);
            self.ack_soon();
            return;
        }

        if diff >= 0 {
            if pkt.flag.ack() {
                self.recv_ack(&pkt);
            }
            if pkt.flag.sack() {
                if let Err(e) = self.recv_sack(&pkt) {
                    self.stats.dropped += 1;
                    tracing::error!(packet = ?pkt, "dropping bad selective ack: {e}");
                }
                self.pool.release(pkt);
                return;
            }
        }

        match self.status {
            Status::TimeWait => {
                // Only a fresh SYN matters here: it means the peer has
                // moved on, so finish dying and make room.
                if pkt.flag.syn() {
                    self.terminate(EndReason::Closed);
                }
                self.pool.release(pkt);
                return;
            }
            Status::FinWait1 if pkt.flag == Flags::ACK && pkt.ack == self.sendseq => {
                self.transition(Status::FinWait2);
                self.pool.release(pkt);
                return;
            }
            Status::Closing if pkt.flag == Flags::ACK && pkt.ack == self.sendseq => {
                self.transition(Status::TimeWait);
                self.timer.finwait = self.cfg.finwait.as_millis() as i64;
                self.pool.release(pkt);
                return;
            }
            Status::LastAck if pkt.flag == Flags::ACK && pkt.ack == self.sendseq => {
                self.transition(Status::Closed);
                self.pool.release(pkt);
                self.terminate(EndReason::Closed);
                return;
            }
            Status::SynRcvd => {
                // Anything legal past the SYN completes the passive open.
                self.timer.conn = 0;
                self.transition(Status::Established);
                self.write_open = true;
                self.signal_connected(Ok(()));
            }
            _ => {}
        }

        match diff.cmp(&0) {
            Ordering::Less => {
                // Duplicate of something already delivered. Refresh the
                // peer's view unless this is itself a bare ACK.
                if pkt.flag != Flags::ACK {
                    self.send_ack();
                }
                self.pool.release(pkt);
            }
            Ordering::Equal => {
                let mut ackneed = false;
                let mut current = Some(pkt);
                while let Some(mut packet) = current.take() {
                    ackneed |= self.proc_current(&mut packet);
                    self.pool.release(packet);
                    if self.done.is_some() {
                        return;
                    }
                    if self.recvbuf.head_seq() == Some(self.recvseq) {
                        current = self.recvbuf.pop();
                    }
                }
                if ackneed || self.recvack != self.recvseq {
                    self.ack_soon();
                }
            }
            Ordering::Greater => {
                if !pkt.content.is_empty() || pkt.flag != Flags::ACK {
                    if let Some(duplicate) = self.recvbuf.push(pkt) {
                        self.pool.release(duplicate);
                    }
                } else {
                    self.pool.release(pkt);
                }
                self.send_sack();
            }
        }
    }

    /// Handles the single packet sitting exactly at `recvseq`. Returns
    /// whether an acknowledgment is owed for it.
    fn proc_current(&mut self, pkt: &mut Packet) -> bool {
        self.sendwnd = pkt.window as i32;

        if !pkt.content.is_empty() {
            self.recv_data(pkt);
            return false;
        }
        if pkt.flag.is_empty() {
            return true;
        }
        if pkt.flag == Flags::ACK {
            return false;
        }

        // A SYN or FIN control occupies one sequence unit.
        self.recvseq = self.recvseq.wrapping_add(1);

        if pkt.flag.syn() {
            if pkt.flag.ack() {
                if self.status != Status::SynSent {
                    self.protocol_violation("SYN|ACK", pkt);
                    return false;
                }
                self.timer.conn = 0;
                self.transition(Status::Established);
                self.send_ack();
                self.write_open = true;
                self.signal_connected(Ok(()));
            } else {
                if self.status != Status::Closed {
                    self.protocol_violation("SYN", pkt);
                    return false;
                }
                self.transition(Status::SynRcvd);
                self.timer.conn = self.cfg.connect_timeout.as_millis() as i64;
                self.send_ctl(Flags::SYN | Flags::ACK);
            }
        } else if pkt.flag.fin() {
            match self.status {
                Status::Established => {
                    // No half-close for the application: answer with our
                    // own FIN at once and wait for its acknowledgment.
                    self.transition(Status::LastAck);
                    self.send_ctl(Flags::FIN | Flags::ACK);
                    self.write_open = false;
                }
                Status::FinWait1 => {
                    if self.sendbuf.is_empty() {
                        self.transition(Status::TimeWait);
                        self.send_ack();
                        self.timer.finwait = self.cfg.finwait.as_millis() as i64;
                    } else {
                        self.transition(Status::Closing);
                        self.send_ack();
                    }
                }
                Status::FinWait2 => {
                    self.transition(Status::TimeWait);
                    self.send_ack();
                    self.timer.finwait = self.cfg.finwait.as_millis() as i64;
                }
                _ => self.protocol_violation("FIN", pkt),
            }
        }
        false
    }

    /// Delivers an in-order payload to the application and advances the
    /// receive cursor.
    fn recv_data(&mut self, pkt: &mut Packet) {
        let size = pkt.content.len();
        {
            let mut readbuf = self.readbuf.lock().unwrap();
            readbuf.extend(pkt.content.drain(..));
        }
        self.read_ready.notify_one();
        self.recvseq = self.recvseq.wrapping_add(size as i32);
        self.stats.received_bytes += size as u64;
    }

    /// Cumulative acknowledgment: drop acknowledged packets from the send
    /// buffer, sample the round-trip time, and grow the congestion window.
    fn recv_ack(&mut self, pkt: &Packet) {
        let now = Instant::now();
        let resend = self.sack_count >= 2 || self.retrans_count != 0;

        while self
            .sendbuf
            .peek()
            .map(|head| seq_lt(head.seq, pkt.ack))
            .unwrap_or(false)
        {
            let Some(acked) = self.sendbuf.pop() else {
                break;
            };
            // A packet that may have been retransmitted gives no usable
            // sample (Karn's rule).
            if !resend {
                let sample = now.saturating_duration_since(acked.t).as_micros() as u32;
                if self.rtt == 0 {
                    self.rtt = sample + 1;
                    self.rttvar = self.rtt / 2;
                } else {
                    let delta = sample as i64 - self.rtt as i64;
                    self.rtt = (self.rtt as i64 + delta / 8).max(1) as u32;
                    self.rttvar =
                        (self.rttvar as i64 + (delta.abs() - self.rttvar as i64) / 4).max(0) as u32;
                }
            }
            self.pool.release(acked);
        }

        if self.rtt != 0 {
            // Floor at the tick: the timer cannot resolve anything finer.
            self.rto = ((self.rtt as i64 + 4 * self.rttvar as i64 + 999) / 1000)
                .max(self.cfg.tick.as_millis() as i64);
            tracing::trace!(
                rtt = self.rtt,
                rttvar = self.rttvar,
                rto = self.rto,
                "rtt estimate"
            );
        }

        let mss = self.cfg.mss as i32;
        if resend {
            // The retransmit episode is over; fall back to the threshold.
            self.cwnd = self.ssthresh;
        } else if self.cwnd <= self.ssthresh {
            self.cwnd += mss;
        } else if self.cwnd < mss * mss {
            self.cwnd += mss * mss / self.cwnd;
        } else {
            self.cwnd += 1;
        }
        self.sack_count = 0;
        self.sack_sent.clear();
        self.retrans_count = 0;
        tracing::trace!(cwnd = self.cwnd, ssthresh = self.ssthresh, "congestion adjust, ack");

        if self.timer.rexmt != 0 {
            self.timer.rexmt = match self.sendbuf.peek() {
                Some(head) => (self.rto - head.t.elapsed().as_millis() as i64).max(1),
                None => 0,
            };
        }
    }

    /// Selective acknowledgment: the payload lists, ascending, the
    /// sequence numbers the peer is holding in its reorder buffer. Packets
    /// named there are implicitly acknowledged; in-flight packets below
    /// the highest named one are candidates for fast retransmit.
    fn recv_sack(&mut self, pkt: &Packet) -> Result<(), PacketError> {
        self.stats.sacks_received += 1;
        let ids = pkt.sack_ids()?;
        tracing::trace!(?ids, "selective ack");

        let mut last_id = None;
        if let Some((&first, rest)) = ids.split_first() {
            let mut cur_id = first;
            last_id = Some(first);
            let mut rest = rest.iter().copied();

            // Walk the send buffer and the id stream in lockstep,
            // rebuilding the buffer without the acknowledged entries.
            let mut kept: VecDeque<Packet> = VecDeque::with_capacity(self.sendbuf.len());
            let mut src = std::mem::take(&mut self.sendbuf).into_iter();
            let mut pending = src.next();
            loop {
                let Some(packet) = pending.take() else {
                    break;
                };
                let df = seq_diff(packet.seq, cur_id);
                match df.cmp(&0) {
                    Ordering::Equal => self.pool.release(packet),
                    Ordering::Less => kept.push_back(packet),
                    Ordering::Greater => pending = Some(packet),
                }
                if df >= 0 {
                    match rest.next() {
                        Some(next_id) => {
                            cur_id = next_id;
                            last_id = Some(next_id);
                        }
                        None => break,
                    }
                }
                if pending.is_none() {
                    pending = src.next();
                }
            }
            if let Some(packet) = pending {
                kept.push_back(packet);
            }
            kept.extend(src);
            self.sendbuf = PacketQueue::from_sorted(kept);
        }

        self.sack_count += 1;
        if self.sack_count < self.cfg.retrans_sackcount {
            return Ok(());
        }

        let mss = self.cfg.mss as i32;
        if self.sack_count == self.cfg.retrans_sackcount {
            let inair = self
                .sendbuf
                .head_seq()
                .map(|head| seq_diff(self.sendseq, head))
                .unwrap_or(0);
            self.ssthresh = ((inair as f32 * self.cfg.backrate) as i32).max(2 * mss);
            self.cwnd = self.ssthresh + 3 * mss;
            tracing::debug!(
                cwnd = self.cwnd,
                ssthresh = self.ssthresh,
                "congestion adjust, fast retransmit"
            );
        } else {
            self.cwnd += mss;
            tracing::trace!(cwnd = self.cwnd, "congestion adjust, sack");
        }

        // Opportunistically resend everything below the highest
        // selectively acknowledged sequence, once per episode.
        if let Some(last_id) = last_id {
            let resend: Vec<Packet> = self
                .sendbuf
                .iter()
                .take_while(|packet| seq_lt(packet.seq, last_id))
                .filter(|packet| !self.sack_sent.contains(&packet.seq))
                .cloned()
                .collect();
            for packet in resend {
                self.sack_sent.insert(packet.seq);
                self.retransmit(packet);
            }
        }
        self.timer.rexmt = self.rto.max(1) << self.retrans_count.min(16);
        Ok(())
    }

    fn protocol_violation(&mut self, what: &str, pkt: &Packet) {
        self.stats.dropped += 1;
        tracing::error!(status = ?self.status, packet = ?pkt, "{what} in the wrong state");
    }
}

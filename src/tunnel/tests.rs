use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use super::*;
use crate::packet::{Flags, Packet};
use crate::pool::PacketPool;

fn config() -> TunnelConfig {
    TunnelConfig {
        mss: 256,
        tick: Duration::from_millis(100),
        delayed_ack: false,
        ..TunnelConfig::default()
    }
}

fn engine(cfg: TunnelConfig) -> Tunnel {
    Tunnel::new(
        cfg,
        PacketPool::new(64),
        Arc::new(Mutex::new(VecDeque::new())),
        Arc::new(Notify::new()),
        None,
        EndSignal::new(),
    )
}

fn take(tunnel: &mut Tunnel) -> Vec<Packet> {
    tunnel.outgoing.drain(..).collect()
}

fn deliver(tunnel: &mut Tunnel, packets: Vec<Packet>) {
    for packet in packets {
        tunnel.on_packet(packet);
    }
}

/// Shuttles packets between the two peers until the wire goes quiet.
/// Returns how many packets crossed in total.
fn pump(a: &mut Tunnel, b: &mut Tunnel) -> usize {
    let mut crossed = 0;
    loop {
        let from_a = take(a);
        let from_b = take(b);
        if from_a.is_empty() && from_b.is_empty() {
            return crossed;
        }
        crossed += from_a.len() + from_b.len();
        deliver(b, from_a);
        deliver(a, from_b);
    }
}

fn read_all(tunnel: &Tunnel) -> Vec<u8> {
    tunnel.readbuf.lock().unwrap().drain(..).collect()
}

fn established_pair(cfg: TunnelConfig) -> (Tunnel, Tunnel) {
    let mut a = engine(cfg.clone());
    let mut b = engine(cfg);
    a.connect();
    pump(&mut a, &mut b);
    assert_eq!(a.status(), Status::Established);
    assert_eq!(b.status(), Status::Established);
    (a, b)
}

#[test]
fn three_way_open() {
    //     Client                                       Server
    // 1.  CLOSED                                       CLOSED
    // 2.  SYNSENT --> <SEQ=0><CTL=SYN>             --> SYNRCVD
    // 3.  EST     <-- <SEQ=0><ACK=1><CTL=SYN,ACK>  <-- SYNRCVD
    // 4.  EST     --> <SEQ=1><ACK=1><CTL=ACK>      --> EST
    let mut client = engine(config());
    let mut server = engine(config());

    // 2
    client.connect();
    assert_eq!(client.status(), Status::SynSent);
    let syn = take(&mut client);
    assert_eq!(syn.len(), 1);
    assert!(syn[0].flag.syn());
    assert!(!syn[0].flag.ack());
    assert_eq!(syn[0].seq, 0);

    deliver(&mut server, syn);
    assert_eq!(server.status(), Status::SynRcvd);

    // 3
    let syn_ack = take(&mut server);
    assert_eq!(syn_ack.len(), 1);
    assert!(syn_ack[0].flag.syn());
    assert!(syn_ack[0].flag.ack());
    assert_eq!(syn_ack[0].seq, 0);
    assert_eq!(syn_ack[0].ack, 1);

    deliver(&mut client, syn_ack);
    assert_eq!(client.status(), Status::Established);

    // 4
    let ack = take(&mut client);
    assert_eq!(ack.len(), 1);
    assert_eq!(ack[0].flag, Flags::ACK);
    assert_eq!(ack[0].ack, 1);

    deliver(&mut server, ack);
    assert_eq!(server.status(), Status::Established);

    // Exactly three packets crossed the wire, and nothing is left over.
    assert!(take(&mut client).is_empty());
    assert!(take(&mut server).is_empty());
}

#[test]
fn in_order_transfer_acks_per_packet() {
    let (mut a, mut b) = established_pair(config());

    a.queue_write(&[7u8; 1024]);
    a.pump_send();
    let data = take(&mut a);
    assert_eq!(data.len(), 4);
    assert!(data.iter().all(|packet| packet.content.len() == 256));

    deliver(&mut b, data);
    let acks = take(&mut b);
    assert_eq!(acks.len(), 4);
    assert_eq!(read_all(&b), vec![7u8; 1024]);

    deliver(&mut a, acks);
    assert!(a.sendbuf.is_empty());
}

#[test]
fn in_order_transfer_coalesces_acks() {
    let mut cfg = config();
    cfg.delayed_ack = true;
    let (mut a, mut b) = established_pair(cfg);

    a.queue_write(&[7u8; 1024]);
    a.pump_send();
    let data = take(&mut a);
    assert_eq!(data.len(), 4);
    let last_seq = data[3].seq;

    deliver(&mut b, data);
    // Nothing on the wire yet: the acknowledgment waits for the tick.
    assert!(take(&mut b).is_empty());

    b.on_tick();
    let acks = take(&mut b);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].flag, Flags::ACK);
    assert_eq!(acks[0].ack, last_seq.wrapping_add(256));
    assert_eq!(read_all(&b), vec![7u8; 1024]);
}

#[test]
fn single_loss_triggers_fast_retransmit() {
    let mut cfg = config();
    cfg.mss = 1024;
    let (mut a, mut b) = established_pair(cfg);

    a.queue_write(&[42u8; 5 * 1024]);
    a.pump_send();
    let mut data = take(&mut a);
    assert_eq!(data.len(), 5);
    let p1 = data.remove(0);
    let p2 = data.remove(0);
    let sacked: Vec<i32> = data.iter().map(|packet| packet.seq).collect();

    // Segment one arrives; segment two is lost on the wire.
    deliver(&mut b, vec![p1]);
    let ack1 = take(&mut b);
    assert_eq!(ack1.len(), 1);
    deliver(&mut a, ack1);

    // The out-of-order tail provokes one selective ack per arrival,
    // each listing everything the reorder buffer holds.
    deliver(&mut b, data);
    let mut sacks = take(&mut b);
    assert_eq!(sacks.len(), 3);
    assert!(sacks.iter().all(|packet| packet.flag.sack()));
    assert!(sacks.iter().all(|packet| !packet.flag.ack()));
    assert_eq!(sacks[2].sack_ids().unwrap(), sacked);
    let sack3 = sacks.pop().unwrap();

    // The second selective ack crosses the fast-retransmit threshold.
    deliver(&mut a, sacks);
    let resent = take(&mut a);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].seq, p2.seq);
    assert_eq!(resent[0].content, p2.content);
    assert_eq!(a.ssthresh, 2 * 1024);
    assert_eq!(a.cwnd, a.ssthresh + 3 * 1024);

    // A third selective ack only inflates the window; the lost segment is
    // not sent twice in the same episode.
    let cwnd = a.cwnd;
    deliver(&mut a, vec![sack3]);
    assert!(take(&mut a).is_empty());
    assert_eq!(a.cwnd, cwnd + 1024);

    // The retransmission fills the gap and everything drains in order.
    deliver(&mut b, resent);
    let acks = take(&mut b);
    deliver(&mut a, acks);
    assert!(a.sendbuf.is_empty());
    assert_eq!(a.cwnd, a.ssthresh);
    assert_eq!(read_all(&b), vec![42u8; 5 * 1024]);
}

#[test]
fn retransmit_timeout_backs_off() {
    let (mut a, mut b) = established_pair(config());

    a.queue_write(&[1u8; 100]);
    a.pump_send();
    let first = take(&mut a);
    assert_eq!(first.len(), 1);
    drop(first); // lost on the wire

    // The handshake round trip was instantaneous, so the retransmission
    // timeout sits at its floor of one tick.
    assert_eq!(a.rto, 100);
    let ssthresh = a.ssthresh;
    a.on_tick();
    let r1 = take(&mut a);
    assert_eq!(r1.len(), 1);
    assert_eq!(r1[0].content, vec![1u8; 100]);
    assert_eq!(a.retrans_count, 1);
    assert_eq!(a.cwnd, 256);
    assert_eq!(a.ssthresh, (ssthresh / 2).max(512));

    // Exponential backoff: the second try waits twice as long, the third
    // four times.
    a.on_tick();
    assert!(take(&mut a).is_empty());
    a.on_tick();
    let r2 = take(&mut a);
    assert_eq!(r2.len(), 1);
    assert_eq!(a.retrans_count, 2);

    for _ in 0..3 {
        a.on_tick();
        assert!(a.outgoing.is_empty());
    }
    a.on_tick();
    let r3 = take(&mut a);
    assert_eq!(r3.len(), 1);
    assert_eq!(a.retrans_count, 3);

    // Eventual delivery acknowledges the segment and the window restarts
    // from the threshold.
    deliver(&mut b, r3);
    let acks = take(&mut b);
    deliver(&mut a, acks);
    assert!(a.sendbuf.is_empty());
    assert_eq!(a.cwnd, a.ssthresh);
    assert_eq!(a.retrans_count, 0);
    assert_eq!(read_all(&b), vec![1u8; 100]);
}

#[test]
fn clean_close_active_passive() {
    let (mut a, mut b) = established_pair(config());

    a.close();
    assert_eq!(a.status(), Status::FinWait1);
    let fin = take(&mut a);
    assert_eq!(fin.len(), 1);
    assert!(fin[0].flag.fin());

    deliver(&mut b, fin);
    assert_eq!(b.status(), Status::LastAck);
    assert!(!b.accepts_writes());
    let fin_ack = take(&mut b);
    assert!(fin_ack[0].flag.fin());
    assert!(fin_ack[0].flag.ack());

    deliver(&mut a, fin_ack);
    assert_eq!(a.status(), Status::TimeWait);
    let ack = take(&mut a);

    deliver(&mut b, ack);
    assert_eq!(b.status(), Status::Closed);
    assert_eq!(b.done, Some(EndReason::Closed));

    // TIME-WAIT expires quietly into CLOSED.
    for _ in 0..300 {
        a.on_tick();
    }
    assert_eq!(a.status(), Status::Closed);
    assert_eq!(a.done, Some(EndReason::Closed));
    assert!(take(&mut a).is_empty());
}

#[test]
fn simultaneous_close() {
    let (mut a, mut b) = established_pair(config());

    a.close();
    b.close();
    assert_eq!(a.status(), Status::FinWait1);
    assert_eq!(b.status(), Status::FinWait1);

    // The FINs cross on the wire.
    let fin_a = take(&mut a);
    let fin_b = take(&mut b);
    deliver(&mut a, fin_b);
    deliver(&mut b, fin_a);
    assert_eq!(a.status(), Status::Closing);
    assert_eq!(b.status(), Status::Closing);

    let ack_a = take(&mut a);
    let ack_b = take(&mut b);
    deliver(&mut a, ack_b);
    deliver(&mut b, ack_a);
    assert_eq!(a.status(), Status::TimeWait);
    assert_eq!(b.status(), Status::TimeWait);

    for _ in 0..300 {
        a.on_tick();
        b.on_tick();
    }
    assert_eq!(a.status(), Status::Closed);
    assert_eq!(b.status(), Status::Closed);
}

#[test]
fn close_flushes_buffered_bytes_before_fin() {
    let (mut a, mut b) = established_pair(config());

    // Clamp the peer window shut so the close cannot flush immediately.
    a.sendwnd = 0;
    a.queue_write(b"parting words");
    a.pump_send();
    a.close();
    assert_eq!(a.status(), Status::Established);
    assert!(take(&mut a).is_empty());

    // The window reopens; data goes out first, then the FIN.
    a.sendwnd = 1024;
    a.pump_send();
    let flushed = take(&mut a);
    assert_eq!(flushed.len(), 2);
    assert_eq!(flushed[0].content, b"parting words");
    assert!(flushed[1].flag.fin());
    assert_eq!(a.status(), Status::FinWait1);

    deliver(&mut b, flushed);
    assert_eq!(read_all(&b), b"parting words");
    assert_eq!(b.status(), Status::LastAck);
}

#[test]
fn duplicate_segment_is_reacknowledged() {
    let (mut a, mut b) = established_pair(config());

    a.queue_write(b"hello");
    a.pump_send();
    let data = take(&mut a);
    assert_eq!(data.len(), 1);

    deliver(&mut b, vec![data[0].clone()]);
    assert_eq!(take(&mut b).len(), 1);

    // The same segment again: re-acknowledged, not re-delivered.
    deliver(&mut b, data);
    let again = take(&mut b);
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].flag, Flags::ACK);
    assert_eq!(read_all(&b), b"hello");
}

#[test]
fn respects_peer_window() {
    let (mut a, _b) = established_pair(config());

    a.sendwnd = 300;
    a.queue_write(&[0u8; 1024]);
    a.pump_send();
    let data = take(&mut a);
    assert_eq!(
        data.iter().map(|packet| packet.content.len()).sum::<usize>(),
        300
    );
}

#[test]
fn keepalive_expiry_resets_the_tunnel() {
    let (mut a, _b) = established_pair(config());

    for _ in 0..600 {
        a.on_tick();
    }
    assert_eq!(a.done, Some(EndReason::KeepaliveExpired));
    let out = take(&mut a);
    assert!(out.last().unwrap().flag.rst());
}

#[test]
fn reset_ends_the_tunnel() {
    let (mut a, mut b) = established_pair(config());

    b.send_rst();
    deliver(&mut a, take(&mut b));
    assert_eq!(a.done, Some(EndReason::Reset));
    assert_eq!(a.status(), Status::Closed);
}

#[test]
fn connect_attempt_times_out() {
    let mut a = engine(config());
    a.connect();
    take(&mut a);

    // 15 seconds of silence at 100ms per tick.
    for _ in 0..150 {
        a.on_tick();
    }
    assert_eq!(a.done, Some(EndReason::ConnectTimeout));
}

#[test]
fn syn_in_timewait_finishes_the_teardown() {
    let (mut a, mut b) = established_pair(config());

    a.close();
    deliver(&mut b, take(&mut a));
    deliver(&mut a, take(&mut b));
    assert_eq!(a.status(), Status::TimeWait);
    take(&mut a);

    let mut syn = Packet::empty();
    syn.flag = Flags::SYN;
    deliver(&mut a, vec![syn]);
    assert_eq!(a.done, Some(EndReason::Closed));
}

#[test]
fn malformed_sack_is_dropped_not_fatal() {
    let (mut a, _b) = established_pair(config());

    let mut bogus = Packet::empty();
    bogus.seq = a.recvseq;
    bogus.ack = a.sendseq;
    bogus.flag = Flags::SACK | Flags::ACK;
    bogus.content = vec![1, 2, 3];
    deliver(&mut a, vec![bogus]);

    assert_eq!(a.done, None);
    assert_eq!(a.stats().dropped, 1);
}

#[test]
fn out_of_order_delivery_stays_contiguous() {
    let (mut a, mut b) = established_pair(config());

    a.queue_write(&[9u8; 768]);
    a.pump_send();
    let mut data = take(&mut a);
    assert_eq!(data.len(), 3);

    // Deliver in reverse: everything buffers until the head arrives.
    let head = data.remove(0);
    data.reverse();
    deliver(&mut b, data);
    assert!(read_all(&b).is_empty());
    take(&mut b);

    deliver(&mut b, vec![head]);
    assert_eq!(read_all(&b), vec![9u8; 768]);
    // The reorder buffer holds nothing at or below the receive cursor.
    assert!(b.recvbuf.is_empty());
}

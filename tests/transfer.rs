//! End-to-end transfers between two spawned tunnels wired together by
//! in-memory channels standing in for the datagram substrate.

use std::time::Duration;

use burrow::{tunnel, EndReason, Initiation, Packet, PacketPool, TunnelConfig};
use tokio::sync::mpsc;

/// Forwards packets from one tunnel's output to the other's input,
/// dropping every `drop_every`-th packet when nonzero.
async fn relay(mut from: mpsc::Receiver<Packet>, to: mpsc::Sender<Packet>, drop_every: usize) {
    let mut count = 0usize;
    while let Some(packet) = from.recv().await {
        count += 1;
        if drop_every != 0 && count % drop_every == 0 {
            continue;
        }
        if to.send(packet).await.is_err() {
            return;
        }
    }
}

fn payload() -> Vec<u8> {
    (0..50_000u32).map(|i| (i % 251) as u8).collect()
}

fn config() -> TunnelConfig {
    TunnelConfig {
        tick: Duration::from_millis(10),
        ..TunnelConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn transfer_over_lossless_substrate() -> anyhow::Result<()> {
    let pool = PacketPool::new(1024);
    let (a_out_tx, a_out_rx) = mpsc::channel(64);
    let (b_out_tx, b_out_rx) = mpsc::channel(64);
    let (mut a, a_in) = tunnel::spawn(config(), pool.clone(), a_out_tx, Initiation::Open);
    let (mut b, b_in) = tunnel::spawn(config(), pool, b_out_tx, Initiation::Listen);
    tokio::spawn(relay(a_out_rx, b_in, 0));
    tokio::spawn(relay(b_out_rx, a_in, 0));

    a.connected().await?;
    b.connected().await?;

    let sent = payload();
    for chunk in sent.chunks(8192) {
        a.write(chunk.to_vec()).await?;
    }

    let mut received = Vec::new();
    while received.len() < sent.len() {
        let chunk = b.read(usize::MAX).await;
        assert!(!chunk.is_empty(), "stream ended before the payload arrived");
        received.extend(chunk);
    }
    assert_eq!(received, sent);

    // A clean close tears both sides down.
    a.close();
    assert_eq!(a.ended().await, EndReason::Closed);
    assert_eq!(b.ended().await, EndReason::Closed);

    let stats = b.stats();
    assert_eq!(stats.received_bytes, sent.len() as u64);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn transfer_over_lossy_substrate() -> anyhow::Result<()> {
    let pool = PacketPool::new(1024);
    let (a_out_tx, a_out_rx) = mpsc::channel(64);
    let (b_out_tx, b_out_rx) = mpsc::channel(64);
    let (mut a, a_in) = tunnel::spawn(config(), pool.clone(), a_out_tx, Initiation::Open);
    let (b, b_in) = tunnel::spawn(config(), pool, b_out_tx, Initiation::Listen);
    // Every seventh packet vanishes, in both directions.
    tokio::spawn(relay(a_out_rx, b_in, 7));
    tokio::spawn(relay(b_out_rx, a_in, 7));

    a.connected().await?;

    let sent = payload();
    for chunk in sent.chunks(8192) {
        a.write(chunk.to_vec()).await?;
    }

    // Retransmission and selective acks must eventually deliver every
    // byte, contiguous and in order.
    let mut received = Vec::new();
    while received.len() < sent.len() {
        let chunk = b.read(usize::MAX).await;
        assert!(!chunk.is_empty(), "stream ended before the payload arrived");
        received.extend(chunk);
    }
    assert_eq!(received, sent);
    assert!(a.stats().sacks_received > 0 || a.stats().retransmitted > 0);

    a.close();
    a.ended().await;
    b.ended().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropped_handle_closes_cleanly() -> anyhow::Result<()> {
    let pool = PacketPool::new(64);
    let (a_out_tx, a_out_rx) = mpsc::channel(64);
    let (b_out_tx, b_out_rx) = mpsc::channel(64);
    let (mut a, a_in) = tunnel::spawn(config(), pool.clone(), a_out_tx, Initiation::Open);
    let (b, b_in) = tunnel::spawn(config(), pool, b_out_tx, Initiation::Listen);
    tokio::spawn(relay(a_out_rx, b_in, 0));
    tokio::spawn(relay(b_out_rx, a_in, 0));

    a.connected().await?;

    // Dropping the handle closes the command and write channels; the
    // tunnel winds down cleanly and the peer follows.
    drop(a);
    assert_eq!(b.ended().await, EndReason::Closed);
    Ok(())
}

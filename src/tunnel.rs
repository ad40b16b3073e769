//! The per-connection reliability engine and the task that drives it.
//!
//! A [`Tunnel`] owns all mutable connection state and is driven by exactly
//! one task, which selects over the inbound packet channel, the
//! application's write channel, a close command channel, and the timer
//! tick. Nothing else ever touches the engine, so the state machine itself
//! is plain synchronous code and can be exercised directly in tests. The
//! only structure shared with the outside is the read buffer, guarded by a
//! mutex and paired with a wakeup for the reader.
//!
//! The engine talks to the substrate through two packet channels: the
//! external demultiplexer feeds decoded inbound packets into the input
//! channel, and the engine queues outbound packets that the task forwards
//! to the output channel in submission order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::config::TunnelConfig;
use crate::packet::{Flags, Packet};
use crate::pool::PacketPool;
use crate::queue::PacketQueue;

mod recv;
mod send;
mod shutdown;
mod state;
mod stats;
mod timer;

#[cfg(test)]
mod tests;

pub use shutdown::EndReason;
pub(crate) use shutdown::EndSignal;
pub use state::Status;
pub use stats::TunnelStats;
use timer::Timers;

/// How a tunnel comes into being: actively, by sending the SYN, or
/// passively, by waiting for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiation {
    Open,
    Listen,
}

/// The reliability engine for one connection.
pub struct Tunnel {
    cfg: TunnelConfig,
    pool: Arc<PacketPool>,

    status: Status,
    /// Next sequence number to assign on send.
    sendseq: i32,
    /// Next inbound sequence number expected.
    recvseq: i32,
    /// Latest sequence number already acknowledged to the peer.
    recvack: i32,

    /// In-flight packets awaiting acknowledgment, ordered by seq.
    sendbuf: PacketQueue,
    /// Out-of-order arrivals waiting for the gap to fill, ordered by seq.
    recvbuf: PacketQueue,
    /// In-order bytes ready for the application, shared with the reader.
    readbuf: Arc<Mutex<VecDeque<u8>>>,
    read_ready: Arc<Notify>,
    /// Application bytes awaiting segmentation.
    writebuf: VecDeque<u8>,
    /// A clean close was requested; emit the FIN once writebuf drains.
    closing: bool,
    /// Whether the application write side is open (established and not
    /// past a FIN in either direction).
    write_open: bool,

    /// Congestion window, bytes.
    cwnd: i32,
    /// Slow-start threshold, bytes.
    ssthresh: i32,
    /// Peer-advertised receive window, bytes.
    sendwnd: i32,

    /// Smoothed round-trip time, microseconds. Zero until first sample.
    rtt: u32,
    /// Round-trip time variance, microseconds.
    rttvar: u32,
    /// Retransmission timeout, milliseconds.
    rto: i64,

    /// Consecutive selective acks since the last clean ack.
    sack_count: u32,
    /// Timeout-based retransmission exponent.
    retrans_count: u32,
    /// Sequence numbers already retransmitted in this sack episode.
    sack_sent: FxHashSet<i32>,

    timer: Timers,
    stats: TunnelStats,

    /// Packets awaiting the wire, drained by the task in order.
    outgoing: VecDeque<Packet>,
    connected: Option<oneshot::Sender<Result<(), EndReason>>>,
    end: EndSignal,
    done: Option<EndReason>,
}

impl Tunnel {
    fn new(
        cfg: TunnelConfig,
        pool: Arc<PacketPool>,
        readbuf: Arc<Mutex<VecDeque<u8>>>,
        read_ready: Arc<Notify>,
        connected: Option<oneshot::Sender<Result<(), EndReason>>>,
        end: EndSignal,
    ) -> Self {
        let mss = cfg.mss as i32;
        let keepalive = cfg.keepalive.as_millis() as i64;
        let window = cfg.window as i32;
        Self {
            pool,
            status: Status::Closed,
            sendseq: 0,
            recvseq: 0,
            recvack: 0,
            sendbuf: PacketQueue::new(),
            recvbuf: PacketQueue::new(),
            readbuf,
            read_ready,
            writebuf: VecDeque::new(),
            closing: false,
            write_open: false,
            cwnd: 4 * mss,
            ssthresh: window,
            sendwnd: window,
            rtt: 0,
            rttvar: 0,
            rto: 1000,
            sack_count: 0,
            retrans_count: 0,
            sack_sent: FxHashSet::default(),
            timer: Timers {
                keep: keepalive,
                ..Timers::default()
            },
            stats: TunnelStats::default(),
            outgoing: VecDeque::new(),
            connected,
            end,
            done: None,
            cfg,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn stats(&self) -> TunnelStats {
        self.stats
    }

    /// Active open: emit a SYN and wait for the handshake to complete.
    pub(crate) fn connect(&mut self) {
        if self.status != Status::Closed {
            return;
        }
        self.transition(Status::SynSent);
        self.timer.conn = self.cfg.connect_timeout.as_millis() as i64;
        self.send_ctl(Flags::SYN);
    }

    /// Starts a clean close. The FIN goes out once buffered application
    /// bytes have been segmentized.
    pub(crate) fn close(&mut self) {
        match self.status {
            Status::Closed | Status::SynSent | Status::SynRcvd => {
                self.terminate(EndReason::Closed);
            }
            Status::Established => {
                self.closing = true;
                self.write_open = false;
                self.pump_send();
            }
            _ => {}
        }
    }

    /// Buffers application bytes for segmentation.
    pub(crate) fn queue_write(&mut self, data: &[u8]) {
        self.writebuf.extend(data);
    }

    /// Whether the task should poll the application write channel.
    pub(crate) fn accepts_writes(&self) -> bool {
        self.write_open
            && !self.closing
            && self.done.is_none()
            && self.writebuf.len() < self.cfg.window as usize
    }

    /// Advances every armed timer by one tick and fires the expired ones.
    pub(crate) fn on_tick(&mut self) {
        let dt = self.cfg.tick.as_millis() as i64;

        if Timers::countdown(&mut self.timer.keep, dt) {
            tracing::debug!("keepalive expired");
            self.send_rst();
            self.terminate(EndReason::KeepaliveExpired);
            return;
        }
        if Timers::countdown(&mut self.timer.conn, dt) {
            if matches!(self.status, Status::SynSent | Status::SynRcvd) {
                self.terminate(EndReason::ConnectTimeout);
                return;
            }
        }
        if Timers::countdown(&mut self.timer.finwait, dt) {
            if self.status == Status::TimeWait {
                self.transition(Status::Closed);
                self.terminate(EndReason::Closed);
                return;
            }
        }
        if Timers::countdown(&mut self.timer.dack, dt) {
            self.send_ack();
        }
        if Timers::countdown(&mut self.timer.rexmt, dt) {
            self.on_rexmt();
        }
    }

    /// Retransmission timeout: resend the oldest unacknowledged packet and
    /// back off.
    fn on_rexmt(&mut self) {
        if self.sendbuf.is_empty() {
            return;
        }
        if self.retrans_count >= self.cfg.retrans_limit {
            self.send_rst();
            self.terminate(EndReason::RetransLimit);
            return;
        }
        let Some(again) = self.sendbuf.peek().cloned() else {
            return;
        };
        self.retrans_count += 1;
        let mss = self.cfg.mss as i32;
        self.ssthresh = (self.ssthresh / 2).max(2 * mss);
        self.cwnd = mss;
        tracing::debug!(
            cwnd = self.cwnd,
            ssthresh = self.ssthresh,
            count = self.retrans_count,
            "retransmit timeout"
        );
        self.retransmit(again);
        self.timer.rexmt = self.rto.max(1) << self.retrans_count.min(16);
    }

    fn transition(&mut self, to: Status) {
        tracing::debug!("{:?} -> {:?}", self.status, to);
        self.status = to;
    }

    fn signal_connected(&mut self, result: Result<(), EndReason>) {
        if let Some(tx) = self.connected.take() {
            let _ = tx.send(result);
        }
    }

    /// The receive window to advertise: configured capacity minus what the
    /// application has not read yet.
    fn recv_window(&self) -> u32 {
        let buffered = self.readbuf.lock().unwrap().len() as u32;
        self.cfg.window.saturating_sub(buffered)
    }

    /// Ends the tunnel. Idempotent; the first reason sticks. Buffered
    /// packets go back to the pool and all waiters are woken. Packets
    /// already queued for the wire (such as a final RST) still go out.
    fn terminate(&mut self, reason: EndReason) {
        if self.done.is_some() {
            return;
        }
        self.done = Some(reason);
        self.status = Status::Closed;
        self.write_open = false;
        self.closing = false;
        tracing::debug!(?reason, stats = ?self.stats, "tunnel ended");
        self.signal_connected(Err(reason));
        self.end.signal(reason);
        while let Some(packet) = self.sendbuf.pop() {
            self.pool.release(packet);
        }
        while let Some(packet) = self.recvbuf.pop() {
            self.pool.release(packet);
        }
        self.writebuf.clear();
        self.read_ready.notify_waiters();
    }
}

enum Command {
    Close,
}

/// The application-facing side of a spawned tunnel.
pub struct TunnelHandle {
    write_tx: mpsc::Sender<Vec<u8>>,
    cmd_tx: mpsc::Sender<Command>,
    readbuf: Arc<Mutex<VecDeque<u8>>>,
    read_ready: Arc<Notify>,
    connected: Option<oneshot::Receiver<Result<(), EndReason>>>,
    end: EndSignal,
    stats: Arc<Mutex<TunnelStats>>,
}

impl TunnelHandle {
    /// Waits for the connection to reach ESTABLISHED. Resolves exactly
    /// once, before any application bytes flow.
    pub async fn connected(&mut self) -> Result<(), EndReason> {
        match self.connected.take() {
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(self.end.try_get().unwrap_or(EndReason::ChannelClosed)),
            },
            None => match self.end.try_get() {
                Some(reason) => Err(reason),
                None => Ok(()),
            },
        }
    }

    /// Reads up to `max` in-order bytes, waiting until some arrive.
    /// Returns an empty vector once the tunnel has ended and the buffer is
    /// drained.
    pub async fn read(&self, max: usize) -> Vec<u8> {
        loop {
            {
                let mut readbuf = self.readbuf.lock().unwrap();
                if !readbuf.is_empty() {
                    let n = readbuf.len().min(max);
                    return readbuf.drain(..n).collect();
                }
            }
            if self.end.try_get().is_some() {
                return Vec::new();
            }
            tokio::select! {
                _ = self.read_ready.notified() => {}
                _ = self.end.wait() => {}
            }
        }
    }

    /// Queues bytes for transmission, waiting for buffer space.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), EndReason> {
        self.write_tx
            .send(data)
            .await
            .map_err(|_| self.end.try_get().unwrap_or(EndReason::ChannelClosed))
    }

    /// Requests a clean close. Bytes already queued are still delivered.
    /// A close already in flight makes this a no-op.
    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(Command::Close);
    }

    /// Waits for the tunnel's terminal event.
    pub async fn ended(&self) -> EndReason {
        self.end.wait().await
    }

    /// A snapshot of the tunnel's traffic counters.
    pub fn stats(&self) -> TunnelStats {
        *self.stats.lock().unwrap()
    }
}

/// Spawns a tunnel task wired to `output` and returns the application
/// handle together with the input channel the demultiplexer feeds.
pub fn spawn(
    cfg: TunnelConfig,
    pool: Arc<PacketPool>,
    output: mpsc::Sender<Packet>,
    initiation: Initiation,
) -> (TunnelHandle, mpsc::Sender<Packet>) {
    let readbuf = Arc::new(Mutex::new(VecDeque::new()));
    let read_ready = Arc::new(Notify::new());
    let end = EndSignal::new();
    let stats = Arc::new(Mutex::new(TunnelStats::default()));
    let (connected_tx, connected_rx) = oneshot::channel();
    let (input_tx, input_rx) = mpsc::channel(64);
    let (write_tx, write_rx) = mpsc::channel(16);
    let (cmd_tx, cmd_rx) = mpsc::channel(1);

    let mut engine = Tunnel::new(
        cfg,
        pool,
        readbuf.clone(),
        read_ready.clone(),
        Some(connected_tx),
        end.clone(),
    );
    if initiation == Initiation::Open {
        engine.connect();
    }

    let handle = TunnelHandle {
        write_tx,
        cmd_tx,
        readbuf,
        read_ready,
        connected: Some(connected_rx),
        end,
        stats: stats.clone(),
    };
    tokio::spawn(run(engine, input_rx, output, write_rx, cmd_rx, stats));
    (handle, input_tx)
}

/// The tunnel task: the only code that mutates the engine.
async fn run(
    mut engine: Tunnel,
    mut input: mpsc::Receiver<Packet>,
    output: mpsc::Sender<Packet>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    mut cmd_rx: mpsc::Receiver<Command>,
    stats: Arc<Mutex<TunnelStats>>,
) {
    let mut ticker = tokio::time::interval(engine.cfg.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut write_closed = false;
    let mut cmd_closed = false;

    loop {
        // Put pending packets on the wire, in submission order, before
        // going back to sleep.
        while let Some(packet) = engine.outgoing.pop_front() {
            if output.send(packet).await.is_err() {
                engine.terminate(EndReason::ChannelClosed);
                break;
            }
        }
        *stats.lock().unwrap() = engine.stats;
        if engine.done.is_some() {
            break;
        }

        tokio::select! {
            packet = input.recv() => match packet {
                Some(packet) => engine.on_packet(packet),
                None => engine.terminate(EndReason::ChannelClosed),
            },
            data = write_rx.recv(), if !write_closed && engine.accepts_writes() => match data {
                Some(data) => engine.queue_write(&data),
                None => {
                    // The writer went away; treat it as a close request.
                    write_closed = true;
                    engine.close();
                }
            },
            cmd = cmd_rx.recv(), if !cmd_closed => match cmd {
                Some(Command::Close) | None => {
                    cmd_closed = true;
                    engine.close();
                }
            },
            _ = ticker.tick() => engine.on_tick(),
        }
        engine.pump_send();
    }

    *stats.lock().unwrap() = engine.stats;
}

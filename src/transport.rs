use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};

use crate::crypto::SecretBytes;
use crate::error::{Error, Result};
use crate::protocol::{
    SolHeader, command, decode_sol_payload, encode_sol_payload, payload_type, sol_bits,
    split_payload_type,
};
use crate::session::{self, SolSession};

/// How long we wait for the initial UDP association.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Read-pump cadence; not an overall deadline.
const READ_DEADLINE: Duration = Duration::from_millis(100);
/// Outbound SOL data write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// ACK-only packets get a tighter write deadline.
const ACK_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Keepalive packets are fire-and-forget.
const KEEPALIVE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Budget for the deactivate/close-session courtesy on teardown.
const CLOSE_BUDGET: Duration = Duration::from_secs(5);
/// Floor for the keepalive cadence.
const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Internal queue depth absorbing bursty boot-time traffic.
const BURST_QUEUE_DEPTH: usize = 10_000;
/// Outbound byte-stream channel depth.
const DATA_CHANNEL_DEPTH: usize = 1_000;
/// User write channel depth.
const WRITE_CHANNEL_DEPTH: usize = 100;

/// Maximum UDP datagram we accept from a BMC.
const MAX_PACKET_SIZE: usize = 4096;

/// Configuration for one SOL transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// BMC host (IPv4 address or resolvable name).
    pub host: String,
    /// RMCP+ UDP port, normally 623.
    pub port: u16,
    /// IPMI username.
    pub username: String,
    /// IPMI password.
    pub password: String,
    /// Close the session when no BMC datagram arrives for this long.
    /// Zero disables the inactivity check (and the keepalive pump).
    pub inactivity_timeout: Duration,
}

impl TransportConfig {
    /// Config with the default port and a 2-minute inactivity window.
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 623,
            username: username.into(),
            password: password.into(),
            inactivity_timeout: Duration::from_secs(120),
        }
    }
}

struct WireState {
    session: SolSession,
    /// Next outbound SOL packet sequence; 1..=255, never 0.
    sol_seq: u8,
    /// Last SOL packet sequence received from the BMC.
    ack_seq: u8,
}

impl WireState {
    fn next_sol_seq(&mut self) -> u8 {
        let current = self.sol_seq;
        self.sol_seq = self.sol_seq.wrapping_add(1);
        if self.sol_seq == 0 {
            self.sol_seq = 1; // sequence 0 is reserved for ACK-only packets
        }
        current
    }
}

struct Shared {
    socket: UdpSocket,
    wire: Mutex<WireState>,
    /// Milliseconds since `epoch` of the last received BMC datagram.
    last_recv_ms: AtomicU64,
    epoch: Instant,
    closed: AtomicBool,
    inactivity_timeout: Duration,
    peer: String,
}

impl Shared {
    fn touch_last_recv(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_recv_ms.store(ms, Ordering::Relaxed);
    }

    fn last_recv_age(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_recv_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Cloneable control surface for an active SOL transport.
///
/// The byte stream and error signal are handed out once by
/// [`SolTransport::split`]; this handle carries everything else.
#[derive(Clone)]
pub struct SolHandle {
    shared: Arc<Shared>,
    write_tx: mpsc::Sender<Vec<u8>>,
}

impl SolHandle {
    /// Queue console input for the BMC.
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::WriteWhileClosed);
        }
        self.write_tx
            .send(data)
            .await
            .map_err(|_| Error::WriteWhileClosed)
    }

    /// Age of the most recent BMC datagram of any payload type.
    pub fn last_recv_age(&self) -> Duration {
        self.shared.last_recv_age()
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Tear the session down: stop the pumps, then issue DeactivatePayload and
    /// CloseSession as a courtesy, bounded by a 5-second budget.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = self.shared.clone();
        let teardown = async {
            // Give the read pump one deadline tick to notice the flag so it
            // stops competing for datagrams.
            tokio::time::sleep(READ_DEADLINE * 2).await;

            let mut wire = shared.wire.lock().await;
            let _ = session::deactivate_sol(&shared.socket, &mut wire.session).await;
            let _ = session::close_session(&shared.socket, &mut wire.session).await;
        };

        if tokio::time::timeout(CLOSE_BUDGET, teardown).await.is_err() {
            debug!(peer = %self.shared.peer, "close budget expired before BMC acknowledged teardown");
        }
    }
}

/// One SOL session to one BMC: an established, activated RMCP+ session with
/// its read, write, and keepalive pumps running.
pub struct SolTransport {
    handle: SolHandle,
    data_rx: mpsc::Receiver<Vec<u8>>,
    error_rx: mpsc::Receiver<Error>,
}

impl SolTransport {
    /// Dial the BMC, run the session bring-up, activate SOL, and start the
    /// background pumps.
    pub async fn connect(cfg: TransportConfig) -> Result<Self> {
        let peer = format!("{}:{}", cfg.host, cfg.port);

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        tokio::time::timeout(DIAL_TIMEOUT, socket.connect(peer.as_str()))
            .await
            .map_err(|_| Error::Timeout)??;

        let password = SecretBytes::new(cfg.password.into_bytes());
        let sol_session = session::establish(&socket, cfg.username.as_bytes(), &password).await?;

        let shared = Arc::new(Shared {
            socket,
            wire: Mutex::new(WireState {
                session: sol_session,
                sol_seq: 1,
                ack_seq: 0,
            }),
            last_recv_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            closed: AtomicBool::new(false),
            inactivity_timeout: cfg.inactivity_timeout,
            peer,
        });
        shared.touch_last_recv();

        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_DEPTH);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_DEPTH);
        let (queue_tx, queue_rx) = mpsc::channel(BURST_QUEUE_DEPTH);

        tokio::spawn(read_pump(shared.clone(), queue_tx, error_tx));
        tokio::spawn(drain_pump(queue_rx, data_tx));
        tokio::spawn(write_pump(shared.clone(), write_rx));
        if cfg.inactivity_timeout > Duration::ZERO {
            tokio::spawn(keepalive_pump(shared.clone()));
        }

        Ok(Self {
            handle: SolHandle {
                shared,
                write_tx,
            },
            data_rx,
            error_rx,
        })
    }

    /// Split into the control handle, the console byte stream, and the
    /// terminal error signal.
    pub fn split(self) -> (SolHandle, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<Error>) {
        (self.handle, self.data_rx, self.error_rx)
    }
}

/// Reads datagrams as fast as the 100 ms deadline cadence allows, dispatches
/// SOL payloads into the burst queue, and ACKs each data-bearing packet.
async fn read_pump(
    shared: Arc<Shared>,
    queue_tx: mpsc::Sender<Vec<u8>>,
    error_tx: mpsc::Sender<Error>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut last_stats = Instant::now();
    let (mut reads, mut timeouts, mut packets, mut sol_packets, mut data_packets) =
        (0u64, 0u64, 0u64, 0u64, 0u64);

    trace!(peer = %shared.peer, "read pump started");

    loop {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }

        if last_stats.elapsed() >= Duration::from_secs(60) {
            debug!(
                peer = %shared.peer,
                reads, timeouts, packets, sol = sol_packets, data = data_packets,
                "read pump stats"
            );
            last_stats = Instant::now();
        }

        let n = match tokio::time::timeout(READ_DEADLINE, shared.socket.recv(&mut buf)).await {
            Err(_elapsed) => {
                reads += 1;
                timeouts += 1;
                if shared.inactivity_timeout > Duration::ZERO
                    && shared.last_recv_age() > shared.inactivity_timeout
                {
                    debug!(
                        peer = %shared.peer,
                        idle = ?shared.last_recv_age(),
                        "inactivity timeout"
                    );
                    let _ = error_tx.try_send(Error::InactivityTimeout);
                    return;
                }
                continue;
            }
            Ok(Err(e)) => {
                warn!(peer = %shared.peer, error = %e, "read pump socket error");
                let _ = error_tx.try_send(Error::Io(e));
                return;
            }
            Ok(Ok(n)) => {
                reads += 1;
                n
            }
        };

        packets += 1;

        // Any packet from the BMC means the session is alive.
        shared.touch_last_recv();

        if n < 20 {
            continue; // too short for SOL, but the BMC responded
        }

        // Dispatch on the payload type, masking the encrypted/authenticated bits.
        let (_, is_encrypted, ptype) = split_payload_type(buf[5]);
        if ptype != payload_type::SOL {
            continue; // e.g. IPMI response to a keepalive
        }
        sol_packets += 1;

        let payload_len = u16::from_le_bytes([buf[14], buf[15]]) as usize;
        if payload_len < 4 || 16 + payload_len > n {
            continue; // invalid payload length
        }

        let payload_owned;
        let payload: &[u8] = if is_encrypted {
            let wire = shared.wire.lock().await;
            match crate::protocol::decrypt_confidential_payload(
                &buf[16..16 + payload_len],
                &wire.session.security.aes_key,
            ) {
                Ok(p) => {
                    payload_owned = p;
                    &payload_owned
                }
                Err(e) => {
                    debug!(peer = %shared.peer, error = %e, "dropping undecryptable SOL payload");
                    continue;
                }
            }
        } else {
            &buf[16..16 + payload_len]
        };

        let Ok((header, chardata)) = decode_sol_payload(payload) else {
            continue;
        };

        // NACK set: the BMC could not accept our characters. Do not advance
        // the remote sequence; the write path will resend.
        if header.op_status & sol_bits::NACK != 0 {
            continue;
        }

        {
            let mut wire = shared.wire.lock().await;
            wire.ack_seq = header.packet_seq;
        }

        if !chardata.is_empty() {
            data_packets += 1;
            let data = chardata.to_vec();

            send_sol_ack(&shared).await;

            // Never block the read loop: drop into the burst queue or not at all.
            let _ = queue_tx.try_send(data);
        } else if header.packet_seq != 0 {
            // Data-less packet with a real sequence still wants an ACK.
            send_sol_ack(&shared).await;
        }
    }
}

/// Drains the burst queue into the subscriber-facing byte stream.
async fn drain_pump(mut queue_rx: mpsc::Receiver<Vec<u8>>, data_tx: mpsc::Sender<Vec<u8>>) {
    while let Some(data) = queue_rx.recv().await {
        if data_tx.send(data).await.is_err() {
            return;
        }
    }
}

async fn send_sol_ack(shared: &Arc<Shared>) {
    let packet = {
        let mut wire = shared.wire.lock().await;
        let header = SolHeader {
            packet_seq: 0, // 0 = ACK only, no data
            ack_seq: wire.ack_seq,
            accepted_count: 0xFF, // accept all
            op_status: 0,
        };
        let payload = encode_sol_payload(header, &[]);
        match wire.session.build_sol_packet(&payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(peer = %shared.peer, error = %e, "failed to build SOL ack");
                return;
            }
        }
    };

    let send = tokio::time::timeout(ACK_WRITE_TIMEOUT, shared.socket.send(&packet)).await;
    if let Ok(Err(e)) = send {
        debug!(peer = %shared.peer, error = %e, "SOL ack send failed");
    }
}

/// Sends user-submitted chunks, splitting anything larger than the negotiated
/// maximum across packets with monotonically increasing sequence numbers.
async fn write_pump(shared: Arc<Shared>, mut write_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = write_rx.recv().await {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = send_sol_data(&shared, &data).await {
            warn!(peer = %shared.peer, error = %e, "SOL write failed");
        }
    }
}

async fn send_sol_data(shared: &Arc<Shared>, data: &[u8]) -> Result<()> {
    let max_data = {
        let wire = shared.wire.lock().await;
        let max = wire.session.max_outbound as usize;
        max.saturating_sub(4).max(1)
    };

    for chunk in data.chunks(max_data) {
        let packet = {
            let mut wire = shared.wire.lock().await;
            let header = SolHeader {
                packet_seq: wire.next_sol_seq(),
                ack_seq: wire.ack_seq,
                accepted_count: 0,
                op_status: 0,
            };
            let payload = encode_sol_payload(header, chunk);
            wire.session.build_sol_packet(&payload)?
        };

        tokio::time::timeout(WRITE_TIMEOUT, shared.socket.send(&packet))
            .await
            .map_err(|_| Error::Timeout)??;
    }

    Ok(())
}

/// Periodically sends an authenticated GetDeviceID. The point is not the
/// reply: a BMC that lost the session silently drops the packet, so the
/// read-pump inactivity timer fires on our side. Replies refresh
/// `last_recv` through the normal read path.
async fn keepalive_pump(shared: Arc<Shared>) {
    let interval = (shared.inactivity_timeout / 3).max(MIN_KEEPALIVE_INTERVAL);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick

    loop {
        ticker.tick().await;
        if shared.closed.load(Ordering::Acquire) {
            return;
        }

        let packet = {
            let mut wire = shared.wire.lock().await;
            match wire
                .session
                .build_ipmi_request(command::NETFN_APP, command::GET_DEVICE_ID, &[])
            {
                Ok((_, p)) => p,
                Err(e) => {
                    debug!(peer = %shared.peer, error = %e, "failed to build keepalive");
                    continue;
                }
            }
        };

        let send = tokio::time::timeout(KEEPALIVE_WRITE_TIMEOUT, shared.socket.send(&packet)).await;
        match send {
            Ok(Err(e)) => debug!(peer = %shared.peer, error = %e, "keepalive send failed"),
            Err(_) => debug!(peer = %shared.peer, "keepalive send timed out"),
            Ok(Ok(_)) => trace!(peer = %shared.peer, "keepalive sent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HashKind;
    use crate::protocol::SecurityContext;

    fn wire_state() -> WireState {
        WireState {
            session: crate::session::SolSession::new_test(
                0x01020304,
                0x0A0B0C0D,
                SecurityContext {
                    integrity: HashKind::Sha1,
                    k1: vec![0u8; 20],
                    aes_key: [0u8; 16],
                },
                false,
                false,
                200,
            ),
            sol_seq: 1,
            ack_seq: 0,
        }
    }

    #[test]
    fn sol_seq_never_zero_and_wraps() {
        let mut w = wire_state();
        w.sol_seq = 254;

        assert_eq!(w.next_sol_seq(), 254);
        assert_eq!(w.next_sol_seq(), 255);
        // 255 wraps past 0 straight to 1.
        assert_eq!(w.next_sol_seq(), 1);
        assert_eq!(w.next_sol_seq(), 2);
    }

    #[test]
    fn full_cycle_skips_zero() {
        let mut w = wire_state();
        let mut seen = Vec::new();
        for _ in 0..300 {
            seen.push(w.next_sol_seq());
        }
        assert!(seen.iter().all(|&s| s != 0));
    }
}

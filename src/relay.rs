//! The relay loop: moves packets between the virtual interface and the wire.
//!
//! One task owns every descriptor and all tunnel state. Each turn of the loop
//! waits for whichever source is ready first and runs exactly one handler:
//!
//! * virtual interface readable: encapsulate and queue for the peer
//! * divert path readable: decapsulate and write to the interface
//! * ICMP socket readable: drain and discard
//! * keepalive fired: queue a beat for the peer
//! * ICMP socket writable while frames are queued: send the oldest one
//!
//! Sends go through a bounded queue so a congested socket never stalls the
//! loop; while the queue is full the interface is simply not read.

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{is_transient, RelayError};
use crate::frame::{self, Decoded, Decoder, ICMP_HEADER_SIZE};
use crate::keepalive::Keepalive;
use crate::role::{BindPolicy, Role, RoleState};

/// Largest datagram the divert path can hand us.
pub const MAX_DATAGRAM: usize = 65535;
/// Frames waiting for the ICMP socket before the interface is throttled.
pub const DEFAULT_QUEUE_LIMIT: usize = 256;
/// Pause before retrying a send the kernel had no buffer space for.
pub const RETRY_PAUSE: Duration = Duration::from_millis(1);

/// The virtual interface, one IP packet per call.
///
/// Implementations own any device framing; the relay only ever sees bare
/// IP packets.
#[allow(async_fn_in_trait)]
pub trait PacketDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;
}

/// Raw ICMP socket used for sending.
#[allow(async_fn_in_trait)]
pub trait IcmpTransmit {
    /// Send one frame, waiting for the socket to become writable.
    async fn send_to(&self, frame: &[u8], peer: Ipv4Addr) -> io::Result<usize>;
    /// Receive (and throw away) whatever the kernel queued on this socket.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Source of diverted ICMP datagrams, IPv4 header included.
#[allow(async_fn_in_trait)]
pub trait DatagramSource {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)>;
}

/// Knobs the relay needs from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Largest packet read from the virtual interface.
    pub mtu: usize,
    pub decoder: Decoder,
    pub bind_on: BindPolicy,
    pub queue_limit: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            mtu: crate::config::DEFAULT_MTU as usize,
            decoder: Decoder::default(),
            bind_on: BindPolicy::default(),
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

impl From<&Config> for RelayOptions {
    fn from(config: &Config) -> Self {
        Self {
            mtu: config.mtu as usize,
            decoder: Decoder::new(config.decode.verify_checksum),
            bind_on: config.decode.bind_on,
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

/// Counters kept by the relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Packets read from the virtual interface.
    pub tun_packets: u64,
    /// Frames handed to the ICMP socket.
    pub frames_sent: u64,
    pub beats_sent: u64,
    /// Payloads written to the virtual interface.
    pub payloads_delivered: u64,
    pub beats_received: u64,
    pub foreign: u64,
    pub malformed: u64,
    /// Interface packets dropped because no peer was known yet.
    pub no_peer_drops: u64,
    /// Keepalives skipped because the send queue was full.
    pub beats_skipped: u64,
}

#[derive(Debug)]
struct Outbound {
    frame: Vec<u8>,
    peer: Ipv4Addr,
    beat: bool,
}

/// Context object owning the descriptors and all tunnel state.
pub struct Relay<D, I, S> {
    device: D,
    icmp: I,
    divert: S,
    state: RoleState,
    options: RelayOptions,
    keepalive: Keepalive,
    outbox: VecDeque<Outbound>,
    retry_at: Option<Instant>,
    stats: RelayStats,
    tun_buf: Vec<u8>,
    divert_buf: Vec<u8>,
    drain_buf: Vec<u8>,
}

impl<D, I, S> Relay<D, I, S>
where
    D: PacketDevice,
    I: IcmpTransmit,
    S: DatagramSource,
{
    pub fn new(
        device: D,
        icmp: I,
        divert: S,
        state: RoleState,
        options: RelayOptions,
        keepalive: Keepalive,
    ) -> Self {
        // Headroom of one ICMP header so an oversized read is never silently
        // truncated to exactly the MTU.
        let tun_capacity = options.mtu + ICMP_HEADER_SIZE;
        Self {
            device,
            icmp,
            divert,
            state,
            options,
            keepalive,
            outbox: VecDeque::with_capacity(options.queue_limit),
            retry_at: None,
            stats: RelayStats::default(),
            tun_buf: vec![0; tun_capacity],
            divert_buf: vec![0; MAX_DATAGRAM],
            drain_buf: vec![0; MAX_DATAGRAM],
        }
    }

    pub fn state(&self) -> &RoleState {
        &self.state
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Frames queued but not yet accepted by the ICMP socket.
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Run until `cancel` fires or a descriptor fails.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), RelayError> {
        info!(
            role = %self.state.role(),
            peer = ?self.state.peer().ok(),
            keepalive = self.keepalive.is_enabled(),
            "relay started"
        );

        loop {
            let can_read_tun = self.outbox.len() < self.options.queue_limit;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(stats = ?self.stats, "relay stopped");
                    return Ok(());
                }

                res = send_head(&self.icmp, self.outbox.front(), self.retry_at),
                    if !self.outbox.is_empty() => {
                    self.on_sent(res)?;
                }

                res = self.divert.recv_from(&mut self.divert_buf) => {
                    let (n, source) = res.map_err(|e| RelayError::io("divert read", e))?;
                    self.on_divert(n, source).await?;
                }

                res = self.device.recv(&mut self.tun_buf), if can_read_tun => {
                    let n = res.map_err(|e| RelayError::io("tun read", e))?;
                    self.on_tun(n)?;
                }

                res = self.icmp.recv(&mut self.drain_buf) => {
                    let n = res.map_err(|e| RelayError::io("icmp read", e))?;
                    if n == 0 {
                        return Err(RelayError::Closed("icmp read"));
                    }
                    trace!(bytes = n, "discarded datagram on send socket");
                }

                _ = self.keepalive.tick() => {
                    self.on_keepalive();
                }
            }
        }
    }

    fn on_tun(&mut self, n: usize) -> Result<(), RelayError> {
        if n == 0 {
            return Err(RelayError::Closed("tun read"));
        }
        self.stats.tun_packets += 1;

        let peer = match self.state.peer() {
            Ok(peer) => peer,
            Err(_) => {
                self.stats.no_peer_drops += 1;
                warn!(bytes = n, "no peer learned yet, dropping outbound packet");
                return Ok(());
            }
        };

        let frame = frame::encode(self.state.role(), &self.tun_buf[..n]);
        trace!(bytes = n, %peer, "queued tunnel frame");
        self.outbox.push_back(Outbound {
            frame,
            peer,
            beat: false,
        });
        Ok(())
    }

    async fn on_divert(&mut self, n: usize, source: Ipv4Addr) -> Result<(), RelayError> {
        if n == 0 {
            return Err(RelayError::Closed("divert read"));
        }
        if self.options.bind_on == BindPolicy::Any {
            Self::learn_peer(&mut self.state, source);
        }

        match self.options.decoder.decode_datagram(&self.divert_buf[..n]) {
            Decoded::Payload(packet) => {
                if self.options.bind_on == BindPolicy::Tunnel {
                    Self::learn_peer(&mut self.state, source);
                }
                trace!(bytes = packet.len(), %source, "delivering tunnel payload");
                let written = self
                    .device
                    .send(packet)
                    .await
                    .map_err(|e| RelayError::io("tun write", e))?;
                if written == 0 {
                    return Err(RelayError::Closed("tun write"));
                }
                self.stats.payloads_delivered += 1;
            }
            Decoded::Beat => {
                self.stats.beats_received += 1;
                debug!(%source, "keepalive received");
            }
            Decoded::Foreign(identifier) => {
                self.stats.foreign += 1;
                debug!(%source, identifier, "ignoring foreign ICMP");
            }
            Decoded::Malformed(reason) => {
                self.stats.malformed += 1;
                warn!(%source, bytes = n, "dropping datagram: {}", reason);
            }
        }
        Ok(())
    }

    /// Only a Responder ever learns its peer from traffic.
    fn learn_peer(state: &mut RoleState, source: Ipv4Addr) {
        if state.role() != Role::Responder || state.is_bound() {
            return;
        }
        if state.bind_peer(source) {
            info!(peer = %source, "bound to peer");
        }
    }

    fn on_keepalive(&mut self) {
        let peer = match self.state.peer() {
            Ok(peer) => peer,
            Err(_) => return,
        };
        if self.outbox.len() >= self.options.queue_limit {
            self.stats.beats_skipped += 1;
            debug!("send queue full, skipping keepalive");
            return;
        }
        trace!(%peer, "queued keepalive");
        self.outbox.push_back(Outbound {
            frame: frame::encode_beat(),
            peer,
            beat: true,
        });
    }

    fn on_sent(&mut self, res: io::Result<usize>) -> Result<(), RelayError> {
        match res {
            Ok(_) => {
                self.retry_at = None;
                if let Some(sent) = self.outbox.pop_front() {
                    self.stats.frames_sent += 1;
                    if sent.beat {
                        self.stats.beats_sent += 1;
                    }
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) if is_transient(&e) => {
                debug!("icmp send deferred: {}", e);
                self.retry_at = Some(Instant::now() + RETRY_PAUSE);
                Ok(())
            }
            Err(e) => Err(RelayError::io("icmp send", e)),
        }
    }
}

/// Send the frame at the head of the queue; pending forever when empty.
async fn send_head<I: IcmpTransmit>(
    icmp: &I,
    head: Option<&Outbound>,
    retry_at: Option<Instant>,
) -> io::Result<usize> {
    let head = match head {
        Some(head) => head,
        None => return std::future::pending().await,
    };
    if let Some(at) = retry_at {
        time::sleep_until(at).await;
    }
    icmp.send_to(&head.frame, head.peer).await
}

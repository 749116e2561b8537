//! Per-connection lifecycle manager and stop-and-wait transport.
//!
//! A [`Connection`] owns the complete state for one logical peer-to-peer
//! session.  Its responsibilities are:
//! - Driving the finite-state machine (see [`crate::state`]) through the
//!   three-way handshake and the FIN/ACK teardown.
//! - Coordinating [`crate::sender`] and [`crate::receiver`].
//! - Retrying with exponential back-off (see [`crate::timer`]).
//! - Exposing an async send/receive API to application code.
//!
//! Only one peer is served at a time; the socket belongs to this connection
//! alone.
//!
//! # Retry policy
//!
//! | operation              | attempts               | timeout per attempt       |
//! |------------------------|------------------------|---------------------------|
//! | `connect`              | `max_retries`          | doubling, capped at 8×    |
//! | `send_stop_and_wait`   | `max_retries`          | doubling, capped at 8×    |
//! | `receive_stop_and_wait`| `max_retries`          | doubling, capped at 8×    |
//! | `accept`               | unbounded              | base (no back-off)        |
//! | `disconnect`           | unbounded              | base (no back-off)        |
//!
//! The unbounded loops can be cut short with a [`CancelToken`].

use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{ConfigError, ImpairmentConfig, TransportConfig};
use crate::packet::{flag_names, flags, Packet, PacketError, MAX_PAYLOAD};
use crate::receiver::{ack_for, Receiver, Segment};
use crate::sender::Sender;
use crate::simulator::Simulator;
use crate::socket::{Recv, Socket, SocketError};
use crate::state::ConnectionState;
use crate::timer::{Backoff, CancelToken};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by connection operations.
///
/// Corrupt and malformed datagrams never show up here: the socket layer
/// discards them and the wait carries on.
#[derive(Debug, Error)]
pub enum ConnError {
    /// Missing remote address or an out-of-range setting.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Payload does not fit in one datagram.
    #[error(transparent)]
    Packet(#[from] PacketError),
    /// No SYN|ACK after every connect attempt.
    #[error("connect timed out: no SYN|ACK after all retries")]
    ConnectTimeout,
    /// No matching ACK after every send attempt.
    #[error("send timed out: no ACK after all retries")]
    SendTimeout,
    /// Nothing arrived after every receive attempt.
    #[error("receive timed out: no data after all retries")]
    ReceiveTimeout,
    /// The operation's [`CancelToken`] fired.
    #[error("operation cancelled")]
    Cancelled,
    /// Underlying socket failure.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A handle to a single reliable connection over UDP.
pub struct Connection {
    /// Current FSM state.
    pub state: ConnectionState,
    /// Outbound sequence numbers and the in-flight segment.
    pub sender: Sender,
    /// Inbound acknowledgement tracking and duplicate detection.
    pub receiver: Receiver,
    socket: Socket,
    remote: Option<SocketAddr>,
    config: TransportConfig,
    isn_rng: Box<dyn RngCore + Send>,
    /// Final ACK of our last active open, re-sent if the peer repeats its
    /// SYN|ACK.
    handshake_ack: Option<Packet>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("local", &self.socket.local_addr)
            .field("remote", &self.remote)
            .field("seq_num", &self.sender.next_seq)
            .field("ack_num", &self.receiver.ack_num)
            .finish()
    }
}

impl Connection {
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    /// Wrap an already bound socket in a new, unconnected connection.
    ///
    /// `remote` is required for an active open and may be `None` for the
    /// passive side, which learns it from the first SYN.
    pub fn new(
        socket: Socket,
        remote: Option<SocketAddr>,
        config: TransportConfig,
    ) -> Result<Self, ConnError> {
        config.validate()?;
        Ok(Self {
            state: ConnectionState::Closed,
            sender: Sender::default(),
            receiver: Receiver::default(),
            socket,
            remote,
            config,
            isn_rng: Box::new(StdRng::from_os_rng()),
            handshake_ack: None,
        })
    }

    /// Bind `local` and build a connection whose socket is impaired
    /// according to `impairment`.
    pub async fn bind(
        local: SocketAddr,
        remote: Option<SocketAddr>,
        config: TransportConfig,
        impairment: ImpairmentConfig,
    ) -> Result<Self, ConnError> {
        impairment.validate()?;
        let socket = Socket::bind(local).await?;
        let socket = if impairment.is_transparent() {
            socket
        } else {
            socket.with_impairment(Simulator::new(impairment))
        };
        Self::new(socket, remote, config)
    }

    /// Draw initial sequence numbers from `rng` instead of the OS-seeded
    /// default.
    pub fn with_isn_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.isn_rng = Box::new(rng);
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = Some(remote);
    }

    /// Local sequence number (next one this endpoint will use).
    pub fn seq_num(&self) -> u32 {
        self.sender.next_seq
    }

    /// Next sequence number expected from the peer.
    pub fn ack_num(&self) -> u32 {
        self.receiver.ack_num
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Initiate an active open (client side).
    ///
    /// Sends SYN and waits for SYN|ACK, retrying with back-off.  Fails with
    /// [`ConfigError::NoRemote`] if no remote address is configured and with
    /// [`ConnError::ConnectTimeout`] once the retries are spent.
    pub async fn connect(&mut self) -> Result<(), ConnError> {
        let peer = self.peer()?;
        let result = self.active_open(peer).await;
        if result.is_err() {
            self.state = ConnectionState::Closed;
        }
        result
    }

    async fn active_open(&mut self, peer: SocketAddr) -> Result<(), ConnError> {
        let isn = self.pick_isn();
        self.sender.reset(isn);
        self.state = ConnectionState::SynSent;

        let syn = Packet::control(isn, 0, flags::SYN);
        let mut backoff = Backoff::from_config(&self.config);

        for attempt in 1..=self.config.max_retries {
            self.transmit(&syn).await?;
            let deadline = Instant::now() + backoff.current();
            loop {
                match self.wait(deadline).await? {
                    Recv::TimedOut => break,
                    Recv::Packet(pkt, _) if pkt.header.has(flags::SYN | flags::ACK) => {
                        self.receiver.reset(pkt.header.seq);
                        let ack = Packet::control(isn.wrapping_add(1), self.receiver.ack_num, flags::ACK);
                        self.transmit(&ack).await?;
                        self.handshake_ack = Some(ack);
                        self.state = ConnectionState::Established;
                        log::info!(
                            "[conn] established with {peer} (seq={} ack={})",
                            self.sender.next_seq,
                            self.receiver.ack_num
                        );
                        return Ok(());
                    }
                    Recv::Packet(pkt, _) => self.ignore(&pkt),
                }
            }
            log::debug!(
                "[conn] no SYN|ACK within {:?} (attempt {attempt}/{})",
                backoff.current(),
                self.config.max_retries
            );
            backoff.back_off();
        }

        log::warn!("[conn] connect to {peer} failed after {} attempts", self.config.max_retries);
        Err(ConnError::ConnectTimeout)
    }

    /// Wait for a peer to connect (server side).  Never gives up.
    ///
    /// While waiting for the final ACK the SYN|ACK is re-sent on every
    /// repeated SYN and every base timeout, without back-off.
    ///
    /// Returns the address of the peer that completed the handshake.
    pub async fn accept(&mut self) -> Result<SocketAddr, ConnError> {
        self.accept_with_cancel(&CancelToken::new()).await
    }

    /// [`accept`](Self::accept), abandoned with [`ConnError::Cancelled`]
    /// once `cancel` fires.
    pub async fn accept_with_cancel(&mut self, cancel: &CancelToken) -> Result<SocketAddr, ConnError> {
        let result = self.passive_open(cancel).await;
        if result.is_err() {
            self.state = ConnectionState::Closed;
        }
        result
    }

    async fn passive_open(&mut self, cancel: &CancelToken) -> Result<SocketAddr, ConnError> {
        self.state = ConnectionState::Closed;
        self.remote = None;
        log::debug!("[conn] waiting for SYN on {}", self.socket.local_addr);

        let (syn, peer) = loop {
            let deadline = Instant::now() + self.config.base_timeout;
            match self.wait_or_cancel(deadline, cancel).await? {
                Recv::Packet(pkt, from) if pkt.header.has(flags::SYN) => break (pkt, from),
                Recv::Packet(pkt, from) if pkt.header.has(flags::FIN) => {
                    // Our ACK of a previous peer's FIN went missing; let it finish.
                    let ack = Packet::control(0, ack_for(pkt.header.seq), flags::ACK);
                    log::debug!("[conn] stray FIN from {from}; → ACK ack={}", ack.header.ack);
                    self.socket.send_to(&ack, from).await?;
                }
                Recv::Packet(pkt, _) => self.ignore(&pkt),
                Recv::TimedOut => {}
            }
        };

        self.remote = Some(peer);
        let isn = self.pick_isn();
        self.sender.reset(isn);
        self.receiver.reset(syn.header.seq);
        self.state = ConnectionState::SynReceived;

        let syn_ack = Packet::control(isn, self.receiver.ack_num, flags::SYN | flags::ACK);
        self.transmit(&syn_ack).await?;

        let expected = isn.wrapping_add(1);
        loop {
            let deadline = Instant::now() + self.config.base_timeout;
            match self.wait_or_cancel(deadline, cancel).await? {
                Recv::Packet(pkt, _) if pkt.header.has(flags::ACK) && pkt.header.ack == expected => {
                    self.sender.next_seq = expected;
                    self.state = ConnectionState::Established;
                    log::info!(
                        "[conn] accepted {peer} (seq={} ack={})",
                        self.sender.next_seq,
                        self.receiver.ack_num
                    );
                    return Ok(peer);
                }
                Recv::Packet(pkt, _)
                    if pkt.header.flags == flags::SYN && pkt.header.seq == syn.header.seq =>
                {
                    log::debug!("[conn] repeated SYN; re-sending SYN|ACK");
                    self.transmit(&syn_ack).await?;
                }
                Recv::Packet(pkt, _) => self.ignore(&pkt),
                Recv::TimedOut => {
                    log::debug!("[conn] no final ACK from {peer}; re-sending SYN|ACK");
                    self.transmit(&syn_ack).await?;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Initiate a graceful close: send FIN until any ACK comes back.
    ///
    /// Does nothing unless connected.  Retries forever without back-off.
    pub async fn disconnect(&mut self) -> Result<(), ConnError> {
        self.disconnect_with_cancel(&CancelToken::new()).await
    }

    /// [`disconnect`](Self::disconnect), abandoned with
    /// [`ConnError::Cancelled`] once `cancel` fires.  The connection stays
    /// `Established` in that case.
    pub async fn disconnect_with_cancel(&mut self, cancel: &CancelToken) -> Result<(), ConnError> {
        if !self.is_connected() {
            return Ok(());
        }

        let fin = Packet::control(self.sender.next_seq, self.receiver.ack_num, flags::FIN);
        self.transmit(&fin).await?;

        loop {
            let deadline = Instant::now() + self.config.base_timeout;
            match self.wait_or_cancel(deadline, cancel).await? {
                Recv::TimedOut => {
                    log::debug!("[conn] FIN not acknowledged; re-sending");
                    self.transmit(&fin).await?;
                }
                Recv::Packet(pkt, _) if pkt.header.has(flags::ACK) => {
                    self.state = ConnectionState::Closed;
                    log::info!("[conn] connection closed");
                    return Ok(());
                }
                Recv::Packet(pkt, _) if pkt.header.has(flags::FIN) => {
                    // Simultaneous close: acknowledge theirs, keep waiting for ours.
                    let ack = Packet::control(self.sender.next_seq, ack_for(pkt.header.seq), flags::ACK);
                    self.transmit(&ack).await?;
                }
                Recv::Packet(pkt, _) => self.answer_stray(&pkt).await?,
            }
        }
    }

    /// Disconnect if still connected, then release the socket.
    pub async fn close(mut self) -> Result<(), ConnError> {
        self.disconnect().await?;
        log::debug!("[conn] releasing socket {}", self.socket.local_addr);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stop-and-wait data transfer
    // -----------------------------------------------------------------------

    /// Reliably deliver one unit of application data.
    ///
    /// Connects first if necessary.  The same packet is retransmitted until
    /// an ACK for it arrives or the retry budget is spent, in which case
    /// [`ConnError::SendTimeout`] is returned and the local sequence number
    /// is left unchanged.  Any failure, or dropping the future, leaves the
    /// connection ready for the next send.
    pub async fn send_stop_and_wait(&mut self, payload: &[u8]) -> Result<(), ConnError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge { len: payload.len() }.into());
        }
        if !self.is_connected() {
            self.connect().await?;
        }

        let packet = self.sender.stage(payload.to_vec(), self.receiver.ack_num)?;
        let result = self.retransmit_until_acked(&packet).await;
        if result.is_err() {
            if let Some(entry) = self.sender.abandon() {
                log::warn!(
                    "[conn] giving up on seq={} after {} transmissions over {:?}",
                    entry.packet.header.seq,
                    entry.tx_count,
                    entry.staged_at.elapsed()
                );
            }
        }
        result
    }

    async fn retransmit_until_acked(&mut self, packet: &Packet) -> Result<(), ConnError> {
        let seq = packet.header.seq;
        let mut backoff = Backoff::from_config(&self.config);

        for attempt in 1..=self.config.max_retries {
            self.sender.on_transmit();
            self.transmit(packet).await?;
            let deadline = Instant::now() + backoff.current();
            loop {
                match self.wait(deadline).await? {
                    Recv::TimedOut => break,
                    Recv::Packet(pkt, _) if self.sender.on_ack(&pkt.header) => {
                        log::debug!("[conn] ← ACK ack={} (seq={seq} delivered)", pkt.header.ack);
                        return Ok(());
                    }
                    Recv::Packet(pkt, _) => self.answer_stray(&pkt).await?,
                }
            }
            log::debug!(
                "[conn] no ACK for seq={seq} within {:?} (attempt {attempt}/{})",
                backoff.current(),
                self.config.max_retries
            );
            backoff.back_off();
        }
        Err(ConnError::SendTimeout)
    }

    /// Reliably receive one unit of application data.
    ///
    /// Returns `Ok(None)` when the peer closes the stream (its FIN is
    /// acknowledged and the connection drops to `Closed`).  Retransmissions
    /// of the previously delivered unit are re-acknowledged and swallowed.
    pub async fn receive_stop_and_wait(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        let mut backoff = Backoff::from_config(&self.config);

        for attempt in 1..=self.config.max_retries {
            let deadline = Instant::now() + backoff.current();
            loop {
                let (pkt, from) = match self.wait(deadline).await? {
                    Recv::TimedOut => break,
                    Recv::Packet(pkt, from) => (pkt, from),
                };
                if self.remote.is_none() {
                    self.remote = Some(from);
                }

                let seq = pkt.header.seq;
                match self.receiver.classify(&pkt.header) {
                    Segment::Fin => {
                        log::debug!("[conn] ← FIN seq={seq}");
                        self.send_ack(ack_for(seq)).await?;
                        self.state = ConnectionState::Closed;
                        log::info!("[conn] peer closed the connection");
                        return Ok(None);
                    }
                    Segment::Duplicate => {
                        log::debug!("[conn] duplicate seq={seq}; re-sending ACK");
                        self.send_ack(ack_for(seq)).await?;
                    }
                    Segment::New => {
                        let ack = self.receiver.on_delivered(seq);
                        log::debug!("[conn] ← DATA seq={seq} len={}", pkt.payload.len());
                        self.send_ack(ack).await?;
                        return Ok(Some(pkt.payload));
                    }
                    Segment::Control => self.answer_stray(&pkt).await?,
                }
            }
            log::debug!(
                "[conn] nothing received within {:?} (attempt {attempt}/{})",
                backoff.current(),
                self.config.max_retries
            );
            backoff.back_off();
        }

        log::warn!("[conn] receive failed after {} attempts", self.config.max_retries);
        Err(ConnError::ReceiveTimeout)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn peer(&self) -> Result<SocketAddr, ConnError> {
        self.remote.ok_or(ConnError::Config(ConfigError::NoRemote))
    }

    fn pick_isn(&mut self) -> u32 {
        self.isn_rng.random_range(0..=self.config.isn_max)
    }

    async fn transmit(&mut self, packet: &Packet) -> Result<(), ConnError> {
        let peer = self.peer()?;
        let h = &packet.header;
        log::debug!(
            "[conn] → {} seq={} ack={} len={}",
            flag_names(h.flags),
            h.seq,
            h.ack,
            packet.payload.len()
        );
        self.socket.send_to(packet, peer).await?;
        Ok(())
    }

    async fn send_ack(&mut self, ack: u32) -> Result<(), ConnError> {
        let pkt = Packet::control(self.sender.next_seq, ack, flags::ACK);
        self.transmit(&pkt).await
    }

    /// Bounded wait for a packet from the current remote (or anyone, while
    /// the remote is unknown).
    async fn wait(&mut self, deadline: Instant) -> Result<Recv, ConnError> {
        loop {
            match self.socket.recv_until(deadline).await? {
                Recv::Packet(_, from) if self.remote.is_some_and(|r| r != from) => {
                    log::trace!("[conn] ignoring datagram from unexpected peer {from}");
                }
                other => return Ok(other),
            }
        }
    }

    async fn wait_or_cancel(
        &mut self,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<Recv, ConnError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("[conn] wait cancelled");
                Err(ConnError::Cancelled)
            }
            res = self.wait(deadline) => res,
        }
    }

    /// React to a packet that is not what the current wait is after.
    ///
    /// - A repeat of the last delivered data segment means the peer missed
    ///   our ACK: acknowledge it again.
    /// - A repeated SYN|ACK means the peer missed our final handshake ACK:
    ///   send it again.
    async fn answer_stray(&mut self, pkt: &Packet) -> Result<(), ConnError> {
        let h = &pkt.header;
        match self.receiver.classify(h) {
            Segment::Duplicate => {
                log::debug!("[conn] duplicate seq={} while busy; re-sending ACK", h.seq);
                self.send_ack(ack_for(h.seq)).await
            }
            Segment::Control if h.has(flags::SYN | flags::ACK) => match self.handshake_ack.clone() {
                Some(ack) => {
                    log::debug!("[conn] repeated SYN|ACK; re-sending final ACK");
                    self.transmit(&ack).await
                }
                None => {
                    self.ignore(pkt);
                    Ok(())
                }
            },
            _ => {
                self.ignore(pkt);
                Ok(())
            }
        }
    }

    fn ignore(&self, pkt: &Packet) {
        let h = &pkt.header;
        log::trace!(
            "[conn] ignoring {} seq={} ack={} in state {}",
            flag_names(h.flags),
            h.seq,
            h.ack,
            self.state
        );
    }
}

//! Transport session state machine.
//!
//! A [`TransportSession`] owns one connected stream and drives it through the
//! handshake into the encrypted phase. The same code runs on both ends; the
//! [`Role`] only decides who speaks first in each exchange and which
//! direction tag each cipher uses.
//!
//! # Transport States
//!
//! 1. **Init** - nothing exchanged yet
//! 2. **VersionExchanged** - identification lines matched exactly
//! 3. **AlgorithmsNegotiated** - KEXINIT lists exchanged, one algorithm per category selected
//! 4. **KeyExchanged** - shared secret computed
//! 5. **CipherReady** - NEWKEYS exchanged, cipher pair installed
//! 6. **Authenticated** - credentials accepted
//! 7. **Transferring** - at least one file transfer started
//! 8. **Closed** - terminal; reached from any state on error or disconnect
//!
//! There are no retries inside a phase. Any failure moves the session to
//! `Closed` and shuts the stream down; the caller has to reconnect.
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::transport::{State, TransportState};
//!
//! let mut state = TransportState::new();
//! assert_eq!(state.current(), State::Init);
//! assert!(state.transition(State::VersionExchanged).is_ok());
//! assert!(state.transition(State::CipherReady).is_err());
//! ```

use crate::ssh::crypto::CipherPair;
use crate::ssh::envelope::{self, Frame};
use crate::ssh::kex::{select_first_match, AlgorithmLists, KexInit, NegotiatedAlgorithms, NewKeys};
use crate::ssh::kex_dh::{DhExchange, DhParams, KexDhInit, KexDhReply, SharedSecret};
use crate::ssh::logging;
use crate::ssh::message::FrameType;
use crate::ssh::packet::{self, MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use crate::ssh::version::{Version, MAX_VERSION_LENGTH};
use kimcloud_platform::{CloudError, CloudResult};
use rand::{CryptoRng, RngCore};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The connecting side (client). Speaks first in every exchange.
    Initiator,
    /// The accepting side (server).
    Responder,
}

impl Role {
    /// Returns "initiator" or "responder".
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

/// Transport session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    /// Nothing exchanged yet.
    #[default]
    Init,
    /// Identification lines exchanged and matched.
    VersionExchanged,
    /// KEXINIT exchanged and algorithms selected.
    AlgorithmsNegotiated,
    /// Shared secret computed.
    KeyExchanged,
    /// NEWKEYS exchanged; encrypted frames may flow.
    CipherReady,
    /// Credentials accepted.
    Authenticated,
    /// A file transfer has started on this session.
    Transferring,
    /// Terminal state.
    Closed,
}

impl State {
    /// Returns true once the cipher pair is installed and the session is open.
    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            State::CipherReady | State::Authenticated | State::Transferring
        )
    }
}

/// State machine with validated transitions.
#[derive(Debug, Clone, Default)]
pub struct TransportState {
    state: State,
}

impl TransportState {
    /// Creates a state machine in [`State::Init`].
    pub fn new() -> Self {
        Self { state: State::Init }
    }

    /// Returns the current state.
    pub fn current(&self) -> State {
        self.state
    }

    /// Returns true if the session reached [`State::Closed`].
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Transitions to `next_state`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::ProtocolViolation`] for a transition that skips
    /// or reverses a phase, or leaves `Closed`.
    pub fn transition(&mut self, next_state: State) -> CloudResult<()> {
        let valid = match (self.state, next_state) {
            (State::Init, State::VersionExchanged) => true,
            (State::VersionExchanged, State::AlgorithmsNegotiated) => true,
            (State::AlgorithmsNegotiated, State::KeyExchanged) => true,
            (State::KeyExchanged, State::CipherReady) => true,
            (State::CipherReady, State::Authenticated) => true,
            (State::Authenticated, State::Transferring) => true,
            // Any phase may fail
            (_, State::Closed) => true,
            (State::Closed, _) => false,
            (s1, s2) if s1 == s2 => true,
            _ => false,
        };

        if !valid {
            return Err(CloudError::ProtocolViolation(format!(
                "Invalid state transition: {:?} -> {:?}",
                self.state, next_state
            )));
        }

        self.state = next_state;
        Ok(())
    }

    /// Moves to [`State::Closed`] unconditionally.
    pub fn close(&mut self) {
        self.state = State::Closed;
    }
}

/// Handshake parameters shared by both roles.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Identification line (without CR LF)
    pub version: Version,
    /// Our algorithm preferences
    pub algorithms: AlgorithmLists,
    /// Diffie-Hellman group
    pub dh_params: DhParams,
}

/// One connection's transport: handshake, cipher pair and encrypted frames.
pub struct TransportSession<S> {
    stream: S,
    role: Role,
    config: TransportConfig,
    state: TransportState,
    peer: String,
    peer_version: Option<Version>,
    negotiated: Option<NegotiatedAlgorithms>,
    ciphers: Option<CipherPair>,
    send_sequence: u32,
    recv_sequence: u32,
}

impl<S> TransportSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connected stream. Nothing is sent until [`handshake`](Self::handshake).
    pub fn new(stream: S, role: Role, config: TransportConfig) -> Self {
        Self {
            stream,
            role,
            config,
            state: TransportState::new(),
            peer: "unknown".to_string(),
            peer_version: None,
            negotiated: None,
            ciphers: None,
            send_sequence: 0,
            recv_sequence: 0,
        }
    }

    /// Sets the peer label used in log lines (usually the socket address).
    pub fn with_peer_label(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> State {
        self.state.current()
    }

    /// Returns this session's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the peer label.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns the peer's identification line, once received.
    pub fn peer_version(&self) -> Option<&Version> {
        self.peer_version.as_ref()
    }

    /// Returns the negotiated algorithm set, once selected.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Runs version exchange, negotiation, key exchange and NEWKEYS.
    ///
    /// On success the session is in [`State::CipherReady`]. On failure it is
    /// [`State::Closed`] and the stream has been shut down.
    ///
    /// # Errors
    ///
    /// - [`CloudError::ProtocolViolation`] on version mismatch or a call
    ///   outside [`State::Init`]
    /// - [`CloudError::NegotiationFailure`] / [`CloudError::MalformedNegotiation`]
    /// - [`CloudError::KeyExchange`] for bad DH messages or public values
    /// - [`CloudError::Framing`] / [`CloudError::Io`] from the stream
    /// - [`CloudError::Config`] for invalid DH parameters, before any I/O
    pub async fn handshake<R>(&mut self, rng: &mut R) -> CloudResult<()>
    where
        R: RngCore + CryptoRng,
    {
        if self.state.current() != State::Init {
            let state = self.state.current();
            return Err(self
                .fail(CloudError::ProtocolViolation(format!(
                    "Handshake requested in state {:?}",
                    state
                )))
                .await);
        }

        if let Err(e) = self.config.dh_params.validate() {
            return Err(self.fail(e).await);
        }

        let started = Instant::now();
        logging::log_handshake_start(&self.peer, self.role.as_str());

        match self.run_handshake(rng).await {
            Ok(()) => {
                logging::log_handshake_complete(&self.peer, started.elapsed().as_millis() as u64);
                Ok(())
            }
            Err(e) => {
                logging::log_handshake_failed(&self.peer, &e.to_string());
                Err(self.fail(e).await)
            }
        }
    }

    async fn run_handshake<R>(&mut self, rng: &mut R) -> CloudResult<()>
    where
        R: RngCore + CryptoRng,
    {
        self.exchange_versions().await?;
        self.advance(State::VersionExchanged)?;

        let negotiated = self.exchange_kexinit(rng).await?;
        logging::log_algorithms_negotiated(&self.peer, &negotiated);
        self.negotiated = Some(negotiated);
        self.advance(State::AlgorithmsNegotiated)?;

        let secret = self.exchange_dh(rng).await?;
        self.advance(State::KeyExchanged)?;

        let ciphers = CipherPair::for_role(&secret, self.role);
        self.exchange_newkeys(rng).await?;
        self.ciphers = Some(ciphers);
        self.advance(State::CipherReady)?;

        Ok(())
    }

    async fn exchange_versions(&mut self) -> CloudResult<()> {
        self.stream
            .write_all(&self.config.version.to_wire_format())
            .await?;
        self.stream.flush().await?;

        let mut line = Vec::with_capacity(64);
        loop {
            let byte = self.stream.read_u8().await?;
            line.push(byte);

            if byte == b'\n' {
                break;
            }

            if line.len() >= MAX_VERSION_LENGTH {
                return Err(CloudError::ProtocolViolation(
                    "Version line too long".to_string(),
                ));
            }
        }

        let peer_version = Version::parse(&String::from_utf8_lossy(&line))?;
        self.config.version.verify_peer(&peer_version)?;
        self.peer_version = Some(peer_version);
        Ok(())
    }

    async fn exchange_kexinit<R>(&mut self, rng: &mut R) -> CloudResult<NegotiatedAlgorithms>
    where
        R: RngCore + CryptoRng,
    {
        let ours = KexInit::new(self.config.algorithms.clone(), rng);

        let theirs = match self.role {
            Role::Initiator => {
                self.send_packet(&ours.to_bytes(), rng).await?;
                logging::log_kexinit(&self.peer, "sent", ours.cookie());
                KexInit::from_bytes(&self.recv_packet().await?)?
            }
            Role::Responder => {
                let theirs = KexInit::from_bytes(&self.recv_packet().await?)?;
                self.send_packet(&ours.to_bytes(), rng).await?;
                logging::log_kexinit(&self.peer, "sent", ours.cookie());
                theirs
            }
        };
        logging::log_kexinit(&self.peer, "received", theirs.cookie());

        match self.role {
            Role::Initiator => select_first_match(ours.lists(), theirs.lists()),
            Role::Responder => select_first_match(theirs.lists(), ours.lists()),
        }
    }

    async fn exchange_dh<R>(&mut self, rng: &mut R) -> CloudResult<SharedSecret>
    where
        R: RngCore + CryptoRng,
    {
        let exchange = DhExchange::new(self.config.dh_params, rng)?;
        logging::log_public_value(&self.peer, "sent", exchange.public_value());

        let peer_public = match self.role {
            Role::Initiator => {
                let init = KexDhInit {
                    public_value: exchange.public_value(),
                };
                self.send_packet(&init.to_bytes(), rng).await?;
                KexDhReply::from_bytes(&self.recv_packet().await?)?.public_value
            }
            Role::Responder => {
                let init = KexDhInit::from_bytes(&self.recv_packet().await?)?;
                let reply = KexDhReply::with_placeholders(exchange.public_value());
                self.send_packet(&reply.to_bytes(), rng).await?;
                init.public_value
            }
        };
        logging::log_public_value(&self.peer, "received", peer_public);

        exchange.compute_shared_secret(peer_public)
    }

    async fn exchange_newkeys<R>(&mut self, rng: &mut R) -> CloudResult<()>
    where
        R: RngCore + CryptoRng,
    {
        let newkeys = NewKeys::new().to_bytes();
        match self.role {
            Role::Initiator => {
                self.send_packet(&newkeys, rng).await?;
                NewKeys::from_bytes(&self.recv_packet().await?)?;
            }
            Role::Responder => {
                NewKeys::from_bytes(&self.recv_packet().await?)?;
                self.send_packet(&newkeys, rng).await?;
            }
        }
        Ok(())
    }

    async fn send_packet<R>(&mut self, payload: &[u8], rng: &mut R) -> CloudResult<()>
    where
        R: RngCore + CryptoRng,
    {
        let bytes = packet::wrap(payload, rng);
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv_packet(&mut self) -> CloudResult<Vec<u8>> {
        let packet_length = self.stream.read_u32().await? as usize;

        if packet_length > MAX_PACKET_SIZE {
            return Err(CloudError::Framing(format!(
                "Packet too large: {} bytes (max {})",
                packet_length, MAX_PACKET_SIZE
            )));
        }
        if packet_length + 4 < MIN_PACKET_SIZE {
            return Err(CloudError::Framing(format!(
                "Packet too short: {} bytes",
                packet_length
            )));
        }

        let mut data = vec![0u8; 4 + packet_length];
        data[..4].copy_from_slice(&(packet_length as u32).to_be_bytes());
        self.stream.read_exact(&mut data[4..]).await?;

        packet::unwrap(&data)
    }

    /// Encrypts and sends one frame with the next application sequence number.
    ///
    /// Any error closes the session.
    pub async fn send_frame(&mut self, frame_type: FrameType, payload: &[u8]) -> CloudResult<()> {
        let result = self.write_encrypted(frame_type, payload).await;
        match result {
            Ok(()) => {
                logging::log_frame_send(frame_type.name(), self.send_sequence, payload.len());
                self.send_sequence = self.send_sequence.wrapping_add(1);
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Receives and decrypts one frame.
    ///
    /// Any error closes the session, including a frame whose application
    /// sequence number is not the next expected one.
    pub async fn recv_frame(&mut self) -> CloudResult<Frame> {
        let result = self.read_encrypted().await;
        match result {
            Ok(frame) => {
                logging::log_frame_recv(frame.frame_type.name(), frame.sequence, frame.payload.len());
                self.recv_sequence = self.recv_sequence.wrapping_add(1);
                Ok(frame)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn write_encrypted(&mut self, frame_type: FrameType, payload: &[u8]) -> CloudResult<()> {
        let state = self.state.current();
        let ciphers = match (state.is_encrypted(), self.ciphers.as_mut()) {
            (true, Some(ciphers)) => ciphers,
            _ => {
                return Err(CloudError::ProtocolViolation(format!(
                    "Cannot send {} in state {:?}",
                    frame_type, state
                )))
            }
        };

        envelope::write_frame(
            &mut self.stream,
            &mut ciphers.send,
            frame_type,
            self.send_sequence,
            payload,
        )
        .await
    }

    async fn read_encrypted(&mut self) -> CloudResult<Frame> {
        let state = self.state.current();
        let ciphers = match (state.is_encrypted(), self.ciphers.as_mut()) {
            (true, Some(ciphers)) => ciphers,
            _ => {
                return Err(CloudError::ProtocolViolation(format!(
                    "Cannot receive in state {:?}",
                    state
                )))
            }
        };

        let frame = envelope::read_frame(&mut self.stream, &mut ciphers.recv).await?;

        if frame.sequence != self.recv_sequence {
            return Err(CloudError::ProtocolViolation(format!(
                "{} carries sequence {}, expected {}",
                frame.frame_type, frame.sequence, self.recv_sequence
            )));
        }

        Ok(frame)
    }

    /// Marks the session authenticated.
    pub fn mark_authenticated(&mut self) -> CloudResult<()> {
        self.advance(State::Authenticated)
    }

    /// Marks the session as carrying file transfers.
    pub fn mark_transferring(&mut self) -> CloudResult<()> {
        self.advance(State::Transferring)
    }

    /// Closes the session and shuts the stream down.
    pub async fn close(&mut self) {
        if !self.state.is_closed() {
            self.log_transition(State::Closed);
            self.state.close();
        }
        let _ = self.stream.shutdown().await;
    }

    fn advance(&mut self, next_state: State) -> CloudResult<()> {
        self.state.transition(next_state)?;
        self.log_transition(next_state);
        Ok(())
    }

    fn log_transition(&self, next_state: State) {
        logging::log_state_transition(
            &self.peer,
            &format!("{:?}", self.state.current()),
            &format!("{:?}", next_state),
        );
    }

    async fn fail(&mut self, error: CloudError) -> CloudError {
        if let CloudError::MacMismatch { sequence } = &error {
            logging::log_mac_failure(&self.peer, *sequence);
        }
        self.close().await;
        error
    }
}

impl<S> std::fmt::Debug for TransportSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("role", &self.role)
            .field("state", &self.state.current())
            .field("peer", &self.peer)
            .field("send_sequence", &self.send_sequence)
            .field("recv_sequence", &self.recv_sequence)
            .finish()
    }
}

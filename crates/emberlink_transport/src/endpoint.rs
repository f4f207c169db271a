//! # Endpoint
//!
//! Composition root for one process: the I/O pump plus one session per
//! remote peer, driven by a single per-tick processing call.
//!
//! A server endpoint accepts handshakes from unknown addresses; a client
//! endpoint dials one remote. Either way the owner constructs the endpoint
//! explicitly and passes handles down into gameplay code; there is no
//! global instance.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::compress::AdaptiveCompressor;
use crate::config::TransportConfig;
use crate::error::ConfigError;
use crate::protocol::{Framer, PacketType};
use crate::session::{Session, SessionRole};
use crate::transport::IoPump;

/// Multi-session endpoint bound to one UDP socket.
pub struct Endpoint {
    config: TransportConfig,
    pump: IoPump,
    compressor: Arc<AdaptiveCompressor>,
    sessions: HashMap<SocketAddr, Session>,
    accept_connections: bool,
}

impl Endpoint {
    /// Binds a server endpoint that accepts incoming handshakes.
    pub fn server(addr: SocketAddr, config: TransportConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Self {
            compressor: Arc::new(AdaptiveCompressor::new(
                config.algorithm,
                config.min_size_to_compress,
                config.use_dictionary_compression,
            )),
            pump: IoPump::spawn(addr)?,
            config,
            sessions: HashMap::new(),
            accept_connections: true,
        })
    }

    /// Binds a client endpoint and starts connecting to `remote`.
    pub fn client(
        bind: SocketAddr,
        remote: SocketAddr,
        config: TransportConfig,
    ) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut endpoint = Self {
            compressor: Arc::new(AdaptiveCompressor::new(
                config.algorithm,
                config.min_size_to_compress,
                config.use_dictionary_compression,
            )),
            pump: IoPump::spawn(bind)?,
            config,
            sessions: HashMap::new(),
            accept_connections: false,
        };
        let now = Instant::now();
        let mut session = endpoint
            .build_session(SessionRole::Initiator, now)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        session.connect(now);
        endpoint.sessions.insert(remote, session);
        Ok(endpoint)
    }

    /// Bound local address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.pump.local_addr()
    }

    /// The session for a remote peer, if one exists.
    #[must_use]
    pub fn session(&self, addr: &SocketAddr) -> Option<&Session> {
        self.sessions.get(addr)
    }

    /// Mutable access to a peer's session.
    pub fn session_mut(&mut self, addr: &SocketAddr) -> Option<&mut Session> {
        self.sessions.get_mut(addr)
    }

    /// Addresses of every live session.
    #[must_use]
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.sessions.keys().copied().collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// One processing step: drain inbound datagrams through the stack,
    /// then drain each session's outbound traffic to the I/O queue.
    pub fn tick(&mut self, now: Instant) {
        for datagram in self.pump.drain_inbound() {
            if !self.sessions.contains_key(&datagram.addr) {
                if !self.accept_connections || !is_handshake(&datagram.data) {
                    continue;
                }
                match self.build_session(SessionRole::Acceptor, now) {
                    Ok(session) => {
                        tracing::info!(addr = %datagram.addr, "accepting new connection");
                        self.sessions.insert(datagram.addr, session);
                    }
                    Err(error) => {
                        tracing::warn!(%error, "failed to build session");
                        continue;
                    }
                }
            }
            if let Some(session) = self.sessions.get_mut(&datagram.addr) {
                session.handle_datagram(&datagram.data, now);
            }
        }

        for (&addr, session) in &mut self.sessions {
            for data in session.tick(now) {
                if !self.pump.send(addr, data) {
                    tracing::warn!(%addr, "outbound queue full, dropping datagram");
                }
            }
        }
    }

    /// Disconnects every session and stops the I/O thread.
    pub fn shutdown(&mut self, now: Instant) {
        for (&addr, session) in &mut self.sessions {
            session.disconnect(now);
            for data in session.tick(now) {
                let _ = self.pump.send(addr, data);
            }
        }
        self.sessions.clear();
        self.pump.shutdown();
    }

    fn build_session(&self, role: SessionRole, now: Instant) -> Result<Session, ConfigError> {
        Session::new(
            self.config.clone(),
            role,
            Arc::clone(&self.compressor),
            now,
        )
    }
}

/// Cheap pre-check: only a valid handshake datagram may create a session.
fn is_handshake(data: &[u8]) -> bool {
    Framer::decode(data)
        .map(|(header, _)| header.packet_type == PacketType::HANDSHAKE)
        .unwrap_or(false)
}

//! # UDP Transport
//!
//! The I/O context: a non-blocking socket wrapper and the pump thread that
//! ferries datagrams between the socket and the processing context's
//! bounded queues.
//!
//! ## Design
//!
//! - Raw UDP, non-blocking; `WouldBlock` is "nothing to read", not an error
//! - Bounded crossbeam channels between I/O and processing; the tick loop
//!   never touches the socket
//! - Socket statistics counted here, reset on request

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::protocol::MAX_DATAGRAM_SIZE;

/// Socket-level statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketStats {
    /// Datagrams sent.
    pub packets_sent: u64,
    /// Datagrams received.
    pub packets_received: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Send errors.
    pub send_errors: u64,
    /// Receive errors.
    pub recv_errors: u64,
}

/// Non-blocking UDP socket wrapper.
pub struct UdpTransport {
    socket: std::net::UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: [u8; MAX_DATAGRAM_SIZE],
    stats: SocketStats,
}

impl UdpTransport {
    /// Binds a non-blocking socket to the given address.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: [0u8; MAX_DATAGRAM_SIZE],
            stats: SocketStats::default(),
        })
    }

    /// Returns the bound local address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends one datagram.
    pub fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.socket.send_to(data, addr) {
            Ok(n) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.stats.send_errors += 1;
                Err(e)
            }
        }
    }

    /// Receives one datagram, or `None` when nothing is pending.
    pub fn recv(&mut self) -> Option<(&[u8], SocketAddr)> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((len, addr)) => {
                self.stats.packets_received += 1;
                self.stats.bytes_received += len as u64;
                Some((&self.recv_buffer[..len], addr))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(_) => {
                self.stats.recv_errors += 1;
                None
            }
        }
    }

    /// Current socket statistics.
    #[must_use]
    pub const fn stats(&self) -> &SocketStats {
        &self.stats
    }

    /// Resets socket statistics.
    pub fn reset_stats(&mut self) {
        self.stats = SocketStats::default();
    }
}

/// A raw datagram crossing the I/O boundary.
#[derive(Clone, Debug)]
pub struct Datagram {
    /// Remote address.
    pub addr: SocketAddr,
    /// Datagram bytes.
    pub data: Vec<u8>,
}

/// Capacity of each direction's bounded queue.
const QUEUE_CAPACITY: usize = 8192;

/// How long the pump thread sleeps when both directions are idle.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// The I/O pump: owns the socket on its own thread and exposes bounded
/// queues to the processing context.
pub struct IoPump {
    inbound_rx: Receiver<Datagram>,
    outbound_tx: Sender<Datagram>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl IoPump {
    /// Binds a socket and starts the pump thread.
    pub fn spawn(addr: SocketAddr) -> io::Result<Self> {
        let mut transport = UdpTransport::bind(addr)?;
        let local_addr = transport.local_addr();
        let (inbound_tx, inbound_rx) = bounded::<Datagram>(QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = bounded::<Datagram>(QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("emberlink-io".into())
            .spawn(move || {
                while !shutdown_flag.load(Ordering::Relaxed) {
                    let mut idle = true;

                    while let Some((data, addr)) = transport.recv() {
                        idle = false;
                        let datagram = Datagram {
                            addr,
                            data: data.to_vec(),
                        };
                        match inbound_tx.try_send(datagram) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                // Processing is behind; dropping here is the
                                // bounded-memory contract, the reliability
                                // layer recovers what matters.
                                tracing::warn!("inbound queue full, dropping datagram");
                            }
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }

                    while let Ok(datagram) = outbound_rx.try_recv() {
                        idle = false;
                        if let Err(error) = transport.send_to(&datagram.data, datagram.addr) {
                            tracing::debug!(%error, "datagram send failed");
                        }
                    }

                    if idle {
                        std::thread::sleep(IDLE_SLEEP);
                    }
                }
            })?;

        Ok(Self {
            inbound_rx,
            outbound_tx,
            shutdown,
            local_addr,
            handle: Some(handle),
        })
    }

    /// Bound local address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drains every datagram currently queued inbound.
    #[must_use]
    pub fn drain_inbound(&self) -> Vec<Datagram> {
        let mut datagrams = Vec::new();
        while let Ok(datagram) = self.inbound_rx.try_recv() {
            datagrams.push(datagram);
        }
        datagrams
    }

    /// Queues a datagram for sending; false when the queue is full.
    pub fn send(&self, addr: SocketAddr, data: Vec<u8>) -> bool {
        self.outbound_tx.try_send(Datagram { addr, data }).is_ok()
    }

    /// Signals the pump thread to stop and joins it.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IoPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_and_stats() {
        let transport = UdpTransport::bind(loopback()).unwrap();
        assert_ne!(transport.local_addr().port(), 0);
        assert_eq!(transport.stats().packets_sent, 0);
    }

    #[test]
    fn test_send_and_receive() {
        let mut a = UdpTransport::bind(loopback()).unwrap();
        let mut b = UdpTransport::bind(loopback()).unwrap();

        a.send_to(b"ping", b.local_addr()).unwrap();

        // Non-blocking: poll briefly for delivery.
        let mut received = None;
        for _ in 0..100 {
            if let Some((data, addr)) = b.recv() {
                received = Some((data.to_vec(), addr));
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let (data, addr) = received.expect("datagram delivered");
        assert_eq!(data, b"ping");
        assert_eq!(addr, a.local_addr());
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(b.stats().packets_received, 1);
    }

    #[test]
    fn test_pump_round_trip() {
        let mut a = IoPump::spawn(loopback()).unwrap();
        let mut b = IoPump::spawn(loopback()).unwrap();

        assert!(a.send(b.local_addr(), b"over the pump".to_vec()));

        let mut datagrams = Vec::new();
        for _ in 0..200 {
            datagrams = b.drain_inbound();
            if !datagrams.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].data, b"over the pump");

        a.shutdown();
        b.shutdown();
    }
}

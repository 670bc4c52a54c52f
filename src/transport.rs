//! Transport leases.
//!
//! A connection never opens sockets itself. It asks a [`Transport`] to dial a
//! [`Destination`] and receives a [`Lease`], which it holds exclusively until
//! it hands it back through [`Transport::release`] exactly once. Two
//! transports exist: [`EphemeralTransport`] connects fresh for every dial and
//! closes on release, [`crate::pool::PooledTransport`] bounds the number of
//! outstanding leases and keeps clean sockets around for reuse.

use std::fmt;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::debug;

use crate::resolver::Resolver;
use crate::stream::{NetStream, Socket};
use crate::tls::{self, TlsErr};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("name resolution failed ({0})")]
    Resolve(ErrorKind),
    #[error("connect failed ({0})")]
    Connect(ErrorKind),
    #[error("tls handshake failed: {0}")]
    Tls(#[from] TlsErr),
    #[error("connection pool exhausted ({max} leases outstanding)")]
    Exhausted { max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// An exclusively held connection to a destination.
///
/// Not `Clone`: the only way to give it up is to move it into
/// [`Transport::release`].
pub struct Lease {
    id: u64,
    destination: Destination,
    socket: Box<dyn Socket>,
}

impl Lease {
    pub fn new(id: u64, destination: Destination, socket: Box<dyn Socket>) -> Self {
        Self {
            id,
            destination,
            socket,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn socket(&mut self) -> &mut dyn Socket {
        self.socket.as_mut()
    }

    pub fn into_socket(self) -> Box<dyn Socket> {
        self.socket
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Dial {
    Ready(Lease),
    /// No lease available right now; retry on a later tick.
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The session ended cleanly before touching the stream; it may be reused.
    Reuse,
    Close,
}

pub trait Transport {
    fn dial(&mut self, destination: &Destination, timeout: Duration) -> Result<Dial, DialError>;

    fn release(&mut self, lease: Lease, disposition: Disposition);

    fn active_leases(&self) -> usize;

    /// Drops any sockets kept for reuse.
    fn shutdown(&mut self) {}
}

/// Opens a brand-new socket to a destination.
pub trait Connector {
    fn connect(
        &mut self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Box<dyn Socket>, DialError>;
}

/// TCP (optionally TLS) connector backed by the shared [`Resolver`].
///
/// Connect and the TLS handshake share one deadline, `timeout` from the start
/// of the dial; the returned stream is non-blocking.
pub struct NetConnector {
    resolver: Resolver,
    tls: Arc<ClientConfig>,
}

impl NetConnector {
    pub fn new() -> Result<Self, TlsErr> {
        Ok(Self::with_tls(Resolver::default(), tls::default_config()?))
    }

    pub fn with_tls(resolver: Resolver, tls: Arc<ClientConfig>) -> Self {
        Self { resolver, tls }
    }

    fn connect_tcp(&mut self, destination: &Destination, deadline: Instant) -> Result<TcpStream, DialError> {
        let addrs = self
            .resolver
            .resolve(&destination.host, destination.port)
            .map_err(|e| DialError::Resolve(e.kind()))?;

        let mut last = ErrorKind::NotFound;
        for addr in addrs {
            let Some(left) = remaining(deadline) else {
                last = ErrorKind::TimedOut;
                break;
            };
            match TcpStream::connect_timeout(&addr, left) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last = e.kind();
                }
            }
        }
        self.resolver.forget(&destination.host, destination.port);
        Err(DialError::Connect(last))
    }
}

/// Time left before `deadline`, or `None` once it has passed.
fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

fn tls_io(err: std::io::Error) -> DialError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => DialError::Tls(TlsErr::Timeout),
        _ => DialError::Tls(TlsErr::Rustls(err.to_string())),
    }
}

/// Drives the client handshake one record at a time so the whole exchange,
/// not each syscall, is bounded by `deadline`.
fn tls_handshake(
    conn: &mut ClientConnection,
    tcp: &mut TcpStream,
    deadline: Instant,
) -> Result<(), DialError> {
    while conn.is_handshaking() || conn.wants_write() {
        let left = remaining(deadline).ok_or(DialError::Tls(TlsErr::Timeout))?;
        if conn.wants_write() {
            tcp.set_write_timeout(Some(left)).map_err(tls_io)?;
            conn.write_tls(tcp).map_err(tls_io)?;
        } else if conn.wants_read() {
            tcp.set_read_timeout(Some(left)).map_err(tls_io)?;
            if conn.read_tls(tcp).map_err(tls_io)? == 0 {
                return Err(DialError::Tls(TlsErr::Rustls(
                    "peer closed the stream during the tls handshake".into(),
                )));
            }
            conn.process_new_packets().map_err(TlsErr::from)?;
        } else {
            break;
        }
    }
    Ok(())
}

impl Connector for NetConnector {
    fn connect(
        &mut self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Box<dyn Socket>, DialError> {
        let deadline = Instant::now() + timeout;
        let mut tcp = self.connect_tcp(destination, deadline)?;
        let io_err = |e: std::io::Error| DialError::Connect(e.kind());
        tcp.set_nodelay(true).map_err(io_err)?;

        let stream = if destination.secure {
            let mut conn = tls::client_connection(&self.tls, &destination.host)?;
            tls_handshake(&mut conn, &mut tcp, deadline)?;
            tcp.set_read_timeout(None).map_err(io_err)?;
            tcp.set_write_timeout(None).map_err(io_err)?;
            tcp.set_nonblocking(true).map_err(io_err)?;
            NetStream::Tls(Box::new(StreamOwned::new(conn, tcp)))
        } else {
            tcp.set_nonblocking(true).map_err(io_err)?;
            NetStream::Plain(tcp)
        };

        Ok(Box::new(stream))
    }
}

/// Connects fresh on every dial, closes on every release. No lease limit.
pub struct EphemeralTransport<C = NetConnector> {
    connector: C,
    next_id: u64,
    active: usize,
}

impl<C: Connector> EphemeralTransport<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            next_id: 1,
            active: 0,
        }
    }
}

impl<C: Connector> Transport for EphemeralTransport<C> {
    fn dial(&mut self, destination: &Destination, timeout: Duration) -> Result<Dial, DialError> {
        let socket = self.connector.connect(destination, timeout)?;
        let id = self.next_id;
        self.next_id += 1;
        self.active += 1;
        Ok(Dial::Ready(Lease::new(id, destination.clone(), socket)))
    }

    fn release(&mut self, lease: Lease, _disposition: Disposition) {
        self.active = self.active.saturating_sub(1);
        let mut socket = lease.into_socket();
        socket.shutdown();
    }

    fn active_leases(&self) -> usize {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn local(port: u16) -> Destination {
        Destination {
            host: "127.0.0.1".into(),
            port,
            secure: false,
        }
    }

    #[test]
    fn ephemeral_dials_and_releases() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut transport = EphemeralTransport::new(NetConnector::new().unwrap());

        let lease = match transport.dial(&local(port), Duration::from_millis(500)).unwrap() {
            Dial::Ready(lease) => lease,
            Dial::Pending => panic!("ephemeral transport never defers"),
        };
        assert_eq!(lease.destination().port, port);
        assert_eq!(transport.active_leases(), 1);

        transport.release(lease, Disposition::Close);
        assert_eq!(transport.active_leases(), 0);
    }

    #[test]
    fn refused_connect_is_a_connect_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut transport = EphemeralTransport::new(NetConnector::new().unwrap());
        match transport.dial(&local(port), Duration::from_millis(500)) {
            Err(DialError::Connect(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn trickling_tls_peer_hits_the_dial_deadline() {
        use std::io::Write;
        use std::thread;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // A 16 KiB handshake record, fed one byte at a time.
            if stream.write_all(&[0x16, 0x03, 0x03, 0x40, 0x00]).is_err() {
                return;
            }
            for _ in 0..60 {
                thread::sleep(Duration::from_millis(50));
                if stream.write_all(&[0]).is_err() {
                    return;
                }
            }
        });

        let mut connector = NetConnector::new().unwrap();
        let destination = Destination {
            secure: true,
            ..local(port)
        };
        let started = Instant::now();
        let result = connector.connect(&destination, Duration::from_millis(300));
        let elapsed = started.elapsed();

        assert_eq!(result.err(), Some(DialError::Tls(TlsErr::Timeout)));
        assert!(elapsed < Duration::from_millis(1500), "dial took {elapsed:?}");
        server.join().unwrap();
    }

    #[test]
    fn destination_display() {
        let d = Destination {
            host: "example.com".into(),
            port: 443,
            secure: true,
        };
        assert_eq!(d.to_string(), "wss://example.com:443");
    }
}

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};

use rustls::{ClientConnection, StreamOwned};

/// A non-blocking byte stream a connection can be driven over.
///
/// Reads and writes must never block: an implementation reports "no data /
/// no space yet" as [`ErrorKind::WouldBlock`].
pub trait Socket: Read + Write {
    /// Whether the stream is idle and clean enough to hand to another session.
    fn is_reusable(&mut self) -> bool {
        false
    }

    fn shutdown(&mut self) {}
}

/// Plain TCP or TLS over TCP, both already switched to non-blocking mode.
#[allow(clippy::large_enum_variant)]
pub enum NetStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl NetStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            NetStream::Plain(s) => s,
            NetStream::Tls(s) => s.get_ref(),
        }
    }
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(s) => s.read(buf),
            NetStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(s) => s.write(buf),
            NetStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetStream::Plain(s) => s.flush(),
            NetStream::Tls(s) => s.flush(),
        }
    }
}

impl Socket for NetStream {
    fn is_reusable(&mut self) -> bool {
        if let NetStream::Tls(s) = self {
            if s.conn.wants_write() || s.conn.is_handshaking() {
                return false;
            }
        }
        let mut peeked = [0u8; 1];
        // Any pending byte or EOF means the peer moved on without us.
        matches!(self.tcp().peek(&mut peeked), Err(e) if e.kind() == ErrorKind::WouldBlock)
    }

    fn shutdown(&mut self) {
        if let NetStream::Tls(s) = self {
            s.conn.send_close_notify();
            let _ = s.conn.write_tls(&mut s.sock);
        }
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

/// Treats `WouldBlock` and `Interrupted` as "try again next tick".
pub fn is_would_block(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn idle_plain_stream_is_reusable_until_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let tcp = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        tcp.set_nonblocking(true).unwrap();
        let (peer, _) = listener.accept().unwrap();

        let mut stream = NetStream::Plain(tcp);
        assert!(stream.is_reusable());

        drop(peer);
        // Give the FIN a moment to land.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!stream.is_reusable());
    }

    #[test]
    fn would_block_classification() {
        assert!(is_would_block(&io::Error::from(ErrorKind::WouldBlock)));
        assert!(is_would_block(&io::Error::from(ErrorKind::Interrupted)));
        assert!(!is_would_block(&io::Error::from(ErrorKind::ConnectionReset)));
    }
}

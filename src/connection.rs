//! Per-connection state machine.
//!
//! ```text
//! CONNECTING -> HANDSHAKE_WRITE -> HANDSHAKE_READ -> CONNECTED -> DISCONNECTED
//!      \_______________\__________________\_______________/
//!                  any failure or close goes straight to DISCONNECTED
//! ```
//!
//! Each call to [`Connection::step`] performs exactly one non-blocking step
//! for the current state. A would-block outcome leaves state and status
//! untouched. The DISCONNECTED step delivers the terminal events, returns the
//! lease, and reports [`Step::Finished`] so the registry can drop the
//! connection.

use std::fmt::Write as _;
use std::io::{self, Read as _, Write as _};

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, Handle, Handler};
use crate::frame::{FrameEngine, FrameMode, MessageKind, MessageQueue};
use crate::http_upgrade::{self, ClientKey, Parsed, RequestParts, UpgradeErr};
use crate::stream::{Socket, is_would_block};
use crate::transport::{Destination, Dial, Disposition, Lease, Transport};
use crate::url::WsUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Connecting,
    HandshakeWrite,
    HandshakeRead,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Finished,
}

pub(crate) struct Connection {
    handle: Handle,
    url: WsUrl,
    destination: Destination,
    state: State,
    status: Option<Error>,
    buffer: Vec<u8>,
    filled: usize,
    messages: MessageQueue,
    handler: Box<dyn Handler>,
    lease: Option<Lease>,
    key: ClientKey,
    request: SmallVec<[u8; 512]>,
    written: usize,
    scan_from: usize,
    frame_mode: FrameMode,
    frames: Option<Box<dyn FrameEngine>>,
    protocol: Option<String>,
    touched: bool,
    debug_level: u8,
}

impl Connection {
    pub fn new(handle: Handle, url: WsUrl, handler: Box<dyn Handler>, config: &Config) -> Self {
        let key = http_upgrade::generate_client_key();
        let authority = url.authority();
        let request = http_upgrade::write_request(&RequestParts {
            host: &authority,
            path_and_query: &url.path_and_query,
            sec_websocket_key: &key.sec_websocket_key,
            protocols: &config.protocols,
            extra_headers: &config.headers,
        });
        let destination = Destination {
            host: url.host.clone(),
            port: url.port,
            secure: url.scheme.is_secure(),
        };

        Self {
            handle,
            url,
            destination,
            state: State::Connecting,
            status: None,
            buffer: vec![0; config.buffer_size],
            filled: 0,
            messages: MessageQueue::new(),
            handler,
            lease: None,
            key,
            request,
            written: 0,
            scan_from: 0,
            frame_mode: config.frames,
            frames: None,
            protocol: None,
            touched: false,
            debug_level: config.debug_level,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn status(&self) -> Option<&Error> {
        self.status.as_ref()
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    /// Requests termination. Against a connected peer this queues a close
    /// frame first; it is flushed best-effort when the connection finalizes.
    pub fn close(&mut self) {
        match self.state {
            State::Disconnected => {}
            State::Connected => {
                if let Some(frames) = self.frames.as_mut() {
                    frames.close();
                }
                self.set_state(State::Disconnected);
            }
            _ => self.set_state(State::Disconnected),
        }
    }

    pub fn send(&mut self, kind: MessageKind, payload: &[u8]) -> Result<()> {
        if self.state != State::Connected {
            return Err(Error::NotConnected(self.handle));
        }
        if let Some(frames) = self.frames.as_mut() {
            frames.queue(kind, payload);
        }
        self.flush_outbound().map_err(|e| {
            let err = Error::io(&e, "send failed");
            self.fail(err.clone());
            err
        })
    }

    pub fn step(&mut self, transport: &mut dyn Transport, config: &Config) -> Step {
        match self.state {
            State::Connecting => self.step_connecting(transport, config),
            State::HandshakeWrite => self.step_handshake_write(),
            State::HandshakeRead => self.step_handshake_read(config),
            State::Connected => self.step_connected(),
            State::Disconnected => {
                self.finalize(transport);
                return Step::Finished;
            }
        }
        Step::Continue
    }

    fn set_state(&mut self, next: State) {
        let prev = self.state;
        if prev != next {
            self.state = next;
            if self.debug_level >= 1 {
                debug!(handle = %self.handle, ?prev, ?next, "state change");
            }
        }
    }

    /// Records `err` as the status unless one is already set, then goes to
    /// DISCONNECTED.
    fn fail(&mut self, err: Error) {
        if self.status.is_none() {
            if self.debug_level >= 1 {
                debug!(handle = %self.handle, error = %err, "connection failed");
            }
            self.status = Some(err);
        }
        self.set_state(State::Disconnected);
    }

    fn step_connecting(&mut self, transport: &mut dyn Transport, config: &Config) {
        match transport.dial(&self.destination, config.socket_timeout) {
            Ok(Dial::Ready(lease)) => {
                if self.debug_level >= 1 {
                    debug!(handle = %self.handle, lease = lease.id(), destination = %self.destination, "lease acquired");
                }
                self.lease = Some(lease);
                self.set_state(State::HandshakeWrite);
            }
            Ok(Dial::Pending) => {
                trace!(handle = %self.handle, "waiting for a free lease");
            }
            Err(source) => self.fail(Error::Transport {
                host: self.destination.host.clone(),
                port: self.destination.port,
                source,
            }),
        }
    }

    fn step_handshake_write(&mut self) {
        let Some(lease) = self.lease.as_mut() else {
            return self.fail(UpgradeErr::Io(io::ErrorKind::NotConnected).into());
        };

        let pending = &self.request[self.written..];
        match lease.socket().write(pending) {
            Ok(0) => self.fail(UpgradeErr::Io(io::ErrorKind::WriteZero).into()),
            Ok(n) => {
                self.touched = true;
                self.written += n;
                if self.written == self.request.len() {
                    if self.debug_level >= 2 {
                        trace!(handle = %self.handle, "request {}", printable(&self.request));
                    }
                    self.set_state(State::HandshakeRead);
                }
            }
            Err(e) if is_would_block(&e) => {}
            Err(e) => self.fail(UpgradeErr::Io(e.kind()).into()),
        }
    }

    fn step_handshake_read(&mut self, config: &Config) {
        let Some(lease) = self.lease.as_mut() else {
            return self.fail(UpgradeErr::Io(io::ErrorKind::NotConnected).into());
        };
        if let Err(e) = flush(lease.socket()) {
            return self.fail(UpgradeErr::Io(e.kind()).into());
        }

        let capacity = self.buffer.len();
        match lease.socket().read(&mut self.buffer[self.filled..capacity]) {
            Ok(0) => return self.fail(UpgradeErr::Eof.into()),
            Ok(n) => self.filled += n,
            Err(e) if is_would_block(&e) => return,
            Err(e) => return self.fail(UpgradeErr::Io(e.kind()).into()),
        }

        let received = &self.buffer[..self.filled];
        match http_upgrade::read_response(received, self.scan_from, &self.key, &config.protocols) {
            Ok(Parsed::NeedMore { scan_from }) => {
                self.scan_from = scan_from;
                if self.filled == capacity {
                    self.fail(UpgradeErr::Oversized.into());
                }
            }
            Ok(Parsed::Complete {
                header_len,
                protocol,
            }) => {
                if self.debug_level >= 2 {
                    trace!(handle = %self.handle, "response {}", printable(&received[..header_len]));
                }
                self.buffer.copy_within(header_len..self.filled, 0);
                self.filled -= header_len;
                self.protocol = protocol;
                self.frames = Some(self.frame_mode.build(capacity));
                self.set_state(State::Connected);
                self.handler.on_event(self.handle, Event::Connected);
                self.demarcate();
            }
            Err(e) => self.fail(e.into()),
        }
    }

    fn step_connected(&mut self) {
        if let Err(e) = self.flush_outbound() {
            return self.fail(Error::io(&e, "send failed"));
        }

        let (Some(frames), Some(lease)) = (self.frames.as_mut(), self.lease.as_mut()) else {
            return self.fail(Error::Io {
                kind: io::ErrorKind::NotConnected,
                context: "connection has no stream",
            });
        };

        let capacity = self.buffer.len();
        if self.filled < capacity {
            match lease.socket().read(&mut self.buffer[self.filled..capacity]) {
                Ok(0) => {
                    let clean = frames.clean_eof();
                    if clean {
                        self.set_state(State::Disconnected);
                    } else {
                        self.fail(Error::Io {
                            kind: io::ErrorKind::UnexpectedEof,
                            context: "peer closed the stream without a close frame",
                        });
                    }
                    return;
                }
                Ok(n) => self.filled += n,
                Err(e) if is_would_block(&e) => {}
                Err(e) => return self.fail(Error::io(&e, "receive failed")),
            }
        }

        self.demarcate();
    }

    /// Runs the frame engine over the filled part of the buffer and delivers
    /// every complete message, in order, before resetting buffer and queue.
    fn demarcate(&mut self) {
        let Some(frames) = self.frames.as_mut() else {
            return;
        };
        if self.filled == 0 && frames.backlog() == 0 {
            return;
        }

        let result = frames.feed(&mut self.buffer, self.filled, &mut self.messages);
        let wants_close = frames.wants_close();

        let mut offset = 0;
        for &len in &self.messages {
            self.handler
                .on_event(self.handle, Event::Message(&self.buffer[offset..offset + len]));
            offset += len;
        }
        self.messages.clear();
        self.filled = 0;

        match result {
            Err(e) => self.fail(e.into()),
            Ok(()) if wants_close => self.set_state(State::Disconnected),
            Ok(()) => {}
        }
    }

    /// One non-blocking write of whatever the frame engine has queued.
    fn flush_outbound(&mut self) -> io::Result<()> {
        let (Some(frames), Some(lease)) = (self.frames.as_mut(), self.lease.as_mut()) else {
            return Ok(());
        };
        let socket = lease.socket();

        let pending = frames.pending_output();
        if !pending.is_empty() {
            match socket.write(pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.touched = true;
                    frames.consume_output(n);
                }
                Err(e) if is_would_block(&e) => {}
                Err(e) => return Err(e),
            }
        }
        flush(socket)
    }

    fn finalize(&mut self, transport: &mut dyn Transport) {
        // Give a queued close frame one chance to leave.
        if self.status.is_none() {
            let _ = self.flush_outbound();
        }

        if let Some(status) = &self.status {
            self.handler.on_event(self.handle, Event::Error(status));
        }
        self.handler.on_event(self.handle, Event::Disconnected);

        if let Some(lease) = self.lease.take() {
            let disposition = if self.status.is_none() && !self.touched {
                Disposition::Reuse
            } else {
                Disposition::Close
            };
            if self.debug_level >= 1 {
                debug!(handle = %self.handle, lease = lease.id(), ?disposition, "lease returned");
            }
            transport.release(lease, disposition);
        }
    }
}

fn flush(socket: &mut dyn Socket) -> io::Result<()> {
    match socket.flush() {
        Err(e) if !is_would_block(&e) => Err(e),
        _ => Ok(()),
    }
}

/// Renders wire bytes for trace output: printable ASCII as-is, CR/LF/TAB
/// escaped, everything else as `\xx`.
pub(crate) fn printable(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 16);
    out.push('\'');
    for &b in bytes {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{b:02x}");
            }
        }
    }
    let _ = write!(out, "' {} bytes", bytes.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_escapes_control_bytes() {
        assert_eq!(
            printable(b"GET / HTTP/1.1\r\n\t\x01"),
            "'GET / HTTP/1.1\\r\\n\\t\\01' 18 bytes"
        );
    }

    #[test]
    fn states_are_ordered_along_the_happy_path() {
        assert!(State::Connecting < State::HandshakeWrite);
        assert!(State::HandshakeWrite < State::HandshakeRead);
        assert!(State::HandshakeRead < State::Connected);
        assert!(State::Connected < State::Disconnected);
    }
}

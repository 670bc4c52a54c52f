#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::rc::Rc;
use std::time::Duration;

use websockets_tick::http_upgrade::accept_key;
use websockets_tick::{
    Connector, Destination, DialError, Engine, Error, ErrorKind as WsErrorKind, Event, Handle,
    Handler, Socket,
};

pub enum Inbound {
    Data(Vec<u8>),
    Eof,
    Fail(ErrorKind),
}

/// Server side of an in-memory socket, scripted by the test.
#[derive(Default)]
pub struct Wire {
    pub inbound: VecDeque<Inbound>,
    pub written: Vec<u8>,
    pub write_limit: Option<usize>,
    pub block_writes: usize,
    pub write_error: Option<ErrorKind>,
    pub write_calls: usize,
    pub shut: bool,
}

pub type SharedWire = Rc<RefCell<Wire>>;

impl Wire {
    pub fn push(&mut self, bytes: impl Into<Vec<u8>>) {
        self.inbound.push_back(Inbound::Data(bytes.into()));
    }

    /// The `Sec-WebSocket-Key` the client sent.
    pub fn client_key(&self) -> String {
        let text = String::from_utf8_lossy(&self.written);
        text.lines()
            .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
            .expect("request carries a key")
            .trim()
            .to_owned()
    }

    pub fn request_complete(&self) -> bool {
        self.written.windows(4).any(|w| w == b"\r\n\r\n")
    }

    pub fn accept(&mut self) {
        let response = upgrade_response(&accept_key(&self.client_key()));
        self.push(response);
    }
}

pub fn upgrade_response(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
    )
    .into_bytes()
}

pub struct MockSocket(pub SharedWire);

impl Read for MockSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.0.borrow_mut();
        match wire.inbound.pop_front() {
            None => Err(ErrorKind::WouldBlock.into()),
            Some(Inbound::Eof) => {
                wire.inbound.push_front(Inbound::Eof);
                Ok(0)
            }
            Some(Inbound::Fail(kind)) => Err(kind.into()),
            Some(Inbound::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    wire.inbound.push_front(Inbound::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for MockSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wire = self.0.borrow_mut();
        wire.write_calls += 1;
        if let Some(kind) = wire.write_error {
            return Err(kind.into());
        }
        if wire.block_writes > 0 {
            wire.block_writes -= 1;
            return Err(ErrorKind::WouldBlock.into());
        }
        let n = wire.write_limit.unwrap_or(usize::MAX).min(buf.len());
        wire.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for MockSocket {
    fn is_reusable(&mut self) -> bool {
        let wire = self.0.borrow();
        !wire.shut && wire.inbound.is_empty() && wire.written.is_empty()
    }

    fn shutdown(&mut self) {
        self.0.borrow_mut().shut = true;
    }
}

/// Hands out scripted sockets and remembers every wire it created.
#[derive(Clone, Default)]
pub struct MockConnector {
    pub wires: Rc<RefCell<Vec<SharedWire>>>,
    pub fail: Rc<RefCell<Option<DialError>>>,
    pub write_limit: Option<usize>,
}

impl MockConnector {
    pub fn wire(&self, index: usize) -> SharedWire {
        self.wires.borrow()[index].clone()
    }

    pub fn connects(&self) -> usize {
        self.wires.borrow().len()
    }
}

impl Connector for MockConnector {
    fn connect(
        &mut self,
        _destination: &Destination,
        _timeout: Duration,
    ) -> Result<Box<dyn Socket>, DialError> {
        if let Some(err) = self.fail.borrow().clone() {
            return Err(err);
        }
        let wire = Rc::new(RefCell::new(Wire {
            write_limit: self.write_limit,
            ..Wire::default()
        }));
        self.wires.borrow_mut().push(wire.clone());
        Ok(Box::new(MockSocket(wire)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connected,
    Message(Vec<u8>),
    Error(WsErrorKind, String),
    Disconnected,
}

#[derive(Clone, Default)]
pub struct Recorder(pub Rc<RefCell<Vec<(Handle, Seen)>>>);

impl Handler for Recorder {
    fn on_event(&mut self, handle: Handle, event: Event<'_>) {
        let seen = match event {
            Event::Connected => Seen::Connected,
            Event::Message(bytes) => Seen::Message(bytes.to_vec()),
            Event::Error(err) => Seen::Error(err.kind(), err.to_string()),
            Event::Disconnected => Seen::Disconnected,
        };
        self.0.borrow_mut().push((handle, seen));
    }
}

impl Recorder {
    pub fn for_handle(&self, handle: Handle) -> Vec<Seen> {
        self.0
            .borrow()
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }
}

/// Checks `Connected? Message* (Error Disconnected | Disconnected)`, allowing
/// the sequence to still be in progress.
pub fn assert_well_formed(events: &[Seen]) {
    let mut i = 0;
    if events.first() == Some(&Seen::Connected) {
        i = 1;
    }
    while matches!(events.get(i), Some(Seen::Message(_))) {
        i += 1;
    }
    if matches!(events.get(i), Some(Seen::Error(..))) {
        i += 1;
        assert_eq!(events.get(i), Some(&Seen::Disconnected), "error must precede disconnect: {events:?}");
    }
    if events.get(i) == Some(&Seen::Disconnected) {
        i += 1;
    }
    assert_eq!(i, events.len(), "malformed event sequence: {events:?}");
}

/// An unmasked server frame.
pub fn server_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![if fin { 0x80 } else { 0 } | opcode];
    match payload.len() {
        n if n < 126 => out.push(n as u8),
        n => {
            out.push(126);
            out.extend_from_slice(&u16::try_from(n).expect("test frames stay small").to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
    out
}

/// Splits masked client frames out of `bytes`: (first byte, unmasked payload).
pub fn client_frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut frames = Vec::new();
    while bytes.len() >= 6 {
        assert_eq!(bytes[1] & 0x80, 0x80, "client frames are masked");
        let len = (bytes[1] & 0x7F) as usize;
        assert!(len < 126);
        let mask = [bytes[2], bytes[3], bytes[4], bytes[5]];
        let payload = bytes[6..6 + len]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i % 4])
            .collect();
        frames.push((bytes[0], payload));
        bytes = &bytes[6 + len..];
    }
    frames
}

pub fn tick_n(engine: &mut Engine, n: usize) {
    for _ in 0..n {
        engine.tick();
    }
}

pub fn kind_of(err: &Error) -> WsErrorKind {
    err.kind()
}

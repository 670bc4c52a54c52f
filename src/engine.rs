//! Engine context.
//!
//! An [`Engine`] owns a registry of connections and the transport that leases
//! their sockets. Nothing here is internally synchronized: `open`, `send`,
//! `close` and `tick` must be called from one logical thread. Handlers run
//! synchronously inside `tick` (and `shutdown`), one connection at a time.

use std::collections::BTreeMap;

use tracing::{debug, error};

use crate::config::{Config, TransportMode};
use crate::connection::{Connection, State, Step};
use crate::error::{Error, Result};
use crate::event::{Handle, Handler};
use crate::frame::MessageKind;
use crate::pool::PooledTransport;
use crate::transport::{EphemeralTransport, NetConnector, Transport};
use crate::url::{WsUrl, parse_ws_or_wss};

pub struct Engine {
    config: Config,
    transport: std::result::Result<Box<dyn Transport>, Error>,
    connections: BTreeMap<Handle, Connection>,
    next_handle: u64,
}

impl Engine {
    /// Builds the engine and its transport from `config`.
    ///
    /// Never fails: if the transport cannot be constructed the error is
    /// logged once and every later [`Engine::open`] returns it.
    pub fn new(config: Config) -> Self {
        let transport = build_transport(&config);
        if let Err(err) = &transport {
            error!(error = %err, "websocket engine not initialized");
        } else if config.debug_level >= 1 {
            debug!(debug_level = config.debug_level, transport = ?config.transport, frames = ?config.frames, "websocket engine initialized");
        }
        Self::assemble(config, transport)
    }

    /// Builds the engine around a caller-supplied transport.
    pub fn with_transport(config: Config, transport: Box<dyn Transport>) -> Self {
        let transport = config
            .validate()
            .map(|()| transport)
            .map_err(Error::Initialization);
        Self::assemble(config, transport)
    }

    fn assemble(config: Config, transport: std::result::Result<Box<dyn Transport>, Error>) -> Self {
        Self {
            config,
            transport,
            connections: BTreeMap::new(),
            next_handle: 1,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The initialization error, if the engine is unusable.
    pub fn init_error(&self) -> Option<&Error> {
        self.transport.as_ref().err()
    }

    /// Registers a new connection in CONNECTING. No I/O happens until the next
    /// [`Engine::tick`].
    pub fn open(&mut self, url: &str, handler: impl Handler + 'static) -> Result<Handle> {
        if let Err(err) = &self.transport {
            return Err(err.clone());
        }
        let url = parse_ws_or_wss(url)?;

        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        if self.config.debug_level >= 1 {
            debug!(%handle, host = %url.host, port = url.port, path = %url.path_and_query, "open");
        }
        let conn = Connection::new(handle, url, Box::new(handler), &self.config);
        self.connections.insert(handle, conn);
        Ok(handle)
    }

    /// Idempotent. Unknown or already-terminal handles are ignored.
    pub fn close(&mut self, handle: Handle) {
        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.close();
        }
    }

    /// Queues a binary message. Only valid while CONNECTED.
    pub fn send(&mut self, handle: Handle, payload: &[u8]) -> Result<()> {
        self.send_kind(handle, MessageKind::Binary, payload)
    }

    /// Queues a text message. Only valid while CONNECTED.
    pub fn send_text(&mut self, handle: Handle, text: &str) -> Result<()> {
        self.send_kind(handle, MessageKind::Text, text.as_bytes())
    }

    fn send_kind(&mut self, handle: Handle, kind: MessageKind, payload: &[u8]) -> Result<()> {
        self.connections
            .get_mut(&handle)
            .ok_or(Error::NotConnected(handle))?
            .send(kind, payload)
    }

    /// Advances every connection by one step, in handle order, and removes
    /// connections whose terminal events have been delivered.
    pub fn tick(&mut self) {
        let Ok(transport) = self.transport.as_mut() else {
            return;
        };

        let mut finished: Vec<Handle> = Vec::new();
        for (handle, conn) in self.connections.iter_mut() {
            if conn.step(&mut **transport, &self.config) == Step::Finished {
                finished.push(*handle);
            }
        }
        for handle in finished {
            self.connections.remove(&handle);
        }
    }

    /// Closes every connection, delivers their terminal events, returns all
    /// leases and drops pooled sockets.
    pub fn shutdown(&mut self) {
        if self.transport.is_err() {
            self.connections.clear();
            return;
        }
        for conn in self.connections.values_mut() {
            conn.close();
        }
        while !self.connections.is_empty() {
            self.tick();
        }
        if let Ok(transport) = self.transport.as_mut() {
            transport.shutdown();
        }
    }

    pub fn state(&self, handle: Handle) -> Option<State> {
        self.connections.get(&handle).map(Connection::state)
    }

    pub fn status(&self, handle: Handle) -> Option<&Error> {
        self.connections.get(&handle).and_then(Connection::status)
    }

    /// The sub-protocol the server selected, once connected.
    pub fn protocol(&self, handle: Handle) -> Option<&str> {
        self.connections.get(&handle).and_then(Connection::protocol)
    }

    pub fn url(&self, handle: Handle) -> Option<&WsUrl> {
        self.connections.get(&handle).map(Connection::url)
    }

    pub fn active_leases(&self) -> usize {
        self.transport
            .as_ref()
            .map(|t| t.active_leases())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

fn build_transport(config: &Config) -> std::result::Result<Box<dyn Transport>, Error> {
    config.validate().map_err(Error::Initialization)?;
    let connector = NetConnector::new().map_err(|e| Error::Initialization(e.to_string()))?;

    let transport: Box<dyn Transport> = match config.transport {
        TransportMode::Ephemeral => Box::new(EphemeralTransport::new(connector)),
        TransportMode::Pooled => Box::new(
            PooledTransport::new(connector, config.max_pooled_connections, config.pool_policy)
                .ok_or_else(|| {
                    Error::Initialization("max_pooled_connections must be at least 1".into())
                })?,
        ),
    };
    Ok(transport)
}

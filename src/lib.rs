//! # websockets-tick
//!
//! A poll-driven WebSocket client engine. One [`Engine`] owns many
//! connections and advances every one of them by exactly one non-blocking
//! step per [`Engine::tick`]. There are no threads, no async runtime, and no
//! internal locking: call `tick` from your own frame loop or timer and the
//! engine never stalls it.
//!
//! ## Features
//!
//! - **Single polling loop**: connect, handshake, receive, and send all run as
//!   non-blocking steps; would-block just means "next tick".
//! - **`ws://` and `wss://`**: TLS via `rustls` with `webpki-roots`. `https://`
//!   URLs are accepted as `wss://`.
//! - **Pooled transport**: a bounded lease pool per engine with wait or
//!   fail-fast exhaustion, or an ephemeral connect-per-session transport.
//! - **Pluggable framing**: a full RFC 6455 engine, or a raw pass-through mode
//!   for endpoints that echo bytes without framing.
//! - **Strict events**: per connection, exactly
//!   `Connected? Message* Error? Disconnected`, with a sticky first error.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! websockets-tick = "0.1"
//! ```
//!
//! ## Basic Example
//!
//! ```no_run
//! use std::time::Duration;
//! use websockets_tick::{Config, Engine, Event, callback};
//!
//! let mut engine = Engine::new(Config::default());
//! let handle = engine
//!     .open(
//!         "wss://echo.websocket.org/",
//!         callback(|handle, event| match event {
//!             Event::Connected => println!("{handle} connected"),
//!             Event::Message(bytes) => println!("{handle} got {} bytes", bytes.len()),
//!             Event::Error(err) => eprintln!("{handle} failed: {err}"),
//!             Event::Disconnected => println!("{handle} gone"),
//!         }),
//!     )
//!     .expect("engine initialized");
//!
//! while !engine.is_empty() {
//!     engine.tick();
//!     if engine.state(handle) == Some(websockets_tick::State::Connected) {
//!         let _ = engine.send_text(handle, "hello");
//!         engine.close(handle);
//!     }
//!     std::thread::sleep(Duration::from_millis(16));
//! }
//! ```
//!
//! ## Configuration
//!
//! [`Config`] deserializes with serde, so it can come from whatever settings
//! source the host application already uses:
//!
//! | key | default | meaning |
//! |-----|---------|---------|
//! | `buffer_size` | `65536` | per-connection receive buffer, fixed at open |
//! | `socket_timeout` | `500` | dial timeout in milliseconds |
//! | `max_pooled_connections` | `2` | outstanding leases per engine |
//! | `debug_level` | `0` | `1` traces state changes, `2` also dumps handshakes |
//! | `pool_policy` | `wait` | `wait` or `fail_fast` when the pool is exhausted |
//! | `transport` | `pooled` | `pooled` or `ephemeral` |
//! | `frames` | `protocol` | `protocol` or `raw` |
//!
//! An unusable configuration does not panic: the engine logs the problem once
//! and every [`Engine::open`] returns [`Error::Initialization`].

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod event;
pub mod frame;
pub mod http_upgrade;
pub mod pool;
pub mod resolver;
pub mod stream;
pub mod tls;
pub mod transport;
pub mod url;

pub use config::{Config, TransportMode};
pub use connection::State;
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use event::{Event, FnHandler, Handle, Handler, callback};
pub use frame::{FrameEngine, FrameMode, MessageKind};
pub use pool::{ExhaustionPolicy, PooledTransport};
pub use stream::Socket;
pub use transport::{
    Connector, Destination, Dial, DialError, Disposition, EphemeralTransport, Lease,
    NetConnector, Transport,
};

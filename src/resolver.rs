use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::trace;

const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Name-resolution channel shared by every dial an engine makes.
///
/// Lookups are cached per `(host, port)` for a short TTL so that reconnect
/// storms against one host do not hammer the system resolver.
#[derive(Debug)]
pub struct Resolver {
    ttl: Duration,
    cache: HashMap<(String, u16), (Vec<SocketAddr>, Instant)>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }
}

impl Resolver {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let key = (host.to_owned(), port);
        if let Some((addrs, at)) = self.cache.get(&key) {
            if at.elapsed() < self.ttl {
                return Ok(addrs.clone());
            }
        }

        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                ErrorKind::NotFound,
                format!("no addresses for {host}"),
            ));
        }
        trace!(host, port, count = addrs.len(), "resolved");
        self.cache.insert(key, (addrs.clone(), Instant::now()));
        Ok(addrs)
    }

    pub fn forget(&mut self, host: &str, port: u16) {
        self.cache.remove(&(host.to_owned(), port));
    }
}

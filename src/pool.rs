//! Pooled transport with a bounded number of outstanding leases.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::stream::Socket;
use crate::transport::{Connector, Destination, Dial, DialError, Disposition, Lease, Transport};

/// What a dial does when every lease is checked out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Report [`Dial::Pending`]; the caller retries on a later tick.
    #[default]
    Wait,
    /// Fail the dial with [`DialError::Exhausted`].
    FailFast,
}

pub struct PooledTransport<C> {
    connector: C,
    max: usize,
    policy: ExhaustionPolicy,
    next_id: u64,
    checked_out: HashSet<u64>,
    idle: HashMap<Destination, Vec<Box<dyn Socket>>>,
}

impl<C: Connector> PooledTransport<C> {
    /// `max` must be non-zero; a pool that can never lease is a configuration error.
    pub fn new(connector: C, max: usize, policy: ExhaustionPolicy) -> Option<Self> {
        (max > 0).then(|| Self {
            connector,
            max,
            policy,
            next_id: 1,
            checked_out: HashSet::new(),
            idle: HashMap::new(),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    fn take_idle(&mut self, destination: &Destination) -> Option<Box<dyn Socket>> {
        let sockets = self.idle.get_mut(destination)?;
        while let Some(mut socket) = sockets.pop() {
            if socket.is_reusable() {
                return Some(socket);
            }
            socket.shutdown();
        }
        None
    }
}

impl<C: Connector> Transport for PooledTransport<C> {
    fn dial(&mut self, destination: &Destination, timeout: Duration) -> Result<Dial, DialError> {
        if self.checked_out.len() >= self.max {
            return match self.policy {
                ExhaustionPolicy::Wait => Ok(Dial::Pending),
                ExhaustionPolicy::FailFast => Err(DialError::Exhausted { max: self.max }),
            };
        }

        let socket = match self.take_idle(destination) {
            Some(socket) => {
                debug!(%destination, "reusing pooled socket");
                socket
            }
            None => self.connector.connect(destination, timeout)?,
        };

        let id = self.next_id;
        self.next_id += 1;
        self.checked_out.insert(id);
        Ok(Dial::Ready(Lease::new(id, destination.clone(), socket)))
    }

    fn release(&mut self, lease: Lease, disposition: Disposition) {
        if !self.checked_out.remove(&lease.id()) {
            warn!(lease = lease.id(), "released a lease this pool does not own");
            return;
        }

        let destination = lease.destination().clone();
        let mut socket = lease.into_socket();
        if disposition == Disposition::Reuse
            && self.idle_count() < self.max
            && socket.is_reusable()
        {
            debug!(%destination, "socket returned to pool");
            self.idle.entry(destination).or_default().push(socket);
        } else {
            socket.shutdown();
        }
    }

    fn active_leases(&self) -> usize {
        self.checked_out.len()
    }

    fn shutdown(&mut self) {
        for (_, sockets) in self.idle.drain() {
            for mut socket in sockets {
                socket.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::{self, Read, Write};
    use std::rc::Rc;

    struct Idle {
        alive: bool,
    }

    impl Read for Idle {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for Idle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Socket for Idle {
        fn is_reusable(&mut self) -> bool {
            self.alive
        }
    }

    #[derive(Clone, Default)]
    struct Counting {
        connects: Rc<Cell<usize>>,
    }

    impl Connector for Counting {
        fn connect(&mut self, _: &Destination, _: Duration) -> Result<Box<dyn Socket>, DialError> {
            self.connects.set(self.connects.get() + 1);
            Ok(Box::new(Idle { alive: true }))
        }
    }

    fn dest() -> Destination {
        Destination {
            host: "example.com".into(),
            port: 80,
            secure: false,
        }
    }

    fn ready(dial: Result<Dial, DialError>) -> Lease {
        match dial {
            Ok(Dial::Ready(lease)) => lease,
            other => panic!("expected a lease, got {other:?}"),
        }
    }

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn zero_capacity_pool_is_rejected() {
        assert!(PooledTransport::new(Counting::default(), 0, ExhaustionPolicy::Wait).is_none());
    }

    #[test]
    fn waits_when_exhausted_and_resumes_after_release() {
        let mut pool = PooledTransport::new(Counting::default(), 2, ExhaustionPolicy::Wait).unwrap();
        let a = ready(pool.dial(&dest(), T));
        let _b = ready(pool.dial(&dest(), T));
        assert!(matches!(pool.dial(&dest(), T), Ok(Dial::Pending)));
        assert_eq!(pool.active_leases(), 2);

        pool.release(a, Disposition::Close);
        assert_eq!(pool.active_leases(), 1);
        ready(pool.dial(&dest(), T));
    }

    #[test]
    fn fail_fast_policy_errors() {
        let mut pool = PooledTransport::new(Counting::default(), 1, ExhaustionPolicy::FailFast).unwrap();
        let _a = ready(pool.dial(&dest(), T));
        assert_eq!(
            pool.dial(&dest(), T).unwrap_err(),
            DialError::Exhausted { max: 1 }
        );
    }

    #[test]
    fn clean_sockets_are_reused() {
        let connector = Counting::default();
        let connects = connector.connects.clone();
        let mut pool = PooledTransport::new(connector, 2, ExhaustionPolicy::Wait).unwrap();

        let a = ready(pool.dial(&dest(), T));
        pool.release(a, Disposition::Reuse);
        assert_eq!(pool.idle_count(), 1);

        let b = ready(pool.dial(&dest(), T));
        assert_eq!(connects.get(), 1);
        assert_eq!(pool.idle_count(), 0);

        pool.release(b, Disposition::Close);
        assert_eq!(pool.idle_count(), 0);
        ready(pool.dial(&dest(), T));
        assert_eq!(connects.get(), 2);
    }

    #[test]
    fn dead_idle_sockets_are_skipped() {
        let connector = Counting::default();
        let connects = connector.connects.clone();
        let mut pool = PooledTransport::new(connector, 2, ExhaustionPolicy::Wait).unwrap();
        pool.idle
            .entry(dest())
            .or_default()
            .push(Box::new(Idle { alive: false }));

        ready(pool.dial(&dest(), T));
        assert_eq!(connects.get(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn foreign_leases_are_ignored() {
        let mut pool = PooledTransport::new(Counting::default(), 1, ExhaustionPolicy::Wait).unwrap();
        let _mine = ready(pool.dial(&dest(), T));
        let stranger = Lease::new(999, dest(), Box::new(Idle { alive: true }));
        pool.release(stranger, Disposition::Reuse);
        assert_eq!(pool.active_leases(), 1);
        assert_eq!(pool.idle_count(), 0);
    }
}

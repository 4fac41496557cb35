//! UDP port pool
//!
//! Hands out locally-free UDP ports from a configured range as RAII guards.
//! A guard reserves the number against concurrent pool users; the actual
//! bind happens later, by whoever ends up owning the port.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::{P2pError, P2pResult};

/// Default range matching common firewall allowances
pub const DEFAULT_PORT_RANGE: (u16, u16) = (40000, 50000);

/// Shared allocator of local UDP ports
#[derive(Clone)]
pub struct PortPool {
    inner: Arc<Mutex<PoolInner>>,
}

struct PoolInner {
    start: u16,
    end: u16,
    next: u16,
    allocated: HashSet<u16>,
}

/// A reserved port, released back to the pool on drop
pub struct PortGuard {
    num: u16,
    pool: Arc<Mutex<PoolInner>>,
}

impl PortGuard {
    /// The reserved port number
    pub fn num(&self) -> u16 {
        self.num
    }
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        let mut inner = self.pool.lock().expect("port pool lock poisoned");
        inner.allocated.remove(&self.num);
    }
}

impl std::fmt::Debug for PortGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PortGuard({})", self.num)
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE.0, DEFAULT_PORT_RANGE.1)
    }
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                start,
                end,
                next: start,
                allocated: HashSet::new(),
            })),
        }
    }

    /// Reserve one free port
    pub fn acquire(&self) -> P2pResult<PortGuard> {
        let mut guards = self.acquire_multiple(1)?;
        Ok(guards.remove(0))
    }

    /// Reserve `n` free ports at once
    pub fn acquire_multiple(&self, n: usize) -> P2pResult<Vec<PortGuard>> {
        let mut inner = self.inner.lock().expect("port pool lock poisoned");
        let range_len = usize::from(inner.end - inner.start);
        let mut guards = Vec::with_capacity(n);
        let mut scanned = 0;

        while guards.len() < n && scanned < range_len {
            let candidate = inner.next;
            inner.next = if inner.next + 1 >= inner.end {
                inner.start
            } else {
                inner.next + 1
            };
            scanned += 1;

            if inner.allocated.contains(&candidate) {
                continue;
            }
            if !is_free(candidate) {
                trace!(port = candidate, "port in use by another process");
                continue;
            }

            inner.allocated.insert(candidate);
            guards.push(PortGuard {
                num: candidate,
                pool: self.inner.clone(),
            });
        }

        if guards.len() < n {
            // Guards drop here, releasing whatever was reserved.
            return Err(P2pError::PortPoolExhausted);
        }
        Ok(guards)
    }
}

fn is_free(port: u16) -> bool {
    UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

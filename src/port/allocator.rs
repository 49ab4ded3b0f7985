use crate::config::PortRange;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::TcpListener;

/// A port handed out by [`PortAllocator`], tagged with the allocator epoch
/// it was issued in.
///
/// `set_range` starts a new epoch; releasing a lease from an older epoch is a
/// no-op so a stale instance cannot free a port that was re-issued after the
/// reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    epoch: u64,
}

#[derive(Debug)]
struct PortPool {
    range: PortRange,
    allocated: BTreeSet<u16>,
    /// Allocated ports whose owner handle was dropped while its server kept
    /// running; only `reclaim` may take them over
    detached: BTreeSet<u16>,
    /// Next candidate to try, so reservations rotate through the range
    cursor: u16,
    epoch: u64,
}

impl PortPool {
    fn new(range: PortRange, epoch: u64) -> Self {
        Self {
            range,
            allocated: BTreeSet::new(),
            detached: BTreeSet::new(),
            cursor: range.low,
            epoch,
        }
    }

    fn candidates(&self) -> impl Iterator<Item = u16> + '_ {
        let PortRange { low, high } = self.range;
        (self.cursor..=high).chain(low..self.cursor)
    }
}

/// Hands out non-conflicting ports from a bounded range.
///
/// All state sits behind one mutex, so concurrent `reserve` calls from
/// different threads can never observe the same free port. A candidate is
/// only issued if it is also free at the OS level (bind check on 127.0.0.1
/// and 0.0.0.0), which skips ports held by foreign processes.
pub struct PortAllocator {
    pool: Mutex<PortPool>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Result<Self> {
        range.validate()?;
        Ok(Self {
            pool: Mutex::new(PortPool::new(range, 0)),
        })
    }

    /// Reserve an unused port from the current range.
    pub fn reserve(&self) -> Result<u16> {
        self.reserve_lease().map(|lease| lease.port)
    }

    /// Reserve an unused port and return it with its epoch tag.
    pub fn reserve_lease(&self) -> Result<PortLease> {
        let mut pool = self.pool.lock();
        let found = pool
            .candidates()
            .find(|port| !pool.allocated.contains(port) && is_port_available(*port));

        match found {
            Some(port) => {
                pool.allocated.insert(port);
                pool.cursor = if port == pool.range.high {
                    pool.range.low
                } else {
                    port + 1
                };
                tracing::debug!("Reserved port {}", port);
                Ok(PortLease {
                    port,
                    epoch: pool.epoch,
                })
            }
            None => Err(Error::PortsExhausted {
                low: pool.range.low,
                high: pool.range.high,
            }),
        }
    }

    /// Claim a specific port (a pinned `port` parameter or a restored record).
    ///
    /// Ports outside the range are tracked too, so two instances cannot pin
    /// the same port. No bind check: a restored server may already be
    /// listening on it.
    pub fn claim(&self, port: u16) -> Result<PortLease> {
        let mut pool = self.pool.lock();
        if !pool.allocated.insert(port) {
            return Err(Error::PortInUse(port));
        }
        Ok(PortLease {
            port,
            epoch: pool.epoch,
        })
    }

    /// Take over a port left reserved by [`detach_lease`](Self::detach_lease),
    /// or claim it as a fresh port.
    ///
    /// Used when restoring a persisted record whose server may have outlived
    /// the handle that reserved its port.
    pub fn reclaim(&self, port: u16) -> Result<PortLease> {
        let mut pool = self.pool.lock();
        if !pool.detached.remove(&port) && !pool.allocated.insert(port) {
            return Err(Error::PortInUse(port));
        }
        Ok(PortLease {
            port,
            epoch: pool.epoch,
        })
    }

    /// Keep a lease's port reserved without an owner.
    ///
    /// The port is not handed out again until it is reclaimed or released.
    /// Stale leases are ignored as in [`release_lease`](Self::release_lease).
    pub fn detach_lease(&self, lease: &PortLease) {
        let mut pool = self.pool.lock();
        if pool.epoch == lease.epoch && pool.allocated.contains(&lease.port) {
            pool.detached.insert(lease.port);
            tracing::debug!("Port {} detached from its owner", lease.port);
        }
    }

    /// Return a port to the pool. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        let mut pool = self.pool.lock();
        pool.detached.remove(&port);
        if pool.allocated.remove(&port) {
            tracing::debug!("Released port {}", port);
        }
    }

    /// Release a lease, ignoring leases issued before the last `set_range`.
    pub fn release_lease(&self, lease: &PortLease) {
        let mut pool = self.pool.lock();
        if pool.epoch != lease.epoch {
            tracing::debug!(
                "Ignoring release of port {} from stale epoch {}",
                lease.port,
                lease.epoch
            );
            return;
        }
        pool.detached.remove(&lease.port);
        if pool.allocated.remove(&lease.port) {
            tracing::debug!("Released port {}", lease.port);
        }
    }

    /// Reset the pool to a new range and forget every outstanding reservation.
    pub fn set_range(&self, low: u16, high: u16) -> Result<()> {
        let range = PortRange::new(low, high)?;
        let mut pool = self.pool.lock();
        let epoch = pool.epoch + 1;
        *pool = PortPool::new(range, epoch);
        tracing::debug!("Port range reset to {}-{} (epoch {})", low, high, epoch);
        Ok(())
    }

    pub fn range(&self) -> PortRange {
        self.pool.lock().range
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.pool.lock().allocated.contains(&port)
    }

    /// Snapshot of reserved ports in ascending order.
    pub fn reserved_ports(&self) -> Vec<u16> {
        self.pool.lock().allocated.iter().copied().collect()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            pool: Mutex::new(PortPool::new(PortRange::default(), 0)),
        }
    }
}

/// Check if a port can be bound on both loopback and the wildcard address.
///
/// On macOS, binding to 127.0.0.1 can succeed even when 0.0.0.0 is in use,
/// so both are checked.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok() && TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(low: u16, high: u16) -> PortAllocator {
        PortAllocator::new(PortRange::new(low, high).unwrap()).unwrap()
    }

    #[test]
    fn test_reserve_within_range() {
        let ports = allocator(41000, 41009);
        let port = ports.reserve().unwrap();
        assert!((41000..=41009).contains(&port));
        assert!(ports.is_reserved(port));
    }

    #[test]
    fn test_multiple_reservations_differ() {
        let ports = allocator(41010, 41019);
        let a = ports.reserve().unwrap();
        let b = ports.reserve().unwrap();
        assert_ne!(a, b);
        assert_eq!(ports.reserved_ports().len(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let ports = allocator(41020, 41021);
        let _a = ports.reserve().unwrap();
        let _b = ports.reserve().unwrap();
        assert!(matches!(
            ports.reserve(),
            Err(Error::PortsExhausted {
                low: 41020,
                high: 41021
            })
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let ports = allocator(41030, 41030);
        let port = ports.reserve().unwrap();
        ports.release(port);
        ports.release(port);
        assert!(!ports.is_reserved(port));
        assert_eq!(ports.reserve().unwrap(), port);
    }

    #[test]
    fn test_skips_ports_bound_by_others() {
        let ports = allocator(41040, 41041);
        let _held = TcpListener::bind(("127.0.0.1", 41040)).unwrap();
        assert_eq!(ports.reserve().unwrap(), 41041);
        assert!(ports.reserve().is_err());
    }

    #[test]
    fn test_set_range_clears_bookkeeping() {
        let ports = allocator(41050, 41050);
        let old = ports.reserve_lease().unwrap();
        ports.set_range(41060, 41061).unwrap();
        assert!(ports.reserved_ports().is_empty());
        assert_eq!(ports.range(), PortRange::new(41060, 41061).unwrap());

        let fresh = ports.claim(41050).unwrap();
        // A lease from before the reset must not free the re-issued port
        ports.release_lease(&old);
        assert!(ports.is_reserved(41050));
        ports.release_lease(&fresh);
        assert!(!ports.is_reserved(41050));
    }

    #[test]
    fn test_claim_rejects_double_pin() {
        let ports = allocator(41070, 41079);
        ports.claim(5999).unwrap();
        assert!(matches!(ports.claim(5999), Err(Error::PortInUse(5999))));
    }

    #[test]
    fn test_reserve_never_returns_claimed_port() {
        let ports = allocator(41080, 41081);
        ports.claim(41080).unwrap();
        assert_eq!(ports.reserve().unwrap(), 41081);
    }

    #[test]
    fn test_detached_port_is_held_until_reclaimed() {
        let ports = allocator(41100, 41101);
        let lease = ports.reserve_lease().unwrap();
        ports.detach_lease(&lease);
        assert!(ports.is_reserved(lease.port));
        assert_ne!(ports.reserve().unwrap(), lease.port);

        // A pinned claim still conflicts; only a restore can adopt it
        assert!(matches!(ports.claim(lease.port), Err(Error::PortInUse(_))));
        let adopted = ports.reclaim(lease.port).unwrap();
        assert!(matches!(ports.reclaim(lease.port), Err(Error::PortInUse(_))));

        ports.release_lease(&adopted);
        assert!(!ports.is_reserved(lease.port));
    }

    #[test]
    fn test_reclaim_free_port_claims_it() {
        let ports = allocator(41110, 41111);
        ports.reclaim(41110).unwrap();
        assert!(ports.is_reserved(41110));
    }

    #[test]
    fn test_invalid_range() {
        let ports = allocator(41090, 41091);
        assert!(matches!(
            ports.set_range(10, 5),
            Err(Error::InvalidPortRange { low: 10, high: 5 })
        ));
        assert_eq!(ports.range().low, 41090);
    }
}

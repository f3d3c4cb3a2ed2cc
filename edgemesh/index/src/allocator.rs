use ahash::AHashSet as HashSet;
use ipnet::Ipv4Net;
use std::{collections::VecDeque, net::Ipv4Addr};

/// The highest offset handed out within the synthetic subnet. Offsets `0` and `0xffff` are never
/// issued.
pub const MAX_POOL_SIZE: u32 = 0xfffe;

/// Hands out synthetic IPs from a private subnet.
///
/// Addresses are issued lazily, one `/24`-aligned block at a time. Released addresses are queued
/// for reuse before the cursor advances. The pool has no lock of its own; it is always mutated
/// under the service registry's write lock.
#[derive(Clone, Debug)]
pub struct FakeIpPool {
    net: Ipv4Net,
    base: u32,
    /// The next offset to be issued.
    next: u32,
    /// The highest offset that may be issued.
    limit: u32,
    free: VecDeque<Ipv4Addr>,
    /// Addresses reserved ahead of the cursor; they are skipped when their block is issued.
    reserved: HashSet<Ipv4Addr>,
}

#[derive(Debug, thiserror::Error)]
#[error("synthetic subnet {0} is too small; the prefix may not be longer than /30")]
pub struct InvalidSubnet(Ipv4Net);

/// A point-in-time view of the pool's accounting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Addresses that have been issued: behind the cursor or reserved ahead of it.
    pub issued: usize,
    /// Issued addresses waiting for reuse.
    pub free: usize,
}

// === impl FakeIpPool ===

impl FakeIpPool {
    pub fn new(net: Ipv4Net) -> Result<Self, InvalidSubnet> {
        if net.prefix_len() > 30 {
            return Err(InvalidSubnet(net));
        }
        let hosts = (1u64 << (32 - net.prefix_len())) - 2;
        let limit = hosts.min(MAX_POOL_SIZE as u64) as u32;
        Ok(Self {
            net: net.trunc(),
            base: u32::from(net.network()),
            next: 1,
            limit,
            free: VecDeque::new(),
            reserved: HashSet::default(),
        })
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.net
    }

    /// Returns whether `ip` is an address this pool may issue.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.offset(ip).is_some()
    }

    /// Takes an address from the pool, or returns `None` when the subnet is exhausted.
    pub fn acquire(&mut self) -> Option<Ipv4Addr> {
        while self.free.is_empty() && self.next <= self.limit {
            self.expand();
        }
        self.free.pop_front()
    }

    /// Marks `ip` unavailable so that it is never handed out by [`FakeIpPool::acquire`]. Returns
    /// false if `ip` is not part of the subnet.
    pub fn reserve(&mut self, ip: Ipv4Addr) -> bool {
        let offset = match self.offset(ip) {
            Some(offset) => offset,
            None => return false,
        };
        if offset < self.next {
            if let Some(pos) = self.free.iter().position(|f| *f == ip) {
                self.free.remove(pos);
            }
        } else {
            self.reserved.insert(ip);
        }
        true
    }

    /// Returns an address to the pool.
    pub fn release(&mut self, ip: Ipv4Addr) {
        if !self.contains(ip) {
            tracing::warn!(%ip, "Ignoring release of an address outside of the synthetic subnet");
            return;
        }
        if self.reserved.remove(&ip) {
            // Not yet reached by the cursor; it will be issued with its block.
            return;
        }
        debug_assert!(!self.free.contains(&ip), "{ip} released twice");
        self.free.push_back(ip);
    }

    pub fn is_free(&self, ip: Ipv4Addr) -> bool {
        self.free.contains(&ip)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            issued: (self.next - 1) as usize + self.reserved.len(),
            free: self.free.len(),
        }
    }

    /// Issues the remainder of the cursor's `/24` block.
    fn expand(&mut self) {
        let end = (self.next | 0xff).min(self.limit);
        for offset in self.next..=end {
            let ip = Ipv4Addr::from(self.base + offset);
            if !self.reserved.remove(&ip) {
                self.free.push_back(ip);
            }
        }
        tracing::debug!(from = self.next, to = end, "Expanded synthetic IP pool");
        self.next = end + 1;
    }

    fn offset(&self, ip: Ipv4Addr) -> Option<u32> {
        let offset = u32::from(ip).checked_sub(self.base)?;
        (1..=self.limit).contains(&offset).then_some(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> FakeIpPool {
        FakeIpPool::new("9.251.0.0/16".parse().unwrap()).unwrap()
    }

    fn ip(c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(9, 251, c, d)
    }

    #[test]
    fn issues_in_order() {
        let mut pool = pool();
        assert_eq!(pool.stats(), PoolStats { issued: 0, free: 0 });
        assert_eq!(pool.acquire(), Some(ip(0, 1)));
        assert_eq!(pool.acquire(), Some(ip(0, 2)));
        // The first block holds .1 through .255.
        assert_eq!(pool.stats(), PoolStats { issued: 255, free: 253 });
    }

    #[test]
    fn grows_by_blocks() {
        let mut pool = pool();
        for _ in 0..255 {
            pool.acquire().unwrap();
        }
        assert_eq!(pool.stats().free, 0);
        assert_eq!(pool.acquire(), Some(ip(1, 0)));
        assert_eq!(pool.stats(), PoolStats { issued: 511, free: 255 });
    }

    #[test]
    fn reuses_released_addresses_first_in_first_out() {
        let mut pool = pool();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        for _ in 0..253 {
            pool.acquire().unwrap();
        }
        pool.release(b);
        pool.release(a);
        assert_eq!(pool.acquire(), Some(b));
        assert_eq!(pool.acquire(), Some(a));
    }

    #[test]
    fn reserved_addresses_are_skipped() {
        let mut pool = pool();
        assert!(pool.reserve(ip(0, 5)));
        assert!(pool.reserve(ip(0, 6)));
        assert!(!pool.reserve(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!pool.reserve(ip(0, 0)));

        assert_eq!(pool.acquire(), Some(ip(0, 1)));
        assert!(!pool.is_free(ip(0, 5)));
        assert!(!pool.is_free(ip(0, 6)));
        let issued = std::iter::from_fn(|| pool.acquire()).take(300).collect::<Vec<_>>();
        assert!(!issued.contains(&ip(0, 5)));
        assert!(!issued.contains(&ip(0, 6)));
    }

    #[test]
    fn reserve_removes_issued_free_addresses() {
        let mut pool = pool();
        pool.acquire().unwrap();
        assert!(pool.is_free(ip(0, 7)));
        pool.reserve(ip(0, 7));
        assert!(!pool.is_free(ip(0, 7)));
        assert_eq!(pool.stats(), PoolStats { issued: 255, free: 253 });
    }

    #[test]
    fn exhausts_at_the_subnet_limit() {
        let mut pool = pool();
        let mut n = 0;
        while pool.acquire().is_some() {
            n += 1;
        }
        assert_eq!(n, MAX_POOL_SIZE);
        assert_eq!(pool.acquire(), None);
        assert_eq!(pool.stats(), PoolStats { issued: 65534, free: 0 });

        pool.release(ip(0, 9));
        assert_eq!(pool.acquire(), Some(ip(0, 9)));
    }

    #[test]
    fn small_subnets() {
        let mut pool = FakeIpPool::new("192.0.2.0/30".parse().unwrap()).unwrap();
        assert_eq!(pool.acquire(), Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(pool.acquire(), Some(Ipv4Addr::new(192, 0, 2, 2)));
        assert_eq!(pool.acquire(), None);

        assert!(FakeIpPool::new("192.0.2.0/31".parse().unwrap()).is_err());
    }
}

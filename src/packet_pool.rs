//! Buffer pool backing PDU recombination.
//!
//! Fragmented PDUs are reassembled into buffers drawn from a
//! [`PacketPool`]. A pool is shared between several clients (typically one
//! per L2CAP channel) and enforces a quota policy between them, so one
//! slow channel cannot starve the others of recombination storage.

use core::cell::{RefCell, UnsafeCell};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// Identifies one client of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClientId(usize);

impl ClientId {
    /// Creates a client id. Must be less than the pool's client count.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }
}

/// Quota policy for dividing a pool between its clients.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Quota {
    /// First come, first served.
    Shared,
    /// Every client gets an equal share of the pool.
    Fair,
    /// Keep at least `n` buffers obtainable for every idle client.
    Reserved(usize),
}

struct State<const MTU: usize, const N: usize, const CLIENTS: usize> {
    buffers: UnsafeCell<[[u8; MTU]; N]>,
    owners: RefCell<[Option<ClientId>; N]>,
}

impl<const MTU: usize, const N: usize, const CLIENTS: usize> State<MTU, N, CLIENTS> {
    const fn new() -> Self {
        Self {
            buffers: UnsafeCell::new([[0; MTU]; N]),
            owners: RefCell::new([None; N]),
        }
    }

    fn used_by(&self, client: ClientId) -> usize {
        self.owners.borrow().iter().filter(|o| **o == Some(client)).count()
    }

    fn used_total(&self) -> usize {
        self.owners.borrow().iter().filter(|o| o.is_some()).count()
    }

    fn idle_clients(&self) -> usize {
        let owners = self.owners.borrow();
        (0..CLIENTS)
            .filter(|c| !owners.iter().any(|o| *o == Some(ClientId(*c))))
            .count()
    }

    fn available(&self, quota: Quota, client: ClientId) -> usize {
        match quota {
            Quota::Shared => N.saturating_sub(self.used_total()),
            Quota::Fair => (N / CLIENTS).saturating_sub(self.used_by(client)),
            Quota::Reserved(n) => {
                // Buffers held back for clients that currently own nothing,
                // not counting this client's own reservation.
                let mut reserved = n * self.idle_clients();
                if self.used_by(client) == 0 {
                    reserved -= n;
                }
                N.saturating_sub(reserved + self.used_total())
            }
        }
    }

    fn alloc(&self, client: ClientId) -> Option<(usize, *mut [u8])> {
        let mut owners = self.owners.borrow_mut();
        let buffers = unsafe { &mut *self.buffers.get() };
        for (index, owner) in owners.iter_mut().enumerate() {
            if owner.is_none() {
                owner.replace(client);
                buffers[index].iter_mut().for_each(|b| *b = 0);
                return Some((index, &mut buffers[index][..]));
            }
        }
        None
    }

    fn free(&self, index: usize) {
        self.owners.borrow_mut()[index] = None;
    }
}

/// A pool of `N` fixed-size buffers shared by `CLIENTS` clients.
pub struct PacketPool<M: RawMutex, const MTU: usize, const N: usize, const CLIENTS: usize> {
    state: Mutex<M, State<MTU, N, CLIENTS>>,
    quota: Quota,
}

impl<M: RawMutex, const MTU: usize, const N: usize, const CLIENTS: usize> PacketPool<M, MTU, N, CLIENTS> {
    /// Creates an empty pool enforcing `quota` between its clients.
    pub fn new(quota: Quota) -> Self {
        assert!(CLIENTS >= 1);
        match quota {
            Quota::Shared => {}
            Quota::Fair => assert!(N >= CLIENTS),
            Quota::Reserved(n) => assert!(N >= n * CLIENTS),
        }
        Self {
            state: Mutex::new(State::new()),
            quota,
        }
    }
}

/// Object-safe pool interface handed out to channels.
pub trait GlobalPacketPool {
    /// Allocates one buffer on behalf of `client`, subject to the quota.
    fn alloc(&'static self, client: ClientId) -> Option<Packet>;
    /// Returns a buffer to the pool.
    fn free(&self, index: usize);
    /// Number of buffers `client` could still allocate.
    fn available(&self, client: ClientId) -> usize;
    /// Size of every buffer in the pool.
    fn mtu(&self) -> usize;
}

impl<M: RawMutex, const MTU: usize, const N: usize, const CLIENTS: usize> GlobalPacketPool
    for PacketPool<M, MTU, N, CLIENTS>
{
    fn alloc(&'static self, client: ClientId) -> Option<Packet> {
        self.state.lock(|state| {
            if state.available(self.quota, client) == 0 {
                return None;
            }
            state.alloc(client).map(|(index, buf)| Packet {
                index,
                buf,
                pool: self,
            })
        })
    }

    fn free(&self, index: usize) {
        self.state.lock(|state| state.free(index));
    }

    fn available(&self, client: ClientId) -> usize {
        self.state.lock(|state| state.available(self.quota, client))
    }

    fn mtu(&self) -> usize {
        MTU
    }
}

/// An owned pool buffer. Returns itself to the pool on drop.
pub struct Packet {
    index: usize,
    buf: *mut [u8],
    pool: &'static dyn GlobalPacketPool,
}

impl Packet {
    /// Capacity of the buffer.
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    /// Whether the buffer has zero capacity.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.pool.free(self.index);
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        // The slot is exclusively owned until drop returns it.
        unsafe { &(&*self.buf)[..] }
    }
}

impl AsMut<[u8]> for Packet {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { &mut (&mut *self.buf)[..] }
    }
}

/// Copyable handle a channel exposes for allocating its recombination
/// storage: a pool plus the channel's client id in it.
#[derive(Clone, Copy)]
pub struct RxAllocator {
    pool: &'static dyn GlobalPacketPool,
    client: ClientId,
}

impl RxAllocator {
    /// Binds `client`'s share of `pool` into an allocator handle.
    pub fn new(pool: &'static dyn GlobalPacketPool, client: ClientId) -> Self {
        Self { pool, client }
    }

    pub(crate) fn alloc(&self) -> Option<Packet> {
        self.pool.alloc(self.client)
    }

    /// Largest PDU this allocator can provide storage for.
    pub fn mtu(&self) -> usize {
        self.pool.mtu()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use static_cell::StaticCell;

    use super::*;

    type NoopPool<const MTU: usize, const N: usize, const CLIENTS: usize> =
        PacketPool<embassy_sync::blocking_mutex::raw::NoopRawMutex, MTU, N, CLIENTS>;

    #[test]
    fn fair_quota_limits_each_client() {
        static POOL: StaticCell<NoopPool<27, 8, 4>> = StaticCell::new();
        let pool = POOL.init(PacketPool::new(Quota::Fair));

        let a1 = pool.alloc(ClientId::new(0));
        assert!(a1.is_some());
        let a2 = pool.alloc(ClientId::new(0));
        assert!(a2.is_some());
        assert!(pool.alloc(ClientId::new(0)).is_none());
        drop(a2);
        assert!(pool.alloc(ClientId::new(0)).is_some());

        assert!(pool.alloc(ClientId::new(1)).is_some());
    }

    #[test]
    fn shared_quota_is_first_come_first_served() {
        static POOL: StaticCell<NoopPool<27, 4, 2>> = StaticCell::new();
        let pool = POOL.init(PacketPool::new(Quota::Shared));

        let taken: std::vec::Vec<_> = (0..4).map(|_| pool.alloc(ClientId::new(0)).unwrap()).collect();
        assert!(pool.alloc(ClientId::new(1)).is_none());
        drop(taken);
        assert!(pool.alloc(ClientId::new(1)).is_some());
    }

    #[test]
    fn reserved_quota_keeps_buffers_for_idle_clients() {
        static POOL: StaticCell<NoopPool<27, 4, 2>> = StaticCell::new();
        let pool = POOL.init(PacketPool::new(Quota::Reserved(1)));

        let a1 = pool.alloc(ClientId::new(0));
        assert!(a1.is_some());
        let a2 = pool.alloc(ClientId::new(0));
        assert!(a2.is_some());
        let a3 = pool.alloc(ClientId::new(0));
        assert!(a3.is_some());
        // The last buffer is held back for the idle client.
        assert!(pool.alloc(ClientId::new(0)).is_none());
        assert!(pool.alloc(ClientId::new(1)).is_some());
    }

    #[test]
    fn buffers_are_zeroed_on_alloc() {
        static POOL: StaticCell<NoopPool<8, 1, 1>> = StaticCell::new();
        let pool = POOL.init(PacketPool::new(Quota::Shared));

        let mut p = pool.alloc(ClientId::new(0)).unwrap();
        p.as_mut().fill(0xaa);
        drop(p);
        let p = pool.alloc(ClientId::new(0)).unwrap();
        assert_eq!(p.as_ref(), &[0; 8]);
    }
}

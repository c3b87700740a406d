use slab::Slab;
use tracing::warn;

use crate::conn::{Conn, NIL};
use crate::hash::tuple_hash;
use crate::packet::Packet;
use crate::types::{Next, PacketType, Tuple};
use crate::{clp2, ether, icmp, ipproto, tcp, udp, ConntrackError};

pub(crate) const LRU_ICMP: usize = 0;
pub(crate) const LRU_TCP_SYN: usize = 1;
pub(crate) const LRU_TCP_EST: usize = 2;
pub(crate) const LRU_UDP: usize = 3;
pub(crate) const LRU_ETHER: usize = 4;
const LRU_COUNT: usize = 5;

/// Handle to a tracked connection. Valid until the matching release drops
/// the last reference. The generation tag keeps a stale handle from
/// resolving to a recycled arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) usize, pub(crate) u64);

/// Per-protocol idle timeouts, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub icmp_secs: u64,
    pub tcp_syn_secs: u64,
    pub tcp_est_secs: u64,
    pub udp_secs: u64,
    pub ether_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            icmp_secs: 30,
            tcp_syn_secs: 30,
            tcp_est_secs: 3600,
            udp_secs: 180,
            ether_secs: 300,
        }
    }
}

/// Integration hooks invoked around per-connection allocation, with the
/// tuple for context so integrations can shard by flow.
pub trait ConnHooks {
    fn conn_alloc(&mut self, _tuple: &Tuple) {}
    fn conn_free(&mut self, _tuple: &Tuple) {}
}

#[derive(Debug, Clone, Default)]
pub struct ConntrackConfig {
    pub timeouts: Option<Timeouts>,
    /// Create connections for TCP packets seen mid-flow (no handshake).
    pub tcp_midflow: bool,
}

#[derive(Debug, Clone, Copy)]
struct LruList {
    expiry_ms: u64,
    head: usize,
    tail: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Policy {
    None,
    Create,
    Invert,
}

/// Connection table for one thread: power-of-two hash buckets plus one LRU
/// list per protocol class. Nothing in here is synchronized.
pub struct Conntrack {
    mask: usize,
    buckets: Vec<usize>,
    lru: [LruList; LRU_COUNT],
    conns: Slab<Conn>,
    next_gen: u64,
    pub(crate) tcp_midflow: bool,
    hooks: Option<Box<dyn ConnHooks>>,
}

impl Conntrack {
    pub fn new(size: u32) -> Result<Self, ConntrackError> {
        Self::with_config(size, ConntrackConfig::default())
    }

    pub fn with_config(size: u32, config: ConntrackConfig) -> Result<Self, ConntrackError> {
        let size = clp2(size);
        if size == 0 {
            return Err(ConntrackError::InvalidSize);
        }
        let t = config.timeouts.unwrap_or_default();
        let mk = |secs: u64| LruList {
            expiry_ms: secs * 1000,
            head: NIL,
            tail: NIL,
        };
        Ok(Self {
            mask: (size as usize) - 1,
            buckets: vec![NIL; size as usize],
            lru: [
                mk(t.icmp_secs),
                mk(t.tcp_syn_secs),
                mk(t.tcp_est_secs),
                mk(t.udp_secs),
                mk(t.ether_secs),
            ],
            conns: Slab::new(),
            next_gen: 0,
            tcp_midflow: config.tcp_midflow,
            hooks: None,
        })
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn ConnHooks>) {
        self.hooks = Some(hooks);
    }

    pub fn set_timeouts(&mut self, t: Timeouts) {
        self.lru[LRU_ICMP].expiry_ms = t.icmp_secs * 1000;
        self.lru[LRU_TCP_SYN].expiry_ms = t.tcp_syn_secs * 1000;
        self.lru[LRU_TCP_EST].expiry_ms = t.tcp_est_secs * 1000;
        self.lru[LRU_UDP].expiry_ms = t.udp_secs * 1000;
        self.lru[LRU_ETHER].expiry_ms = t.ether_secs * 1000;
    }

    /// Number of live connections (linked or held).
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn get(&self, id: ConnId) -> Option<&Conn> {
        self.conns.get(id.0).filter(|c| c.gen == id.1)
    }

    pub fn refcount(&self, id: ConnId) -> u32 {
        self.get(id).map(|c| c.lockref).unwrap_or(0)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn conn_mut(&mut self, id: ConnId) -> &mut Conn {
        &mut self.conns[id.0]
    }

    /// Visit every live connection.
    pub fn dump(&self, mut cb: impl FnMut(ConnId, &Conn)) {
        for (key, conn) in self.conns.iter() {
            cb(ConnId(key, conn.gen), conn);
        }
    }

    // Bucket linkage.

    fn bucket_push(&mut self, b: usize, id: usize) {
        let head = self.buckets[b];
        {
            let c = &mut self.conns[id];
            c.bucket = b;
            c.bucket_prev = NIL;
            c.bucket_next = head;
        }
        if head != NIL {
            self.conns[head].bucket_prev = id;
        }
        self.buckets[b] = id;
    }

    fn bucket_unlink(&mut self, id: usize) {
        let (b, prev, next) = {
            let c = &self.conns[id];
            (c.bucket, c.bucket_prev, c.bucket_next)
        };
        if b == NIL {
            return;
        }
        if prev != NIL {
            self.conns[prev].bucket_next = next;
        } else {
            self.buckets[b] = next;
        }
        if next != NIL {
            self.conns[next].bucket_prev = prev;
        }
        let c = &mut self.conns[id];
        c.bucket = NIL;
        c.bucket_prev = NIL;
        c.bucket_next = NIL;
    }

    // LRU linkage. Membership means "has a timeout obligation".

    fn lru_unlink(&mut self, id: usize) {
        let (l, prev, next) = {
            let c = &self.conns[id];
            (c.lru, c.lru_prev, c.lru_next)
        };
        if l == NIL {
            return;
        }
        if prev != NIL {
            self.conns[prev].lru_next = next;
        } else {
            self.lru[l].head = next;
        }
        if next != NIL {
            self.conns[next].lru_prev = prev;
        } else {
            self.lru[l].tail = prev;
        }
        let c = &mut self.conns[id];
        c.lru = NIL;
        c.lru_prev = NIL;
        c.lru_next = NIL;
    }

    /// Move to the tail of the given LRU list, switching lists if needed.
    pub(crate) fn lru_update(&mut self, lru: usize, id: ConnId) {
        let id = id.0;
        self.lru_unlink(id);
        let tail = self.lru[lru].tail;
        {
            let c = &mut self.conns[id];
            c.lru = lru;
            c.lru_prev = tail;
            c.lru_next = NIL;
        }
        if tail != NIL {
            self.conns[tail].lru_next = id;
        } else {
            self.lru[lru].head = id;
        }
        self.lru[lru].tail = id;
    }

    /// Expire from the head while entries are older than the list's
    /// timeout. Runs before lookup so a dead entry cannot be re-touched by
    /// the packet that should have outlived it.
    pub(crate) fn lru_expire(&mut self, lru: usize, timestamp: u64) {
        let expiry = self.lru[lru].expiry_ms;
        let mut cur = self.lru[lru].head;
        while cur != NIL {
            let (ts, next) = {
                let c = &self.conns[cur];
                (c.timestamp, c.lru_next)
            };
            if timestamp < ts || timestamp - ts < expiry {
                break;
            }
            self.release_index(cur);
            cur = next;
        }
    }

    // Allocation and lookup.

    /// Hash lookup with direction-agnostic tuple equality. A hit takes a
    /// reference.
    pub(crate) fn lookup_hash(&mut self, tuple: &Tuple, hash: u32) -> Option<ConnId> {
        let b = (hash as usize) & self.mask;
        let mut cur = self.buckets[b];
        while cur != NIL {
            if self.conns[cur].tuple.matches(tuple) {
                self.conns[cur].lockref += 1;
                return Some(ConnId(cur, self.conns[cur].gen));
            }
            cur = self.conns[cur].bucket_next;
        }
        None
    }

    /// Lookup with an allocation policy for misses. A created connection
    /// enters the table with `lockref == 1`: the linkage reference, which
    /// doubles as the creator's handle.
    pub(crate) fn lookup_policy(&mut self, tuple: &Tuple, hash: u32, policy: Policy) -> Option<ConnId> {
        if let Some(id) = self.lookup_hash(tuple, hash) {
            return Some(id);
        }
        match policy {
            Policy::None => None,
            Policy::Create => Some(self.create_linked(tuple, hash, false)),
            Policy::Invert => Some(self.create_linked(tuple, hash, true)),
        }
    }

    fn create_linked(&mut self, tuple: &Tuple, hash: u32, invert: bool) -> ConnId {
        let t = if invert { tuple.invert() } else { *tuple };
        if let Some(h) = self.hooks.as_mut() {
            h.conn_alloc(&t);
        }
        self.next_gen += 1;
        let mut conn = Conn::new(t);
        conn.lockref = 1;
        conn.gen = self.next_gen;
        let id = self.conns.insert(conn);
        let b = (hash as usize) & self.mask;
        self.bucket_push(b, id);
        ConnId(id, self.next_gen)
    }

    /// Allocate a connection that never enters the table (broadcast
    /// traffic). The caller owns the only reference.
    pub(crate) fn alloc_unlinked(&mut self, tuple: &Tuple, invert: bool) -> ConnId {
        let t = if invert { tuple.invert() } else { *tuple };
        if let Some(h) = self.hooks.as_mut() {
            h.conn_alloc(&t);
        }
        self.next_gen += 1;
        let mut conn = Conn::new(t);
        conn.lockref = 1;
        conn.gen = self.next_gen;
        ConnId(self.conns.insert(conn), self.next_gen)
    }

    /// Drop one reference. At zero the connection is unlinked and freed.
    pub fn release(&mut self, id: ConnId) {
        if !self.contains(id) {
            warn!(id = id.0, "conntrack: release of dead connection");
            return;
        }
        self.release_index(id.0);
    }

    fn release_index(&mut self, id: usize) {
        if !self.conns.contains(id) {
            warn!(id, "conntrack: release of dead connection");
            return;
        }
        let lockref = self.conns[id].lockref;
        if lockref == 0 {
            warn!(id, "conntrack: release of unreferenced connection");
            return;
        }
        self.conns[id].lockref = lockref - 1;
        if lockref - 1 == 0 {
            self.bucket_unlink(id);
            self.lru_unlink(id);
            let tuple = self.conns[id].tuple;
            if let Some(h) = self.hooks.as_mut() {
                h.conn_free(&tuple);
            }
            self.conns.remove(id);
        }
    }

    /// Resolve the connection for a parsed packet, creating it when the
    /// protocol policy calls for it. Broadcast frames get an unshared
    /// connection that never enters the table.
    pub fn lookup(&mut self, packet: &mut Packet) -> Option<ConnId> {
        if packet.next == Next::None {
            return None;
        }
        if packet.ptype == PacketType::Broadcast {
            return Some(self.alloc_unlinked(&packet.tuple, false));
        }
        match packet.next {
            Next::LookupTcp => tcp::lookup(self, packet),
            Next::LookupUdp => udp::lookup(self, packet),
            Next::LookupIcmp => icmp::lookup(self, packet),
            Next::BypassIcmp => icmp::bypass(self, packet),
            Next::BypassEth => ether::lookup(self, packet),
            Next::None => None,
        }
    }

    /// Tuple-keyed lookup for integrations that track flows outside the
    /// packet path. Returns the direction of `tuple` relative to the
    /// connection's stored orientation. A hit takes a reference.
    pub fn lookup_by_tuple(&mut self, tuple: &Tuple, timestamp: u64) -> Option<(ConnId, usize)> {
        let lru = match tuple.proto {
            ipproto::ICMP => LRU_ICMP,
            ipproto::TCP => {
                self.lru_expire(LRU_TCP_SYN, timestamp);
                LRU_TCP_EST
            }
            ipproto::UDP => LRU_UDP,
            _ => return None,
        };
        self.lru_expire(lru, timestamp);

        let id = self.lookup_hash(tuple, tuple_hash(tuple))?;
        self.lru_update(lru, id);
        let len = tuple.domain.len();
        let dir = if self.conns[id.0].tuple.addr[0].0[..len] == tuple.addr[0].0[..len] {
            0
        } else {
            1
        };
        Some((id, dir))
    }

    fn clear(&mut self) {
        for lru in 0..LRU_COUNT {
            let mut cur = self.lru[lru].head;
            while cur != NIL {
                let next = self.conns[cur].lru_next;
                self.bucket_unlink(cur);
                self.lru_unlink(cur);
                self.release_index(cur);
                cur = next;
            }
        }
    }
}

impl Drop for Conntrack {
    fn drop(&mut self) {
        self.clear();
    }
}

use crate::tcp::TcpCb;
use crate::types::Tuple;

pub(crate) const NIL: usize = usize::MAX;

/// Per-protocol control block. Only TCP needs per-connection state; the
/// datagram protocols are fully described by the tuple and timestamp.
#[derive(Debug, Clone, Default)]
pub enum ProtoCb {
    #[default]
    None,
    Tcp(TcpCb),
}

/// One tracked connection, owned by the conntrack arena.
///
/// `lockref` counts ownership of the bucket/LRU linkage plus any handles
/// still held by callers. A connection with `lockref == 0` is not linked
/// anywhere and its slot is free.
#[derive(Debug, Clone)]
pub struct Conn {
    pub tuple: Tuple,
    pub cb: ProtoCb,
    pub timestamp: u64,
    pub(crate) lockref: u32,
    pub(crate) gen: u64,
    pub(crate) bucket: usize,
    pub(crate) bucket_prev: usize,
    pub(crate) bucket_next: usize,
    pub(crate) lru: usize,
    pub(crate) lru_prev: usize,
    pub(crate) lru_next: usize,
}

impl Conn {
    pub(crate) fn new(tuple: Tuple) -> Self {
        use crate::ipproto;
        let cb = if tuple.proto == ipproto::TCP {
            ProtoCb::Tcp(TcpCb::default())
        } else {
            ProtoCb::None
        };
        Conn {
            tuple,
            cb,
            timestamp: 0,
            lockref: 0,
            gen: 0,
            bucket: NIL,
            bucket_prev: NIL,
            bucket_next: NIL,
            lru: NIL,
            lru_prev: NIL,
            lru_next: NIL,
        }
    }

    pub fn tcp(&self) -> Option<&TcpCb> {
        match &self.cb {
            ProtoCb::Tcp(t) => Some(t),
            ProtoCb::None => None,
        }
    }

    pub(crate) fn tcp_mut(&mut self) -> Option<&mut TcpCb> {
        match &mut self.cb {
            ProtoCb::Tcp(t) => Some(t),
            ProtoCb::None => None,
        }
    }
}

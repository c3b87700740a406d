use crate::conntrack::{ConnId, Conntrack, Policy, LRU_UDP};
use crate::packet::Packet;
use crate::types::Next;
use crate::ParseError;

pub(crate) fn parse(p: &mut Packet) -> Result<(), ParseError> {
    if p.remaining() < 8 {
        return Err(ParseError::Truncated);
    }
    let h = p.payload();
    p.tuple.port[0] = u16::from_be_bytes([h[0], h[1]]);
    p.tuple.port[1] = u16::from_be_bytes([h[2], h[3]]);
    p.next = Next::LookupUdp;
    p.advance(8);
    Ok(())
}

pub(crate) fn lookup(ct: &mut Conntrack, p: &mut Packet) -> Option<ConnId> {
    ct.lru_expire(LRU_UDP, p.timestamp);
    let id = ct.lookup_policy(&p.tuple, p.hash, Policy::Create)?;
    {
        let len = p.tuple.domain.len();
        let conn = ct.conn_mut(id);
        conn.timestamp = p.timestamp;
        p.direction = if conn.tuple.addr[0].0[..len] == p.tuple.addr[0].0[..len] {
            0
        } else {
            1
        };
    }
    ct.lru_update(LRU_UDP, id);
    p.next = Next::None;
    Some(id)
}

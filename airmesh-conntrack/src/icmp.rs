use crate::conntrack::{ConnId, Conntrack, Policy, LRU_ICMP};
use crate::ether::eth_type_from_ip;
use crate::packet::Packet;
use crate::types::Next;
use crate::ParseError;

const ICMP_HDR_LEN: usize = 8;

pub(crate) fn parse(p: &mut Packet) -> Result<(), ParseError> {
    if p.remaining() < ICMP_HDR_LEN {
        return Err(ParseError::Truncated);
    }
    let ty = p.payload()[0];
    // Unreachable, source-quench and redirect are about some other flow;
    // they bypass the stateful path.
    p.next = if (3..=5).contains(&ty) {
        Next::BypassIcmp
    } else {
        Next::LookupIcmp
    };
    Ok(())
}

pub(crate) fn parse6(p: &mut Packet) -> Result<(), ParseError> {
    if p.remaining() < ICMP_HDR_LEN {
        return Err(ParseError::Truncated);
    }
    p.next = Next::LookupIcmp;
    Ok(())
}

pub(crate) fn lookup(ct: &mut Conntrack, p: &mut Packet) -> Option<ConnId> {
    ct.lru_expire(LRU_ICMP, p.timestamp);
    let id = ct.lookup_policy(&p.tuple, p.hash, Policy::Create)?;
    ct.conn_mut(id).timestamp = p.timestamp;
    ct.lru_update(LRU_ICMP, id);
    Some(id)
}

/// Stateless path. A destination-unreachable additionally tears down the
/// embedded connection it refers to, so the table does not keep a flow the
/// network already rejected.
pub(crate) fn bypass(ct: &mut Conntrack, p: &mut Packet) -> Option<ConnId> {
    let payload = p.payload();
    if payload.len() < ICMP_HDR_LEN {
        return None;
    }
    let ty = payload[0];
    if ty == 3 {
        let inner = &payload[ICMP_HDR_LEN..];
        if !inner.is_empty() {
            let ethertype = eth_type_from_ip(inner[0]);
            if ethertype != 0 {
                if let Ok(embedded) = Packet::parse(ethertype, inner, p.timestamp) {
                    if let Some(id) = ct.lookup_policy(&embedded.tuple, embedded.hash, Policy::None)
                    {
                        // Once for the lookup, once to unlink and free.
                        ct.release(id);
                        ct.release(id);
                    }
                }
            }
        }
    }
    Some(ct.alloc_unlinked(&p.tuple, false))
}

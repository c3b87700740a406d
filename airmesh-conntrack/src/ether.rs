use crate::conntrack::{ConnId, Conntrack, Policy, LRU_ETHER};
use crate::packet::Packet;
use crate::types::Next;
use crate::{ethertype, ipproto, ParseError};

/// Map the first byte of an IP header to its ethertype.
pub(crate) fn eth_type_from_ip(byte: u8) -> u16 {
    match byte >> 4 {
        4 => ethertype::IPV4,
        6 => ethertype::IPV6,
        _ => 0,
    }
}

/// Non-IP frames (ARP) collapse into one connection per VLAN, tagged with
/// the EtherIP protocol number.
pub(crate) fn input(p: &mut Packet) -> Result<(), ParseError> {
    p.tuple.proto = ipproto::ETHERIP;
    p.next = Next::BypassEth;
    p.data = 0;
    Ok(())
}

pub(crate) fn lookup(ct: &mut Conntrack, p: &mut Packet) -> Option<ConnId> {
    ct.lru_expire(LRU_ETHER, p.timestamp);
    let id = ct.lookup_policy(&p.tuple, p.hash, Policy::Create)?;
    ct.conn_mut(id).timestamp = p.timestamp;
    ct.lru_update(LRU_ETHER, id);
    p.next = Next::None;
    Some(id)
}

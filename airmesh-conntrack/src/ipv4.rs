use crate::packet::{proto_handoff, Packet};
use crate::types::{Domain, PacketType, TupleAddr};
use crate::ParseError;

const IP_MF: u16 = 0x2000;
const IP_OFFSET: u16 = 0x1fff;

pub(crate) fn input(p: &mut Packet) -> Result<(), ParseError> {
    if p.remaining() < 20 {
        return Err(ParseError::Truncated);
    }
    let h = p.payload();
    let ihl = ((h[0] & 0x0f) as usize) << 2;
    let tot_len = u16::from_be_bytes([h[2], h[3]]) as usize;
    let frag_off = u16::from_be_bytes([h[6], h[7]]);
    let proto = h[9];

    // Fragments carry no transport header worth classifying.
    if frag_off & (IP_MF | IP_OFFSET) != 0 {
        return Err(ParseError::Fragmented);
    }
    if ihl < 20 {
        return Err(ParseError::Malformed);
    }

    let mut saddr = [0u8; 4];
    let mut daddr = [0u8; 4];
    saddr.copy_from_slice(&h[12..16]);
    daddr.copy_from_slice(&h[16..20]);

    // Trust tot_len over the captured length, never beyond it.
    p.set_tail(tot_len);
    if ihl > p.remaining() {
        return Err(ParseError::Malformed);
    }
    p.advance(ihl);
    p.mark_prot();

    p.tuple.addr[0] = TupleAddr::from_v4(saddr);
    p.tuple.addr[1] = TupleAddr::from_v4(daddr);
    p.tuple.domain = Domain::Inet;
    p.tuple.proto = proto;

    if p.ptype == PacketType::Unknown {
        if p.tuple.addr[1].is_v4_multicast() {
            p.ptype = PacketType::Multicast;
        } else if !p.tuple.addr[1].is_unspec() {
            p.ptype = PacketType::Host;
        }
    }

    proto_handoff(p, proto)
}

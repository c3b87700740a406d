use crate::packet::{proto_handoff, Packet};
use crate::types::{Domain, PacketType, TupleAddr};
use crate::ParseError;

const NEXTHDR_HOP: u8 = 0;
const NEXTHDR_ROUTING: u8 = 43;
const NEXTHDR_FRAGMENT: u8 = 44;
const NEXTHDR_ESP: u8 = 50;
const NEXTHDR_AUTH: u8 = 51;
const NEXTHDR_NONE: u8 = 59;
const NEXTHDR_DEST: u8 = 60;
const NEXTHDR_MOBILITY: u8 = 135;

fn is_extension(nhdr: u8) -> bool {
    matches!(
        nhdr,
        NEXTHDR_HOP | NEXTHDR_ROUTING | NEXTHDR_ESP | NEXTHDR_AUTH | NEXTHDR_DEST | NEXTHDR_MOBILITY
    )
}

pub(crate) fn input(p: &mut Packet) -> Result<(), ParseError> {
    let size = p.remaining();
    if size < 40 {
        return Err(ParseError::Truncated);
    }
    let h = p.payload();

    let mut saddr = [0u8; 16];
    let mut daddr = [0u8; 16];
    saddr.copy_from_slice(&h[8..24]);
    daddr.copy_from_slice(&h[24..40]);
    p.tuple.addr[0] = TupleAddr::from_v6(saddr);
    p.tuple.addr[1] = TupleAddr::from_v6(daddr);
    p.tuple.domain = Domain::Inet6;

    let mut nhdr = h[6];
    let mut offset = 40usize;

    while is_extension(nhdr) {
        // ESP hides everything behind it; stop the chain.
        if nhdr == NEXTHDR_ESP {
            break;
        }
        if offset + 2 > size {
            return Err(ParseError::Truncated);
        }
        let ext_nhdr = h[offset];
        let ext_len = h[offset + 1] as usize;
        let elen = if nhdr == NEXTHDR_AUTH {
            (ext_len + 2) * 4
        } else {
            (ext_len + 1) * 8
        };
        if offset + elen > size {
            return Err(ParseError::Malformed);
        }
        offset += elen;
        nhdr = ext_nhdr;
    }

    // Fragments and no-next-header frames drop silently: parse succeeds
    // but nothing dispatches.
    if nhdr == NEXTHDR_FRAGMENT || nhdr == NEXTHDR_NONE {
        return Ok(());
    }

    p.advance(offset);
    p.mark_prot();
    p.tuple.proto = nhdr;

    if p.ptype == PacketType::Unknown {
        if p.tuple.addr[1].is_v6_multicast() {
            p.ptype = PacketType::Multicast;
        } else if !p.tuple.addr[1].is_unspec() {
            p.ptype = PacketType::Host;
        }
    }

    proto_handoff(p, nhdr)
}

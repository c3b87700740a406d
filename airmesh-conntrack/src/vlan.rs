use crate::packet::{input_handoff, Packet};
use crate::{ethertype, ParseError};

/// 802.1Q unwrap. Nested tags collapse: the innermost tag wins.
pub(crate) fn input(p: &mut Packet) -> Result<(), ParseError> {
    let mut tci;
    let mut tpid;
    loop {
        if p.remaining() < 4 {
            return Err(ParseError::Truncated);
        }
        let h = p.payload();
        tci = u16::from_be_bytes([h[0], h[1]]);
        tpid = u16::from_be_bytes([h[2], h[3]]);
        p.advance(4);
        if tpid != ethertype::VLAN {
            break;
        }
    }
    p.tuple.vlan = tci & 0x0fff;
    input_handoff(p, tpid)
}

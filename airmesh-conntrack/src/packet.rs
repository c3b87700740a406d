use crate::hash::tuple_hash;
use crate::types::{Next, PacketType, Tuple};
use crate::{ethertype, ipproto, ParseError};
use crate::{ether, gre, icmp, ipv4, ipv6, tcp, udp, vlan};

/// A parsed frame. Offsets index into the original buffer: `data..tail` is
/// the remaining payload, `prot` marks the innermost protocol header.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub tuple: Tuple,
    pub timestamp: u64,
    /// 0 = from client, 1 = from server. Meaningful after lookup.
    pub direction: usize,
    pub ptype: PacketType,
    pub next: Next,
    pub hash: u32,
    pub(crate) buf: &'a [u8],
    pub(crate) data: usize,
    pub(crate) tail: usize,
    pub(crate) prot: usize,
}

impl<'a> Packet<'a> {
    /// Normalize a frame and compute its tuple hash. `ethertype == 0` means
    /// `data` starts with an Ethernet II header; otherwise it must identify
    /// the protocol `data` points at. The timestamp is in milliseconds and
    /// drives all conntrack expiry.
    pub fn parse(ethertype: u16, data: &'a [u8], timestamp: u64) -> Result<Self, ParseError> {
        let mut p = Packet {
            tuple: Tuple::default(),
            timestamp,
            direction: 0,
            ptype: PacketType::Unknown,
            next: Next::None,
            hash: 0,
            buf: data,
            data: 0,
            tail: data.len(),
            prot: 0,
        };

        let mut ethertype = ethertype;
        if ethertype == 0 {
            if p.remaining() < 14 {
                return Err(ParseError::Truncated);
            }
            p.ptype = if data[0] & 0x01 != 0 {
                if data[0] == 0xff {
                    PacketType::Broadcast
                } else {
                    PacketType::Multicast
                }
            } else {
                PacketType::Host
            };
            ethertype = u16::from_be_bytes([data[12], data[13]]);
            p.data += 14;
        }

        input_handoff(&mut p, ethertype)?;
        p.hash = tuple_hash(&p.tuple);
        Ok(p)
    }

    pub fn remaining(&self) -> usize {
        self.tail.saturating_sub(self.data)
    }

    /// Payload from the current parse position to the (clamped) tail.
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.data..self.tail]
    }

    /// Innermost protocol header onwards.
    pub(crate) fn prot_bytes(&self) -> &'a [u8] {
        &self.buf[self.prot..self.tail]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.data += n;
    }

    pub(crate) fn set_tail(&mut self, len_from_data: usize) {
        self.tail = self.data + len_from_data.min(self.remaining());
    }

    pub(crate) fn mark_prot(&mut self) {
        self.prot = self.data;
    }

    /// Consume the remaining payload (used to hide out-of-order data).
    pub(crate) fn consume_payload(&mut self) {
        self.data = self.tail;
    }
}

/// Ethertype handoff. Unknown types parse successfully but carry no
/// dispatch tag, so no connection is ever created for them.
pub(crate) fn input_handoff(p: &mut Packet, ethertype: u16) -> Result<(), ParseError> {
    match ethertype {
        ethertype::VLAN => vlan::input(p),
        ethertype::IPV4 => ipv4::input(p),
        ethertype::IPV6 => ipv6::input(p),
        ethertype::ARP => ether::input(p),
        _ => Ok(()),
    }
}

/// IP protocol handoff, shared by the v4 and v6 parsers.
pub(crate) fn proto_handoff(p: &mut Packet, proto: u8) -> Result<(), ParseError> {
    match proto {
        ipproto::IPIP => ipv4::input(p),
        ipproto::TCP => tcp::parse(p),
        ipproto::UDP => udp::parse(p),
        ipproto::IPV6 => ipv6::input(p),
        ipproto::GRE => gre::parse(p),
        ipproto::ICMP => icmp::parse(p),
        ipproto::ICMPV6 => icmp::parse6(p),
        _ => Ok(()),
    }
}

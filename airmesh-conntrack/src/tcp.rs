//! TCP state tracking.
//!
//! Each connection carries two direction halves. SYN/FIN/RST run a state
//! table first; everything else classifies against the expected sequence
//! number (keepalive, zero-window probe, in-order, past, future). The
//! transition into CLOSED drops the table's linkage reference exactly once.

use crate::conn::ProtoCb;
use crate::conntrack::{ConnId, Conntrack, Policy, LRU_TCP_EST, LRU_TCP_SYN};
use crate::packet::Packet;
use crate::types::Next;
use crate::ParseError;

pub const TCP_DEFAULT_MSS: u16 = 1460;

pub const TH_FIN: u8 = 0x01;
pub const TH_SYN: u8 = 0x02;
pub const TH_RST: u8 = 0x04;
pub const TH_ACK: u8 = 0x10;

/// Connection-level flags.
pub const F_TCP_RETRANSMIT: u16 = 1 << 0;
pub const F_TCP_OUTOFORDER: u16 = 1 << 1;

/// Half-connection flags.
pub const F_TCP_HALF_OPEN: u16 = 1 << 0;
pub const F_TCP_HALF_CLOSED: u16 = 1 << 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TcpState {
    #[default]
    Connecting,
    Established,
    HalfDisconnected,
    LastAck,
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpHalf {
    /// Timestamp of the last segment seen from this half.
    pub last_seq_time: u64,
    pub init_seq: u32,
    pub last_seq: u32,
    pub next_seq: u32,
    pub last_ack: u32,
    pub seq_wraps: u32,
    pub packets: u32,
    pub flags: u16,
    pub mss: u16,
}

#[derive(Debug, Clone, Default)]
pub struct TcpCb {
    pub half: [TcpHalf; 2],
    pub state: TcpState,
    pub flags: u16,
    /// The CLOSED transition already dropped the linkage reference.
    released: bool,
}

#[inline]
fn seq_is_after(seq: u32, other: u32) -> bool {
    (seq.wrapping_sub(other) as i32) > 0
}

/// Extract the MSS option from a SYN's option block.
fn tcp_mss(th: &[u8], th_len: usize) -> u16 {
    let mut i = 20usize;
    while i < th_len && i < th.len() {
        match th[i] {
            0 => break, // end of options
            1 => i += 1,
            kind => {
                if i + 1 >= th.len() {
                    break;
                }
                let olen = th[i + 1] as usize;
                if olen < 2 || i + olen > th_len {
                    break;
                }
                if kind == 2 && olen >= 4 {
                    return u16::from_be_bytes([th[i + 2], th[i + 3]]);
                }
                i += olen;
            }
        }
    }
    TCP_DEFAULT_MSS
}

pub(crate) fn parse(p: &mut Packet) -> Result<(), ParseError> {
    if p.remaining() < 20 {
        return Err(ParseError::Truncated);
    }
    let h = p.payload();
    let th_len = ((h[12] >> 4) as usize) << 2;
    if th_len < 20 || p.remaining() < th_len {
        return Err(ParseError::Malformed);
    }
    p.tuple.port[0] = u16::from_be_bytes([h[0], h[1]]);
    p.tuple.port[1] = u16::from_be_bytes([h[2], h[3]]);
    p.advance(th_len);
    p.next = Next::LookupTcp;
    Ok(())
}

#[derive(Clone, Copy)]
enum Ev {
    Fin,
    Syn,
    Rst,
}

fn rcv_err(tcp: &mut TcpCb) {
    tcp.state = TcpState::Closed;
}

fn rcv_rst(tcp: &mut TcpCb) {
    tcp.half[0].flags |= F_TCP_HALF_CLOSED;
    tcp.half[1].flags |= F_TCP_HALF_CLOSED;
    tcp.state = TcpState::Closed;
}

fn rcv_syn(tcp: &mut TcpCb, dir: usize, seq: u32, ack: u32, datalen: u32, flags: u8, mss: u16) {
    if tcp.half[dir].flags & F_TCP_HALF_OPEN != 0 {
        tcp.flags |= F_TCP_RETRANSMIT;
    }
    tcp.half[dir].init_seq = seq;
    tcp.half[dir].last_seq = seq;
    tcp.half[dir].next_seq = seq.wrapping_add(1).wrapping_add(datalen);
    tcp.half[dir].mss = mss;
    tcp.half[dir].flags |= F_TCP_HALF_OPEN;

    if flags & TH_ACK == 0 {
        return;
    }
    tcp.half[dir].last_ack = ack;
    tcp.half[1 - dir].last_ack = tcp.half[dir].next_seq;
}

fn rcv_fin(tcp: &mut TcpCb, dir: usize, seq: u32, ack: u32, datalen: u32) {
    if tcp.half[dir].flags & F_TCP_HALF_CLOSED != 0 {
        tcp.flags |= F_TCP_RETRANSMIT;
    }
    tcp.half[dir].flags |= F_TCP_HALF_CLOSED;
    tcp.half[dir].next_seq = seq.wrapping_add(1).wrapping_add(datalen);
    tcp.half[dir].last_ack = ack;
}

pub(crate) fn lookup(ct: &mut Conntrack, p: &mut Packet) -> Option<ConnId> {
    let th = p.prot_bytes();
    let flags = th[13];
    let seq = u32::from_be_bytes([th[4], th[5], th[6], th[7]]);
    let ack = u32::from_be_bytes([th[8], th[9], th[10], th[11]]);
    let window = u16::from_be_bytes([th[14], th[15]]);
    let th_len = ((th[12] >> 4) as usize) << 2;

    let policy = if flags & TH_SYN != 0 {
        ct.lru_expire(LRU_TCP_SYN, p.timestamp);
        if flags & TH_ACK != 0 {
            // The reply showed up first: record the server-to-client
            // orientation.
            Policy::Invert
        } else {
            Policy::Create
        }
    } else {
        ct.lru_expire(LRU_TCP_EST, p.timestamp);
        if ct.tcp_midflow {
            Policy::Create
        } else {
            Policy::None
        }
    };

    // Direction as it would be for a newly created connection; fixed up
    // from the stored tuple right after lookup.
    p.direction = (policy == Policy::Invert) as usize;

    let id = ct.lookup_policy(&p.tuple, p.hash, policy)?;
    ct.conn_mut(id).timestamp = p.timestamp;

    let len = p.tuple.domain.len();
    let dir = {
        let conn = ct.conn_mut(id);
        if conn.tuple.addr[0].0[..len] == p.tuple.addr[0].0[..len] {
            0
        } else {
            1
        }
    };
    p.direction = dir;

    if flags & TH_SYN != 0 && flags & TH_ACK == 0 {
        ct.lru_update(LRU_TCP_SYN, id);
    } else {
        ct.lru_update(LRU_TCP_EST, id);
    }

    let mut datalen = p.remaining() as u32;
    let mss = tcp_mss(th, th_len);

    let mut release_now = false;
    {
        let conn = ct.conn_mut(id);
        let tcp = match conn.cb {
            ProtoCb::Tcp(ref mut t) => t,
            ProtoCb::None => return Some(id),
        };

        if tcp.half[dir].packets == 0 {
            tcp.half[dir].last_seq = seq;
            tcp.half[dir].init_seq = seq.wrapping_sub(1);
            tcp.half[dir].next_seq = seq;
            tcp.half[dir].last_ack = ack;
        }
        tcp.half[dir].packets = tcp.half[dir].packets.wrapping_add(1);

        let tcpf = flags & (TH_FIN | TH_SYN | TH_RST);
        if tcpf != 0 {
            let ev = match tcpf >> 1 {
                0 => Ev::Fin,
                1 => Ev::Syn,
                _ => Ev::Rst,
            };
            match (tcp.state, ev) {
                (TcpState::Closed, _) => rcv_err(tcp),
                (_, Ev::Rst) => rcv_rst(tcp),
                (TcpState::Connecting, Ev::Fin) => rcv_err(tcp),
                (TcpState::Connecting, Ev::Syn) => rcv_syn(tcp, dir, seq, ack, datalen, flags, mss),
                (TcpState::Established, Ev::Fin) => rcv_fin(tcp, dir, seq, ack, datalen),
                (TcpState::Established, Ev::Syn) => rcv_syn(tcp, dir, seq, ack, datalen, flags, mss),
                (TcpState::HalfDisconnected, Ev::Fin) => rcv_fin(tcp, dir, seq, ack, datalen),
                (TcpState::HalfDisconnected, Ev::Syn) => rcv_err(tcp),
                (TcpState::LastAck, Ev::Fin) => rcv_fin(tcp, dir, seq, ack, datalen),
                (TcpState::LastAck, Ev::Syn) => rcv_err(tcp),
            }
        } else if datalen <= 1 && seq == tcp.half[dir].next_seq.wrapping_sub(1) {
            // Keepalive.
            datalen = 0;
        } else if datalen == 1 && seq == tcp.half[dir].next_seq && window == 0 {
            // Zero-window probe.
            datalen = 0;
        } else if seq == tcp.half[dir].next_seq {
            // In order.
            tcp.half[dir].next_seq = seq.wrapping_add(datalen);
            tcp.half[dir].last_ack = ack;
            tcp.flags &= !(F_TCP_RETRANSMIT | F_TCP_OUTOFORDER);
        } else if !seq_is_after(seq, tcp.half[dir].next_seq) {
            // From the past: an old segment showing up again late is a
            // retransmission, one showing up promptly is reordering.
            if tcp.half[dir].last_seq_time.wrapping_sub(p.timestamp) > 30 {
                tcp.flags |= F_TCP_RETRANSMIT;
            } else {
                tcp.flags |= F_TCP_OUTOFORDER;
            }
        } else {
            // From the future.
            tcp.flags |= F_TCP_OUTOFORDER;
            tcp.half[dir].next_seq = seq.wrapping_add(datalen);
            tcp.half[dir].last_ack = ack;
        }

        tcp.half[dir].last_seq_time = p.timestamp;

        if tcp.flags & F_TCP_RETRANSMIT == 0 {
            let mut closed_early = false;
            match tcp.state {
                TcpState::Connecting => {
                    let both_open = tcp.half[0].flags & F_TCP_HALF_OPEN != 0
                        && tcp.half[1].flags & F_TCP_HALF_OPEN != 0;
                    if flags & TH_SYN == 0 && (datalen > 0 || both_open) {
                        tcp.state = TcpState::Established;
                    }
                }
                TcpState::Established => {
                    let any_closed = tcp.half[0].flags & F_TCP_HALF_CLOSED != 0
                        || tcp.half[1].flags & F_TCP_HALF_CLOSED != 0;
                    if any_closed {
                        // If the other half never spoke it is impossible to
                        // know whether it ever will; assume it won't.
                        tcp.state = if tcp.half[1 - dir].packets == 0 {
                            TcpState::LastAck
                        } else {
                            TcpState::HalfDisconnected
                        };
                    }
                }
                TcpState::HalfDisconnected => {
                    let both_closed = tcp.half[0].flags & F_TCP_HALF_CLOSED != 0
                        && tcp.half[1].flags & F_TCP_HALF_CLOSED != 0;
                    if both_closed {
                        tcp.state = TcpState::LastAck;
                    }
                }
                TcpState::LastAck => {
                    let final_ack = tcp.half[dir].last_ack == tcp.half[1 - dir].next_seq
                        && tcp.half[1 - dir].last_ack == tcp.half[dir].next_seq;
                    if tcp.half[1 - dir].packets == 0 || final_ack {
                        tcp.state = TcpState::Closed;
                        if !tcp.released {
                            tcp.released = true;
                            release_now = true;
                        }
                    }
                }
                TcpState::Closed => {
                    if !tcp.released {
                        tcp.released = true;
                        release_now = true;
                    }
                    closed_early = true;
                }
            }

            // A packet landing on an already-closed connection skips the
            // sequence accounting.
            if !closed_early && seq_is_after(seq, tcp.half[dir].last_seq) {
                if seq < tcp.half[dir].last_seq {
                    tcp.half[dir].seq_wraps = tcp.half[dir].seq_wraps.wrapping_add(1);
                }
                tcp.half[dir].last_seq = seq;
            }
        }
    }

    if release_now {
        ct.release(id);
    }

    p.next = Next::None;

    if !ct.contains(id) {
        return None;
    }

    // Out-of-order or retransmitted data is consumed so the caller only
    // ever sees orderly payload.
    if let ProtoCb::Tcp(ref mut tcp) = ct.conn_mut(id).cb {
        if tcp.flags & (F_TCP_OUTOFORDER | F_TCP_RETRANSMIT) != 0 {
            p.consume_payload();
            tcp.flags &= !(F_TCP_OUTOFORDER | F_TCP_RETRANSMIT);
        }
    }

    Some(id)
}

impl TcpCb {
    /// Absolute byte offset of the last segment within the flow, counting
    /// sequence-space wraps from the initial sequence number.
    pub fn data_offset(&self, dir: usize, syn: bool) -> i64 {
        let h = &self.half[dir];
        let isn = h.init_seq as i64 + if syn { 0 } else { 1 };
        (h.last_seq as i64 + (h.seq_wraps as i64) * 0x1_0000_0000) - isn
    }
}

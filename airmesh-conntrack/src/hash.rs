//! Symmetric tuple hashing.
//!
//! The base is the Jenkins lookup3 word hash. The hash is process-local;
//! nothing on the wire depends on it.

use crate::types::Tuple;

const JHASH_INITVAL: u32 = 0xdeadbeef;

#[inline]
fn rol32(x: u32, k: u32) -> u32 {
    x.rotate_left(k)
}

#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= rol32(*c, 4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= rol32(*a, 6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= rol32(*b, 8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= rol32(*c, 16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= rol32(*a, 19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= rol32(*b, 4);
    *b = b.wrapping_add(*a);
}

#[inline]
fn final_mix(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    c ^= b;
    c = c.wrapping_sub(rol32(b, 14));
    a ^= c;
    a = a.wrapping_sub(rol32(c, 11));
    b ^= a;
    b = b.wrapping_sub(rol32(a, 25));
    c ^= b;
    c = c.wrapping_sub(rol32(b, 16));
    a ^= c;
    a = a.wrapping_sub(rol32(c, 4));
    b ^= a;
    b = b.wrapping_sub(rol32(a, 14));
    c ^= b;
    c = c.wrapping_sub(rol32(b, 24));
    c
}

/// Hash an array of u32 words.
pub fn jhash2(k: &[u32], initval: u32) -> u32 {
    let mut a = JHASH_INITVAL
        .wrapping_add((k.len() as u32) << 2)
        .wrapping_add(initval);
    let mut b = a;
    let mut c = a;

    let mut chunks = k.chunks_exact(3);
    for ch in &mut chunks {
        a = a.wrapping_add(ch[0]);
        b = b.wrapping_add(ch[1]);
        c = c.wrapping_add(ch[2]);
        mix(&mut a, &mut b, &mut c);
    }
    let rem = chunks.remainder();
    match rem.len() {
        0 => c,
        1 => {
            a = a.wrapping_add(rem[0]);
            final_mix(a, b, c)
        }
        2 => {
            a = a.wrapping_add(rem[0]);
            b = b.wrapping_add(rem[1]);
            final_mix(a, b, c)
        }
        _ => unreachable!(),
    }
}

/// Symmetric tuple hash: both orientations of a flow hash identically.
pub fn tuple_hash(tuple: &Tuple) -> u32 {
    let canon;
    let t = if tuple.needs_swap() {
        canon = tuple.invert();
        &canon
    } else {
        tuple
    };

    // Eight address words followed by one word packing both ports.
    let mut words = [0u32; 9];
    for (i, w) in words.iter_mut().take(8).enumerate() {
        let src = if i < 4 { &t.addr[0].0 } else { &t.addr[1].0 };
        let off = (i % 4) * 4;
        *w = u32::from_le_bytes([src[off], src[off + 1], src[off + 2], src[off + 3]]);
    }
    words[8] = (t.port[0] as u32) | ((t.port[1] as u32) << 16);

    let initval = (t.domain.tag() << 24) | ((t.proto as u32) << 16) | (t.vlan as u32);
    jhash2(&words, initval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Domain, TupleAddr};
    use proptest::prelude::*;

    fn v4_tuple(a: [u8; 4], pa: u16, b: [u8; 4], pb: u16, proto: u8) -> Tuple {
        Tuple {
            addr: [TupleAddr::from_v4(a), TupleAddr::from_v4(b)],
            port: [pa, pb],
            proto,
            domain: Domain::Inet,
            vlan: 0,
        }
    }

    #[test]
    fn symmetric_for_tcp_pair() {
        let a = v4_tuple([10, 0, 0, 1], 1234, [10, 0, 0, 2], 80, 6);
        let b = a.invert();
        assert_eq!(tuple_hash(&a), tuple_hash(&b));
    }

    #[test]
    fn differs_by_vlan() {
        let a = v4_tuple([10, 0, 0, 1], 1234, [10, 0, 0, 2], 80, 6);
        let mut b = a;
        b.vlan = 100;
        assert_ne!(tuple_hash(&a), tuple_hash(&b));
    }

    proptest! {
        #[test]
        fn hash_symmetric_v4(
            a in prop::array::uniform4(any::<u8>()),
            b in prop::array::uniform4(any::<u8>()),
            pa in any::<u16>(),
            pb in any::<u16>(),
            proto in any::<u8>(),
            vlan in 0u16..4096,
        ) {
            let mut t = v4_tuple(a, pa, b, pb, proto);
            t.vlan = vlan;
            prop_assert_eq!(tuple_hash(&t), tuple_hash(&t.invert()));
        }

        #[test]
        fn hash_symmetric_v6(
            a in prop::array::uniform16(any::<u8>()),
            b in prop::array::uniform16(any::<u8>()),
            pa in any::<u16>(),
            pb in any::<u16>(),
        ) {
            let t = Tuple {
                addr: [TupleAddr::from_v6(a), TupleAddr::from_v6(b)],
                port: [pa, pb],
                proto: 6,
                domain: Domain::Inet6,
                vlan: 0,
            };
            prop_assert_eq!(tuple_hash(&t), tuple_hash(&t.invert()));
        }

        #[test]
        fn matches_symmetric(
            a in prop::array::uniform4(any::<u8>()),
            b in prop::array::uniform4(any::<u8>()),
            pa in any::<u16>(),
            pb in any::<u16>(),
        ) {
            let t = v4_tuple(a, pa, b, pb, 17);
            let u = t.invert();
            prop_assert_eq!(t.matches(&u), u.matches(&t));
            prop_assert!(t.matches(&u));
        }
    }
}

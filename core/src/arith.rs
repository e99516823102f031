//! Big-endian 256-bit arithmetic for ranking scores
//!
//! The ranking score is the absolute distance between two hashes treated as
//! unsigned 256-bit integers. Big-endian byte arrays compare numerically
//! under lexicographic ordering, so `Score` derives `Ord` directly.

use crate::types::Hash256;
use serde::{Deserialize, Serialize};

/// Ranking score, ordered numerically
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Score(pub Hash256);

/// Add a small integer to a 256-bit big-endian value, wrapping on overflow
pub fn add_u32(value: &[u8; 32], n: u32) -> [u8; 32] {
    let mut out = *value;
    let mut carry = n as u64;
    for byte in out.iter_mut().rev() {
        if carry == 0 {
            break;
        }
        let sum = *byte as u64 + (carry & 0xff);
        *byte = (sum & 0xff) as u8;
        carry = (carry >> 8) + (sum >> 8);
    }
    out
}

/// |a - b| over 256-bit big-endian values
pub fn abs_diff(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    let mut out = [0u8; 32];
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let diff = hi[i] as i16 - lo[i] as i16 - borrow;
        if diff < 0 {
            out[i] = (diff + 256) as u8;
            borrow = 1;
        } else {
            out[i] = diff as u8;
            borrow = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(last: u8) -> [u8; 32] {
        let mut v = [0u8; 32];
        v[31] = last;
        v
    }

    #[test]
    fn add_without_carry() {
        assert_eq!(add_u32(&h(1), 2), h(3));
    }

    #[test]
    fn add_carries_across_bytes() {
        let mut v = [0u8; 32];
        v[31] = 0xff;
        let out = add_u32(&v, 1);
        assert_eq!(out[31], 0);
        assert_eq!(out[30], 1);
    }

    #[test]
    fn add_wraps_at_max() {
        let out = add_u32(&[0xff; 32], 1);
        assert_eq!(out, [0u8; 32]);
    }

    #[test]
    fn abs_diff_is_symmetric() {
        let a = h(9);
        let b = h(4);
        assert_eq!(abs_diff(&a, &b), h(5));
        assert_eq!(abs_diff(&b, &a), h(5));
    }

    #[test]
    fn abs_diff_borrows() {
        let mut a = [0u8; 32];
        a[30] = 1; // 256
        let b = h(1);
        let diff = abs_diff(&a, &b);
        assert_eq!(diff[31], 0xff);
        assert_eq!(diff[30], 0);
    }

    #[test]
    fn score_orders_numerically() {
        assert!(Score(Hash256(h(2))) > Score(Hash256(h(1))));
        let mut big = [0u8; 32];
        big[0] = 1;
        let mut small = [0u8; 32];
        small[1..].fill(0xff);
        assert!(Score(Hash256(big)) > Score(Hash256(small)));
    }
}

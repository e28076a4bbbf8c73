use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter, Result};

use crate::{KEY_BITS, KEY_LENGTH};

/// A key that represents nodes, values and message correlation ids.
///
/// Keys are 160 bits wide. The distance between two keys is their XOR interpreted as an unsigned
/// big-endian integer, so comparing two distances is a plain lexicographic byte comparison.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Serialize, Deserialize, Default, Copy)]
pub struct Key(pub [u8; KEY_LENGTH]);

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let hex_vec: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", hex_vec.join(""))
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter) -> Result {
        Debug::fmt(self, f)
    }
}

impl Key {
    /// The all-zero key.
    pub const MIN: Key = Key([0; KEY_LENGTH]);

    /// Constructs a new `Key` from a byte array.
    pub fn new(data: [u8; KEY_LENGTH]) -> Self {
        Key(data)
    }

    /// Constructs a new, random `Key`.
    pub fn rand() -> Self {
        let mut ret = Key([0; KEY_LENGTH]);
        for byte in &mut ret.0 {
            *byte = rand::random::<u8>();
        }
        ret
    }

    /// Constructs a new, random `Key` whose first `depth` bits are those of `prefix`.
    pub fn rand_with_prefix(prefix: &Key, depth: usize) -> Self {
        let mut ret = Key::rand();
        let depth = depth.min(KEY_BITS);
        let bytes = depth / 8;
        let bit = depth % 8;
        ret.0[..bytes].copy_from_slice(&prefix.0[..bytes]);
        if bit > 0 {
            let mask = 0xFFu8 << (8 - bit);
            ret.0[bytes] = (prefix.0[bytes] & mask) | (ret.0[bytes] & !mask);
        }
        ret
    }

    /// Returns the XOR result between `self` and `key`.
    pub fn xor(&self, key: &Key) -> Key {
        let mut ret = [0; KEY_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ key.0[i];
        }
        Key(ret)
    }

    /// Returns the distance between `self` and `key`.
    pub fn distance(&self, key: &Key) -> Key {
        self.xor(key)
    }

    /// Orders `a` and `b` by their distance to `self`. Distinct keys never tie since XOR with a
    /// fixed pivot is a bijection.
    pub fn cmp_distance(&self, a: &Key, b: &Key) -> Ordering {
        self.xor(a).cmp(&self.xor(b))
    }

    /// Returns `true` if `a` is strictly closer to `self` than `b`.
    pub fn is_closer(&self, a: &Key, b: &Key) -> bool {
        self.cmp_distance(a, b) == Ordering::Less
    }

    /// Returns the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy of `self` with the bit at `index` set to `value`.
    pub fn with_bit(&self, index: usize, value: bool) -> Key {
        let mut ret = *self;
        let mask = 0x80 >> (index % 8);
        if value {
            ret.0[index / 8] |= mask;
        } else {
            ret.0[index / 8] &= !mask;
        }
        ret
    }

    /// Returns `true` if the first `depth` bits of `self` and `other` are equal.
    pub fn shares_prefix(&self, other: &Key, depth: usize) -> bool {
        self.xor(other).leading_zeros() >= depth
    }

    /// Returns the number of leading zeros in `self`. This is used to calculate the distance
    /// between keys.
    pub fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for i in 0..KEY_LENGTH {
            if self.0[i] == 0 {
                ret += 8
            } else {
                return ret + self.0[i].leading_zeros() as usize;
            }
        }
        ret
    }
}

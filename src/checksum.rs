use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Rsync-style rolling checksum for weak block matching.
///
/// Two 32-bit accumulators: `a` is the byte sum of the window, `b` the sum of
/// the running prefix sums (equivalently `sum((len - i) * buf[i])`).
/// Arithmetic wraps; the digest packs the low halves of both. Supports O(1)
/// sliding window updates and O(1) front shrinking for the end-of-file tail.
pub struct RollingSum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingSum {
    pub fn new() -> Self {
        Self { a: 0, b: 0, len: 0 }
    }

    /// Compute the checksum over a full window, replacing any prior state.
    pub fn seed(&mut self, data: &[u8]) {
        self.len = data.len() as u32;
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for &byte in data {
            a = a.wrapping_add(u32::from(byte));
            b = b.wrapping_add(a);
        }
        self.a = a;
        self.b = b;
    }

    /// Slide the window one byte: `removed` leaves the front, `incoming`
    /// enters at the back. Window length is unchanged.
    pub fn roll(&mut self, removed: u8, incoming: u8) {
        self.a = self
            .a
            .wrapping_sub(u32::from(removed))
            .wrapping_add(u32::from(incoming));
        self.b = self
            .b
            .wrapping_sub(u32::from(removed).wrapping_mul(self.len))
            .wrapping_add(self.a);
    }

    /// Shrink the window from the front by one byte. Used once the window
    /// tail has reached end-of-input and can no longer slide at full width.
    pub fn roll_out(&mut self, removed: u8) {
        self.b = self
            .b
            .wrapping_sub(u32::from(removed).wrapping_mul(self.len));
        self.a = self.a.wrapping_sub(u32::from(removed));
        self.len -= 1;
    }

    pub fn window_len(&self) -> usize {
        self.len as usize
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | (self.a & 0xffff)
    }
}

impl Default for RollingSum {
    fn default() -> Self {
        Self::new()
    }
}

/// Weak checksum of a complete block.
pub fn weak_sum(data: &[u8]) -> u32 {
    let mut sum = RollingSum::new();
    sum.seed(data);
    sum.digest()
}

/// Strong content checksum: a BLAKE3 digest.
///
/// Equality implies byte equality for the purposes of this system. The
/// persisted and displayed form is lowercase hexadecimal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Strong([u8; 32]);

impl Strong {
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(Self::from)
    }
}

impl From<blake3::Hash> for Strong {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for Strong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Strong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Strong({})", self.to_hex())
    }
}

impl Serialize for Strong {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Strong {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid digest: {hex}")))
    }
}

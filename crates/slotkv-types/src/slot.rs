use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Upper bound of the hash-slot universe. The last partition of a file ends here.
pub const SLOT_MAX: i32 = 65536;

const CRC16_TABLE: [u16; 256] = build_crc16_table();

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC16/XMODEM over `data` (poly 0x1021, init 0, no reflection).
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &b| {
        (crc << 8) ^ CRC16_TABLE[(((crc >> 8) as u8) ^ b) as usize]
    })
}

/// Map a key to its hash slot in `[0, SLOT_MAX)`.
pub fn hash_slot(key: &str) -> i32 {
    crc16(key.as_bytes()) as i32
}

/// Inclusive range of hash slots owned by a partition.
///
/// The empty range is `(0, -1)`, which is what a freshly reset block carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotRange {
    pub begin: i32,
    pub end: i32,
}

impl SlotRange {
    pub const EMPTY: SlotRange = SlotRange { begin: 0, end: -1 };

    /// Construct a range, rejecting ranges that run backwards or leave the universe.
    pub fn new(begin: i32, end: i32) -> Result<Self, TypeError> {
        if begin < 0 || end > SLOT_MAX || end < begin - 1 {
            return Err(TypeError::InvalidSlotRange { begin, end });
        }
        Ok(Self { begin, end })
    }

    /// The full universe `[0, SLOT_MAX]`.
    pub const fn full() -> Self {
        Self { begin: 0, end: SLOT_MAX }
    }

    pub fn contains(&self, slot: i32) -> bool {
        slot >= self.begin && slot <= self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.begin
    }

    /// Number of slots covered.
    pub fn len(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.end as i64 - self.begin as i64 + 1
        }
    }

    pub fn midpoint(&self) -> i32 {
        ((self.begin as i64 + self.end as i64) / 2) as i32
    }

    /// Split at the midpoint into `[begin, mid]` and `[mid + 1, end]`.
    pub fn split(&self) -> (SlotRange, SlotRange) {
        let mid = self.midpoint();
        (
            SlotRange { begin: self.begin, end: mid },
            SlotRange { begin: mid + 1, end: self.end },
        )
    }

    /// Name used for backing-store objects, e.g. `0_32767`.
    pub fn to_path_component(&self) -> String {
        format!("{}_{}", self.begin, self.end)
    }
}

impl Default for SlotRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.begin, self.end)
    }
}

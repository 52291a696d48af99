use std::{fmt::Display, num::ParseIntError, str::FromStr};

use serde::{Deserialize, Serialize};

pub const KIB: u64 = 1 << 10;
pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;
pub const TIB: u64 = 1 << 40;

/// A size in bytes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ByteCount(pub u64);

impl From<u64> for ByteCount {
    fn from(x: u64) -> Self {
        ByteCount(x)
    }
}

impl ByteCount {
    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_human_readable(&self) -> String {
        match self.0.trailing_zeros() {
            _ if self.0 == 0 => "0".to_owned(),
            0..=9 => format!("{} B", self.0),
            10..=19 => format!("{} KiB", self.0 >> 10),
            20..=29 => format!("{} MiB", self.0 >> 20),
            30..=39 => format!("{} GiB", self.0 >> 30),
            _ => format!("{} TiB", self.0 >> 40),
        }
    }

    pub fn from_human_readable(mut s: &str) -> Result<Self, ParseIntError> {
        s = s.trim();
        let try_parse = |val: &str, shift: u8| Ok(Self(val.trim().parse::<u64>()? << shift));
        if let Some(p) = s.strip_suffix("KiB").or_else(|| s.strip_suffix('K')) {
            try_parse(p, 10)
        } else if let Some(p) = s.strip_suffix("MiB").or_else(|| s.strip_suffix('M')) {
            try_parse(p, 20)
        } else if let Some(p) = s.strip_suffix("GiB").or_else(|| s.strip_suffix('G')) {
            try_parse(p, 30)
        } else if let Some(p) = s.strip_suffix("TiB").or_else(|| s.strip_suffix('T')) {
            try_parse(p, 40)
        } else if let Some(p) = s.strip_suffix('B') {
            try_parse(p, 0)
        } else {
            try_parse(s, 0)
        }
    }
}

impl Display for ByteCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_human_readable())
    }
}

impl FromStr for ByteCount {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_human_readable(s)
    }
}

pub fn is_power_of_two(i: u64) -> bool {
    i != 0 && i & (i - 1) == 0
}

pub fn is_multiple_of(i: u64, j: u64) -> bool {
    i % j == 0
}

/// Round i down to a multiple of m.
pub fn round_down(i: u64, m: u64) -> u64 {
    i - i % m
}

/// Round i up to a multiple of m.
pub fn round_up(i: u64, m: u64) -> u64 {
    round_down(i + m - 1, m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_readable() {
        assert_eq!(ByteCount(0).to_human_readable(), "0");
        assert_eq!(ByteCount(512).to_human_readable(), "512 B");
        assert_eq!(ByteCount(16 * MIB).to_human_readable(), "16 MiB");
        assert_eq!(ByteCount(3 * GIB).to_human_readable(), "3 GiB");
        assert_eq!(ByteCount(2 * TIB).to_human_readable(), "2 TiB");
    }

    #[test]
    fn test_parse() {
        assert_eq!("1024".parse::<ByteCount>().unwrap(), ByteCount(1024));
        assert_eq!("16M".parse::<ByteCount>().unwrap(), ByteCount(16 * MIB));
        assert_eq!("16 MiB".parse::<ByteCount>().unwrap(), ByteCount(16 * MIB));
        assert_eq!("2G".parse::<ByteCount>().unwrap(), ByteCount(2 * GIB));
        assert!("12X".parse::<ByteCount>().is_err());
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_up(1, 2048), 2048);
        assert_eq!(round_up(2048, 2048), 2048);
        assert_eq!(round_down(4095, 2048), 2048);
        assert!(is_power_of_two(4096));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(12));
    }
}

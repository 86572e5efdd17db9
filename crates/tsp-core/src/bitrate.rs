use std::fmt;

/// Stream bitrate in bits per second. Zero means unknown: a consumer that
/// needs a rate has to determine it on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitRate(u64);

impl BitRate {
    pub const UNKNOWN: BitRate = BitRate(0);

    pub const fn new(bits_per_second: u64) -> Self {
        Self(bits_per_second)
    }

    pub const fn bits_per_second(self) -> u64 {
        self.0
    }

    pub const fn is_known(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for BitRate {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for BitRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "{} b/s", self.0)
        } else {
            f.write_str("unknown")
        }
    }
}

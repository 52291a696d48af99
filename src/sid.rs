use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Stable 64-bit object identifier. Assigned once at creation and kept
/// across device graph copies, so a sid names the same logical object in
/// every graph it appears in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sid(pub u64);

// The first sid is arbitrary but nonzero, so accidental zero-initialized
// ids stand out in logs.
static NEXT_SID: AtomicU64 = AtomicU64::new(42);

impl Sid {
    pub fn allocate() -> Sid {
        Sid(NEXT_SID.fetch_add(1, Ordering::Relaxed))
    }

    /// Make sure future allocations are above `sid`. Called after loading a
    /// persisted graph.
    pub fn reserve_up_to(sid: Sid) {
        NEXT_SID.fetch_max(sid.0 + 1, Ordering::Relaxed);
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_monotonic() {
        let a = Sid::allocate();
        let b = Sid::allocate();
        assert!(b.0 > a.0);
    }

    #[test]
    fn test_reserve() {
        let a = Sid::allocate();
        Sid::reserve_up_to(Sid(a.0 + 1000));
        let b = Sid::allocate();
        assert!(b.0 > a.0 + 1000);
    }
}

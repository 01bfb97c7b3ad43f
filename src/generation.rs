use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Tree-wide mutation counter.
///
/// Each two-child splice advances the clock and stamps the new value on the node
/// below which the tree shape changed. Readers take a snapshot before descending
/// and treat any predecessor stamped after the snapshot as a sign of a stale path.
pub struct GenerationClock {
    current: AtomicU64,
}

impl GenerationClock {
    pub const fn new() -> GenerationClock {
        GenerationClock {
            current: AtomicU64::new(0),
        }
    }

    /// Generation observed at the start of a traversal.
    #[inline(always)]
    pub fn snapshot(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Move clock forward and return generation assigned to the change.
    #[inline(always)]
    pub fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for GenerationClock {
    fn default() -> Self {
        GenerationClock::new()
    }
}

impl Display for GenerationClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Generation: {:?}", self.snapshot())
    }
}

impl Debug for GenerationClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("generation_clock: current={}", self.snapshot()))
    }
}

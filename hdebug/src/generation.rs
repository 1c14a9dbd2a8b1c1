use std::sync::atomic::{AtomicU64, Ordering};

/// A checkpoint value. Records created after `new_generation()` returned `g`
/// carry a generation `>= g`.
pub type Generation = u64;

/// Process-wide monotonic generation counter.
#[derive(Debug)]
pub struct GenerationCounter {
    current: AtomicU64,
}

impl GenerationCounter {
    pub const fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
        }
    }

    /// The generation stamped on records registered right now.
    #[inline]
    pub fn current(&self) -> Generation {
        self.current.load(Ordering::Acquire)
    }

    /// Advance the counter and return the new generation.
    ///
    /// Wrapping would let a new session see old records as its own, so the
    /// counter aborts instead of overflowing.
    pub fn new_generation(&self) -> Generation {
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |g| {
                g.checked_add(1)
            });
        match previous {
            Ok(g) => g + 1,
            Err(_) => {
                log::error!("generation counter exhausted");
                panic!("generation counter exhausted");
            }
        }
    }
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn new_generation_is_strictly_increasing() {
        let counter = GenerationCounter::new();
        assert_eq!(counter.current(), 0);
        let a = counter.new_generation();
        let b = counter.new_generation();
        assert!(b > a, "{b} should be greater than {a}");
        assert_eq!(counter.current(), b);
    }

    #[test]
    fn concurrent_callers_never_share_a_generation() {
        let counter = Arc::new(GenerationCounter::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    let mut seen = Vec::with_capacity(500);
                    for _ in 0..500 {
                        seen.push(counter.new_generation());
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for worker in workers {
            let seen = worker.join().expect("worker panicked");
            assert!(
                seen.windows(2).all(|w| w[0] < w[1]),
                "per-thread generations must increase"
            );
            all.extend(seen);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8 * 500, "generations were reused");
    }

    #[test]
    #[should_panic(expected = "generation counter exhausted")]
    fn exhaustion_is_fatal() {
        let counter = GenerationCounter {
            current: AtomicU64::new(u64::MAX),
        };
        counter.new_generation();
    }
}

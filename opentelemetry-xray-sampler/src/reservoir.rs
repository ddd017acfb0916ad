use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-second reservoir of guaranteed samples.
///
/// The current window (whole seconds since the unix epoch) and the number of
/// samples taken in it are packed into a single atomic word, high and low 32
/// bits respectively, so that concurrent callers never race between reading
/// and incrementing the counter.
#[derive(Debug, Default)]
pub(crate) struct Reservoir {
    state: AtomicU64,
}

impl Reservoir {
    pub(crate) fn new() -> Self {
        Reservoir::default()
    }

    /// Takes one sample out of the reservoir of second `now` if any is left.
    pub(crate) fn try_take_at(&self, capacity: u64, now: u64) -> bool {
        if capacity == 0 {
            return false;
        }
        let capacity = capacity.min(u64::from(u32::MAX));
        let window = now & u64::from(u32::MAX);

        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let (current_window, taken) = (current >> 32, current & u64::from(u32::MAX));
            let next = if current_window != window {
                // a new second refills the reservoir
                (window << 32) | 1
            } else if taken < capacity {
                current + 1
            } else {
                return false;
            };

            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

pub(crate) fn now_secs(now: SystemTime) -> u64 {
    // a clock before the epoch lands in window zero
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::Reservoir;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reservoir_refills_every_second() {
        let reservoir = Reservoir::new();

        let test_cases = vec![
            (100, vec![true, true, false, false]),
            (100, vec![false]),
            (101, vec![true, true, false]),
            (105, vec![true, true, false]),
        ];

        for (second, cases) in test_cases.into_iter() {
            for should_pass in cases {
                assert_eq!(should_pass, reservoir.try_take_at(2, second));
            }
        }
    }

    #[test]
    fn test_zero_capacity_never_samples() {
        let reservoir = Reservoir::new();
        assert!(!reservoir.try_take_at(0, 1));
        assert!(!reservoir.try_take_at(0, 2));
    }

    #[test]
    fn test_capacity_change_within_window() {
        let reservoir = Reservoir::new();
        assert!(reservoir.try_take_at(1, 10));
        assert!(!reservoir.try_take_at(1, 10));
        // a larger quota applied mid-window takes effect immediately
        assert!(reservoir.try_take_at(3, 10));
        assert!(reservoir.try_take_at(3, 10));
        assert!(!reservoir.try_take_at(3, 10));
    }

    #[test]
    fn test_concurrent_takes_never_exceed_capacity() {
        let reservoir = Arc::new(Reservoir::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reservoir = Arc::clone(&reservoir);
                thread::spawn(move || (0..1_000).filter(|_| reservoir.try_take_at(50, 42)).count())
            })
            .collect();

        let taken: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(taken, 50);
    }
}

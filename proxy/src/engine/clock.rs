// PSP PROXY — MONOTONIC CLOCK
// All blocking primitives measure their timeouts against CLOCK_MONOTONIC.
// Wall-clock time never enters deadline arithmetic.

/// Milliseconds from CLOCK_MONOTONIC. Origin is boot-relative and irrelevant;
/// only differences are meaningful.
#[inline]
pub fn clock_ms() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

/// A fixed point in monotonic time that blocking loops count down against.
#[derive(Clone, Copy)]
pub struct Deadline {
    end_ms: u64,
}

impl Deadline {
    pub fn after(ms: u32) -> Self {
        Deadline { end_ms: clock_ms() + ms as u64 }
    }

    /// Milliseconds left, or `None` once the deadline has passed.
    pub fn remaining_ms(&self) -> Option<u32> {
        let now = clock_ms();
        if now >= self.end_ms {
            return None;
        }
        Some((self.end_ms - now).min(u32::MAX as u64) as u32)
    }

    pub fn expired(&self) -> bool {
        self.remaining_ms().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = clock_ms();
        let b = clock_ms();
        assert!(b >= a);
    }

    #[test]
    fn deadline_counts_down() {
        let d = Deadline::after(60_000);
        let rem = d.remaining_ms().unwrap();
        assert!(rem <= 60_000 && rem > 59_000);
        assert!(!d.expired());

        let past = Deadline { end_ms: clock_ms().saturating_sub(1) };
        assert!(past.expired());
        assert!(past.remaining_ms().is_none());
    }
}

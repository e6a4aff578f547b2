/// Duration that never expires. Any `arm` at or beyond the signed half-range
/// of the tick counter saturates to this.
pub const FOREVER_MS: u32 = u32::MAX;

const MAX_ARM_MS: u32 = i32::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Elapsed,
    At(u32),
    Never,
}

/// Monotonic deadline over a wrapping 32-bit millisecond tick counter.
///
/// Deadlines are compared with a signed wrapping difference, so a timer armed
/// shortly before the counter wraps still expires on time afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    deadline: Deadline,
}

impl Default for Timer {
    fn default() -> Self {
        Self::expired()
    }
}

impl Timer {
    /// A timer that reports expired immediately.
    pub const fn expired() -> Self {
        Self {
            deadline: Deadline::Elapsed,
        }
    }

    pub const fn forever() -> Self {
        Self {
            deadline: Deadline::Never,
        }
    }

    pub fn armed(now_ms: u32, duration_ms: u32) -> Self {
        let mut timer = Self::forever();
        timer.arm(now_ms, duration_ms);
        timer
    }

    pub fn arm(&mut self, now_ms: u32, duration_ms: u32) {
        self.deadline = if duration_ms >= MAX_ARM_MS {
            Deadline::Never
        } else {
            Deadline::At(now_ms.wrapping_add(duration_ms))
        };
    }

    pub fn is_expired(&self, now_ms: u32) -> bool {
        match self.deadline {
            Deadline::Elapsed => true,
            Deadline::At(deadline) => now_ms.wrapping_sub(deadline) as i32 >= 0,
            Deadline::Never => false,
        }
    }

    pub fn is_forever(&self) -> bool {
        self.deadline == Deadline::Never
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_at_deadline() {
        let timer = Timer::armed(1_000, 500);
        assert!(!timer.is_expired(1_000));
        assert!(!timer.is_expired(1_499));
        assert!(timer.is_expired(1_500));
        assert!(timer.is_expired(9_000));
    }

    #[test]
    fn handles_counter_wraparound() {
        let start = u32::MAX - 100;
        let timer = Timer::armed(start, 300);
        assert!(!timer.is_expired(start));
        assert!(!timer.is_expired(u32::MAX));
        assert!(!timer.is_expired(150));
        assert!(timer.is_expired(199));
        assert!(timer.is_expired(1_000));
    }

    #[test]
    fn deadline_landing_on_zero_is_not_special() {
        let timer = Timer::armed(u32::MAX - 9, 10);
        assert!(!timer.is_expired(u32::MAX));
        assert!(timer.is_expired(0));
    }

    #[test]
    fn forever_never_expires() {
        let mut timer = Timer::armed(0, FOREVER_MS);
        assert!(timer.is_forever());
        for now in [0, 1, i32::MAX as u32, u32::MAX] {
            assert!(!timer.is_expired(now));
        }

        timer.arm(10, i32::MAX as u32);
        assert!(timer.is_forever());
    }

    #[test]
    fn default_timer_is_expired() {
        let timer = Timer::default();
        assert!(timer.is_expired(0));
        assert!(timer.is_expired(u32::MAX / 2 + 7));
    }
}

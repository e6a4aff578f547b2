use tracing::error;

pub const FAST_BLINK_MS: u32 = 250;
pub const SLOW_BLINK_MS: u32 = 1_000;
pub const FATAL_BLINK_MS: u32 = 100;

pub trait Indicator: Send {
    fn set(&mut self, on: bool);
}

#[derive(Debug, Default)]
pub struct NullIndicator;

impl Indicator for NullIndicator {
    fn set(&mut self, _on: bool) {}
}

/// Fast blink without network, slow blink without broker, solid when both up.
pub fn link_pattern(network_up: bool, broker_connected: bool, now_ms: u32) -> bool {
    if !network_up {
        (now_ms / FAST_BLINK_MS) % 2 == 0
    } else if !broker_connected {
        (now_ms / SLOW_BLINK_MS) % 2 == 0
    } else {
        true
    }
}

/// Drives an indicator from link state, touching the output only on change.
pub struct StatusIndicator<I> {
    led: I,
    lit: Option<bool>,
}

impl<I: Indicator> StatusIndicator<I> {
    pub fn new(led: I) -> Self {
        Self { led, lit: None }
    }

    pub fn update(&mut self, network_up: bool, broker_connected: bool, now_ms: u32) {
        let desired = link_pattern(network_up, broker_connected, now_ms);
        if self.lit == Some(desired) {
            return;
        }
        self.led.set(desired);
        self.lit = Some(desired);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    EntityTable,
    StorageUnavailable,
    ThreadSpawn,
}

impl FatalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EntityTable => "entity table could not be built",
            Self::StorageUnavailable => "persistent storage unavailable",
            Self::ThreadSpawn => "control thread could not be started",
        }
    }
}

/// Stops all functionality and blinks `indicator` rapidly forever.
pub fn halt(reason: FatalReason, indicator: &mut dyn Indicator) -> ! {
    error!("FATAL: {}; halting", reason.as_str());
    let mut lit = false;
    loop {
        lit = !lit;
        indicator.set(lit);
        std::thread::sleep(std::time::Duration::from_millis(u64::from(FATAL_BLINK_MS)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockIndicator;

    #[test]
    fn pattern_reflects_link_state() {
        assert!(link_pattern(true, true, 123));
        assert!(link_pattern(false, false, 0));
        assert!(!link_pattern(false, false, FAST_BLINK_MS));
        assert!(link_pattern(true, false, FAST_BLINK_MS));
        assert!(!link_pattern(true, false, SLOW_BLINK_MS));
    }

    #[test]
    fn status_indicator_writes_only_on_change() {
        let led = MockIndicator::default();
        let mut status = StatusIndicator::new(led.clone());
        status.update(true, true, 0);
        status.update(true, true, 5_000);
        status.update(false, false, FAST_BLINK_MS);
        assert_eq!(led.writes(), vec![true, false]);
    }
}

use std::fmt::Debug;

/// Current state plus a one-shot "entered this tick" flag.
///
/// States are never re-entered implicitly: restarting the current state
/// requires an explicit `change_state` with the same value, which re-arms the
/// first-time flag.
#[derive(Debug, Clone)]
pub struct PolledStateMachine<S> {
    state: S,
    first_time: bool,
}

impl<S: Copy + PartialEq + Debug> PolledStateMachine<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            first_time: true,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn is(&self, state: S) -> bool {
        self.state == state
    }

    pub fn change_state(&mut self, next: S) {
        self.state = next;
        self.first_time = true;
    }

    /// Returns true once after every `change_state`.
    pub fn is_first_time(&mut self) -> bool {
        std::mem::replace(&mut self.first_time, false)
    }
}

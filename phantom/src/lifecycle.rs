//! Termination state and exit code of a run.

/// Exit code recorded when the user script cannot be read or evaluated.
pub const SCRIPT_FAILURE_EXIT_CODE: i32 = -1;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    #[default]
    Running,
    /// Stopped before any script ran (`--version`, rejected options).
    Terminated,
    /// `exit` was requested; pages are gone.
    Exited,
}

/// Process-wide termination flag plus exit code.
///
/// Only the first `exit` is honored; later requests leave the code as is.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    state: State,
    exit_code: i32,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminated(&self) -> bool {
        self.state != State::Running
    }

    pub fn has_exited(&self) -> bool {
        self.state == State::Exited
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Stop the run without touching the exit code.
    pub fn terminate(&mut self) {
        if self.state == State::Running {
            self.state = State::Terminated;
        }
    }

    /// Record an exit request. Returns `false` if an exit already happened.
    pub fn exit(&mut self, code: i32) -> bool {
        if self.state == State::Exited {
            return false;
        }
        self.state = State::Exited;
        self.exit_code = code;
        true
    }

    /// Record a failure code while leaving the run alive.
    pub fn fail(&mut self, code: i32) {
        if self.state != State::Exited {
            self.exit_code = code;
        }
    }
}

use crate::error::SupervisorError;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Error = 4,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 5] = [
        LifecycleState::Stopped,
        LifecycleState::Starting,
        LifecycleState::Running,
        LifecycleState::Stopping,
        LifecycleState::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Error => "error",
        }
    }

    /// A child process may be alive in these states; `start()` is rejected while in one.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping
        )
    }

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Error, Starting)
                | (Error, Stopped)
        )
    }

    fn from_raw(raw: u8) -> LifecycleState {
        match raw {
            0 => LifecycleState::Stopped,
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::Error,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub reason: Option<String>,
}



/*
    @@@
    @state_cell();
    . Creates the one writer and the shareable reader over a single atomic byte.
    . The writer is not Clone: whoever holds it is the only context allowed to move the machine.
    . Readers load the byte without locking, so a read can never observe a torn value.
*/
pub fn state_cell(initial: LifecycleState) -> (StateWriter, StateReader) {
    let raw = Arc::new(AtomicU8::new(initial as u8));
    (StateWriter { raw: raw.clone() }, StateReader { raw })
}

#[derive(Debug)]
pub struct StateWriter {
    raw: Arc<AtomicU8>,
}

impl StateWriter {
    pub fn current(&self) -> LifecycleState {
        LifecycleState::from_raw(self.raw.load(Ordering::Acquire))
    }

    /// Applies `next` if the table allows it. A rejected move leaves the cell untouched.
    pub fn transition(&mut self, next: LifecycleState) -> Result<StateChange, SupervisorError> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(SupervisorError::InvalidTransition { from, to: next });
        }
        self.raw.store(next as u8, Ordering::Release);
        Ok(StateChange { from, to: next, reason: None })
    }

    pub fn reader(&self) -> StateReader {
        StateReader { raw: self.raw.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct StateReader {
    raw: Arc<AtomicU8>,
}

impl StateReader {
    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_raw(self.raw.load(Ordering::Acquire))
    }
}

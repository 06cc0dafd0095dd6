//! Install progress as seen by the health endpoint

use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstallState {
    #[default]
    Unknown,
    Installing,
    Finished,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstallState::Unknown => "UNKNOWN",
            InstallState::Installing => "INSTALLING",
            InstallState::Finished => "FINISHED",
        })
    }
}

/// Shared handle; clones observe the same state
#[derive(Clone, Debug, Default)]
pub struct InstallStatus(Arc<Mutex<InstallState>>);

impl InstallStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> InstallState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, state: InstallState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let status = InstallStatus::new();
        let seen_by_server = status.clone();
        assert_eq!(seen_by_server.get(), InstallState::Unknown);
        status.set(InstallState::Installing);
        assert_eq!(seen_by_server.get(), InstallState::Installing);
        assert_eq!(InstallState::Installing.to_string(), "INSTALLING");
    }
}

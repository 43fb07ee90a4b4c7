//! Supervisor lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a supervisor run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    ProvisioningEnv,
    ResolvingConflicts,
    VerifyingExternalService,
    Launching,
    Running,
    Stopped,
    Failed,
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `setup`, `test` and `ollama --verify` stop after their last step, so
    /// `Stopped` is reachable from the provisioning and verification states.
    pub fn can_transition_to(&self, next: SupervisorState) -> bool {
        use SupervisorState::*;

        if self.is_terminal() {
            return false;
        }
        match (*self, next) {
            (_, Failed) => true,
            (Idle, ProvisioningEnv) | (Idle, VerifyingExternalService) => true,
            (ProvisioningEnv, ResolvingConflicts) | (ProvisioningEnv, Stopped) => true,
            (ResolvingConflicts, VerifyingExternalService) => true,
            (VerifyingExternalService, Launching) | (VerifyingExternalService, Stopped) => true,
            (Launching, Running) => true,
            (Running, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::ProvisioningEnv => "provisioning_env",
            Self::ResolvingConflicts => "resolving_conflicts",
            Self::VerifyingExternalService => "verifying_external_service",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SupervisorState::*;

    #[test]
    fn test_start_path_is_valid() {
        let path = [
            Idle,
            ProvisioningEnv,
            ResolvingConflicts,
            VerifyingExternalService,
            Launching,
            Running,
            Stopped,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Failed));
        assert!(Launching.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Launching.can_transition_to(Stopped));
    }
}

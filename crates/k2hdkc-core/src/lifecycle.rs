use crate::CoreError;
use serde::Serialize;
use std::fmt;

/// Where the manager is in bringing the service up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    /// Nothing prepared yet.
    Idle,
    Preparing,
    AwaitingHealth,
    Ready,
    Failed,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Idle => write!(f, "idle"),
            ManagerState::Preparing => write!(f, "preparing"),
            ManagerState::AwaitingHealth => write!(f, "awaiting_health"),
            ManagerState::Ready => write!(f, "ready"),
            ManagerState::Failed => write!(f, "failed"),
        }
    }
}

pub fn validate_transition(from: ManagerState, to: ManagerState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            ManagerState::Idle | ManagerState::Ready | ManagerState::Failed,
            ManagerState::Preparing
        ) | (
            ManagerState::Preparing,
            ManagerState::AwaitingHealth | ManagerState::Failed
        ) | (
            ManagerState::AwaitingHealth,
            ManagerState::Ready | ManagerState::Failed
        )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(ManagerState::Idle, ManagerState::Preparing).is_ok());
        assert!(validate_transition(ManagerState::Preparing, ManagerState::AwaitingHealth).is_ok());
        assert!(validate_transition(ManagerState::Preparing, ManagerState::Failed).is_ok()); // start failed
        assert!(validate_transition(ManagerState::AwaitingHealth, ManagerState::Ready).is_ok());
        assert!(validate_transition(ManagerState::AwaitingHealth, ManagerState::Failed).is_ok());
        assert!(validate_transition(ManagerState::Ready, ManagerState::Preparing).is_ok()); // re-prepare
        assert!(validate_transition(ManagerState::Failed, ManagerState::Preparing).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(ManagerState::Idle, ManagerState::Ready).is_err());
        assert!(validate_transition(ManagerState::Preparing, ManagerState::Ready).is_err());
        assert!(validate_transition(ManagerState::Ready, ManagerState::Failed).is_err());
        assert!(validate_transition(ManagerState::Failed, ManagerState::Ready).is_err());
        assert!(validate_transition(ManagerState::Failed, ManagerState::AwaitingHealth).is_err());
        assert!(validate_transition(ManagerState::Preparing, ManagerState::Preparing).is_err());
    }

    #[test]
    fn error_names_both_states() {
        let err = validate_transition(ManagerState::Failed, ManagerState::Ready).unwrap_err();
        assert_eq!(err.to_string(), "invalid state transition: failed -> ready");
    }
}

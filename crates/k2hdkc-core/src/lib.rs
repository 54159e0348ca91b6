//! Service lifecycle orchestration for the K2HDKC guest agent.
//!
//! This crate ties the schema, store, and runtime crates together into the
//! `Manager`, which prepares the database service container, waits for it to
//! become healthy, reconciles configuration overrides (restarting the service
//! only when a tracked key changed), and drives backup and restore through the
//! `BackupOrchestrator`. Health is observed by the `StatusPoller`; the
//! manager's own state machine is validated by `validate_transition`.

pub mod backup;
pub mod container;
pub mod lifecycle;
pub mod manager;
pub mod reconcile;
pub mod status;

pub use backup::{BackupOrchestrator, HelperOutcome, RestoreOutcome, RESTORE_CONTAINER};
pub use container::{restore_container_spec, service_container_spec, SERVICE_CONTAINER};
pub use lifecycle::{validate_transition, ManagerState};
pub use manager::{GuestAgent, Manager, PrepareReport};
pub use reconcile::{ConfigReconciler, KeyChange, ReconcileOutcome};
pub use status::StatusPoller;

use k2hdkc_schema::ServiceHealth;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] k2hdkc_schema::ConfigError),
    #[error("invalid command line: {0}")]
    CommandLine(#[from] k2hdkc_schema::CommandLineError),
    #[error("store error: {0}")]
    Store(#[from] k2hdkc_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] k2hdkc_runtime::RuntimeError),
    #[error("service did not become {target} within {waited_secs}s")]
    HealthTimeout {
        target: ServiceHealth,
        waited_secs: u64,
    },
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("cannot {operation} while {state}")]
    Unavailable {
        state: ManagerState,
        operation: &'static str,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_timeout_display() {
        let e = CoreError::HealthTimeout {
            target: ServiceHealth::Healthy,
            waited_secs: 60,
        };
        assert_eq!(e.to_string(), "service did not become healthy within 60s");
    }

    #[test]
    fn runtime_error_converts() {
        let e: CoreError = k2hdkc_runtime::RuntimeError::NotFound("db_restore".to_owned()).into();
        assert!(matches!(e, CoreError::Runtime(_)));
        assert!(e.to_string().contains("db_restore"));
    }
}

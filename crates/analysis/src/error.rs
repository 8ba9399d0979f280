use thiserror::Error;

use shopfloor_core::{AnalysisError, ConfigError, ErrorClass, IntegrityPattern, ItemId, ResourceId};

/// Ownership violation of a pause token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PauseError {
    #[error("pause of resource {resource} released by item {requester}, owned by {owner}")]
    NotOwner {
        resource: ResourceId,
        owner: ItemId,
        requester: ItemId,
    },
}

/// Errors surfacing from the scheduler to its driver.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("process exit requested: {0}")]
    ExitRequested(String),

    #[error("sub-item {item} of {parent} still not resolved after {attempts} attempts")]
    SubItemLivelock {
        parent: ItemId,
        item: ItemId,
        attempts: u32,
    },

    #[error(transparent)]
    Pause(#[from] PauseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("worker error: {0}")]
    Worker(String),
}

impl SchedulerError {
    /// Class used by the driver to decide between continuing and exiting.
    pub fn class(&self, transient_integrity: &[IntegrityPattern]) -> ErrorClass {
        match self {
            SchedulerError::Analysis(e) => e.class(transient_integrity),
            SchedulerError::ExitRequested(_)
            | SchedulerError::SubItemLivelock { .. }
            | SchedulerError::Config(_) => ErrorClass::Fatal,
            SchedulerError::Pause(_) | SchedulerError::Worker(_) => ErrorClass::Unclassified,
        }
    }

    /// Integrity patterns only separate transient from fatal violations,
    /// never from `Fatal`, so none are needed here.
    pub fn is_fatal(&self) -> bool {
        self.class(&[]) == ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopfloor_core::IntegrityViolation;

    #[test]
    fn fatal_errors() {
        assert!(SchedulerError::ExitRequested("oom".into()).is_fatal());
        assert!(SchedulerError::SubItemLivelock { parent: 1, item: 2, attempts: 10 }.is_fatal());
        assert!(SchedulerError::Analysis(AnalysisError::OutOfMemory).is_fatal());
        assert!(!SchedulerError::Analysis(AnalysisError::Stale(1)).is_fatal());
    }

    #[test]
    fn transient_store_errors_stay_transient() {
        let err = SchedulerError::from(AnalysisError::TemporaryWithDelay("pool".into()));
        assert_eq!(err.class(&[]), ErrorClass::TransientWithDelay);
        assert_eq!(err.to_string(), "temporary failure, retry after a delay: pool");
    }

    #[test]
    fn integrity_violations_follow_the_given_patterns() {
        let err = SchedulerError::from(AnalysisError::IntegrityViolation(IntegrityViolation {
            table: "public.reason_slot".into(),
            constraint: None,
            code: "23P01".into(),
            message: "overlap".into(),
        }));
        let patterns = vec![IntegrityPattern {
            table: "reason_slot".into(),
            codes: vec!["23P01".into()],
        }];
        assert_eq!(err.class(&patterns), ErrorClass::IntegrityViolationTransient);
        assert_eq!(err.class(&[]), ErrorClass::IntegrityViolationFatal);
        assert!(!err.is_fatal());
    }
}

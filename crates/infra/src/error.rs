//! Service-level error model shared by repositories, jobs and the
//! subscription service.

use bazaar_billing::ProviderError;
use bazaar_core::DomainError;
use bazaar_events::OutboxEncodeError;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Error kinds surfaced by the core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Caller-supplied data is malformed. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An expected row is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not legal in the current state.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// An external system (database, provider, lock store, object storage)
    /// failed. Retried by the outer loop.
    #[error("dependency failure: {0}")]
    Dependency(String),

    /// Programmer error or invariant violation (including caught panics).
    #[error("fatal: {0}")]
    Fatal(String),

    /// The surrounding cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// Several independent sub-tasks failed.
    #[error("{} errors: {}", .0.len(), join_messages(.0))]
    Multiple(Vec<ServiceError>),
}

fn join_messages(errors: &[ServiceError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::Dependency(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Combine accumulated errors: `Ok` when empty, the error itself when
    /// there is exactly one, `Multiple` otherwise. Nested `Multiple`s are
    /// flattened.
    pub fn join(errors: Vec<ServiceError>) -> ServiceResult<()> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                ServiceError::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(ServiceError::Multiple(flat)),
        }
    }

    /// First error, looking inside `Multiple`.
    pub fn first(&self) -> &ServiceError {
        match self {
            ServiceError::Multiple(inner) => inner.first().map_or(self, ServiceError::first),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.first(), ServiceError::Cancelled)
    }
}

impl From<DomainError> for ServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::NotFound(what) => Self::NotFound(what),
            DomainError::IllegalState(msg) => Self::StateConflict(msg),
            err @ DomainError::UnknownTag { .. } => Self::Fatal(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Dependency(format!("database: {other}")),
        }
    }
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        Self::Dependency(format!("billing provider: {err}"))
    }
}

impl From<OutboxEncodeError> for ServiceError {
    fn from(err: OutboxEncodeError) -> Self {
        Self::Fatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_collapses_empty_and_single() {
        assert_eq!(ServiceError::join(vec![]), Ok(()));
        assert_eq!(
            ServiceError::join(vec![ServiceError::not_found("license")]),
            Err(ServiceError::not_found("license"))
        );
    }

    #[test]
    fn join_flattens_nested_errors_and_keeps_order() {
        let nested = ServiceError::Multiple(vec![
            ServiceError::dependency("db"),
            ServiceError::fatal("boom"),
        ]);
        let err = ServiceError::join(vec![nested, ServiceError::Cancelled]).unwrap_err();

        let ServiceError::Multiple(all) = &err else {
            panic!("expected multiple, got {err:?}");
        };
        assert_eq!(all.len(), 3);
        assert_eq!(err.first(), &ServiceError::dependency("db"));
        assert!(err.to_string().starts_with("3 errors: dependency failure: db"));
    }

    #[test]
    fn domain_errors_map_onto_service_kinds() {
        assert!(matches!(
            ServiceError::from(DomainError::illegal_state("not pending")),
            ServiceError::StateConflict(_)
        ));
        assert_eq!(
            ServiceError::from(DomainError::unknown_tag("order status", "lost")),
            ServiceError::fatal("unknown order status: lost")
        );
        assert!(matches!(
            ServiceError::from(DomainError::invalid_id("x")),
            ServiceError::Validation(_)
        ));
        assert!(matches!(
            ServiceError::from(sqlx::Error::RowNotFound),
            ServiceError::NotFound(_)
        ));
        assert!(matches!(
            ServiceError::from(ProviderError::Transport("timeout".into())),
            ServiceError::Dependency(_)
        ));
    }
}

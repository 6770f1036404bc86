use runwarden_core::errors::{ApplicationError, DomainError};
use runwarden_db::repositories::RepositoryError;

/// Maps storage failures into the application taxonomy. Unique-key conflicts
/// are caller mistakes; everything else is a persistence outage.
pub(crate) fn persistence(error: RepositoryError) -> ApplicationError {
    match error {
        RepositoryError::Conflict(message) => {
            ApplicationError::Domain(DomainError::InvariantViolation(message))
        }
        other => ApplicationError::Persistence(other.to_string()),
    }
}

pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> ApplicationError {
    ApplicationError::Domain(DomainError::NotFound { entity, id: id.to_string() })
}

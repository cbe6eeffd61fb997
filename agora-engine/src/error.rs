use crate::api::{Error as ApiError, Uuid};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    pub fn permission_denied() -> Error {
        Error::Api(ApiError::PermissionDenied)
    }

    pub fn not_found(uuid: Uuid) -> Error {
        Error::Api(ApiError::NotFound(uuid))
    }

    pub fn uuid_already_used(uuid: Uuid) -> Error {
        Error::Api(ApiError::UuidAlreadyUsed(uuid))
    }

    pub fn acyclic_violation() -> Error {
        Error::Api(ApiError::AcyclicViolation)
    }

    pub fn aggregation_failure(uuid: Uuid) -> Error {
        Error::Api(ApiError::AggregationFailure(uuid))
    }

    /// The user-facing error, if this is one
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            Error::Anyhow(_) => None,
            Error::Api(e) => Some(e),
        }
    }
}

use agora_api::Error as ApiError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    pub fn unauthenticated() -> Error {
        Error::Api(ApiError::Unauthenticated)
    }

    pub fn permission_denied() -> Error {
        Error::Api(ApiError::PermissionDenied)
    }
}

impl From<agora_engine::Error> for Error {
    fn from(e: agora_engine::Error) -> Error {
        match e {
            agora_engine::Error::Anyhow(e) => Error::Anyhow(e),
            agora_engine::Error::Api(e) => Error::Api(e),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let api_err = match self {
            Error::Api(e) => {
                tracing::debug!(error = %e, "request rejected");
                e
            }
            Error::Anyhow(e) => {
                tracing::error!(err = ?e, "internal server error");
                // tests want to see what went wrong, clients must not
                if cfg!(test) {
                    ApiError::Unknown(format!("internal error: {e:?}"))
                } else {
                    ApiError::Unknown(String::from("internal error, details are in the server logs"))
                }
            }
        };
        (api_err.status_code(), api_err.contents()).into_response()
    }
}

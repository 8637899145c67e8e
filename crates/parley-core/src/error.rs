use parley_util::validation::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("database error: {0}")]
    Database(#[from] parley_db::DbError),
}

impl From<ValidationError> for CoreError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::EmptyMessage => {
                CoreError::BadRequest("Message must contain text or media".into())
            }
            ValidationError::TooLong { max, .. } => CoreError::BadRequest(format!(
                "Message text must be {max} characters or fewer"
            )),
            ValidationError::InvalidFormat => {
                CoreError::BadRequest("Media url must not be empty".into())
            }
        }
    }
}

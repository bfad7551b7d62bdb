use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::repository::RepositoryError;
use crate::service::errors::TournamentError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Internal server error")]
    InternalServerError,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bracket provider error: {0}")]
    BadGateway(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
    details: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            ApiError::InternalServerError | ApiError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) | ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status();
        let message = match self {
            ApiError::DatabaseError(_) => "Database error".to_string(),
            _ => self.to_string(),
        };

        let error_response = ErrorResponse {
            error: message,
            code: status.as_u16(),
            details: Some(self.to_string()),
        };

        HttpResponse::build(status).json(error_response)
    }
}

impl From<TournamentError> for ApiError {
    fn from(err: TournamentError) -> Self {
        match err {
            TournamentError::NoCurrentTournament
            | TournamentError::TournamentNotFound(_)
            | TournamentError::MatchNotFound(_)
            | TournamentError::NotRegistered(_)
            | TournamentError::NotAParticipant(_) => ApiError::NotFound(err.to_string()),
            TournamentError::AlreadyExists(_)
            | TournamentError::AlreadyRegistered(_)
            | TournamentError::TournamentAlreadyStarted(_)
            | TournamentError::TournamentNotStarted(_) => ApiError::Conflict(err.to_string()),
            TournamentError::InvalidWinner(_)
            | TournamentError::InvalidScore(_)
            | TournamentError::Schedule(_) => ApiError::BadRequest(err.to_string()),
            TournamentError::BracketProvider(_) => ApiError::BadGateway(err.to_string()),
            TournamentError::Repository(RepositoryError::Database(e)) => ApiError::DatabaseError(e),
            TournamentError::Repository(_) | TournamentError::InvariantViolation(_) => {
                error!(error = %err, "Tournament operation failed");
                ApiError::InternalServerError
            }
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::challonge_service::BracketProviderError;
    use crate::service::scheduling_service::ScheduleError;
    use actix_web::http::StatusCode;

    fn status_of(err: TournamentError) -> StatusCode {
        ApiError::from(err).status_code()
    }

    #[test]
    fn test_tournament_error_status_mapping() {
        assert_eq!(status_of(TournamentError::NoCurrentTournament), StatusCode::NOT_FOUND);
        assert_eq!(status_of(TournamentError::NotAParticipant("m".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(TournamentError::AlreadyRegistered("ash".into())), StatusCode::CONFLICT);
        assert_eq!(status_of(TournamentError::TournamentNotStarted("cup".into())), StatusCode::CONFLICT);
        assert_eq!(status_of(TournamentError::InvalidScore("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(TournamentError::Schedule(ScheduleError::NoTimezoneConfigured)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(TournamentError::InvariantViolation("two finals".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_provider_failure_is_bad_gateway() {
        let err = TournamentError::BracketProvider(BracketProviderError::Rejected {
            status: 422,
            message: "Round is not open".into(),
        });
        let api = ApiError::from(err);
        assert_eq!(api.status_code(), StatusCode::BAD_GATEWAY);
        assert!(api.to_string().contains("Round is not open"));
    }

    #[test]
    fn test_database_details_are_hidden() {
        let api = ApiError::DatabaseError(sqlx::Error::RowNotFound);
        let response = api.error_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

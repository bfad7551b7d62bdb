use thiserror::Error;

use crate::repository::RepositoryError;
use crate::service::challonge_service::BracketProviderError;
use crate::service::scheduling_service::ScheduleError;

/// Failures of the tournament engine operations.
///
/// Validation variants are reported to the caller and abort the operation with
/// no local change. `InvariantViolation` means local state disagrees with
/// itself and is always logged at error level where it is raised.
#[derive(Debug, Error)]
pub enum TournamentError {
    #[error(transparent)]
    BracketProvider(#[from] BracketProviderError),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Member {0} is not registered for this tournament")]
    NotRegistered(String),

    #[error("Member {0} is not a participant of an open match")]
    NotAParticipant(String),

    #[error("Match not found: {0}")]
    MatchNotFound(String),

    #[error("No current tournament is set")]
    NoCurrentTournament,

    #[error("Tournament not found: {0}")]
    TournamentNotFound(String),

    #[error("Tournament already exists: {0}")]
    AlreadyExists(String),

    #[error("Member {0} is already signed up")]
    AlreadyRegistered(String),

    #[error("Tournament {0} has already started")]
    TournamentAlreadyStarted(String),

    #[error("Tournament {0} has not started")]
    TournamentNotStarted(String),

    #[error("Invalid winner: {0}")]
    InvalidWinner(String),

    #[error("Invalid score: {0}")]
    InvalidScore(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl TournamentError {
    /// Validation failures the caller can fix by changing the request.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            TournamentError::BracketProvider(_)
                | TournamentError::InvariantViolation(_)
                | TournamentError::Repository(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_classification() {
        assert!(TournamentError::NoCurrentTournament.is_user_error());
        assert!(TournamentError::MatchNotFound("x".into()).is_user_error());
        assert!(!TournamentError::InvariantViolation("two finals".into()).is_user_error());
        assert!(!TournamentError::Repository(RepositoryError::LockPoisoned).is_user_error());
    }

    #[test]
    fn test_provider_message_is_preserved() {
        let err: TournamentError = BracketProviderError::Rejected {
            status: 422,
            message: "Match is already complete".to_string(),
        }
        .into();
        assert!(err.to_string().contains("Match is already complete"));
    }
}

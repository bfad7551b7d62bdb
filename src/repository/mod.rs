//! Persistence for tournaments, their participants and their matches.
//!
//! Every method is pure persistence: nothing here talks to the bracket host.
//! Writes that must keep a multi-row invariant (one current tournament, round
//! advancement) execute atomically in each implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Member, MatchState, NewMatch, NewTournament, Tournament, TournamentMatch, TournamentParticipant,
};

pub mod memory;
pub mod pg;

pub use memory::InMemoryTournamentRepository;
pub use pg::PgTournamentRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Repository lock poisoned")]
    LockPoisoned,
}

#[async_trait]
pub trait TournamentRepository: Send + Sync {
    // ----- tournaments -----

    async fn create_tournament(&self, new: NewTournament) -> Result<Tournament, RepositoryError>;

    /// Deletes the tournament with its participants and matches.
    async fn delete_tournament(&self, tournament_id: Uuid) -> Result<(), RepositoryError>;

    /// `SELECT * FROM tournaments WHERE slug = $1`
    async fn load_by_slug(&self, slug: &str) -> Result<Option<Tournament>, RepositoryError>;

    async fn load_tournament(&self, tournament_id: Uuid) -> Result<Option<Tournament>, RepositoryError>;

    /// `SELECT * FROM tournaments WHERE is_current`
    async fn load_current(&self) -> Result<Option<Tournament>, RepositoryError>;

    /// Clears the flag on every other row and sets it on `tournament_id` in one write.
    async fn set_current(&self, tournament_id: Uuid) -> Result<(), RepositoryError>;

    async fn set_ongoing(&self, tournament_id: Uuid, ongoing: bool) -> Result<(), RepositoryError>;

    async fn set_winner(
        &self,
        tournament_id: Uuid,
        winner_participant_id: Option<Uuid>,
    ) -> Result<(), RepositoryError>;

    /// Compare-and-set on the round counter. Returns `false` when another caller
    /// already moved it away from `expected`.
    async fn advance_round(
        &self,
        tournament_id: Uuid,
        expected: i32,
        next: i32,
    ) -> Result<bool, RepositoryError>;

    // ----- members -----

    async fn load_member(&self, member_id: Uuid) -> Result<Option<Member>, RepositoryError>;

    // ----- participants -----

    async fn insert_participant(
        &self,
        tournament_id: Uuid,
        member_id: Uuid,
        external_id: i64,
    ) -> Result<TournamentParticipant, RepositoryError>;

    /// Removes the participant; match slots referencing it are cleared.
    async fn delete_participant(&self, participant_id: Uuid) -> Result<(), RepositoryError>;

    async fn load_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<TournamentParticipant>, RepositoryError>;

    async fn load_participant_by_member(
        &self,
        tournament_id: Uuid,
        member_id: Uuid,
    ) -> Result<Option<TournamentParticipant>, RepositoryError>;

    async fn load_participant_by_external_id(
        &self,
        tournament_id: Uuid,
        external_id: i64,
    ) -> Result<Option<TournamentParticipant>, RepositoryError>;

    async fn list_participants(
        &self,
        tournament_id: Uuid,
    ) -> Result<Vec<TournamentParticipant>, RepositoryError>;

    async fn mark_reward_received(
        &self,
        participant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    // ----- matches -----

    /// Inserts the matches, skipping any whose external id is already stored,
    /// and returns the rows that were actually created.
    async fn bulk_insert_matches(
        &self,
        tournament_id: Uuid,
        matches: &[NewMatch],
    ) -> Result<Vec<TournamentMatch>, RepositoryError>;

    async fn load_match(&self, match_id: Uuid) -> Result<Option<TournamentMatch>, RepositoryError>;

    async fn load_match_by_external_id(
        &self,
        tournament_id: Uuid,
        external_id: i64,
    ) -> Result<Option<TournamentMatch>, RepositoryError>;

    /// `WHERE NOT completed AND {participant1_id, participant2_id} = {$a, $b}`
    async fn load_open_match_for_pair(
        &self,
        tournament_id: Uuid,
        a: Uuid,
        b: Uuid,
    ) -> Result<Option<TournamentMatch>, RepositoryError>;

    /// The participant's open match whose opponent is already known.
    async fn load_open_match_for_participant(
        &self,
        tournament_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Option<TournamentMatch>, RepositoryError>;

    /// `WHERE tournament_id = $1 AND round = $2 ORDER BY external_id`
    async fn load_round_matches(
        &self,
        tournament_id: Uuid,
        round: i32,
    ) -> Result<Vec<TournamentMatch>, RepositoryError>;

    async fn list_matches(&self, tournament_id: Uuid) -> Result<Vec<TournamentMatch>, RepositoryError>;

    async fn count_open_matches_in_round(
        &self,
        tournament_id: Uuid,
        round: i32,
    ) -> Result<i64, RepositoryError>;

    /// Highest round holding any match, the bronze round excluded.
    async fn max_round(&self, tournament_id: Uuid) -> Result<Option<i32>, RepositoryError>;

    async fn bind_participants(
        &self,
        match_id: Uuid,
        participant1_id: Option<Uuid>,
        participant2_id: Option<Uuid>,
    ) -> Result<(), RepositoryError>;

    async fn record_result(
        &self,
        match_id: Uuid,
        winner_participant_id: Uuid,
        score: &str,
        evidence_url: Option<&str>,
    ) -> Result<(), RepositoryError>;

    /// Overwrites slots and result fields with the reconciled state.
    async fn overwrite_match_state(
        &self,
        match_id: Uuid,
        state: &MatchState,
    ) -> Result<(), RepositoryError>;

    async fn schedule_match(
        &self,
        match_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

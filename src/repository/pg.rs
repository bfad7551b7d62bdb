use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::{RepositoryError, TournamentRepository};
use crate::db::DbPool;
use crate::models::{
    Member, MatchState, NewMatch, NewTournament, Tournament, TournamentMatch, TournamentParticipant,
};

/// Advisory lock key serialising writes to the `is_current` flag.
const SET_CURRENT_LOCK_KEY: i64 = 0x7475_726e_6375_7272;

const TOURNAMENT_COLUMNS: &str =
    "id, external_id, name, slug, url, ongoing, is_current, current_round, winner_id";

const PARTICIPANT_COLUMNS: &str =
    "id, tournament_id, member_id, external_id, reward_received, reward_received_on";

const MATCH_COLUMNS: &str = "id, tournament_id, participant1_id, participant2_id, external_id, \
     round, completed, winner_participant_id, score, scheduled_datetime, evidence_url";

/// Postgres-backed repository.
#[derive(Clone)]
pub struct PgTournamentRepository {
    pool: DbPool,
}

impl PgTournamentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_unique(err: sqlx::Error, what: &str) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::UniqueViolation(what.to_string())
        }
        _ => RepositoryError::Database(err),
    }
}

fn expect_row(rows_affected: u64, what: &str) -> Result<(), RepositoryError> {
    if rows_affected == 0 {
        return Err(RepositoryError::NotFound(what.to_string()));
    }
    Ok(())
}

#[async_trait]
impl TournamentRepository for PgTournamentRepository {
    async fn create_tournament(&self, new: NewTournament) -> Result<Tournament, RepositoryError> {
        let sql = format!(
            "INSERT INTO tournaments (id, external_id, name, slug, url) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            TOURNAMENT_COLUMNS
        );
        let tournament = sqlx::query_as::<_, Tournament>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.external_id)
            .bind(&new.name)
            .bind(&new.slug)
            .bind(&new.url)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_unique(e, "tournament slug"))?;

        info!(tournament_id = %tournament.id, slug = %tournament.slug, "Tournament row created");
        Ok(tournament)
    }

    async fn delete_tournament(&self, tournament_id: Uuid) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // The winner pointer references a participant row that the cascade removes.
        sqlx::query("UPDATE tournaments SET winner_id = NULL WHERE id = $1")
            .bind(tournament_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tournaments WHERE id = $1")
            .bind(tournament_id)
            .execute(&mut *tx)
            .await?;
        expect_row(result.rows_affected(), "tournament")?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_by_slug(&self, slug: &str) -> Result<Option<Tournament>, RepositoryError> {
        let sql = format!("SELECT {} FROM tournaments WHERE slug = $1", TOURNAMENT_COLUMNS);
        Ok(sqlx::query_as::<_, Tournament>(&sql)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn load_tournament(&self, tournament_id: Uuid) -> Result<Option<Tournament>, RepositoryError> {
        let sql = format!("SELECT {} FROM tournaments WHERE id = $1", TOURNAMENT_COLUMNS);
        Ok(sqlx::query_as::<_, Tournament>(&sql)
            .bind(tournament_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn load_current(&self) -> Result<Option<Tournament>, RepositoryError> {
        let sql = format!("SELECT {} FROM tournaments WHERE is_current", TOURNAMENT_COLUMNS);
        Ok(sqlx::query_as::<_, Tournament>(&sql)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_current(&self, tournament_id: Uuid) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SET_CURRENT_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE tournaments SET is_current = FALSE WHERE is_current AND id <> $1")
            .bind(tournament_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("UPDATE tournaments SET is_current = TRUE WHERE id = $1")
            .bind(tournament_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique(e, "current tournament"))?;
        expect_row(result.rows_affected(), "tournament")?;

        tx.commit().await?;
        debug!(tournament_id = %tournament_id, "Current tournament switched");
        Ok(())
    }

    async fn set_ongoing(&self, tournament_id: Uuid, ongoing: bool) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE tournaments SET ongoing = $1 WHERE id = $2")
            .bind(ongoing)
            .bind(tournament_id)
            .execute(&self.pool)
            .await?;
        expect_row(result.rows_affected(), "tournament")
    }

    async fn set_winner(
        &self,
        tournament_id: Uuid,
        winner_participant_id: Option<Uuid>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE tournaments SET winner_id = $1 WHERE id = $2")
            .bind(winner_participant_id)
            .bind(tournament_id)
            .execute(&self.pool)
            .await?;
        expect_row(result.rows_affected(), "tournament")
    }

    async fn advance_round(
        &self,
        tournament_id: Uuid,
        expected: i32,
        next: i32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE tournaments SET current_round = $1 WHERE id = $2 AND current_round = $3",
        )
        .bind(next)
        .bind(tournament_id)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn load_member(&self, member_id: Uuid) -> Result<Option<Member>, RepositoryError> {
        Ok(sqlx::query_as::<_, Member>(
            "SELECT id, discord_id, username, timezone, country_code FROM members WHERE id = $1",
        )
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn insert_participant(
        &self,
        tournament_id: Uuid,
        member_id: Uuid,
        external_id: i64,
    ) -> Result<TournamentParticipant, RepositoryError> {
        let sql = format!(
            "INSERT INTO tournament_participants (id, tournament_id, member_id, external_id) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            PARTICIPANT_COLUMNS
        );
        sqlx::query_as::<_, TournamentParticipant>(&sql)
            .bind(Uuid::new_v4())
            .bind(tournament_id)
            .bind(member_id)
            .bind(external_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_unique(e, "tournament participant"))
    }

    async fn delete_participant(&self, participant_id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM tournament_participants WHERE id = $1")
            .bind(participant_id)
            .execute(&self.pool)
            .await?;
        expect_row(result.rows_affected(), "tournament participant")
    }

    async fn load_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<TournamentParticipant>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM tournament_participants WHERE id = $1",
            PARTICIPANT_COLUMNS
        );
        Ok(sqlx::query_as::<_, TournamentParticipant>(&sql)
            .bind(participant_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn load_participant_by_member(
        &self,
        tournament_id: Uuid,
        member_id: Uuid,
    ) -> Result<Option<TournamentParticipant>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM tournament_participants WHERE tournament_id = $1 AND member_id = $2",
            PARTICIPANT_COLUMNS
        );
        Ok(sqlx::query_as::<_, TournamentParticipant>(&sql)
            .bind(tournament_id)
            .bind(member_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn load_participant_by_external_id(
        &self,
        tournament_id: Uuid,
        external_id: i64,
    ) -> Result<Option<TournamentParticipant>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM tournament_participants WHERE tournament_id = $1 AND external_id = $2",
            PARTICIPANT_COLUMNS
        );
        Ok(sqlx::query_as::<_, TournamentParticipant>(&sql)
            .bind(tournament_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_participants(
        &self,
        tournament_id: Uuid,
    ) -> Result<Vec<TournamentParticipant>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM tournament_participants WHERE tournament_id = $1 ORDER BY external_id",
            PARTICIPANT_COLUMNS
        );
        Ok(sqlx::query_as::<_, TournamentParticipant>(&sql)
            .bind(tournament_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn mark_reward_received(
        &self,
        participant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE tournament_participants SET reward_received = TRUE, reward_received_on = $1 \
             WHERE id = $2",
        )
        .bind(at)
        .bind(participant_id)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "tournament participant")
    }

    async fn bulk_insert_matches(
        &self,
        tournament_id: Uuid,
        matches: &[NewMatch],
    ) -> Result<Vec<TournamentMatch>, RepositoryError> {
        let sql = format!(
            "INSERT INTO tournament_matches (id, tournament_id, participant1_id, participant2_id, \
             external_id, round, completed, winner_participant_id, score) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (tournament_id, external_id) DO NOTHING \
             RETURNING {}",
            MATCH_COLUMNS
        );

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(matches.len());
        for m in matches {
            let row = sqlx::query_as::<_, TournamentMatch>(&sql)
                .bind(Uuid::new_v4())
                .bind(tournament_id)
                .bind(m.participant1_id)
                .bind(m.participant2_id)
                .bind(m.external_id)
                .bind(m.round)
                .bind(m.completed)
                .bind(m.winner_participant_id)
                .bind(&m.score)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_unique(e, "open match for participant pair"))?;
            inserted.extend(row);
        }
        tx.commit().await?;

        debug!(
            tournament_id = %tournament_id,
            requested = matches.len(),
            inserted = inserted.len(),
            "Matches inserted"
        );
        Ok(inserted)
    }

    async fn load_match(&self, match_id: Uuid) -> Result<Option<TournamentMatch>, RepositoryError> {
        let sql = format!("SELECT {} FROM tournament_matches WHERE id = $1", MATCH_COLUMNS);
        Ok(sqlx::query_as::<_, TournamentMatch>(&sql)
            .bind(match_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn load_match_by_external_id(
        &self,
        tournament_id: Uuid,
        external_id: i64,
    ) -> Result<Option<TournamentMatch>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM tournament_matches WHERE tournament_id = $1 AND external_id = $2",
            MATCH_COLUMNS
        );
        Ok(sqlx::query_as::<_, TournamentMatch>(&sql)
            .bind(tournament_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn load_open_match_for_pair(
        &self,
        tournament_id: Uuid,
        a: Uuid,
        b: Uuid,
    ) -> Result<Option<TournamentMatch>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM tournament_matches \
             WHERE tournament_id = $1 AND NOT completed \
               AND ((participant1_id = $2 AND participant2_id = $3) \
                 OR (participant1_id = $3 AND participant2_id = $2))",
            MATCH_COLUMNS
        );
        Ok(sqlx::query_as::<_, TournamentMatch>(&sql)
            .bind(tournament_id)
            .bind(a)
            .bind(b)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn load_open_match_for_participant(
        &self,
        tournament_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Option<TournamentMatch>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM tournament_matches \
             WHERE tournament_id = $1 AND NOT completed \
               AND participant1_id IS NOT NULL AND participant2_id IS NOT NULL \
               AND (participant1_id = $2 OR participant2_id = $2) \
             ORDER BY round DESC LIMIT 1",
            MATCH_COLUMNS
        );
        Ok(sqlx::query_as::<_, TournamentMatch>(&sql)
            .bind(tournament_id)
            .bind(participant_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn load_round_matches(
        &self,
        tournament_id: Uuid,
        round: i32,
    ) -> Result<Vec<TournamentMatch>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM tournament_matches WHERE tournament_id = $1 AND round = $2 \
             ORDER BY external_id",
            MATCH_COLUMNS
        );
        Ok(sqlx::query_as::<_, TournamentMatch>(&sql)
            .bind(tournament_id)
            .bind(round)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn list_matches(&self, tournament_id: Uuid) -> Result<Vec<TournamentMatch>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM tournament_matches WHERE tournament_id = $1 ORDER BY round, external_id",
            MATCH_COLUMNS
        );
        Ok(sqlx::query_as::<_, TournamentMatch>(&sql)
            .bind(tournament_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn count_open_matches_in_round(
        &self,
        tournament_id: Uuid,
        round: i32,
    ) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tournament_matches \
             WHERE tournament_id = $1 AND round = $2 AND NOT completed",
        )
        .bind(tournament_id)
        .bind(round)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn max_round(&self, tournament_id: Uuid) -> Result<Option<i32>, RepositoryError> {
        let max: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(round) FROM tournament_matches WHERE tournament_id = $1 AND round > 0",
        )
        .bind(tournament_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    async fn bind_participants(
        &self,
        match_id: Uuid,
        participant1_id: Option<Uuid>,
        participant2_id: Option<Uuid>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE tournament_matches SET participant1_id = $1, participant2_id = $2 WHERE id = $3",
        )
        .bind(participant1_id)
        .bind(participant2_id)
        .bind(match_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "open match for participant pair"))?;
        expect_row(result.rows_affected(), "tournament match")
    }

    async fn record_result(
        &self,
        match_id: Uuid,
        winner_participant_id: Uuid,
        score: &str,
        evidence_url: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE tournament_matches \
             SET completed = TRUE, winner_participant_id = $1, score = $2, \
                 evidence_url = COALESCE($3, evidence_url) \
             WHERE id = $4",
        )
        .bind(winner_participant_id)
        .bind(score)
        .bind(evidence_url)
        .bind(match_id)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "tournament match")
    }

    async fn overwrite_match_state(
        &self,
        match_id: Uuid,
        state: &MatchState,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE tournament_matches \
             SET participant1_id = $1, participant2_id = $2, winner_participant_id = $3, \
                 score = $4, completed = $5 \
             WHERE id = $6",
        )
        .bind(state.participant1_id)
        .bind(state.participant2_id)
        .bind(state.winner_participant_id)
        .bind(&state.score)
        .bind(state.completed)
        .bind(match_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "open match for participant pair"))?;
        expect_row(result.rows_affected(), "tournament match")
    }

    async fn schedule_match(
        &self,
        match_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE tournament_matches SET scheduled_datetime = $1 WHERE id = $2")
            .bind(at)
            .bind(match_id)
            .execute(&self.pool)
            .await?;
        expect_row(result.rows_affected(), "tournament match")
    }
}

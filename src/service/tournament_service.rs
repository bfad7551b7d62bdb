use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{
    slugify, Member, NewMatch, NewTournament, Tournament, TournamentMatch, TournamentParticipant,
    BRONZE_ROUND,
};
use crate::repository::{RepositoryError, TournamentRepository};
use crate::service::challonge_service::BracketProvider;
use crate::service::errors::TournamentError;
use crate::service::locks::TournamentLocks;
use crate::service::round_progression_service::{ParticipantMap, RoundProgressionService};

/// The tournament flagged current, read fresh on every call.
pub async fn load_current(repository: &dyn TournamentRepository) -> Result<Tournament, TournamentError> {
    repository
        .load_current()
        .await?
        .ok_or(TournamentError::NoCurrentTournament)
}

/// Provider participant id to local participant id for the whole tournament.
pub async fn participant_map(
    repository: &dyn TournamentRepository,
    tournament_id: Uuid,
) -> Result<ParticipantMap, TournamentError> {
    Ok(repository
        .list_participants(tournament_id)
        .await?
        .into_iter()
        .map(|p| (p.external_id, p.id))
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct TournamentOverview {
    pub tournament: Tournament,
    pub participants: Vec<TournamentParticipant>,
    pub matches: Vec<TournamentMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub tournament: Tournament,
    pub matches_imported: usize,
    pub channels_opened: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndReport {
    pub tournament: Tournament,
    pub winner: Option<Member>,
}

/// Tournament lifecycle: creation, sign-ups, start, end and deletion.
pub struct TournamentService {
    repository: Arc<dyn TournamentRepository>,
    provider: Arc<dyn BracketProvider>,
    engine: Arc<RoundProgressionService>,
    locks: Arc<TournamentLocks>,
}

impl TournamentService {
    pub fn new(
        repository: Arc<dyn TournamentRepository>,
        provider: Arc<dyn BracketProvider>,
        engine: Arc<RoundProgressionService>,
        locks: Arc<TournamentLocks>,
    ) -> Self {
        Self {
            repository,
            provider,
            engine,
            locks,
        }
    }

    pub async fn create_tournament(&self, name: &str) -> Result<Tournament, TournamentError> {
        let slug = slugify(name);
        if self.repository.load_by_slug(&slug).await?.is_some() {
            return Err(TournamentError::AlreadyExists(slug));
        }

        let external_id = self.provider.create_tournament(name.trim(), &slug).await?;
        let tournament = self
            .repository
            .create_tournament(NewTournament::new(external_id, name))
            .await
            .map_err(|e| match e {
                RepositoryError::UniqueViolation(_) => TournamentError::AlreadyExists(slug.clone()),
                other => other.into(),
            })?;

        info!(slug = %tournament.slug, external_id = external_id, "Tournament created");
        Ok(tournament)
    }

    /// Remote deletion is best effort; the local rows always go.
    pub async fn delete_tournament(&self, slug: &str) -> Result<(), TournamentError> {
        let tournament = self.load_by_slug(slug).await?;
        let guard = self.locks.acquire(tournament.id).await;

        if let Err(e) = self.provider.destroy_tournament(&tournament.slug).await {
            warn!(slug = %tournament.slug, error = %e, "Remote bracket deletion failed; deleting locally anyway");
        }
        self.repository.delete_tournament(tournament.id).await?;
        drop(guard);
        self.locks.forget(tournament.id);

        info!(slug = %tournament.slug, "Tournament deleted");
        Ok(())
    }

    pub async fn set_current(&self, slug: &str) -> Result<Tournament, TournamentError> {
        let tournament = self.load_by_slug(slug).await?;
        self.repository.set_current(tournament.id).await?;
        info!(slug = %tournament.slug, "Current tournament set");
        self.load_by_slug(slug).await
    }

    pub async fn get_current(&self) -> Result<TournamentOverview, TournamentError> {
        let tournament = load_current(self.repository.as_ref()).await?;
        let participants = self.repository.list_participants(tournament.id).await?;
        let matches = self.repository.list_matches(tournament.id).await?;
        Ok(TournamentOverview {
            tournament,
            participants,
            matches,
        })
    }

    async fn load_by_slug(&self, slug: &str) -> Result<Tournament, TournamentError> {
        self.repository
            .load_by_slug(slug)
            .await?
            .ok_or_else(|| TournamentError::TournamentNotFound(slug.to_string()))
    }

    // =============================================================================
    // SIGN-UPS
    // =============================================================================

    pub async fn sign_up(&self, member_id: Uuid) -> Result<TournamentParticipant, TournamentError> {
        let tournament = load_current(self.repository.as_ref()).await?;
        let member = self
            .repository
            .load_member(member_id)
            .await?
            .ok_or_else(|| TournamentError::NotRegistered(member_id.to_string()))?;

        if tournament.ongoing {
            return Err(TournamentError::TournamentAlreadyStarted(tournament.slug));
        }
        if self
            .repository
            .load_participant_by_member(tournament.id, member_id)
            .await?
            .is_some()
        {
            return Err(TournamentError::AlreadyRegistered(member.username));
        }

        let external_id = self
            .provider
            .create_participant(&tournament.slug, &member.username, &member.id.to_string())
            .await?;

        match self
            .repository
            .insert_participant(tournament.id, member_id, external_id)
            .await
        {
            Ok(participant) => {
                info!(tournament = %tournament.slug, member = %member.username, "Member signed up");
                Ok(participant)
            }
            Err(e) => {
                // Keep the remote bracket free of participants we don't know about.
                if let Err(remote) = self.provider.destroy_participant(&tournament.slug, external_id).await {
                    warn!(external_id = external_id, error = %remote, "Could not roll back remote participant");
                }
                Err(match e {
                    RepositoryError::UniqueViolation(_) => TournamentError::AlreadyRegistered(member.username),
                    other => other.into(),
                })
            }
        }
    }

    pub async fn withdraw(&self, member_id: Uuid) -> Result<(), TournamentError> {
        let tournament = load_current(self.repository.as_ref()).await?;
        let participant = self
            .repository
            .load_participant_by_member(tournament.id, member_id)
            .await?
            .ok_or_else(|| TournamentError::NotRegistered(member_id.to_string()))?;

        if let Err(e) = self
            .provider
            .destroy_participant(&tournament.slug, participant.external_id)
            .await
        {
            warn!(
                tournament = %tournament.slug,
                external_id = participant.external_id,
                error = %e,
                "Remote participant removal failed"
            );
        }
        self.repository.delete_participant(participant.id).await?;
        info!(tournament = %tournament.slug, member_id = %member_id, "Member withdrew");
        Ok(())
    }

    pub async fn mark_reward_received(&self, member_id: Uuid) -> Result<TournamentParticipant, TournamentError> {
        let tournament = load_current(self.repository.as_ref()).await?;
        let participant = self
            .repository
            .load_participant_by_member(tournament.id, member_id)
            .await?
            .ok_or_else(|| TournamentError::NotRegistered(member_id.to_string()))?;

        self.repository
            .mark_reward_received(participant.id, Utc::now())
            .await?;
        self.repository
            .load_participant(participant.id)
            .await?
            .ok_or_else(|| TournamentError::NotRegistered(member_id.to_string()))
    }

    // =============================================================================
    // START / END
    // =============================================================================

    /// Seeds and starts the remote bracket, imports it, and opens round one.
    pub async fn start_tournament(&self) -> Result<StartReport, TournamentError> {
        let current = load_current(self.repository.as_ref()).await?;
        let _guard = self.locks.acquire(current.id).await;
        let tournament = self.load_by_slug(&current.slug).await?;
        if tournament.ongoing {
            return Err(TournamentError::TournamentAlreadyStarted(tournament.slug));
        }

        // Step 1: Randomize and start remotely
        self.provider.start_tournament(&tournament.slug).await?;
        self.repository.set_ongoing(tournament.id, true).await?;

        // Step 2: Import the bracket
        let imported = self.import_bracket(&tournament).await.map_err(|e| {
            error!(tournament = %tournament.slug, error = %e, "Bracket started but import failed; run sync");
            e
        })?;

        // Step 3: Open round one
        let tournament = self.load_by_slug(&tournament.slug).await?;
        let (channels_opened, skipped) = self
            .engine
            .open_round(&tournament, tournament.current_round)
            .await?;
        if channels_opened > 0 {
            self.engine
                .announce(&tournament, None, tournament.current_round)
                .await;
        }

        info!(
            tournament = %tournament.slug,
            matches = imported,
            channels_opened = channels_opened,
            skipped = skipped,
            "Tournament started"
        );
        Ok(StartReport {
            tournament,
            matches_imported: imported,
            channels_opened,
        })
    }

    /// Imports every bracket match except the bronze match, which is
    /// materialized once the semifinals are decided.
    async fn import_bracket(&self, tournament: &Tournament) -> Result<usize, TournamentError> {
        let external = self.provider.list_matches(&tournament.slug, None).await?;
        let known = participant_map(self.repository.as_ref(), tournament.id).await?;

        let mut batch = Vec::with_capacity(external.len());
        for m in external.iter().filter(|m| m.round != BRONZE_ROUND) {
            batch.push(NewMatch {
                external_id: m.id,
                round: m.round,
                participant1_id: self.engine.resolve_external(tournament, m.player1_id, Some(&known)).await?,
                participant2_id: self.engine.resolve_external(tournament, m.player2_id, Some(&known)).await?,
                completed: false,
                winner_participant_id: None,
                score: None,
            });
        }

        let inserted = self
            .repository
            .bulk_insert_matches(tournament.id, &batch)
            .await?;
        Ok(inserted.len())
    }

    /// Finalizes the remote bracket and records its rank-1 participant.
    pub async fn end_tournament(&self) -> Result<EndReport, TournamentError> {
        let current = load_current(self.repository.as_ref()).await?;
        let _guard = self.locks.acquire(current.id).await;
        let tournament = self.load_by_slug(&current.slug).await?;
        if !tournament.ongoing {
            return Err(TournamentError::TournamentNotStarted(tournament.slug));
        }

        self.provider.finalize(&tournament.slug).await?;

        let winner = match self.provider.ranked_participant(&tournament.slug, 1).await? {
            Some(external_id) => self
                .repository
                .load_participant_by_external_id(tournament.id, external_id)
                .await?,
            None => None,
        };
        if winner.is_none() {
            warn!(tournament = %tournament.slug, "Bracket finalized without a mapped rank-1 participant");
        }

        self.repository
            .set_winner(tournament.id, winner.as_ref().map(|p| p.id))
            .await?;
        self.repository.set_ongoing(tournament.id, false).await?;

        for round in [tournament.current_round, BRONZE_ROUND] {
            self.engine.close_round(&tournament, round).await;
        }

        let winner_member = match &winner {
            Some(p) => self.repository.load_member(p.member_id).await?,
            None => None,
        };
        let tournament = self.load_by_slug(&tournament.slug).await?;
        info!(
            tournament = %tournament.slug,
            winner = ?winner_member.as_ref().map(|m| m.username.as_str()),
            "Tournament ended"
        );
        Ok(EndReport {
            tournament,
            winner: winner_member,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_create_rejects_duplicate_slug() {
        let h = Harness::new();
        let t = assert_ok!(h.tournaments.create_tournament("Winter Cup").await);
        assert_eq!(t.slug, "winter_cup");
        assert_eq!(t.url, "https://challonge.com/winter_cup");
        assert!(!t.ongoing);

        let err = assert_err!(h.tournaments.create_tournament("winter cup").await);
        assert!(matches!(err, TournamentError::AlreadyExists(slug) if slug == "winter_cup"));
    }

    #[tokio::test]
    async fn test_single_current_tournament() {
        let h = Harness::new();
        let a = h.tournaments.create_tournament("Cup A").await.unwrap();
        let b = h.tournaments.create_tournament("Cup B").await.unwrap();

        assert!(matches!(
            h.tournaments.get_current().await,
            Err(TournamentError::NoCurrentTournament)
        ));

        h.tournaments.set_current(&a.slug).await.unwrap();
        h.tournaments.set_current(&b.slug).await.unwrap();
        let current = h.tournaments.get_current().await.unwrap();
        assert_eq!(current.tournament.id, b.id);
        assert!(!h.repo.load_by_slug(&a.slug).await.unwrap().unwrap().is_current);

        let err = assert_err!(h.tournaments.set_current("missing").await);
        assert!(matches!(err, TournamentError::TournamentNotFound(_)));
    }

    #[tokio::test]
    async fn test_sign_up_rules() {
        let h = Harness::open_tournament(2).await;
        let member = h.members[0].id;

        let err = assert_err!(h.tournaments.sign_up(member).await);
        assert!(matches!(err, TournamentError::AlreadyRegistered(_)));

        let err = assert_err!(h.tournaments.sign_up(Uuid::new_v4()).await);
        assert!(matches!(err, TournamentError::NotRegistered(_)));

        let overview = h.tournaments.get_current().await.unwrap();
        assert_eq!(overview.participants.len(), 2);
        assert!(overview.matches.is_empty());
    }

    #[tokio::test]
    async fn test_no_sign_up_or_restart_after_start() {
        let mut h = Harness::started_tournament(2).await;
        h.seed_members(1);
        let late = h.members[2].id;

        let err = assert_err!(h.tournaments.sign_up(late).await);
        assert!(matches!(err, TournamentError::TournamentAlreadyStarted(_)));

        let err = assert_err!(h.tournaments.start_tournament().await);
        assert!(matches!(err, TournamentError::TournamentAlreadyStarted(_)));
    }

    #[tokio::test]
    async fn test_withdraw_removes_participant_everywhere() {
        let h = Harness::open_tournament(3).await;
        let t = h.current().await;
        let member = h.members[1].id;

        assert_ok!(h.tournaments.withdraw(member).await);
        assert!(h
            .repo
            .load_participant_by_member(t.id, member)
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.provider.list_participants(&t.slug).await.unwrap().len(), 2);

        let err = assert_err!(h.tournaments.withdraw(member).await);
        assert!(matches!(err, TournamentError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_withdraw_survives_remote_failure() {
        let h = Harness::open_tournament(2).await;
        h.provider.fail_next_destroys(1);
        assert_ok!(h.tournaments.withdraw(h.members[0].id).await);
        assert_eq!(h.tournaments.get_current().await.unwrap().participants.len(), 1);
    }

    #[tokio::test]
    async fn test_start_with_provider_rejection_changes_nothing() {
        // three players cannot be bracketed by the fake host
        let h = Harness::open_tournament(3).await;
        let err = assert_err!(h.tournaments.start_tournament().await);
        assert!(matches!(err, TournamentError::BracketProvider(_)));

        let overview = h.tournaments.get_current().await.unwrap();
        assert!(!overview.tournament.ongoing);
        assert!(overview.matches.is_empty());
    }

    #[tokio::test]
    async fn test_start_reports_import() {
        let h = Harness::open_tournament(8).await;
        let report = assert_ok!(h.tournaments.start_tournament().await);
        assert_eq!(report.matches_imported, 7);
        assert_eq!(report.channels_opened, 4);
        assert!(report.tournament.ongoing);
        assert_eq!(report.tournament.current_round, 1);
    }

    #[tokio::test]
    async fn test_end_records_rank_one_winner() {
        let h = Harness::started_tournament(4).await;
        h.play_round(1).await;
        h.play_round(2).await;
        h.play_round(BRONZE_ROUND).await;

        let champion = h.round(2).await.remove(0).participant1_id;
        let report = assert_ok!(h.tournaments.end_tournament().await);

        assert!(!report.tournament.ongoing);
        assert_eq!(report.tournament.winner_id, champion);
        let winner = report.winner.unwrap();
        assert_eq!(Some(winner.id), Some(h.member_of(champion.unwrap()).await));

        let closed = h.dispatcher.closed_categories();
        assert!(closed.contains(&"round-2".to_string()));
        assert!(closed.contains(&"round-0".to_string()));

        let err = assert_err!(h.tournaments.end_tournament().await);
        assert!(matches!(err, TournamentError::TournamentNotStarted(_)));
    }

    #[tokio::test]
    async fn test_delete_is_local_even_when_remote_fails() {
        let h = Harness::started_tournament(4).await;
        let t = h.current().await;

        h.provider.fail_next_destroys(1);
        assert_ok!(h.tournaments.delete_tournament(&t.slug).await);

        assert!(h.repo.load_by_slug(&t.slug).await.unwrap().is_none());
        assert!(h.repo.list_matches(t.id).await.unwrap().is_empty());
        assert!(h.provider.has_tournament(&t.slug));

        let err = assert_err!(h.tournaments.delete_tournament(&t.slug).await);
        assert!(matches!(err, TournamentError::TournamentNotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_reward_received() {
        let h = Harness::open_tournament(2).await;
        let participant = assert_ok!(h.tournaments.mark_reward_received(h.members[0].id).await);
        assert!(participant.reward_received);
        assert!(participant.reward_received_on.is_some());
    }
}

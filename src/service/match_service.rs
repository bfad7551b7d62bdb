use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{ReportResultRequest, ScheduleMatchRequest, TournamentMatch};
use crate::repository::TournamentRepository;
use crate::service::challonge_service::BracketProvider;
use crate::service::errors::TournamentError;
use crate::service::locks::TournamentLocks;
use crate::service::round_progression_service::{ProgressionOutcome, RoundProgressionService};
use crate::service::scheduling_service::{resolve_for_member, WallClock};
use crate::service::tournament_service::load_current;

#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub match_id: Uuid,
    pub round: i32,
    pub winner_participant_id: Uuid,
    /// As sent to the bracket host, player1-player2.
    pub score: String,
    /// `None` when the result was stored but progression failed; sync repairs it.
    pub progression: Option<ProgressionOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledMatch {
    pub match_id: Uuid,
    pub round: i32,
    pub scheduled_at: DateTime<Utc>,
}

/// Result reporting and match scheduling for the current tournament.
pub struct MatchService {
    repository: Arc<dyn TournamentRepository>,
    provider: Arc<dyn BracketProvider>,
    engine: Arc<RoundProgressionService>,
    locks: Arc<TournamentLocks>,
}

impl MatchService {
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

    // =============================================================================
    // REPORT RESULT
    // =============================================================================

    /// Records the reporter's win on their open match.
    ///
    /// The bracket host is written first. If that fails nothing local changes
    /// and the same call can simply be repeated.
    pub async fn report_result(&self, req: ReportResultRequest) -> Result<ReportOutcome, TournamentError> {
        let current = load_current(self.repository.as_ref()).await?;
        let _guard = self.locks.acquire(current.id).await;

        // Re-read under the lock: the round may have moved while we waited.
        let tournament = self
            .repository
            .load_tournament(current.id)
            .await?
            .ok_or_else(|| TournamentError::TournamentNotFound(current.slug.clone()))?;
        if !tournament.ongoing {
            return Err(TournamentError::TournamentNotStarted(tournament.slug));
        }

        let winner = self
            .repository
            .load_participant_by_member(tournament.id, req.winner_member_id)
            .await?
            .ok_or_else(|| TournamentError::NotAParticipant(req.winner_member_id.to_string()))?;

        let open = self
            .repository
            .load_open_match_for_participant(tournament.id, winner.id)
            .await?
            .filter(|m| m.round == tournament.current_round || m.is_bronze())
            .ok_or_else(|| {
                TournamentError::MatchNotFound(format!(
                    "no open match for member {} in round {}",
                    req.winner_member_id, tournament.current_round
                ))
            })?;

        let winner_is_player1 = open.participant1_id == Some(winner.id);
        let score = oriented_score(req.score.as_deref(), winner_is_player1)?;

        info!(
            tournament = %tournament.slug,
            match_id = %open.id,
            round = open.round,
            winner = %winner.id,
            score = %score,
            "Reporting match result"
        );

        // Step 1: Push the authoritative result
        self.provider
            .update_match(&tournament.slug, open.external_id, &score, winner.external_id)
            .await
            .map_err(|e| {
                error!(match_id = %open.id, error = %e, "Bracket provider rejected the result");
                TournamentError::from(e)
            })?;

        // Step 2: Mirror it locally
        if let Err(e) = self
            .repository
            .record_result(open.id, winner.id, &score, Some(&req.evidence_url))
            .await
        {
            error!(
                match_id = %open.id,
                error = %e,
                "Result accepted by bracket provider but not stored locally; run sync"
            );
            return Err(e.into());
        }

        let completed = TournamentMatch {
            completed: true,
            winner_participant_id: Some(winner.id),
            score: Some(score.clone()),
            evidence_url: Some(req.evidence_url.clone()),
            ..open
        };

        // Step 3: Progression
        let progression = match self.engine.on_match_completed(&tournament, &completed).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(
                    tournament = %tournament.slug,
                    match_id = %completed.id,
                    error = %e,
                    "Round progression failed after result was stored; run sync"
                );
                None
            }
        };

        Ok(ReportOutcome {
            match_id: completed.id,
            round: completed.round,
            winner_participant_id: winner.id,
            score,
            progression,
        })
    }

    // =============================================================================
    // SCHEDULE MATCH
    // =============================================================================

    /// Stores the agreed start time on the open match between two members.
    /// The wall-clock time is read in the requesting member's timezone.
    pub async fn schedule_match(&self, req: ScheduleMatchRequest) -> Result<ScheduledMatch, TournamentError> {
        let tournament = load_current(self.repository.as_ref()).await?;

        let member = self
            .repository
            .load_member(req.member_id)
            .await?
            .ok_or_else(|| TournamentError::NotRegistered(req.member_id.to_string()))?;
        let me = self
            .repository
            .load_participant_by_member(tournament.id, req.member_id)
            .await?
            .ok_or_else(|| TournamentError::NotAParticipant(req.member_id.to_string()))?;
        let opponent = self
            .repository
            .load_participant_by_member(tournament.id, req.opponent_member_id)
            .await?
            .ok_or_else(|| TournamentError::NotAParticipant(req.opponent_member_id.to_string()))?;

        let open = self
            .repository
            .load_open_match_for_pair(tournament.id, me.id, opponent.id)
            .await?
            .ok_or_else(|| {
                TournamentError::MatchNotFound(format!(
                    "no open match between {} and {}",
                    req.member_id, req.opponent_member_id
                ))
            })?;

        let wall = WallClock {
            year: req.year,
            month: req.month,
            day: req.day,
            hour: req.hour,
            minute: req.minute,
        };
        let at = resolve_for_member(&member, wall, Utc::now())?;

        self.repository.schedule_match(open.id, at).await?;
        info!(match_id = %open.id, scheduled_at = %at, "Match scheduled");

        Ok(ScheduledMatch {
            match_id: open.id,
            round: open.round,
            scheduled_at: at,
        })
    }
}

/// Turns a score given from the winner's side into `player1-player2` order.
pub fn oriented_score(score: Option<&str>, winner_is_player1: bool) -> Result<String, TournamentError> {
    let (won, lost) = match score.map(str::trim) {
        None | Some("") => (1, 0),
        Some(raw) => {
            let parsed = raw
                .split_once('-')
                .and_then(|(a, b)| Some((a.trim().parse::<u32>().ok()?, b.trim().parse::<u32>().ok()?)));
            parsed.ok_or_else(|| TournamentError::InvalidScore(raw.to_string()))?
        }
    };
    if won <= lost {
        return Err(TournamentError::InvalidWinner(format!(
            "score {}-{} does not make the reporter the winner",
            won, lost
        )));
    }
    Ok(if winner_is_player1 {
        format!("{}-{}", won, lost)
    } else {
        format!("{}-{}", lost, won)
    })
}

//! Sync Reconciliation
//!
//! Re-reads the whole remote bracket and overwrites the local slot and result
//! fields to match it. This is the recovery path for every partially applied
//! result report, so it must converge and be safe to run repeatedly.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{MatchState, NewMatch, Tournament, TournamentMatch, BRONZE_ROUND};
use crate::repository::TournamentRepository;
use crate::service::challonge_service::{BracketProvider, ExternalMatch};
use crate::service::errors::TournamentError;
use crate::service::locks::TournamentLocks;
use crate::service::round_progression_service::{ParticipantMap, ProgressionOutcome, RoundProgressionService};
use crate::service::tournament_service::{load_current, participant_map};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub examined: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Provider matches left untouched because they could not be mapped or
    /// would have reopened a round already left.
    pub anomalies: usize,
    pub channels_opened: usize,
    pub progression: Vec<ProgressionOutcome>,
}

pub struct SyncService {
    repository: Arc<dyn TournamentRepository>,
    provider: Arc<dyn BracketProvider>,
    engine: Arc<RoundProgressionService>,
    locks: Arc<TournamentLocks>,
}

impl SyncService {
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

    pub async fn sync(&self) -> Result<SyncReport, TournamentError> {
        let current = load_current(self.repository.as_ref()).await?;
        let _guard = self.locks.acquire(current.id).await;
        let tournament = self
            .repository
            .load_tournament(current.id)
            .await?
            .ok_or_else(|| TournamentError::TournamentNotFound(current.slug.clone()))?;

        let external = self.provider.list_matches(&tournament.slug, None).await?;
        let known = participant_map(self.repository.as_ref(), tournament.id).await?;

        let mut report = SyncReport {
            examined: external.len(),
            ..SyncReport::default()
        };
        let mut newly_completed: Vec<TournamentMatch> = Vec::new();
        let mut newly_resolved: Vec<TournamentMatch> = Vec::new();

        for ext in &external {
            let Some(desired) = self.desired_state(&tournament, ext, &known) else {
                report.anomalies += 1;
                continue;
            };

            match self
                .repository
                .load_match_by_external_id(tournament.id, ext.id)
                .await?
            {
                None => {
                    let new = NewMatch {
                        external_id: ext.id,
                        round: ext.round,
                        participant1_id: desired.participant1_id,
                        participant2_id: desired.participant2_id,
                        completed: desired.completed,
                        winner_participant_id: desired.winner_participant_id,
                        score: desired.score.clone(),
                    };
                    for local in self.repository.bulk_insert_matches(tournament.id, &[new]).await? {
                        report.inserted += 1;
                        if local.completed {
                            newly_completed.push(local);
                        } else if local.is_resolved() {
                            newly_resolved.push(local);
                        }
                    }
                }
                Some(local) => {
                    if MatchState::of(&local) == desired {
                        report.unchanged += 1;
                        continue;
                    }
                    if local.completed && !desired.completed && !local.is_bronze() && local.round < tournament.current_round {
                        warn!(
                            tournament = %tournament.slug,
                            match_id = %local.id,
                            round = local.round,
                            "Provider reopened a match of a finished round; keeping local result"
                        );
                        report.anomalies += 1;
                        continue;
                    }

                    self.repository.overwrite_match_state(local.id, &desired).await?;
                    report.updated += 1;

                    let became_complete = !local.completed && desired.completed;
                    let became_resolved = !local.is_resolved()
                        && desired.participant1_id.is_some()
                        && desired.participant2_id.is_some();
                    let updated = TournamentMatch {
                        participant1_id: desired.participant1_id,
                        participant2_id: desired.participant2_id,
                        winner_participant_id: desired.winner_participant_id,
                        score: desired.score,
                        completed: desired.completed,
                        ..local
                    };
                    if became_complete {
                        newly_completed.push(updated);
                    } else if became_resolved && !updated.completed {
                        newly_resolved.push(updated);
                    }
                }
            }
        }

        // Channels for pairs the current stage was still waiting on.
        report.channels_opened = self
            .engine
            .open_newly_resolved(&tournament, &newly_resolved)
            .await?;

        for m in &newly_completed {
            let round_type = self.engine.classify(tournament.id, m.round).await?;
            self.engine.trigger_rewards(&tournament, m, round_type).await;
        }

        // Progression runs on every sync: a result may have been stored by an
        // earlier call that never got to advance the round.
        report.progression = self.catch_up(&tournament, !newly_completed.is_empty()).await?;

        info!(
            tournament = %tournament.slug,
            examined = report.examined,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            anomalies = report.anomalies,
            "Sync finished"
        );
        Ok(report)
    }

    /// Re-evaluates the current round, and keeps going while the round just
    /// entered is already fully decided, which covers syncs that land several
    /// rounds of results at once. Only outcomes that moved the tournament are
    /// returned.
    ///
    /// The final stage is only evaluated when this sync completed a match or
    /// advanced a round, so a finished tournament is not announced again on
    /// every run.
    async fn catch_up(
        &self,
        tournament: &Tournament,
        completed_any: bool,
    ) -> Result<Vec<ProgressionOutcome>, TournamentError> {
        let max_round = self.repository.max_round(tournament.id).await?.unwrap_or(0);
        let mut moved = completed_any;
        let mut outcomes = Vec::new();
        let mut round = tournament.current_round;
        loop {
            if max_round == 0 || (round >= max_round && !moved) {
                return Ok(outcomes);
            }
            let outcome = self.engine.evaluate_round(tournament.id, round).await?;
            let next = match &outcome {
                ProgressionOutcome::RoundAdvanced { to, .. } => Some(*to),
                _ => None,
            };
            if matches!(
                outcome,
                ProgressionOutcome::RoundAdvanced { .. } | ProgressionOutcome::TournamentCompleted { .. }
            ) {
                outcomes.push(outcome);
            }

            let Some(to) = next else {
                return Ok(outcomes);
            };
            moved = true;
            let open = self
                .repository
                .count_open_matches_in_round(tournament.id, to)
                .await?;
            if open > 0 {
                return Ok(outcomes);
            }
            round = to;
        }
    }

    /// Local field values mirroring `ext`, or `None` when the match references
    /// participants or a winner that cannot be mapped.
    fn desired_state(
        &self,
        tournament: &Tournament,
        ext: &ExternalMatch,
        known: &ParticipantMap,
    ) -> Option<MatchState> {
        let map = |id: Option<i64>| -> Result<Option<uuid::Uuid>, i64> {
            match id {
                None => Ok(None),
                Some(external_id) => known.get(&external_id).copied().map(Some).ok_or(external_id),
            }
        };

        let slots = (map(ext.player1_id), map(ext.player2_id));
        let (participant1_id, participant2_id) = match slots {
            (Ok(a), Ok(b)) => (a, b),
            (Err(unknown), _) | (_, Err(unknown)) => {
                warn!(
                    tournament = %tournament.slug,
                    external_match_id = ext.id,
                    external_participant_id = unknown,
                    "Provider match references an unknown participant"
                );
                return None;
            }
        };

        if !ext.is_complete() {
            return Some(MatchState {
                participant1_id,
                participant2_id,
                winner_participant_id: None,
                score: None,
                completed: false,
            });
        }

        let winner = map(ext.winner_id).ok().flatten();
        let consistent = participant1_id.is_some()
            && participant2_id.is_some()
            && participant1_id != participant2_id
            && winner.is_some()
            && (winner == participant1_id || winner == participant2_id);
        if !consistent {
            warn!(
                tournament = %tournament.slug,
                external_match_id = ext.id,
                round = ext.round,
                bronze = ext.round == BRONZE_ROUND,
                "Completed provider match has no resolvable winner among its players"
            );
            return None;
        }

        Some(MatchState {
            participant1_id,
            participant2_id,
            winner_participant_id: winner,
            score: ext.score(),
            completed: true,
        })
    }
}

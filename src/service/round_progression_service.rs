//! Round Progression Engine
//!
//! Runs every time a match of the current tournament is marked completed:
//! mirrors the bracket host's placement of the winner and loser into their
//! next matches, decides whether the round is over and, when it is, moves the
//! tournament to its next stage.
//!
//! Callers hold the tournament lock for the whole chain. Round advancement is
//! additionally a compare-and-set on `current_round`, so two engines sharing a
//! database cannot both advance the same round.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{
    round_category, Member, NewMatch, Placements, RoundAnnouncement, RoundType, Tournament,
    TournamentMatch, BRONZE_ROUND,
};
use crate::repository::TournamentRepository;
use crate::service::challonge_service::{BracketProvider, ExternalMatch};
use crate::service::dispatcher::Dispatcher;
use crate::service::errors::TournamentError;

/// What a completed match did to the tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProgressionOutcome {
    /// Other matches of the round are still open.
    RoundPending { round: i32, open_matches: i64 },
    RoundAdvanced {
        from: i32,
        to: i32,
        channels_opened: usize,
        pairs_skipped: usize,
        bronze_opened: bool,
    },
    /// One of the final and the bronze match is still being played.
    AwaitingTerminalMatch,
    TournamentCompleted { placements: Placements },
    /// The round counter had already moved past this round.
    AlreadyAdvanced { round: i32 },
}

/// Local view of a provider match after its slots were mirrored.
#[derive(Debug, Clone)]
pub struct MirroredMatch {
    pub local: TournamentMatch,
    /// Both slots got filled by this call.
    pub newly_resolved: bool,
}

/// Provider participant id to local participant id.
pub type ParticipantMap = HashMap<i64, Uuid>;

pub struct RoundProgressionService {
    repository: Arc<dyn TournamentRepository>,
    provider: Arc<dyn BracketProvider>,
    dispatcher: Arc<dyn Dispatcher>,
    category_prefix: String,
}

impl RoundProgressionService {
    pub fn new(
        repository: Arc<dyn TournamentRepository>,
        provider: Arc<dyn BracketProvider>,
        dispatcher: Arc<dyn Dispatcher>,
        category_prefix: String,
    ) -> Self {
        Self {
            repository,
            provider,
            dispatcher,
            category_prefix,
        }
    }

    pub fn category(&self, round: i32) -> String {
        round_category(&self.category_prefix, round)
    }

    pub async fn classify(&self, tournament_id: Uuid, round: i32) -> Result<RoundType, TournamentError> {
        let max_round = self.max_round(tournament_id).await?;
        Ok(RoundType::classify(round, max_round))
    }

    async fn max_round(&self, tournament_id: Uuid) -> Result<i32, TournamentError> {
        self.repository.max_round(tournament_id).await?.ok_or_else(|| {
            error!(tournament_id = %tournament_id, "Tournament has no bracket matches");
            TournamentError::InvariantViolation("tournament has no bracket matches".to_string())
        })
    }

    // =============================================================================
    // MATCH COMPLETED
    // =============================================================================

    /// Full transition for a match that was just recorded as completed.
    ///
    /// Propagation and reward failures are logged and left to sync; only
    /// repository failures during the round evaluation are returned.
    pub async fn on_match_completed(
        &self,
        tournament: &Tournament,
        completed: &TournamentMatch,
    ) -> Result<ProgressionOutcome, TournamentError> {
        let round_type = self.classify(tournament.id, completed.round).await?;
        let winner = completed.winner_participant_id.ok_or_else(|| {
            error!(match_id = %completed.id, "Completed match has no winner");
            TournamentError::InvariantViolation(format!("match {} completed without winner", completed.id))
        })?;
        let loser = completed.loser();

        info!(
            tournament = %tournament.slug,
            match_id = %completed.id,
            round = completed.round,
            round_type = %round_type,
            "Processing completed match"
        );

        if !round_type.is_terminal() {
            // Step 1: Winner propagation
            self.propagate_logged(tournament, winner, "winner").await;

            // Step 2: Loser propagation (semifinal losers go to the bronze match)
            if let Some(loser) = loser {
                self.propagate_logged(tournament, loser, "loser").await;
            }
        }

        // Step 3: Reward triggers
        self.trigger_rewards(tournament, completed, round_type).await;

        // Step 4: Round completion
        self.evaluate_round(tournament.id, completed.round).await
    }

    async fn propagate_logged(&self, tournament: &Tournament, participant_id: Uuid, role: &str) {
        if let Err(e) = self.propagate(tournament, participant_id).await {
            warn!(
                tournament = %tournament.slug,
                participant_id = %participant_id,
                role = role,
                error = %e,
                "Propagation failed; run sync to repair"
            );
        }
    }

    /// Mirrors the participant's next provider match into the local bracket.
    pub async fn propagate(
        &self,
        tournament: &Tournament,
        participant_id: Uuid,
    ) -> Result<Option<MirroredMatch>, TournamentError> {
        let participant = self
            .repository
            .load_participant(participant_id)
            .await?
            .ok_or_else(|| TournamentError::NotAParticipant(participant_id.to_string()))?;

        let next = self
            .provider
            .find_next_match_for_participant(&tournament.slug, participant.external_id)
            .await?;
        let Some(next) = next else {
            debug!(participant_id = %participant_id, "No further match for participant");
            return Ok(None);
        };

        let mirrored = self.mirror_slots(tournament, &next, None).await?;

        if mirrored.newly_resolved {
            self.open_newly_resolved(tournament, std::slice::from_ref(&mirrored.local))
                .await?;
        }
        Ok(Some(mirrored))
    }

    /// Upserts the provider match locally, filling empty slots from the
    /// provider. Local bindings are never cleared here; sync owns overwrites.
    pub async fn mirror_slots(
        &self,
        tournament: &Tournament,
        external: &ExternalMatch,
        known: Option<&ParticipantMap>,
    ) -> Result<MirroredMatch, TournamentError> {
        let p1 = self.resolve_external(tournament, external.player1_id, known).await?;
        let p2 = self.resolve_external(tournament, external.player2_id, known).await?;

        let existing = self
            .repository
            .load_match_by_external_id(tournament.id, external.id)
            .await?;

        let Some(local) = existing else {
            let new = NewMatch {
                external_id: external.id,
                round: external.round,
                participant1_id: p1,
                participant2_id: p2,
                completed: false,
                winner_participant_id: None,
                score: None,
            };
            let mut inserted = self.repository.bulk_insert_matches(tournament.id, &[new]).await?;
            let local = inserted.pop().ok_or_else(|| {
                TournamentError::InvariantViolation(format!("match {} was not inserted", external.id))
            })?;
            info!(
                tournament = %tournament.slug,
                external_match_id = external.id,
                round = local.round,
                "Materialized match"
            );
            let newly_resolved = local.is_resolved();
            return Ok(MirroredMatch { local, newly_resolved });
        };

        let slot1 = local.participant1_id.or(p1);
        let slot2 = local.participant2_id.or(p2);
        if slot1 == local.participant1_id && slot2 == local.participant2_id {
            return Ok(MirroredMatch { local, newly_resolved: false });
        }

        let was_resolved = local.is_resolved();
        self.repository.bind_participants(local.id, slot1, slot2).await?;
        let local = TournamentMatch {
            participant1_id: slot1,
            participant2_id: slot2,
            ..local
        };
        debug!(match_id = %local.id, round = local.round, "Bound participants");
        Ok(MirroredMatch {
            newly_resolved: !was_resolved && local.is_resolved(),
            local,
        })
    }

    /// Maps a provider participant id to the local participant. An id with no
    /// local row is logged and treated as an empty slot.
    pub async fn resolve_external(
        &self,
        tournament: &Tournament,
        external_id: Option<i64>,
        known: Option<&ParticipantMap>,
    ) -> Result<Option<Uuid>, TournamentError> {
        let Some(external_id) = external_id else {
            return Ok(None);
        };
        let local = match known {
            Some(map) => map.get(&external_id).copied(),
            None => self
                .repository
                .load_participant_by_external_id(tournament.id, external_id)
                .await?
                .map(|p| p.id),
        };
        if local.is_none() {
            warn!(
                tournament = %tournament.slug,
                external_participant_id = external_id,
                "Provider participant has no local mapping; run sync after registering it"
            );
        }
        Ok(local)
    }

    // =============================================================================
    // REWARDS
    // =============================================================================

    /// Normal round: the loser is out. Semifinal: nobody yet. Final and
    /// bronze: both players reached the last stage.
    pub async fn trigger_rewards(
        &self,
        tournament: &Tournament,
        completed: &TournamentMatch,
        round_type: RoundType,
    ) -> usize {
        let recipients: Vec<Uuid> = match round_type {
            RoundType::Normal => completed.loser().into_iter().collect(),
            RoundType::Semifinal => Vec::new(),
            RoundType::Final | RoundType::Bronze => completed
                .participant1_id
                .into_iter()
                .chain(completed.participant2_id)
                .collect(),
        };
        if recipients.is_empty() {
            return 0;
        }

        let mut members = Vec::with_capacity(recipients.len());
        for participant_id in recipients {
            match self.member_for_participant(participant_id).await {
                Ok(Some((member, true))) => {
                    debug!(member = %member.username, "Reward already received, skipping channel");
                }
                Ok(Some((member, false))) => members.push(member),
                Ok(None) => {}
                Err(e) => warn!(participant_id = %participant_id, error = %e, "Could not load reward recipient"),
            }
        }
        if members.is_empty() {
            return 0;
        }

        match self.dispatcher.open_reward_channel(&members, &tournament.slug).await {
            Ok(channels) => channels.len(),
            Err(e) => {
                warn!(tournament = %tournament.slug, error = %e, "Failed to open reward channels");
                0
            }
        }
    }

    /// Member behind a participant, with its `reward_received` flag.
    async fn member_for_participant(
        &self,
        participant_id: Uuid,
    ) -> Result<Option<(Member, bool)>, TournamentError> {
        let Some(participant) = self.repository.load_participant(participant_id).await? else {
            return Ok(None);
        };
        let member = self
            .repository
            .load_member(participant.member_id)
            .await?
            .ok_or_else(|| {
                error!(member_id = %participant.member_id, "Participant references a missing member");
                TournamentError::InvariantViolation(format!("member {} missing", participant.member_id))
            })?;
        Ok(Some((member, participant.reward_received)))
    }

    // =============================================================================
    // ROUND EVALUATION
    // =============================================================================

    /// Checks whether `round` is finished and moves the tournament on.
    pub async fn evaluate_round(
        &self,
        tournament_id: Uuid,
        round: i32,
    ) -> Result<ProgressionOutcome, TournamentError> {
        let tournament = self
            .repository
            .load_tournament(tournament_id)
            .await?
            .ok_or_else(|| TournamentError::TournamentNotFound(tournament_id.to_string()))?;
        let max_round = self.max_round(tournament_id).await?;
        let round_type = RoundType::classify(round, max_round);

        match round_type {
            RoundType::Normal | RoundType::Semifinal => {
                self.advance_if_complete(&tournament, round, round_type).await
            }
            RoundType::Final | RoundType::Bronze => self.check_completion(&tournament, max_round).await,
        }
    }

    async fn advance_if_complete(
        &self,
        tournament: &Tournament,
        round: i32,
        round_type: RoundType,
    ) -> Result<ProgressionOutcome, TournamentError> {
        if round != tournament.current_round {
            debug!(round = round, current = tournament.current_round, "Round already left");
            return Ok(ProgressionOutcome::AlreadyAdvanced { round });
        }

        let open_matches = self
            .repository
            .count_open_matches_in_round(tournament.id, round)
            .await?;
        if open_matches > 0 {
            debug!(round = round, open = open_matches, "Round still in progress");
            return Ok(ProgressionOutcome::RoundPending { round, open_matches });
        }

        // Semifinals fork into the final and the bronze match.
        let bronze = if round_type == RoundType::Semifinal {
            self.materialize_bronze(tournament).await
        } else {
            None
        };

        let next = round + 1;
        if !self.repository.advance_round(tournament.id, round, next).await? {
            info!(tournament = %tournament.slug, round = round, "Round advanced by another caller");
            return Ok(ProgressionOutcome::AlreadyAdvanced { round });
        }
        info!(tournament = %tournament.slug, from = round, to = next, round_type = %round_type, "Round advanced");

        let mut bronze_opened = false;
        if let Some(bronze) = bronze.filter(|b| b.is_resolved() && !b.completed) {
            let category = self.category(BRONZE_ROUND);
            bronze_opened = self.open_match_channel(tournament, &bronze, &category).await;
        } else if round_type == RoundType::Semifinal {
            warn!(tournament = %tournament.slug, "Bronze match not ready; run sync once both semifinal losers are known");
        }

        self.close_round(tournament, round).await;

        let (channels_opened, pairs_skipped) = self.open_round(tournament, next).await?;
        if channels_opened > 0 {
            self.announce(tournament, Some(round), next).await;
        } else {
            info!(
                tournament = %tournament.slug,
                round = next,
                "No resolved pair yet; announcement deferred"
            );
        }

        Ok(ProgressionOutcome::RoundAdvanced {
            from: round,
            to: next,
            channels_opened,
            pairs_skipped,
            bronze_opened,
        })
    }

    /// Mirrors the provider's round-0 match locally. Failures are logged.
    async fn materialize_bronze(&self, tournament: &Tournament) -> Option<TournamentMatch> {
        let matches = match self.provider.list_matches(&tournament.slug, None).await {
            Ok(matches) => matches,
            Err(e) => {
                warn!(tournament = %tournament.slug, error = %e, "Could not list matches for bronze match; run sync");
                return None;
            }
        };
        let external = matches.into_iter().find(|m| m.round == BRONZE_ROUND)?;
        match self.mirror_slots(tournament, &external, None).await {
            Ok(mirrored) => Some(mirrored.local),
            Err(e) => {
                warn!(tournament = %tournament.slug, error = %e, "Could not materialize bronze match; run sync");
                None
            }
        }
    }

    async fn check_completion(
        &self,
        tournament: &Tournament,
        max_round: i32,
    ) -> Result<ProgressionOutcome, TournamentError> {
        let finals = self.repository.load_round_matches(tournament.id, max_round).await?;
        let [final_match] = finals.as_slice() else {
            error!(tournament = %tournament.slug, count = finals.len(), "Expected exactly one final match");
            return Err(TournamentError::InvariantViolation(format!(
                "{} matches in final round {}",
                finals.len(),
                max_round
            )));
        };
        if !final_match.completed {
            return Ok(ProgressionOutcome::AwaitingTerminalMatch);
        }

        let bronze = self
            .repository
            .load_round_matches(tournament.id, BRONZE_ROUND)
            .await?
            .into_iter()
            .next();
        if max_round >= 2 {
            match &bronze {
                Some(b) if b.completed => {}
                Some(_) => return Ok(ProgressionOutcome::AwaitingTerminalMatch),
                None => {
                    warn!(tournament = %tournament.slug, "Final is decided but no bronze match is stored; run sync");
                    return Ok(ProgressionOutcome::AwaitingTerminalMatch);
                }
            }
        }

        let placements = Self::placements(final_match, bronze.as_ref())?;
        info!(
            tournament = %tournament.slug,
            first = %placements.first,
            second = %placements.second,
            "Tournament completed"
        );
        if let Err(e) = self
            .dispatcher
            .announce_completion(&tournament.slug, &placements)
            .await
        {
            warn!(tournament = %tournament.slug, error = %e, "Failed to announce completion");
        }
        Ok(ProgressionOutcome::TournamentCompleted { placements })
    }

    fn placements(
        final_match: &TournamentMatch,
        bronze: Option<&TournamentMatch>,
    ) -> Result<Placements, TournamentError> {
        let decided = |m: &TournamentMatch| -> Result<(Uuid, Uuid), TournamentError> {
            match (m.has_consistent_winner(), m.winner_participant_id, m.loser()) {
                (true, Some(winner), Some(loser)) => Ok((winner, loser)),
                _ => {
                    error!(match_id = %m.id, "Completed match has inconsistent winner binding");
                    Err(TournamentError::InvariantViolation(format!(
                        "match {} has inconsistent winner binding",
                        m.id
                    )))
                }
            }
        };

        let (first, second) = decided(final_match)?;
        let (third, fourth) = match bronze.filter(|b| b.completed) {
            Some(b) => {
                let (w, l) = decided(b)?;
                (Some(w), Some(l))
            }
            None => (None, None),
        };
        Ok(Placements { first, second, third, fourth })
    }

    // =============================================================================
    // CHANNELS AND ANNOUNCEMENTS
    // =============================================================================

    /// Opens a channel for every resolved open pair of `round`.
    /// Returns (opened, skipped).
    pub async fn open_round(
        &self,
        tournament: &Tournament,
        round: i32,
    ) -> Result<(usize, usize), TournamentError> {
        let category = self.category(round);
        let mut opened = 0;
        let mut skipped = 0;

        for m in self.repository.load_round_matches(tournament.id, round).await? {
            if m.completed {
                continue;
            }
            if !m.is_resolved() {
                info!(
                    tournament = %tournament.slug,
                    round = round,
                    external_match_id = m.external_id,
                    "Pair not resolved yet, skipping channel"
                );
                skipped += 1;
                continue;
            }
            if self.open_match_channel(tournament, &m, &category).await {
                opened += 1;
            } else {
                skipped += 1;
            }
        }
        Ok((opened, skipped))
    }

    /// Opens channels for pairs that just got both players and are playable
    /// now. If these are the first pairs of the current round, the round was
    /// entered without an announcement and it goes out here.
    pub async fn open_newly_resolved(
        &self,
        tournament: &Tournament,
        newly_resolved: &[TournamentMatch],
    ) -> Result<usize, TournamentError> {
        let current = tournament.current_round;
        let max_round = self.repository.max_round(tournament.id).await?.unwrap_or(0);
        let mut opened = 0;
        let mut opened_current = false;

        for m in newly_resolved.iter().filter(|m| m.is_resolved() && !m.completed) {
            let playable = m.round == current || (m.is_bronze() && current == max_round);
            if !playable {
                continue;
            }
            if self.open_match_channel(tournament, m, &self.category(m.round)).await {
                opened += 1;
                opened_current |= m.round == current;
            }
        }

        if opened_current {
            let fresh: HashSet<Uuid> = newly_resolved.iter().map(|m| m.id).collect();
            let already_announced = self
                .repository
                .load_round_matches(tournament.id, current)
                .await?
                .iter()
                .any(|m| m.is_resolved() && !fresh.contains(&m.id));
            if !already_announced {
                info!(tournament = %tournament.slug, round = current, "Sending deferred round announcement");
                let finished = (current > 1).then(|| current - 1);
                self.announce(tournament, finished, current).await;
            }
        }
        Ok(opened)
    }

    /// Returns whether the channel was opened. Failures are logged.
    pub async fn open_match_channel(&self, tournament: &Tournament, m: &TournamentMatch, category: &str) -> bool {
        let (Some(p1), Some(p2)) = (m.participant1_id, m.participant2_id) else {
            return false;
        };
        let members = match (
            self.member_for_participant(p1).await,
            self.member_for_participant(p2).await,
        ) {
            (Ok(Some((a, _))), Ok(Some((b, _)))) => (a, b),
            (a, b) => {
                warn!(match_id = %m.id, first = ?a.err(), second = ?b.err(), "Could not load match players");
                return false;
            }
        };

        match self
            .dispatcher
            .open_match_channel([&members.0, &members.1], m.round, category)
            .await
        {
            Ok(channel) => {
                info!(tournament = %tournament.slug, channel = %channel, round = m.round, "Match channel opened");
                true
            }
            Err(e) => {
                warn!(tournament = %tournament.slug, match_id = %m.id, error = %e, "Failed to open match channel");
                false
            }
        }
    }

    pub async fn close_round(&self, tournament: &Tournament, round: i32) {
        let category = self.category(round);
        if let Err(e) = self.dispatcher.close_channels(&category).await {
            warn!(tournament = %tournament.slug, category = %category, error = %e, "Failed to close round channels");
        }
    }

    pub async fn announce(&self, tournament: &Tournament, finished_round: Option<i32>, new_round: i32) {
        let announcement = RoundAnnouncement::new(&tournament.slug, finished_round, new_round, Utc::now());
        if let Err(e) = self.dispatcher.announce_round(&announcement).await {
            warn!(tournament = %tournament.slug, round = new_round, error = %e, "Failed to announce round");
        }
    }
}

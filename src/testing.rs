//! In-process doubles for the bracket host and the chat layer, plus a harness
//! wiring them to the real services over the in-memory repository.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::{Member, Placements, ReportResultRequest, RoundAnnouncement, Tournament, TournamentMatch};
use crate::repository::{InMemoryTournamentRepository, TournamentRepository};
use crate::service::challonge_service::{
    BracketProvider, BracketProviderError, ExternalMatch, ExternalMatchState, ExternalParticipant,
};
use crate::service::dispatcher::{
    match_channel_name, reward_channel_name, ChannelRef, DispatchError, DispatchEvent, Dispatcher, IssuedRewards,
};
use crate::service::{
    MatchService, ReportOutcome, RoundProgressionService, SyncService, TournamentError, TournamentLocks,
    TournamentService,
};

pub const FIRST_PARTICIPANT_ID: i64 = 1000;
pub const FIRST_MATCH_ID: i64 = 5000;

// =============================================================================
// FAKE BRACKET PROVIDER
// =============================================================================

#[derive(Default)]
struct Bracket {
    participants: Vec<ExternalParticipant>,
    matches: Vec<ExternalMatch>,
    rounds: i32,
    started: bool,
}

impl Bracket {
    fn round_matches(&self, round: i32) -> Vec<usize> {
        (0..self.matches.len())
            .filter(|&i| self.matches[i].round == round)
            .collect()
    }

    fn seat(&mut self, round: i32, index: usize, participant: i64) {
        let targets = self.round_matches(round);
        let Some(&target) = targets.get(index / 2) else {
            return;
        };
        let m = &mut self.matches[target];
        if index % 2 == 0 {
            m.player1_id = Some(participant);
        } else {
            m.player2_id = Some(participant);
        }
        if m.player1_id.is_some() && m.player2_id.is_some() {
            m.state = ExternalMatchState::Open;
        }
    }
}

/// Single elimination host with a third place match, seeding participants in
/// sign-up order. Participant ids are above 1000, match ids start at 5000.
#[derive(Default)]
pub struct FakeBracketProvider {
    brackets: Mutex<HashMap<String, Bracket>>,
    next_id: AtomicUsize,
    failing_updates: AtomicUsize,
    failing_lists: AtomicUsize,
    failing_destroys: AtomicUsize,
    pub update_calls: AtomicUsize,
}

fn unavailable() -> BracketProviderError {
    BracketProviderError::Rejected {
        status: 503,
        message: "Service Unavailable".to_string(),
    }
}

fn unprocessable(message: &str) -> BracketProviderError {
    BracketProviderError::Rejected {
        status: 422,
        message: message.to_string(),
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FakeBracketProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_lists(&self, n: usize) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_destroys(&self, n: usize) {
        self.failing_destroys.store(n, Ordering::SeqCst);
    }

    pub fn match_by_id(&self, slug: &str, id: i64) -> Option<ExternalMatch> {
        let brackets = self.brackets.lock().unwrap();
        brackets
            .get(slug)
            .and_then(|b| b.matches.iter().find(|m| m.id == id).cloned())
    }

    pub fn matches(&self, slug: &str) -> Vec<ExternalMatch> {
        let brackets = self.brackets.lock().unwrap();
        brackets.get(slug).map(|b| b.matches.clone()).unwrap_or_default()
    }

    pub fn has_tournament(&self, slug: &str) -> bool {
        self.brackets.lock().unwrap().contains_key(slug)
    }

    /// Simulates an organizer resetting a match on the host's website.
    pub fn reopen_match(&self, slug: &str, id: i64) {
        let mut brackets = self.brackets.lock().unwrap();
        if let Some(m) = brackets
            .get_mut(slug)
            .and_then(|b| b.matches.iter_mut().find(|m| m.id == id))
        {
            m.state = ExternalMatchState::Open;
            m.winner_id = None;
            m.loser_id = None;
            m.scores_csv = None;
        }
    }

    fn next_id(&self, base: i64) -> i64 {
        base + self.next_id.fetch_add(1, Ordering::SeqCst) as i64
    }
}

#[async_trait]
impl BracketProvider for FakeBracketProvider {
    async fn create_tournament(&self, _name: &str, slug: &str) -> Result<i64, BracketProviderError> {
        let mut brackets = self.brackets.lock().unwrap();
        if brackets.contains_key(slug) {
            return Err(unprocessable("URL is already taken"));
        }
        brackets.insert(slug.to_string(), Bracket::default());
        Ok(self.next_id(1))
    }

    async fn destroy_tournament(&self, slug: &str) -> Result<(), BracketProviderError> {
        if take_failure(&self.failing_destroys) {
            return Err(unavailable());
        }
        self.brackets.lock().unwrap().remove(slug);
        Ok(())
    }

    async fn create_participant(&self, slug: &str, name: &str, _misc: &str) -> Result<i64, BracketProviderError> {
        let id = self.next_id(FIRST_PARTICIPANT_ID);
        let mut brackets = self.brackets.lock().unwrap();
        let bracket = brackets.get_mut(slug).ok_or_else(|| unprocessable("Tournament not found"))?;
        bracket.participants.push(ExternalParticipant {
            id,
            name: Some(name.to_string()),
            final_rank: None,
        });
        Ok(id)
    }

    async fn destroy_participant(&self, slug: &str, external_participant_id: i64) -> Result<(), BracketProviderError> {
        if take_failure(&self.failing_destroys) {
            return Err(unavailable());
        }
        let mut brackets = self.brackets.lock().unwrap();
        let bracket = brackets.get_mut(slug).ok_or_else(|| unprocessable("Tournament not found"))?;
        bracket.participants.retain(|p| p.id != external_participant_id);
        Ok(())
    }

    async fn start_tournament(&self, slug: &str) -> Result<(), BracketProviderError> {
        let mut brackets = self.brackets.lock().unwrap();
        let bracket = brackets.get_mut(slug).ok_or_else(|| unprocessable("Tournament not found"))?;
        let n = bracket.participants.len();
        if n < 2 || !n.is_power_of_two() {
            return Err(unprocessable("Participant count must be a power of two"));
        }
        if bracket.started {
            return Err(unprocessable("Tournament already started"));
        }

        let rounds = n.trailing_zeros() as i32;
        let mut matches = Vec::new();
        for round in 1..=rounds {
            let count = n >> round;
            for i in 0..count {
                let (p1, p2) = if round == 1 {
                    (
                        Some(bracket.participants[2 * i].id),
                        Some(bracket.participants[2 * i + 1].id),
                    )
                } else {
                    (None, None)
                };
                matches.push(ExternalMatch {
                    id: FIRST_MATCH_ID + matches.len() as i64,
                    round,
                    player1_id: p1,
                    player2_id: p2,
                    winner_id: None,
                    loser_id: None,
                    state: if round == 1 { ExternalMatchState::Open } else { ExternalMatchState::Pending },
                    scores_csv: None,
                });
            }
        }
        if rounds >= 2 {
            matches.push(ExternalMatch {
                id: FIRST_MATCH_ID + matches.len() as i64,
                round: 0,
                player1_id: None,
                player2_id: None,
                winner_id: None,
                loser_id: None,
                state: ExternalMatchState::Pending,
                scores_csv: None,
            });
        }

        bracket.matches = matches;
        bracket.rounds = rounds;
        bracket.started = true;
        Ok(())
    }

    async fn list_matches(
        &self,
        slug: &str,
        participant_filter: Option<i64>,
    ) -> Result<Vec<ExternalMatch>, BracketProviderError> {
        if take_failure(&self.failing_lists) {
            return Err(unavailable());
        }
        let brackets = self.brackets.lock().unwrap();
        let bracket = brackets.get(slug).ok_or_else(|| unprocessable("Tournament not found"))?;
        Ok(bracket
            .matches
            .iter()
            .filter(|m| participant_filter.map_or(true, |p| m.involves(p)))
            .cloned()
            .collect())
    }

    async fn update_match(
        &self,
        slug: &str,
        external_match_id: i64,
        score: &str,
        winner_external_id: i64,
    ) -> Result<(), BracketProviderError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_updates) {
            return Err(unavailable());
        }

        let mut brackets = self.brackets.lock().unwrap();
        let bracket = brackets.get_mut(slug).ok_or_else(|| unprocessable("Tournament not found"))?;
        let idx = bracket
            .matches
            .iter()
            .position(|m| m.id == external_match_id)
            .ok_or_else(|| unprocessable("Match not found"))?;

        let m = bracket.matches[idx].clone();
        if !m.involves(winner_external_id) {
            return Err(unprocessable("Winner is not a player of this match"));
        }
        if m.is_complete() {
            return if m.winner_id == Some(winner_external_id) {
                Ok(())
            } else {
                Err(unprocessable("Match is already complete"))
            };
        }
        let loser = if m.player1_id == Some(winner_external_id) { m.player2_id } else { m.player1_id };
        let Some(loser) = loser else {
            return Err(unprocessable("Match is not open"));
        };

        {
            let target = &mut bracket.matches[idx];
            target.state = ExternalMatchState::Complete;
            target.winner_id = Some(winner_external_id);
            target.loser_id = Some(loser);
            target.scores_csv = Some(score.to_string());
        }

        if m.round >= 1 && m.round < bracket.rounds {
            let position = bracket
                .round_matches(m.round)
                .iter()
                .position(|&i| i == idx)
                .unwrap_or(0);
            bracket.seat(m.round + 1, position, winner_external_id);
            if m.round == bracket.rounds - 1 {
                bracket.seat(0, position, loser);
            }
        }
        Ok(())
    }

    async fn finalize(&self, slug: &str) -> Result<(), BracketProviderError> {
        let mut brackets = self.brackets.lock().unwrap();
        let bracket = brackets.get_mut(slug).ok_or_else(|| unprocessable("Tournament not found"))?;
        let rounds = bracket.rounds;
        let mut ranks: Vec<(i64, i32)> = Vec::new();
        for m in bracket.matches.iter().filter(|m| m.is_complete()) {
            if let (Some(w), Some(l)) = (m.winner_id, m.loser_id) {
                if m.round == rounds {
                    ranks.push((w, 1));
                    ranks.push((l, 2));
                } else if m.round == 0 {
                    ranks.push((w, 3));
                    ranks.push((l, 4));
                }
            }
        }
        for p in bracket.participants.iter_mut() {
            p.final_rank = ranks.iter().find(|(id, _)| *id == p.id).map(|(_, r)| *r);
        }
        Ok(())
    }

    async fn list_participants(&self, slug: &str) -> Result<Vec<ExternalParticipant>, BracketProviderError> {
        let brackets = self.brackets.lock().unwrap();
        let bracket = brackets.get(slug).ok_or_else(|| unprocessable("Tournament not found"))?;
        Ok(bracket.participants.clone())
    }
}

// =============================================================================
// RECORDING DISPATCHER
// =============================================================================

#[derive(Default)]
pub struct RecordingDispatcher {
    events: Mutex<Vec<DispatchEvent>>,
    issued: IssuedRewards,
}

impl RecordingDispatcher {
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn push(&self, event: DispatchEvent) {
        self.events.lock().unwrap().push(event);
    }

    /// (round, channel) of every opened match channel.
    pub fn match_channels(&self) -> Vec<(i32, ChannelRef)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DispatchEvent::OpenMatchChannel { round, channel, .. } => Some((round, channel)),
                _ => None,
            })
            .collect()
    }

    pub fn reward_recipients(&self) -> Vec<Uuid> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DispatchEvent::OpenRewardChannel { member, .. } => Some(member.id),
                _ => None,
            })
            .collect()
    }

    pub fn announcements(&self) -> Vec<RoundAnnouncement> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DispatchEvent::AnnounceRound { announcement } => Some(announcement),
                _ => None,
            })
            .collect()
    }

    pub fn closed_categories(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DispatchEvent::CloseChannels { category } => Some(category),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> Vec<Placements> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DispatchEvent::TournamentCompleted { placements, .. } => Some(placements),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn open_match_channel(
        &self,
        participants: [&Member; 2],
        round: i32,
        category: &str,
    ) -> Result<ChannelRef, DispatchError> {
        let channel = match_channel_name(participants[0], participants[1]);
        self.push(DispatchEvent::OpenMatchChannel {
            category: category.to_string(),
            round,
            channel: channel.clone(),
            members: vec![participants[0].clone(), participants[1].clone()],
        });
        Ok(channel)
    }

    async fn open_reward_channel(
        &self,
        participants: &[Member],
        tournament_slug: &str,
    ) -> Result<Vec<ChannelRef>, DispatchError> {
        let mut opened = Vec::new();
        for member in participants {
            if !self.issued.first_request(member.id, tournament_slug) {
                continue;
            }
            let channel = reward_channel_name(member, tournament_slug);
            self.push(DispatchEvent::OpenRewardChannel {
                tournament_slug: tournament_slug.to_string(),
                channel: channel.clone(),
                member: member.clone(),
            });
            opened.push(channel);
        }
        Ok(opened)
    }

    async fn close_channels(&self, round_category: &str) -> Result<(), DispatchError> {
        self.push(DispatchEvent::CloseChannels {
            category: round_category.to_string(),
        });
        Ok(())
    }

    async fn announce_round(&self, announcement: &RoundAnnouncement) -> Result<(), DispatchError> {
        self.push(DispatchEvent::AnnounceRound {
            announcement: announcement.clone(),
        });
        Ok(())
    }

    async fn announce_completion(&self, tournament_slug: &str, placements: &Placements) -> Result<(), DispatchError> {
        self.push(DispatchEvent::TournamentCompleted {
            tournament_slug: tournament_slug.to_string(),
            placements: placements.clone(),
        });
        Ok(())
    }
}

// =============================================================================
// HARNESS
// =============================================================================

pub const EVIDENCE_URL: &str = "https://videos.example.com/match";

pub struct Harness {
    pub repo: Arc<InMemoryTournamentRepository>,
    pub provider: Arc<FakeBracketProvider>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub engine: Arc<RoundProgressionService>,
    pub tournaments: TournamentService,
    pub matches: MatchService,
    pub sync: SyncService,
    pub members: Vec<Member>,
}

impl Harness {
    pub fn new() -> Self {
        let repo = Arc::new(InMemoryTournamentRepository::new());
        let provider = Arc::new(FakeBracketProvider::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        Self::with_parts(repo, provider, dispatcher, Arc::new(TournamentLocks::new()))
    }

    /// Services over shared parts; separate locks model a second process.
    pub fn with_parts(
        repo: Arc<InMemoryTournamentRepository>,
        provider: Arc<FakeBracketProvider>,
        dispatcher: Arc<RecordingDispatcher>,
        locks: Arc<TournamentLocks>,
    ) -> Self {
        let repository: Arc<dyn TournamentRepository> = repo.clone();
        let bracket: Arc<dyn BracketProvider> = provider.clone();
        let engine = Arc::new(RoundProgressionService::new(
            repository.clone(),
            bracket.clone(),
            dispatcher.clone(),
            "round".to_string(),
        ));
        Self {
            tournaments: TournamentService::new(repository.clone(), bracket.clone(), engine.clone(), locks.clone()),
            matches: MatchService::new(repository.clone(), bracket.clone(), engine.clone(), locks.clone()),
            sync: SyncService::new(repository, bracket, engine.clone(), locks),
            engine,
            repo,
            provider,
            dispatcher,
            members: Vec::new(),
        }
    }

    pub fn seed_members(&mut self, n: usize) {
        for i in 0..n {
            let member = Member {
                id: Uuid::new_v4(),
                discord_id: 10_000 + i as i64,
                username: format!("trainer{}", i + 1),
                timezone: Some("Europe/Berlin".to_string()),
                country_code: None,
            };
            self.repo.insert_member(member.clone()).unwrap();
            self.members.push(member);
        }
    }

    /// Created, current, `n` sign-ups, not started.
    pub async fn open_tournament(n: usize) -> Self {
        let mut h = Self::new();
        h.seed_members(n);
        let t = h.tournaments.create_tournament("Test Cup").await.unwrap();
        h.tournaments.set_current(&t.slug).await.unwrap();
        for m in h.members.clone() {
            h.tournaments.sign_up(m.id).await.unwrap();
        }
        h
    }

    pub async fn started_tournament(n: usize) -> Self {
        let h = Self::open_tournament(n).await;
        h.tournaments.start_tournament().await.unwrap();
        h
    }

    pub async fn current(&self) -> Tournament {
        self.repo.load_current().await.unwrap().unwrap()
    }

    pub async fn round(&self, round: i32) -> Vec<TournamentMatch> {
        let t = self.current().await;
        self.repo.load_round_matches(t.id, round).await.unwrap()
    }

    pub async fn member_of(&self, participant_id: Uuid) -> Uuid {
        self.repo
            .load_participant(participant_id)
            .await
            .unwrap()
            .unwrap()
            .member_id
    }

    pub fn report_request(member_id: Uuid) -> ReportResultRequest {
        ReportResultRequest {
            winner_member_id: member_id,
            evidence_url: EVIDENCE_URL.to_string(),
            score: None,
        }
    }

    /// Player one of `m` reports a win.
    pub async fn report_player1(&self, m: &TournamentMatch) -> Result<ReportOutcome, TournamentError> {
        let member = self.member_of(m.participant1_id.unwrap()).await;
        self.matches.report_result(Self::report_request(member)).await
    }

    /// Player one wins every open match of `round`, in match order.
    pub async fn play_round(&self, round: i32) -> Vec<ReportOutcome> {
        let mut outcomes = Vec::new();
        for m in self.round(round).await.into_iter().filter(|m| !m.completed) {
            outcomes.push(self.report_player1(&m).await.unwrap());
        }
        outcomes
    }
}
